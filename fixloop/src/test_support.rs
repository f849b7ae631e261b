//! Test-only collaborators and fixtures for driving the pipeline without
//! git, docker or an agent.
//!
//! Each scripted collaborator pops one queued response per call and fails the
//! stage when its queue is empty.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::types::{BuildResult, FixSet, ProjectKind, TestRunResult};
use crate::io::config::PipelineConfig;
use crate::io::docker::{Builder, TestRunner};
use crate::io::fixer::{FixProposer, FixRequest};
use crate::io::git::SourceAcquirer;

/// pytest output for one deterministic assertion failure.
pub const ASSERTION_LOG: &str = "\
============================= test session starts ==============================
collected 2 items

tests/test_calc.py .F                                                    [100%]

=================================== FAILURES ===================================
___________________________________ test_add ___________________________________

    def test_add():
>       assert add(2, 2) == 4
E       assert 3 == 4

tests/test_calc.py:5: AssertionError
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_add - assert 3 == 4
========================= 1 failed, 1 passed in 0.02s ==========================
";

/// pytest output for one transient connection failure.
pub const CONNECTION_LOG: &str = "\
=================================== FAILURES ===================================
__________________________________ test_fetch __________________________________
E       requests.exceptions.ConnectionError: connection refused

src/net.py:22: ConnectionError
FAILED tests/test_net.py::test_fetch - ConnectionError: connection refused
============================== 1 failed in 0.10s ===============================
";

/// pytest output with every test passing.
pub const PASSING_LOG: &str = "\
tests/test_calc.py ..                                                    [100%]
============================== 2 passed in 0.01s ===============================
";

/// Config rooted in a temp directory.
pub fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        artifacts_dir: root.join("runs"),
        repos_dir: root.join("repos"),
        ..PipelineConfig::default()
    }
}

/// Create a small Python working copy at `root/name`.
pub fn working_copy(root: &Path, name: &str) -> Result<PathBuf> {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("tests"))?;
    fs::write(dir.join("requirements.txt"), "pytest\n")?;
    fs::write(dir.join("calc.py"), "def add(a, b):\n    return a + b - 1\n")?;
    fs::write(
        dir.join("tests/test_calc.py"),
        "from calc import add\n\n\ndef test_add():\n    assert add(2, 2) == 4\n",
    )?;
    Ok(dir)
}

pub fn build_ok() -> BuildResult {
    BuildResult {
        exit_code: 0,
        stdout: "Successfully installed pytest\n".to_string(),
        stderr: String::new(),
        project_kinds: [ProjectKind::Python].into_iter().collect(),
    }
}

pub fn build_failed(exit_code: i32) -> BuildResult {
    BuildResult {
        exit_code,
        stdout: String::new(),
        stderr: "error: could not compile\n".to_string(),
        project_kinds: [ProjectKind::Cpp].into_iter().collect(),
    }
}

pub fn test_pass() -> TestRunResult {
    TestRunResult {
        exit_code: 0,
        stdout: PASSING_LOG.to_string(),
        stderr: String::new(),
    }
}

pub fn test_fail(log: &str) -> TestRunResult {
    TestRunResult {
        exit_code: 1,
        stdout: log.to_string(),
        stderr: String::new(),
    }
}

pub fn fixes(entries: &[(&str, &str)]) -> FixSet {
    entries
        .iter()
        .map(|(path, content)| (path.to_string(), content.to_string()))
        .collect()
}

fn pop_scripted<T>(queue: &Mutex<VecDeque<Result<T>>>, what: &str) -> Result<T> {
    let mut queue = queue
        .lock()
        .map_err(|_| anyhow!("scripted {what} queue poisoned"))?;
    queue
        .pop_front()
        .unwrap_or_else(|| Err(anyhow!("unexpected {what} call")))
}

/// Acquirer that hands out queued working-copy paths.
pub struct ScriptedAcquirer {
    queue: Mutex<VecDeque<Result<PathBuf>>>,
    remotes: Mutex<Vec<String>>,
}

impl ScriptedAcquirer {
    pub fn new(responses: Vec<Result<PathBuf>>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            remotes: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.remotes.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn remotes(&self) -> Vec<String> {
        self.remotes.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl SourceAcquirer for ScriptedAcquirer {
    fn acquire(&self, remote: &str, _name: &str, _timeout: Duration) -> Result<PathBuf> {
        if let Ok(mut remotes) = self.remotes.lock() {
            remotes.push(remote.to_string());
        }
        pop_scripted(&self.queue, "acquire")
    }
}

/// Builder that returns queued build results.
pub struct ScriptedBuilder {
    queue: Mutex<VecDeque<Result<BuildResult>>>,
    calls: Mutex<usize>,
    delay: Duration,
}

impl ScriptedBuilder {
    pub fn new(responses: Vec<Result<BuildResult>>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            calls: Mutex::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every build call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

impl Builder for ScriptedBuilder {
    fn build(&self, _workdir: &Path, _timeout: Duration) -> Result<BuildResult> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        pop_scripted(&self.queue, "build")
    }
}

/// One queued test run: the result plus an optional JUnit report to leave behind.
pub struct ScriptedRun {
    pub result: Result<TestRunResult>,
    pub report_xml: Option<String>,
}

impl From<Result<TestRunResult>> for ScriptedRun {
    fn from(result: Result<TestRunResult>) -> Self {
        Self {
            result,
            report_xml: None,
        }
    }
}

/// Runner that returns queued test results.
///
/// When a queued run carries a report, it is written to `report_path` inside
/// the working copy; otherwise any report from an earlier call is removed.
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<ScriptedRun>>,
    kinds_seen: Mutex<Vec<BTreeSet<ProjectKind>>>,
    report_path: String,
}

impl ScriptedRunner {
    pub fn new(responses: Vec<Result<TestRunResult>>) -> Self {
        Self::with_runs(responses.into_iter().map(ScriptedRun::from).collect())
    }

    pub fn with_runs(runs: Vec<ScriptedRun>) -> Self {
        Self {
            queue: Mutex::new(runs.into()),
            kinds_seen: Mutex::new(Vec::new()),
            report_path: PipelineConfig::default().report_path,
        }
    }

    pub fn calls(&self) -> usize {
        self.kinds_seen.lock().map(|k| k.len()).unwrap_or(0)
    }

    pub fn kinds_seen(&self) -> Vec<BTreeSet<ProjectKind>> {
        self.kinds_seen.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

impl TestRunner for ScriptedRunner {
    fn run_tests(
        &self,
        workdir: &Path,
        kinds: &BTreeSet<ProjectKind>,
        _timeout: Duration,
    ) -> Result<TestRunResult> {
        if let Ok(mut seen) = self.kinds_seen.lock() {
            seen.push(kinds.clone());
        }
        let run = self
            .queue
            .lock()
            .map_err(|_| anyhow!("scripted test queue poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected test call"))?;
        let report = workdir.join(&self.report_path);
        match &run.report_xml {
            Some(xml) => fs::write(&report, xml)?,
            None if report.exists() => fs::remove_file(&report)?,
            None => {}
        }
        run.result
    }
}

/// Proposer that returns queued fix sets and records every request.
pub struct ScriptedProposer {
    queue: Mutex<VecDeque<Result<FixSet>>>,
    requests: Mutex<Vec<FixRequest>>,
}

impl ScriptedProposer {
    pub fn new(responses: Vec<Result<FixSet>>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<FixRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl FixProposer for ScriptedProposer {
    fn propose(&self, request: &FixRequest) -> Result<FixSet> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        pop_scripted(&self.queue, "propose")
    }
}
