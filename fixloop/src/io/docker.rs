//! Containerized build and test execution.
//!
//! The working copy is bind-mounted at `/workspace` inside a throwaway
//! container; build artifacts therefore persist between the build and test
//! containers of one attempt.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::types::{BuildResult, ProjectKind, TestRunResult};
use crate::io::config::PipelineConfig;
use crate::io::process::run_command_with_timeout;

/// Mount point of the working copy inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

const PYTHON_MARKERS: &[&str] = &["pyproject.toml", "setup.py", "requirements.txt"];
const CPP_MARKERS: &[&str] = &["CMakeLists.txt", "Makefile"];

const BUILD_SCRIPT: &str = r#"set -e
if [ -f pyproject.toml ] || [ -f setup.py ] || [ -f requirements.txt ]; then
    pip install -U pip
    if [ -f requirements.txt ]; then
        pip install -r requirements.txt
    else
        pip install .
    fi
fi
if [ -f CMakeLists.txt ]; then
    cmake -S . -B build
    cmake --build build
elif [ -f Makefile ]; then
    make
fi
"#;

/// Builds a working copy.
pub trait Builder {
    fn build(&self, workdir: &Path, timeout: Duration) -> Result<BuildResult>;
}

/// Runs the test suite of a built working copy.
pub trait TestRunner {
    fn run_tests(
        &self,
        workdir: &Path,
        kinds: &BTreeSet<ProjectKind>,
        timeout: Duration,
    ) -> Result<TestRunResult>;
}

/// Detect project kinds from marker files at the repository root.
pub fn detect_project_kinds(path: &Path) -> BTreeSet<ProjectKind> {
    let has_any = |markers: &[&str]| markers.iter().any(|m| path.join(m).is_file());
    let mut kinds = BTreeSet::new();
    if has_any(PYTHON_MARKERS) {
        kinds.insert(ProjectKind::Python);
    }
    if has_any(CPP_MARKERS) {
        kinds.insert(ProjectKind::Cpp);
    }
    kinds
}

/// Shell script that runs the tests and writes a JUnit report to `report_path`.
///
/// Python wins when both kinds are present. Returns `None` for an empty set.
pub fn test_script(kinds: &BTreeSet<ProjectKind>, report_path: &str) -> Option<String> {
    let report = format!("{CONTAINER_WORKDIR}/{report_path}");
    if kinds.contains(&ProjectKind::Python) {
        return Some(format!(
            r#"set -e
rm -f '{report}'
if [ -f requirements.txt ]; then
    pip install -r requirements.txt
fi
pip install pytest
pytest --junitxml='{report}'
"#
        ));
    }
    if kinds.contains(&ProjectKind::Cpp) {
        return Some(format!(
            r#"set -e
rm -f '{report}'
if [ ! -d build ]; then
    echo "No build directory found"
    exit 1
fi
ctest --test-dir build --output-on-failure --output-junit '{report}'
"#
        ));
    }
    None
}

/// Docker-backed [`Builder`] and [`TestRunner`].
#[derive(Debug, Clone)]
pub struct DockerBackend {
    pub image: String,
    pub context_dir: PathBuf,
    pub report_path: String,
    pub output_limit_bytes: usize,
}

impl DockerBackend {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            image: config.docker.image.clone(),
            context_dir: config.docker.context_dir.clone(),
            report_path: config.report_path.clone(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    /// Build the CI image from `context_dir` unless it already exists.
    ///
    /// The inspect and build commands share the time left until `deadline`.
    #[instrument(skip_all, fields(image = %self.image))]
    pub fn ensure_image(&self, deadline: Instant) -> Result<()> {
        let inspect = run_command_with_timeout(
            docker(&["image", "inspect", &self.image]),
            None,
            remaining_budget(deadline)?,
            self.output_limit_bytes,
        )
        .context("run docker image inspect")?;
        if inspect.status.success() {
            debug!("ci image present");
            return Ok(());
        }

        if !self.context_dir.is_dir() {
            return Err(anyhow!(
                "docker context directory not found at {}",
                self.context_dir.display()
            ));
        }
        info!(context = %self.context_dir.display(), "building ci image");
        let mut cmd = docker(&["build", "-t", &self.image]);
        cmd.arg(&self.context_dir);
        let timeout = remaining_budget(deadline)?;
        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .context("run docker build")?;
        output.ensure_finished("docker build", timeout)?;
        if !output.status.success() {
            return Err(anyhow!(
                "failed to build ci image {}: {}",
                self.image,
                output.stderr_text().trim()
            ));
        }
        Ok(())
    }

    fn run_in_container(
        &self,
        workdir: &Path,
        script: &str,
        label: &str,
        timeout: Duration,
    ) -> Result<(i32, String, String)> {
        let mount = workdir
            .canonicalize()
            .with_context(|| format!("resolve working copy {}", workdir.display()))?;
        let mut cmd = docker(&["run", "--rm", "-v"]);
        cmd.arg(format!("{}:{CONTAINER_WORKDIR}", mount.display()))
            .args(["-w", CONTAINER_WORKDIR, &self.image, "bash", "-c", script]);

        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .with_context(|| format!("run {label} container"))?;
        output.ensure_finished(label, timeout)?;
        Ok((output.exit_code(), output.stdout_text(), output.stderr_text()))
    }
}

impl Builder for DockerBackend {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn build(&self, workdir: &Path, timeout: Duration) -> Result<BuildResult> {
        let deadline = Instant::now() + timeout;
        self.ensure_image(deadline)?;
        let project_kinds = detect_project_kinds(workdir);
        if project_kinds.is_empty() {
            warn!("no python or c++ markers found");
        }
        let (exit_code, stdout, stderr) =
            self.run_in_container(workdir, BUILD_SCRIPT, "build", remaining_budget(deadline)?)?;
        info!(exit_code, "build finished");
        Ok(BuildResult {
            exit_code,
            stdout,
            stderr,
            project_kinds,
        })
    }
}

impl TestRunner for DockerBackend {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn run_tests(
        &self,
        workdir: &Path,
        kinds: &BTreeSet<ProjectKind>,
        timeout: Duration,
    ) -> Result<TestRunResult> {
        let script = test_script(kinds, &self.report_path)
            .ok_or_else(|| anyhow!("no test runner for this project (no python or c++ markers)"))?;
        let (exit_code, stdout, stderr) =
            self.run_in_container(workdir, &script, "test run", timeout)?;
        info!(exit_code, "test run finished");
        Ok(TestRunResult {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn docker(args: &[&str]) -> Command {
    let mut cmd = Command::new("docker");
    cmd.args(args);
    cmd
}
