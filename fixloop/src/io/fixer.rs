//! Fix proposal via an external coding agent.
//!
//! The [`FixProposer`] trait decouples the pipeline from the agent backend
//! (currently `codex exec`). Tests use scripted proposers that return
//! predetermined fix sets without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::types::{ErrorRecord, FailureReport, FixSet};
use crate::io::config::FixerConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::run_log::tail_lines;

const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const FIX_OUTPUT_SCHEMA: &str = include_str!("../../schemas/fix_output.schema.json");

const SOURCE_EXTENSIONS: &[&str] = &["py", "c", "cc", "cpp", "h", "hpp"];
const SKIPPED_DIRS: &[&str] = &[".git", "__pycache__", ".venv", "build", "node_modules"];

static FENCED_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)FIXED_CODE:\s*\n```[^\n]*\n(.*?)\n```").expect("fenced code regex")
});

/// Failure evidence handed to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureContext {
    pub failing_tests: Vec<String>,
    pub error_records: Vec<ErrorRecord>,
    pub error_categories: Vec<String>,
    /// Last lines of the most recent test log.
    pub log_excerpt: String,
}

impl FailureContext {
    pub fn from_report(report: &FailureReport, log_text: &str, max_lines: usize) -> Self {
        Self {
            failing_tests: report.failing_tests.clone(),
            error_records: report.error_records.clone(),
            error_categories: report.error_categories.iter().cloned().collect(),
            log_excerpt: tail_lines(log_text, max_lines),
        }
    }
}

/// Parameters for one fix proposal.
#[derive(Debug, Clone)]
pub struct FixRequest {
    pub workdir: PathBuf,
    /// 1-based patch attempt this proposal is for.
    pub attempt: u32,
    pub failure: FailureContext,
    /// Files the agent should concentrate on (suspected files).
    pub focus_files: Vec<String>,
    /// Directory for the prompt, agent output and agent log.
    pub output_dir: PathBuf,
    pub timeout: Duration,
}

/// Abstraction over fix-generation backends.
pub trait FixProposer {
    /// Propose complete replacement contents keyed by repository-relative path.
    fn propose(&self, request: &FixRequest) -> Result<FixSet>;
}

#[derive(Debug, Deserialize)]
struct FixOutput {
    fixes: Vec<FileFix>,
}

#[derive(Debug, Deserialize)]
struct FileFix {
    path: String,
    content: String,
}

/// Proposer that runs `codex exec` (or any compatible command).
#[derive(Debug, Clone)]
pub struct CodexFixProposer {
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

impl CodexFixProposer {
    pub fn from_config(config: &FixerConfig, output_limit_bytes: usize) -> Self {
        Self {
            command: config.command.clone(),
            output_limit_bytes,
        }
    }
}

impl FixProposer for CodexFixProposer {
    #[instrument(skip_all, fields(attempt = request.attempt, timeout_secs = request.timeout.as_secs()))]
    fn propose(&self, request: &FixRequest) -> Result<FixSet> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("fixer command is empty"))?;
        fs::create_dir_all(&request.output_dir)
            .with_context(|| format!("create fix dir {}", request.output_dir.display()))?;

        let prompt = render_prompt(request)?;
        let prompt_path = request.output_dir.join("prompt.md");
        fs::write(&prompt_path, &prompt)
            .with_context(|| format!("write {}", prompt_path.display()))?;
        let schema_path = request.output_dir.join("fix_output.schema.json");
        fs::write(&schema_path, FIX_OUTPUT_SCHEMA)
            .with_context(|| format!("write {}", schema_path.display()))?;
        let output_path = request.output_dir.join("output.json");

        info!(workdir = %request.workdir.display(), %program, "requesting fix proposal");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {program}"))?;
        write_agent_log(&request.output_dir.join("agent.log"), &output)?;

        output.ensure_finished("fix agent", request.timeout)?;
        if !output.status.success() {
            warn!(exit_code = output.exit_code(), "fix agent failed");
            bail!("fix agent failed with exit code {}", output.exit_code());
        }

        let answer = if output_path.is_file() {
            fs::read_to_string(&output_path)
                .with_context(|| format!("read {}", output_path.display()))?
        } else {
            debug!("agent wrote no output file, using stdout");
            output.stdout_text()
        };
        let fixes = parse_agent_answer(&answer)?;
        info!(files = fixes.len(), "fix proposal received");
        Ok(fixes)
    }
}

/// Run `proposer` for `request`, splitting the work per focus file when `parallel`.
///
/// Parallel proposals run on scoped threads and are all joined before this
/// returns. Results merge in focus-file order; the first proposal for a path
/// wins. Any failed proposal fails the whole call.
#[instrument(skip_all, fields(attempt = request.attempt, parallel = parallel, focus = request.focus_files.len()))]
pub fn propose_fixes<P>(proposer: &P, request: &FixRequest, parallel: bool) -> Result<FixSet>
where
    P: FixProposer + Sync,
{
    if !parallel || request.focus_files.len() <= 1 {
        return proposer.propose(request);
    }

    let mut focus_files = request.focus_files.clone();
    focus_files.sort();
    let requests: Vec<FixRequest> = focus_files
        .iter()
        .enumerate()
        .map(|(i, file)| FixRequest {
            focus_files: vec![file.clone()],
            output_dir: request.output_dir.join(format!("task-{}", i + 1)),
            ..request.clone()
        })
        .collect();

    let results: Vec<Result<FixSet>> = thread::scope(|scope| {
        let handles: Vec<_> = requests
            .iter()
            .map(|req| scope.spawn(move || proposer.propose(req)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("fix proposal thread panicked")),
            })
            .collect()
    });

    let mut merged = FixSet::new();
    for (file, result) in focus_files.iter().zip(results) {
        let fixes = result.with_context(|| format!("propose fix for {file}"))?;
        for (path, content) in fixes {
            merged.entry(path).or_insert(content);
        }
    }
    debug!(files = merged.len(), "merged parallel proposals");
    Ok(merged)
}

/// Repository source files, relative to `root`, sorted.
pub fn list_source_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
        })
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Render the agent prompt for `request`.
pub fn render_prompt(request: &FixRequest) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("fix", FIX_TEMPLATE)
        .context("load fix prompt template")?;
    let template = env.get_template("fix")?;
    let rendered = template.render(context! {
        files => list_source_files(&request.workdir),
        focus_files => request.focus_files,
        failing_tests => request.failure.failing_tests,
        error_records => request.failure.error_records,
        log_excerpt => (!request.failure.log_excerpt.trim().is_empty()).then(|| request.failure.log_excerpt.trim()),
        attempt => request.attempt,
    })?;
    Ok(rendered)
}

/// Parse the agent's final message: schema-valid JSON, or the fenced-block format.
pub fn parse_agent_answer(answer: &str) -> Result<FixSet> {
    match serde_json::from_str::<Value>(answer.trim()) {
        Ok(value) => {
            validate_fix_output(&value)?;
            let output: FixOutput =
                serde_json::from_value(value).context("decode fix output")?;
            let mut fixes = FixSet::new();
            for fix in output.fixes {
                fixes.entry(fix.path).or_insert(fix.content);
            }
            Ok(fixes)
        }
        Err(_) => {
            let fixes = parse_fenced_fixes(answer);
            if fixes.is_empty() {
                warn!("no fixes found in agent answer");
            }
            Ok(fixes)
        }
    }
}

fn validate_fix_output(value: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(FIX_OUTPUT_SCHEMA).context("parse fix output schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile fix output schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("fix output schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Parse `SOURCE_FILE: <path>` / `FIXED_CODE:` fenced blocks.
pub fn parse_fenced_fixes(text: &str) -> FixSet {
    let mut fixes = FixSet::new();
    for part in text.split("SOURCE_FILE:").skip(1) {
        let Some(path) = part.lines().next().map(str::trim).filter(|p| !p.is_empty()) else {
            continue;
        };
        if let Some(caps) = FENCED_CODE_RE.captures(part) {
            fixes
                .entry(path.to_string())
                .or_insert_with(|| format!("{}\n", &caps[1]));
        }
    }
    fixes
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}
