//! Driver for one build-test-fix pipeline run.
//!
//! The loop owns the [`PipelineState`]. For the current stage it performs the
//! side effect through a collaborator, turns the result into an [`Event`], and
//! asks [`transition`] for the next stage, until a terminal stage is reached.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::log_parser::parse_test_log;
use crate::core::machine::{AbortReason, Event, Stage, TransitionRecord, transition};
use crate::core::state::{PipelineState, RepoSource};
use crate::core::types::ErrorRecord;
use crate::io::config::PipelineConfig;
use crate::io::docker::{Builder, TestRunner};
use crate::io::fixer::{FailureContext, FixProposer, FixRequest, propose_fixes};
use crate::io::git::{Git, SourceAcquirer};
use crate::io::patch::{apply_fixes, write_changelog};
use crate::io::report::analyze;
use crate::io::run_log::{
    RunPaths, create_run_dir, tail_lines, write_build_log, write_summary, write_test_log,
};

/// Build output lines kept in the outcome when the build fails.
const BUILD_TAIL_LINES: usize = 20;

/// External capabilities the pipeline drives.
pub struct Collaborators<'a, A, B, R, F> {
    pub acquirer: &'a A,
    pub builder: &'a B,
    pub runner: &'a R,
    pub proposer: &'a F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Aborted,
}

/// Final report of a pipeline run, also written to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub source: RepoSource,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    /// Stage from which the terminal stage was entered.
    pub last_stage: Stage,
    /// Message of the failed stage, when a collaborator failed.
    pub error: Option<String>,
    /// Every error category observed during the run.
    pub error_categories: Vec<String>,
    /// Error records of the most recent analysis.
    pub error_messages: Vec<String>,
    pub failing_tests: Vec<String>,
    /// Change log of the last applied patch attempt.
    pub changelog_path: Option<PathBuf>,
    pub repo_path: Option<PathBuf>,
    /// Short HEAD commit of the working copy, when it is a git checkout.
    pub revision: Option<String>,
    /// Log of the most recent build attempt.
    pub build_log: Option<PathBuf>,
    /// Trailing build output (stderr, else stdout) when the build failed.
    pub build_error_tail: Option<String>,
    pub build_attempts: u32,
    pub test_retry_count: u32,
    pub patch_attempt_count: u32,
    pub duration_ms: u64,
    pub transitions: Vec<TransitionRecord>,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

struct Driver<'c, 'a, A, B, R, F> {
    collaborators: &'c Collaborators<'a, A, B, R, F>,
    config: &'c PipelineConfig,
    run: RunPaths,
    deadline: Instant,
}

/// Run the pipeline for `source` until it reaches Success or Aborted.
///
/// Collaborator failures end the run in Aborted with the message preserved;
/// only artifact-directory failures and illegal transitions are returned as
/// errors.
#[instrument(skip_all, fields(source = ?source))]
pub fn run_pipeline<A, B, R, F>(
    source: RepoSource,
    collaborators: &Collaborators<'_, A, B, R, F>,
    config: &PipelineConfig,
) -> Result<PipelineOutcome>
where
    A: SourceAcquirer,
    B: Builder,
    R: TestRunner,
    F: FixProposer + Sync,
{
    let started = Instant::now();
    let run = create_run_dir(&config.artifacts_dir, &source.name())?;
    info!(run_dir = %run.dir.display(), "pipeline run started");
    let driver = Driver {
        collaborators,
        config,
        run,
        deadline: started + config.run_timeout(),
    };

    let mut state = PipelineState::new(source);
    let mut stage = Stage::Start;
    let mut last_stage = stage;
    let mut abort_reason = None;
    let mut transitions = Vec::new();

    while !stage.is_terminal() {
        let event = match driver.perform(stage, &mut state) {
            Ok(event) => event,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(%stage, error = %message, "stage failed");
                state.last_error = Some(message.clone());
                Event::StageFailed { message }
            }
        };
        let next = transition(stage, &event).map_err(|err| anyhow!(err))?;
        debug!(from = %stage, to = %next, event = event.name(), "transition");
        transitions.push(TransitionRecord {
            from: stage,
            to: next,
            event: event.name().to_string(),
            test_retry_count: state.test_retry_count,
            patch_attempt_count: state.patch_attempt_count,
        });
        if next == Stage::Aborted {
            abort_reason = Some(AbortReason::from_edge(stage, &event));
        }
        last_stage = stage;
        stage = next;
    }

    let status = if stage == Stage::Success {
        RunStatus::Success
    } else {
        RunStatus::Aborted
    };
    let outcome = PipelineOutcome {
        run_dir: driver.run.dir.clone(),
        status,
        abort_reason,
        last_stage,
        error: state.last_error.clone(),
        error_categories: state.observed_categories.iter().cloned().collect(),
        error_messages: state
            .failure_report
            .error_records
            .iter()
            .map(describe_record)
            .collect(),
        failing_tests: state.failure_report.failing_tests.clone(),
        changelog_path: state.last_changelog.clone(),
        repo_path: state.repo_path().map(PathBuf::from),
        revision: state.repo_path().and_then(head_revision),
        build_log: state.last_build_log.clone(),
        build_error_tail: match abort_reason {
            Some(AbortReason::BuildFailed { .. }) => build_error_tail(&state),
            _ => None,
        },
        build_attempts: state.build_attempt,
        test_retry_count: state.test_retry_count,
        patch_attempt_count: state.patch_attempt_count,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        transitions,
        source: state.repo_source,
    };
    write_summary(&driver.run, &outcome)?;

    match outcome.abort_reason {
        Some(reason) => warn!(%reason, last_stage = %outcome.last_stage, "pipeline aborted"),
        None => info!(patch_attempts = outcome.patch_attempt_count, "pipeline succeeded"),
    }
    Ok(outcome)
}

fn head_revision(workdir: &Path) -> Option<String> {
    match Git::new(workdir).head_short_sha(12) {
        Ok(sha) => Some(sha),
        Err(err) => {
            debug!(err = %format!("{err:#}"), "working copy has no git revision");
            None
        }
    }
}

fn build_error_tail(state: &PipelineState) -> Option<String> {
    let build = state.build_result.as_ref()?;
    let output = if build.stderr.trim().is_empty() {
        &build.stdout
    } else {
        &build.stderr
    };
    let tail = tail_lines(output.trim_end(), BUILD_TAIL_LINES);
    (!tail.is_empty()).then_some(tail)
}

fn describe_record(record: &ErrorRecord) -> String {
    format!(
        "{}: {} ({}:{})",
        record.category, record.message, record.file, record.line
    )
}

impl<A, B, R, F> Driver<'_, '_, A, B, R, F>
where
    A: SourceAcquirer,
    B: Builder,
    R: TestRunner,
    F: FixProposer + Sync,
{
    fn perform(&self, stage: Stage, state: &mut PipelineState) -> Result<Event> {
        match stage {
            Stage::Start => Ok(Event::Begin {
                has_working_copy: state.repo_path().is_some(),
                has_remote: state.repo_source.is_remote(),
            }),
            Stage::Clone => self.clone_source(state),
            Stage::Build => self.build(state),
            Stage::Test => self.test(state),
            Stage::Analyze => Ok(self.analyze(state)),
            Stage::ProposeFix => self.propose(state),
            Stage::ApplyPatch => self.apply(state),
            Stage::Success | Stage::Aborted => {
                Err(anyhow!("terminal stage {stage} has no side effect"))
            }
        }
    }

    /// Stage timeout clamped to what is left of the run budget.
    fn stage_timeout(&self, limit: Duration) -> Result<Duration> {
        Ok(remaining_budget(self.deadline)?.min(limit))
    }

    fn clone_source(&self, state: &mut PipelineState) -> Result<Event> {
        let RepoSource::Remote(remote) = &state.repo_source else {
            return Err(anyhow!("clone requested for a local source"));
        };
        let timeout = self.stage_timeout(self.config.clone_timeout())?;
        let path = self
            .collaborators
            .acquirer
            .acquire(remote, &state.repo_source.name(), timeout)?;
        info!(path = %path.display(), "working copy ready");
        state.set_repo_path(path).map_err(anyhow::Error::msg)?;
        Ok(Event::Cloned)
    }

    fn build(&self, state: &mut PipelineState) -> Result<Event> {
        let attempt = state.begin_build_attempt();
        let workdir = state.require_repo_path().map_err(anyhow::Error::msg)?;
        let timeout = self.stage_timeout(self.config.build_timeout())?;
        info!(attempt, "building");
        let result = self.collaborators.builder.build(workdir, timeout)?;
        state.last_build_log = Some(write_build_log(&self.run, attempt, &result)?);
        let exit_code = result.exit_code;
        state.build_result = Some(result);
        Ok(Event::Built { exit_code })
    }

    fn test(&self, state: &mut PipelineState) -> Result<Event> {
        let workdir = state.require_repo_path().map_err(anyhow::Error::msg)?;
        let kinds = state
            .build_result
            .as_ref()
            .map(|b| b.project_kinds.clone())
            .unwrap_or_default();
        let timeout = self.stage_timeout(self.config.test_timeout())?;
        let result = self.collaborators.runner.run_tests(workdir, &kinds, timeout)?;
        state.test_retry_count += 1;
        info!(
            try_number = state.test_retry_count,
            exit_code = result.exit_code,
            "tests finished"
        );
        write_test_log(&self.run, state.build_attempt, state.test_retry_count, &result)?;
        state.test_log_text = result.combined_log();
        state.test_result = Some(result);
        Ok(Event::Tested)
    }

    fn analyze(&self, state: &mut PipelineState) -> Event {
        let report = match state.repo_path() {
            Some(workdir) => analyze(
                &workdir.join(&self.config.report_path),
                &state.test_log_text,
            ),
            None => parse_test_log(&state.test_log_text),
        };
        let exit_code = state.test_result.as_ref().map_or(0, |r| r.exit_code);
        let passed = exit_code == 0 && report.is_clean();
        let categories: Vec<String> = report.error_categories.iter().cloned().collect();
        info!(
            passed,
            mode = ?report.mode,
            failing = report.failing_tests.len(),
            categories = ?categories,
            "analysis finished"
        );
        state.record_failure_report(report);
        Event::Analyzed {
            passed,
            test_retry_count: state.test_retry_count,
            categories,
        }
    }

    fn propose(&self, state: &mut PipelineState) -> Result<Event> {
        let workdir = state.require_repo_path().map_err(anyhow::Error::msg)?;
        let attempt = state.patch_attempt_count + 1;
        let request = FixRequest {
            workdir: workdir.to_path_buf(),
            attempt,
            failure: FailureContext::from_report(
                &state.failure_report,
                &state.test_log_text,
                self.config.fixer.log_tail_lines,
            ),
            focus_files: state.failure_report.suspected_files.iter().cloned().collect(),
            output_dir: self.run.fix_dir(attempt),
            timeout: self.stage_timeout(self.config.fix_timeout())?,
        };
        let fixes = propose_fixes(
            self.collaborators.proposer,
            &request,
            self.config.fixer.parallel,
        )?;
        state.patch_attempt_count = attempt;
        if fixes.is_empty() {
            warn!(attempt, "fix proposal was empty");
        }
        let count = fixes.len();
        state.proposed_fixes = fixes;
        Ok(Event::FixesProposed { count })
    }

    fn apply(&self, state: &mut PipelineState) -> Result<Event> {
        let workdir = state.require_repo_path().map_err(anyhow::Error::msg)?;
        let attempt = state.patch_attempt_count;
        if !state.proposed_fixes.is_empty() {
            let report = apply_fixes(workdir, &state.proposed_fixes);
            let changelog = write_changelog(&self.run.dir, attempt, &report.applied)?;
            info!(
                attempt,
                files = ?report.applied_paths(),
                skipped = report.skipped.len(),
                changelog = %changelog.display(),
                "change log written"
            );
            state.last_changelog = Some(changelog);
        }
        state.proposed_fixes.clear();
        Ok(Event::PatchApplied {
            patch_attempt_count: attempt,
        })
    }
}
