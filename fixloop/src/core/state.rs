//! Pipeline state threaded through the orchestrator.
//!
//! A single [`PipelineState`] value is owned by the driving loop for the
//! lifetime of one run; no other component holds a writable reference.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::types::{BuildResult, FailureReport, FixSet, TestRunResult};

const REMOTE_PREFIXES: &[&str] = &["http://", "https://", "ssh://", "git://", "git@"];

/// Where the repository under test comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoSource {
    Remote(String),
    Local(PathBuf),
}

impl RepoSource {
    /// Classify user input as a clonable remote or a local path.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let is_remote = trimmed.ends_with(".git")
            || REMOTE_PREFIXES
                .iter()
                .any(|prefix| trimmed.starts_with(prefix));
        if is_remote {
            RepoSource::Remote(trimmed.to_string())
        } else {
            RepoSource::Local(PathBuf::from(trimmed))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, RepoSource::Remote(_))
    }

    /// Short, filesystem-safe name derived from the last path segment.
    pub fn name(&self) -> String {
        let raw = match self {
            RepoSource::Remote(url) => url
                .trim_end_matches('/')
                .rsplit(['/', ':'])
                .next()
                .unwrap_or_default()
                .to_string(),
            RepoSource::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let raw = raw.strip_suffix(".git").unwrap_or(&raw);
        let cleaned: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
            "repo".to_string()
        } else {
            cleaned
        }
    }
}

/// Mutable record consumed and updated by every stage.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub repo_source: RepoSource,
    repo_path: Option<PathBuf>,
    pub build_result: Option<BuildResult>,
    pub test_result: Option<TestRunResult>,
    /// Combined stdout/stderr of the most recent test run.
    pub test_log_text: String,
    pub failure_report: FailureReport,
    /// Test runs performed against the current build; reset by every build.
    pub test_retry_count: u32,
    /// Fix proposals made over the whole run; never reset.
    pub patch_attempt_count: u32,
    pub proposed_fixes: FixSet,
    /// Every category seen by any analysis in this run.
    pub observed_categories: BTreeSet<String>,
    /// Number of build attempts started so far.
    pub build_attempt: u32,
    pub last_error: Option<String>,
    pub last_changelog: Option<PathBuf>,
    pub last_build_log: Option<PathBuf>,
}

impl PipelineState {
    /// Create the initial state; an existing local directory becomes the working copy.
    pub fn new(repo_source: RepoSource) -> Self {
        let repo_path = match &repo_source {
            RepoSource::Local(path) if path.is_dir() => Some(path.clone()),
            _ => None,
        };
        Self {
            repo_source,
            repo_path,
            build_result: None,
            test_result: None,
            test_log_text: String::new(),
            failure_report: FailureReport::default(),
            test_retry_count: 0,
            patch_attempt_count: 0,
            proposed_fixes: FixSet::new(),
            observed_categories: BTreeSet::new(),
            build_attempt: 0,
            last_error: None,
            last_changelog: None,
            last_build_log: None,
        }
    }

    pub fn repo_path(&self) -> Option<&Path> {
        self.repo_path.as_deref()
    }

    /// Record the working copy location. It can be set only once.
    pub fn set_repo_path(&mut self, path: PathBuf) -> Result<(), String> {
        if let Some(existing) = &self.repo_path {
            return Err(format!(
                "working copy already set to {}",
                existing.display()
            ));
        }
        if path.as_os_str().is_empty() {
            return Err("working copy path is empty".to_string());
        }
        self.repo_path = Some(path);
        Ok(())
    }

    /// Working copy path, required before any build or test stage.
    pub fn require_repo_path(&self) -> Result<&Path, String> {
        self.repo_path()
            .ok_or_else(|| "no working copy available".to_string())
    }

    /// Start a new build attempt: the test retry budget starts over.
    pub fn begin_build_attempt(&mut self) -> u32 {
        self.build_attempt += 1;
        self.test_retry_count = 0;
        self.build_attempt
    }

    /// Store a fresh analysis result and fold its categories into the run history.
    pub fn record_failure_report(&mut self, report: FailureReport) {
        self.observed_categories
            .extend(report.error_categories.iter().cloned());
        self.failure_report = report;
    }
}
