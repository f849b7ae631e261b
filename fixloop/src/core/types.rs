//! Shared deterministic types for the pipeline core.
//!
//! These types are the contracts between the log parser, the policies and the
//! state machine. They carry no I/O handles and serialize deterministically
//! (ordered sets and maps only).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// File attribution used when a failure cannot be tied to a source location.
pub const UNKNOWN_FILE: &str = "unknown";

/// Which parser produced a [`FailureReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Parsed from a structured test report inside the working copy.
    Structured,
    /// Parsed line by line from combined stdout/stderr.
    #[default]
    FreeText,
}

/// One failing assertion or exception attributed to a source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: String,
    pub message: String,
    pub file: String,
    pub line: u32,
}

/// Normalized failure set extracted from build/test evidence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureReport {
    pub mode: ParseMode,
    /// `<location>::<name>` identifiers, unique, in first-occurrence order.
    pub failing_tests: Vec<String>,
    pub error_categories: BTreeSet<String>,
    pub suspected_files: BTreeSet<String>,
    pub error_records: Vec<ErrorRecord>,
}

impl FailureReport {
    pub fn empty(mode: ParseMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Append a failing test id unless it is already present.
    pub fn push_failing_test(&mut self, id: String) {
        if !self.failing_tests.contains(&id) {
            self.failing_tests.push(id);
        }
    }

    /// True when the report carries no failing tests and no error records.
    pub fn is_clean(&self) -> bool {
        self.failing_tests.is_empty() && self.error_records.is_empty()
    }
}

/// Project flavours the builder knows how to build and test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Python,
    Cpp,
}

impl ProjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectKind::Python => "python",
            ProjectKind::Cpp => "cpp",
        }
    }
}

/// Output of one build attempt.
///
/// `project_kinds` holds every kind whose marker files were found; membership is
/// the evidence flag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub project_kinds: BTreeSet<ProjectKind>,
}

/// Output of one test run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestRunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TestRunResult {
    /// Stdout followed by stderr, the evidence handed to the log parser.
    pub fn combined_log(&self) -> String {
        let mut buf = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        buf.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            buf.push('\n');
        }
        buf.push_str(&self.stderr);
        buf
    }
}

/// Proposed fixes: repository-relative path to complete replacement content.
pub type FixSet = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_failing_test_keeps_first_occurrence_order() {
        let mut report = FailureReport::default();
        report.push_failing_test("b.py::t".to_string());
        report.push_failing_test("a.py::t".to_string());
        report.push_failing_test("b.py::t".to_string());
        assert_eq!(report.failing_tests, vec!["b.py::t", "a.py::t"]);
    }

    #[test]
    fn combined_log_separates_streams() {
        let run = TestRunResult {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(run.combined_log(), "out\nerr");
    }

    #[test]
    fn project_kinds_serialize_lowercase() {
        let json = serde_json::to_string(&ProjectKind::Cpp).expect("serialize");
        assert_eq!(json, "\"cpp\"");
    }
}
