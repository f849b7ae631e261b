//! Test evidence analysis: structured report when available, free text otherwise.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::junit::parse_junit_report;
use crate::core::log_parser::parse_test_log;
use crate::core::types::{FailureReport, ParseMode};

/// Analyze one test run.
///
/// Uses the JUnit report at `report_file` when it exists and parses;
/// otherwise falls back to parsing `log_text`. Never fails.
#[instrument(skip_all, fields(report_file = %report_file.display()))]
pub fn analyze(report_file: &Path, log_text: &str) -> FailureReport {
    match read_structured(report_file) {
        Ok(Some(report)) => {
            debug!(
                failing = report.failing_tests.len(),
                "parsed structured report"
            );
            return report;
        }
        Ok(None) => debug!("no structured report, parsing log"),
        Err(err) => warn!(err = %format!("{err:#}"), "unusable structured report, parsing log"),
    }
    parse_test_log(log_text)
}

/// Parse a structured report file; a missing file yields an empty report.
pub fn parse_report_file(path: &Path) -> Result<FailureReport> {
    Ok(read_structured(path)?.unwrap_or_else(|| FailureReport::empty(ParseMode::Structured)))
}

fn read_structured(path: &Path) -> Result<Option<FailureReport>> {
    if !path.is_file() {
        return Ok(None);
    }
    let xml = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let report = parse_junit_report(&xml)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "E   AssertionError: assert 3 == 4\n\
tests/test_calc.py:5: AssertionError\n\
FAILED tests/test_calc.py::test_add - assert 3 == 4\n";

    #[test]
    fn missing_report_falls_back_to_free_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = analyze(&temp.path().join("report.xml"), LOG);

        assert_eq!(report.mode, ParseMode::FreeText);
        assert_eq!(report.failing_tests, vec!["tests/test_calc.py::test_add"]);
    }

    #[test]
    fn structured_report_wins_over_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("report.xml"),
            r#"<testsuite><testcase classname="t" name="ok"/></testsuite>"#,
        )
        .expect("write");
        let report = analyze(&temp.path().join("report.xml"), LOG);

        assert_eq!(report.mode, ParseMode::Structured);
        assert!(report.is_clean());
    }

    #[test]
    fn malformed_report_falls_back_to_free_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("report.xml"), "<testsuite><testcase></testsuite>")
            .expect("write");
        let report = analyze(&temp.path().join("report.xml"), LOG);

        assert_eq!(report.mode, ParseMode::FreeText);
        assert!(report.error_categories.contains("AssertionError"));
    }

    #[test]
    fn parse_report_file_is_empty_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = parse_report_file(&temp.path().join("nope.xml")).expect("parse");
        assert_eq!(report.mode, ParseMode::Structured);
        assert!(report.is_clean());
    }
}
