//! Free-text failure extraction from combined test output.
//!
//! The scan is a single left-to-right pass. Location lines
//! (`path:line: SomeError`) and message lines (`E   SomeError: text`) appear at
//! non-adjacent positions, so messages wait in a per-category stack until a
//! location line of the same category claims them.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ErrorRecord, FailureReport, ParseMode};

/// Message used when no pending message matches a location line.
pub const MISSING_MESSAGE: &str = "See logs for details";

// The name keeps class segments (`TestCalc::test_add`) and parameters (`test_div[1-0]`).
static FAILED_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"FAILED\s+(\S+?)::(\S+?)(?:\s+-\s|\s*$)").expect("failed-test regex")
});

static INLINE_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*E\s+(?:\w+\.)*(\w+(?:Error|Exception|Unavailable)):\s+(.*)$")
        .expect("inline-error regex")
});

static LOCATED_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(.*?):(\d+):\s+(?:\w+\.)*(\w+(?:Error|Exception|Unavailable))\b")
        .expect("located-error regex")
});

/// Messages awaiting a location line, stacked per category.
#[derive(Debug, Default)]
pub struct PendingErrors {
    by_category: HashMap<String, Vec<String>>,
}

impl PendingErrors {
    pub fn push(&mut self, category: &str, message: String) {
        self.by_category
            .entry(category.to_string())
            .or_default()
            .push(message);
    }

    /// Remove and return the most recently pushed message for `category`.
    pub fn pop(&mut self, category: &str) -> Option<String> {
        let stack = self.by_category.get_mut(category)?;
        let message = stack.pop();
        if stack.is_empty() {
            self.by_category.remove(category);
        }
        message
    }

    pub fn clear(&mut self) {
        self.by_category.clear();
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_category.is_empty()
    }
}

/// Parse free-text test output into a [`FailureReport`].
///
/// Never fails: lines matching no pattern are dropped.
pub fn parse_test_log(text: &str) -> FailureReport {
    let mut report = FailureReport::empty(ParseMode::FreeText);
    let mut pending = PendingErrors::default();

    for line in text.lines() {
        if let Some(caps) = FAILED_TEST_RE.captures(line) {
            let file = caps[1].trim();
            let name = &caps[2];
            report.push_failing_test(format!("{file}::{name}"));
            report.suspected_files.insert(file.to_string());
            pending.clear();
            continue;
        }

        if let Some(caps) = INLINE_ERROR_RE.captures(line) {
            let category = &caps[1];
            pending.push(category, caps[2].trim_end().to_string());
            report.error_categories.insert(category.to_string());
            continue;
        }

        if let Some(caps) = LOCATED_ERROR_RE.captures(line) {
            let file = caps[1].trim();
            let Ok(line_number) = caps[2].parse::<u32>() else {
                continue;
            };
            if file.is_empty() {
                continue;
            }
            let category = caps[3].to_string();
            let message = pending
                .pop(&category)
                .unwrap_or_else(|| MISSING_MESSAGE.to_string());

            report.error_categories.insert(category.clone());
            report.suspected_files.insert(file.to_string());
            report.error_records.push(ErrorRecord {
                category,
                message,
                file: file.to_string(),
                line: line_number,
            });
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_FAILURE: &str = "
=================================== FAILURES ===================================
_________________________________ test_example _________________________________
    def test_example():
>       assert 1 == 2
E       AssertionError: assert 1 == 2

tests/test_simple.py:4: AssertionError
FAILED tests/test_simple.py::test_example
=========================== 1 failed in 0.05s ============================
";

    const PYTEST_SESSION: &str = "
============================= test session starts ==============================
platform darwin -- Python 3.12.0, pytest-9.0.2, pluggy-1.6.0
rootdir: /Users/dev/project
collected 2 items

examples/calc_app/tests/test_calc.py F.                                  [100%]

=================================== FAILURES ===================================
___________________________________ test_add ___________________________________

    def test_add():
>       assert add(2, 2) == 4
E       assert 3 == 4
E        +  where 3 = add(2, 2)

examples/calc_app/tests/test_calc.py:5: AssertionError
=========================== short test summary info ============================
FAILED examples/calc_app/tests/test_calc.py::test_add - assert 3 == 4
========================= 1 failed, 1 passed in 0.04s ==========================
";

    #[test]
    fn simple_failure_is_reported() {
        let report = parse_test_log(SIMPLE_FAILURE);

        assert_eq!(report.mode, ParseMode::FreeText);
        assert_eq!(report.failing_tests, vec!["tests/test_simple.py::test_example"]);
        assert!(report.error_categories.contains("AssertionError"));
        assert!(report.suspected_files.contains("tests/test_simple.py"));
        assert_eq!(
            report.error_records,
            vec![ErrorRecord {
                category: "AssertionError".to_string(),
                message: "assert 1 == 2".to_string(),
                file: "tests/test_simple.py".to_string(),
                line: 4,
            }]
        );
    }

    #[test]
    fn failed_line_with_message_above_it() {
        let log = "E   AssertionError: assert 1 == 2\nFAILED tests/test_simple.py::test_example\n";
        let report = parse_test_log(log);

        assert_eq!(report.failing_tests, vec!["tests/test_simple.py::test_example"]);
        assert!(report.error_categories.contains("AssertionError"));
    }

    #[test]
    fn multiple_failures_of_different_categories() {
        let log = "
FAILED tests/api/test_login.py::test_login_failure
E   ValueError: Invalid token
FAILED tests/ui/test_dashboard.py::test_layout
E   RuntimeError: Timeout
";
        let report = parse_test_log(log);

        assert_eq!(report.failing_tests.len(), 2);
        assert!(
            report
                .failing_tests
                .contains(&"tests/api/test_login.py::test_login_failure".to_string())
        );
        assert!(
            report
                .failing_tests
                .contains(&"tests/ui/test_dashboard.py::test_layout".to_string())
        );
        assert!(report.error_categories.contains("ValueError"));
        assert!(report.error_categories.contains("RuntimeError"));
        assert_eq!(report.suspected_files.len(), 2);
    }

    #[test]
    fn passing_session_yields_empty_report() {
        let log = "
tests/test_good.py ..                                                    [100%]
============================== 2 passed in 0.01s ===============================
";
        let report = parse_test_log(log);

        assert!(report.failing_tests.is_empty());
        assert!(report.error_categories.is_empty());
        assert!(report.suspected_files.is_empty());
        assert!(report.error_records.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn location_line_without_matching_message_uses_placeholder() {
        let report = parse_test_log(PYTEST_SESSION);

        assert!(
            report
                .failing_tests
                .contains(&"examples/calc_app/tests/test_calc.py::test_add".to_string())
        );
        assert!(
            report
                .suspected_files
                .contains("examples/calc_app/tests/test_calc.py")
        );
        assert!(report.error_categories.contains("AssertionError"));

        let record = report
            .error_records
            .iter()
            .find(|r| r.category == "AssertionError")
            .expect("assertion record");
        assert_eq!(record.file, "examples/calc_app/tests/test_calc.py");
        assert_eq!(record.line, 5);
        assert_eq!(record.message, MISSING_MESSAGE);
    }

    #[test]
    fn messages_are_matched_by_category_not_proximity() {
        let log = "
E   ValueError: bad value
E   TimeoutError: took too long
src/io.py:12: ValueError
src/net.py:40: TimeoutError
";
        let report = parse_test_log(log);

        assert_eq!(report.error_records.len(), 2);
        assert_eq!(report.error_records[0].message, "bad value");
        assert_eq!(report.error_records[0].file, "src/io.py");
        assert_eq!(report.error_records[1].message, "took too long");
        assert_eq!(report.error_records[1].line, 40);
    }

    #[test]
    fn same_category_messages_pop_most_recent_first() {
        let log = "
E   ValueError: first
E   ValueError: second
a.py:1: ValueError
a.py:2: ValueError
a.py:3: ValueError
";
        let report = parse_test_log(log);
        let messages: Vec<&str> = report
            .error_records
            .iter()
            .map(|r| r.message.as_str())
            .collect();
        assert_eq!(messages, vec!["second", "first", MISSING_MESSAGE]);
    }

    #[test]
    fn failed_marker_discards_pending_messages() {
        let log = "
E   ValueError: belongs to first test
FAILED tests/test_a.py::test_one
tests/test_b.py:9: ValueError
";
        let report = parse_test_log(log);
        assert_eq!(report.error_records.len(), 1);
        assert_eq!(report.error_records[0].message, MISSING_MESSAGE);
    }

    #[test]
    fn qualified_categories_are_reduced_to_last_segment() {
        let log = "
E   requests.exceptions.ConnectionError: connection refused
tests/test_api.py:7: requests.exceptions.ConnectionError
";
        let report = parse_test_log(log);
        assert!(report.error_categories.contains("ConnectionError"));
        assert_eq!(report.error_categories.len(), 1);
        assert_eq!(report.error_records[0].message, "connection refused");
    }

    #[test]
    fn duplicate_failed_lines_are_collapsed() {
        let log = "
FAILED tests/test_a.py::test_one - boom
FAILED tests/test_a.py::test_one
";
        let report = parse_test_log(log);
        assert_eq!(report.failing_tests, vec!["tests/test_a.py::test_one"]);
        assert_eq!(report.suspected_files.len(), 1);
    }

    #[test]
    fn class_and_parametrized_ids_stay_distinct() {
        let log = "
FAILED tests/test_calc.py::TestCalc::test_add - assert 3 == 4
FAILED tests/test_calc.py::TestCalc::test_sub - assert 1 == 0
FAILED tests/test_p.py::test_div[1-0] - ZeroDivisionError: division by zero
FAILED tests/test_p.py::test_div[2-0]
";
        let report = parse_test_log(log);

        assert_eq!(
            report.failing_tests,
            vec![
                "tests/test_calc.py::TestCalc::test_add",
                "tests/test_calc.py::TestCalc::test_sub",
                "tests/test_p.py::test_div[1-0]",
                "tests/test_p.py::test_div[2-0]",
            ]
        );
        assert_eq!(
            report.suspected_files.iter().collect::<Vec<_>>(),
            vec!["tests/test_calc.py", "tests/test_p.py"]
        );
    }

    #[test]
    fn malformed_input_is_ignored() {
        let report = parse_test_log("\u{0}\u{1}garbage ::: FAILED\n:::\nE :\n:12: \n");
        assert!(report.is_clean());
        assert!(report.error_categories.is_empty());
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(parse_test_log(PYTEST_SESSION), parse_test_log(PYTEST_SESSION));
    }

    #[test]
    fn pending_errors_pop_per_category() {
        let mut pending = PendingErrors::default();
        pending.push("ValueError", "a".to_string());
        pending.push("TypeError", "b".to_string());
        pending.push("ValueError", "c".to_string());

        assert_eq!(pending.pop("ValueError").as_deref(), Some("c"));
        assert_eq!(pending.pop("KeyError"), None);
        assert_eq!(pending.pop("TypeError").as_deref(), Some("b"));
        assert_eq!(pending.pop("ValueError").as_deref(), Some("a"));
        assert!(pending.is_empty());
    }
}
