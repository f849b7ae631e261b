//! Structured failure extraction from JUnit-style XML reports.
//!
//! Accepts the dialects written by `pytest --junitxml` and
//! `ctest --output-junit`: any number of `<testcase>` elements (nesting under
//! `<testsuites>`/`<testsuite>` is irrelevant) with optional `<failure>` or
//! `<error>` children. `<skipped>` and output captures are ignored.

use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use crate::core::types::{ErrorRecord, FailureReport, ParseMode, UNKNOWN_FILE};

/// Category used when a marker declares no `type` attribute.
pub const DEFAULT_CATEGORY: &str = "Failure";
/// Message used when a marker has neither body text nor a `message` attribute.
pub const MISSING_MESSAGE: &str = "No message provided";

static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s:'"()\[\]]+\.\w+):(\d+):"#).expect("location regex")
});

#[derive(Debug, Default)]
struct Marker {
    category: String,
    message_attr: Option<String>,
    body: String,
    file: Option<String>,
    line: Option<u32>,
}

#[derive(Debug, Default)]
struct TestCase {
    id: String,
    file: Option<String>,
    line: Option<u32>,
    markers: Vec<Marker>,
}

/// Parse a JUnit XML document into a [`FailureReport`].
///
/// Returns an error only for XML that cannot be tokenized; callers decide how
/// to fall back.
pub fn parse_junit_report(xml: &str) -> Result<FailureReport, String> {
    let mut reader = Reader::from_str(xml);
    let mut report = FailureReport::empty(ParseMode::Structured);
    let mut case: Option<TestCase> = None;
    let mut marker: Option<Marker> = None;

    loop {
        let event = reader.read_event().map_err(|err| {
            format!(
                "invalid report xml at byte {}: {err}",
                reader.buffer_position()
            )
        })?;
        match event {
            Event::Start(el) => match el.name().as_ref() {
                b"testcase" => case = Some(test_case_from(&el)),
                b"failure" | b"error" if case.is_some() => marker = Some(marker_from(&el)),
                _ => {}
            },
            Event::Empty(el) => match el.name().as_ref() {
                // A self-closing test case has no markers, so it passed.
                b"testcase" => {}
                b"failure" | b"error" => {
                    if let Some(current) = case.as_mut() {
                        current.markers.push(marker_from(&el));
                    }
                }
                _ => {}
            },
            Event::Text(text) => {
                if let Some(current) = marker.as_mut() {
                    let decoded = text
                        .unescape()
                        .map_err(|err| format!("invalid text in report: {err}"))?;
                    current.body.push_str(&decoded);
                }
            }
            Event::CData(data) => {
                if let Some(current) = marker.as_mut() {
                    current.body.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(el) => match el.name().as_ref() {
                b"failure" | b"error" => {
                    if let (Some(current), Some(done)) = (case.as_mut(), marker.take()) {
                        current.markers.push(done);
                    }
                }
                b"testcase" => {
                    if let Some(done) = case.take() {
                        record_test_case(&mut report, done);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(report)
}

fn test_case_from(el: &BytesStart<'_>) -> TestCase {
    let classname = attr(el, b"classname").unwrap_or_default();
    let name = attr(el, b"name").unwrap_or_default();
    let id = if classname.is_empty() {
        name
    } else {
        format!("{classname}::{name}")
    };
    TestCase {
        id,
        file: attr(el, b"file").filter(|f| !f.is_empty()),
        line: attr(el, b"line").and_then(|l| l.trim().parse().ok()),
        markers: Vec::new(),
    }
}

fn marker_from(el: &BytesStart<'_>) -> Marker {
    Marker {
        category: attr(el, b"type")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        message_attr: attr(el, b"message"),
        body: String::new(),
        file: attr(el, b"file").filter(|f| !f.is_empty()),
        line: attr(el, b"line").and_then(|l| l.trim().parse().ok()),
    }
}

fn attr(el: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    el.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn record_test_case(report: &mut FailureReport, case: TestCase) {
    let TestCase {
        id,
        file: case_file,
        line: case_line,
        markers,
    } = case;
    if markers.is_empty() {
        return;
    }
    report.push_failing_test(id);

    for marker in markers {
        let message = resolve_message(&marker);
        let (file, line) = resolve_location(case_file.as_deref(), case_line, &marker, &message);

        report.error_categories.insert(marker.category.clone());
        if file != UNKNOWN_FILE {
            report.suspected_files.insert(file.clone());
        }
        report.error_records.push(ErrorRecord {
            category: marker.category,
            message,
            file,
            line,
        });
    }
}

fn resolve_message(marker: &Marker) -> String {
    let body = marker.body.trim();
    if !body.is_empty() {
        return body.to_string();
    }
    match marker.message_attr.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => MISSING_MESSAGE.to_string(),
    }
}

/// Test case attributes win over marker attributes, which win over a
/// `path:line:` found in the message.
fn resolve_location(
    case_file: Option<&str>,
    case_line: Option<u32>,
    marker: &Marker,
    message: &str,
) -> (String, u32) {
    if let Some(file) = case_file.or(marker.file.as_deref()) {
        let line = case_line.or(marker.line).unwrap_or(0);
        return (file.to_string(), line);
    }
    if let Some(caps) = LOCATION_RE.captures(message)
        && let Ok(line) = caps[2].parse::<u32>()
    {
        return (caps[1].to_string(), line);
    }
    (UNKNOWN_FILE.to_string(), 0)
}
