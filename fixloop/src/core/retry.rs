//! Transient-failure retry policy for test runs.
//!
//! Retries are conservative: a test stage is re-run only when every observed
//! category is known to be transient and the per-build ceiling is not reached.

/// Maximum number of test runs per build attempt.
pub const MAX_TEST_RETRIES: u32 = 3;

/// Categories presumed recoverable by re-running without code changes.
pub const RETRIABLE_CATEGORIES: &[&str] = &[
    "ConnectionError",
    "NetworkError",
    "TimeoutError",
    "NoSuchElementException",
    "ResourceUnavailable",
];

/// Categories that signal deterministic defects.
pub const NON_RETRIABLE_CATEGORIES: &[&str] = &["AssertionError", "ModuleNotFoundError"];

/// Retry classification of a single error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryClass {
    Retriable,
    NonRetriable,
    Unknown,
}

pub fn classify_category(category: &str) -> CategoryClass {
    if NON_RETRIABLE_CATEGORIES.contains(&category) {
        CategoryClass::NonRetriable
    } else if RETRIABLE_CATEGORIES.contains(&category) {
        CategoryClass::Retriable
    } else {
        CategoryClass::Unknown
    }
}

/// Decide whether a failed test stage should be re-run on the same build.
///
/// - `false` once `retry_count` reaches [`MAX_TEST_RETRIES`].
/// - `false` if any category is non-retriable.
/// - `true` only if every category is retriable (vacuously true when empty).
pub fn should_retry_tests<I>(retry_count: u32, categories: I) -> bool
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    if retry_count >= MAX_TEST_RETRIES {
        return false;
    }
    let classes: Vec<CategoryClass> = categories
        .into_iter()
        .map(|category| classify_category(category.as_ref()))
        .collect();
    if classes.contains(&CategoryClass::NonRetriable) {
        return false;
    }
    classes
        .iter()
        .all(|class| *class == CategoryClass::Retriable)
}
