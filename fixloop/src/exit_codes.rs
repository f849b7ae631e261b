//! Stable exit codes for fixloop CLI commands.

/// Command succeeded; for `fixloop run`, the pipeline reached Success.
pub const OK: i32 = 0;
/// Invalid input or config, or an error outside the pipeline stages.
pub const INVALID: i32 = 1;
/// `fixloop run` ended in Aborted.
pub const ABORTED: i32 = 2;
