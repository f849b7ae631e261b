//! Build-test-diagnose-patch loop for arbitrary source repositories.
//!
//! A run clones (or reuses) a working copy, builds it and runs its tests in a
//! container, parses the failures, and either retries transient failures,
//! asks a coding agent for a fix and rebuilds, or stops. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (log and report parsing, retry and
//!   budget policies, the stage machine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, git, docker, the fix
//!   agent, run artifacts). Collaborators sit behind traits so tests can script
//!   them.
//!
//! [`pipeline`] joins the two: it drives the stage machine and performs each
//! stage's side effect.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
