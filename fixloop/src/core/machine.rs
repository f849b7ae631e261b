//! Explicit finite-state machine for the build-test-fix loop.
//!
//! ```text
//! Start      -> Build | Clone | Aborted
//! Clone      -> Build
//! Build      -> Test | Aborted            (non-zero build exit is never patched)
//! Test       -> Analyze
//! Analyze    -> Success | Test | ProposeFix
//! ProposeFix -> ApplyPatch
//! ApplyPatch -> Build | Aborted           (patch budget)
//! any non-terminal stage -> Aborted       (collaborator failure)
//! ```
//!
//! [`transition`] is pure. The driver in [`crate::pipeline`] performs the side
//! effect for the current stage, turns its result into an [`Event`], and asks
//! [`transition`] for the next stage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::budget::max_patch_attempts_reached;
use crate::core::retry::should_retry_tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Clone,
    Build,
    Test,
    Analyze,
    ProposeFix,
    ApplyPatch,
    Success,
    Aborted,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Success | Stage::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Clone => "clone",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Analyze => "analyze",
            Stage::ProposeFix => "propose_fix",
            Stage::ApplyPatch => "apply_patch",
            Stage::Success => "success",
            Stage::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of performing the side effect of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin {
        has_working_copy: bool,
        has_remote: bool,
    },
    Cloned,
    Built {
        exit_code: i32,
    },
    Tested,
    Analyzed {
        passed: bool,
        test_retry_count: u32,
        categories: Vec<String>,
    },
    FixesProposed {
        count: usize,
    },
    PatchApplied {
        patch_attempt_count: u32,
    },
    StageFailed {
        message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Begin { .. } => "begin",
            Event::Cloned => "cloned",
            Event::Built { .. } => "built",
            Event::Tested => "tested",
            Event::Analyzed { .. } => "analyzed",
            Event::FixesProposed { .. } => "fixes_proposed",
            Event::PatchApplied { .. } => "patch_applied",
            Event::StageFailed { .. } => "stage_failed",
        }
    }
}

/// Why a run ended in [`Stage::Aborted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// Neither a working copy nor a clonable remote was provided.
    NoSource,
    /// The build exited non-zero.
    BuildFailed { exit_code: i32 },
    /// The fix loop used up its patch attempts.
    PatchBudgetExhausted { attempts: u32 },
    /// A collaborator or I/O failure during `stage`.
    StageError { stage: Stage },
}

impl AbortReason {
    /// Derive the abort reason for an edge into [`Stage::Aborted`].
    pub fn from_edge(from: Stage, event: &Event) -> Self {
        match event {
            Event::Begin { .. } => AbortReason::NoSource,
            Event::Built { exit_code } => AbortReason::BuildFailed {
                exit_code: *exit_code,
            },
            Event::PatchApplied {
                patch_attempt_count,
            } => AbortReason::PatchBudgetExhausted {
                attempts: *patch_attempt_count,
            },
            _ => AbortReason::StageError { stage: from },
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoSource => write!(f, "no usable repository source"),
            AbortReason::BuildFailed { exit_code } => {
                write!(f, "build failed with exit code {exit_code}")
            }
            AbortReason::PatchBudgetExhausted { attempts } => {
                write!(f, "patch budget exhausted after {attempts} attempts")
            }
            AbortReason::StageError { stage } => write!(f, "{stage} stage failed"),
        }
    }
}

/// A single recorded stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Stage,
    pub to: Stage,
    pub event: String,
    pub test_retry_count: u32,
    pub patch_attempt_count: u32,
}

/// Compute the next stage for `event` observed in `stage`.
///
/// Errors when the event cannot occur in `stage`, including any event observed
/// after a terminal stage.
pub fn transition(stage: Stage, event: &Event) -> Result<Stage, String> {
    if stage.is_terminal() {
        return Err(format!(
            "no transition out of terminal stage {stage} (event {})",
            event.name()
        ));
    }

    let next = match (stage, event) {
        (_, Event::StageFailed { .. }) => Stage::Aborted,
        (
            Stage::Start,
            Event::Begin {
                has_working_copy,
                has_remote,
            },
        ) => {
            if *has_working_copy {
                Stage::Build
            } else if *has_remote {
                Stage::Clone
            } else {
                Stage::Aborted
            }
        }
        (Stage::Clone, Event::Cloned) => Stage::Build,
        (Stage::Build, Event::Built { exit_code }) => {
            if *exit_code == 0 {
                Stage::Test
            } else {
                Stage::Aborted
            }
        }
        (Stage::Test, Event::Tested) => Stage::Analyze,
        (
            Stage::Analyze,
            Event::Analyzed {
                passed,
                test_retry_count,
                categories,
            },
        ) => {
            if *passed {
                Stage::Success
            } else if should_retry_tests(*test_retry_count, categories) {
                Stage::Test
            } else {
                Stage::ProposeFix
            }
        }
        (Stage::ProposeFix, Event::FixesProposed { .. }) => Stage::ApplyPatch,
        (
            Stage::ApplyPatch,
            Event::PatchApplied {
                patch_attempt_count,
            },
        ) => {
            if max_patch_attempts_reached(*patch_attempt_count) {
                Stage::Aborted
            } else {
                Stage::Build
            }
        }
        (stage, event) => {
            return Err(format!(
                "illegal event {} in stage {stage}",
                event.name()
            ));
        }
    };
    Ok(next)
}
