//! Bounded budgets for the fix loop.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Number of fix-apply-rebuild cycles after which the pipeline stops.
pub const MAX_PATCH_ATTEMPTS: u32 = 3;

/// True once `patch_attempt_count` has reached [`MAX_PATCH_ATTEMPTS`].
pub fn max_patch_attempts_reached(patch_attempt_count: u32) -> bool {
    patch_attempt_count >= MAX_PATCH_ATTEMPTS
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("time budget exhausted"));
    }
    Ok(remaining)
}
