//! What to do after a failed attempt.

use std::time::Duration;

use crate::settings::BatchSettings;

/// Action chosen for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Run the same iteration again after `delay`.
    Retry { delay: Duration },
    /// Give up on this iteration and move on to the next one.
    Skip,
    /// Give up on the batch.
    Abort,
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per iteration before it counts as failed.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
    /// Skip exhausted iterations instead of aborting.
    pub allow_fail: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, allow_fail: bool) -> Self {
        Self {
            max_attempts,
            delay,
            allow_fail,
        }
    }

    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self::new(
            settings.max_attempts,
            settings.delay_attempts(),
            settings.allow_fail,
        )
    }

    /// Whether `attempts` consecutive failures use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Decide the next step after the `attempts`-th consecutive failure
    /// (1-based).
    pub fn on_failure(&self, attempts: u32) -> FailureAction {
        if !self.is_exhausted(attempts) {
            FailureAction::Retry { delay: self.delay }
        } else if self.allow_fail {
            FailureAction::Skip
        } else {
            FailureAction::Abort
        }
    }
}
