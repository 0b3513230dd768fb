//! Run state owned by the controller.

use serde::Serialize;
use serde_json::{Map, Value};

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Never started, or reset since the last batch.
    #[default]
    Idle,
    /// An attempt is about to run or is in flight.
    Running,
    /// Waiting out the retry delay after a failed attempt.
    RetryWaiting,
    /// Batch completed (cap reached, explicit end, or halt honored).
    Finished,
    /// Batch gave up after an unrecoverable iteration.
    Aborted,
}

/// Counters and flags for the current batch.
///
/// `batch_count` is cumulative over the controller's lifetime; everything
/// else is reinitialized when a batch starts or on `reset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    pub batch_count: u32,
    /// Current iteration index within the batch, 0-based.
    pub iteration: u32,
    pub completed: u32,
    pub failed: u32,
    /// Consecutive failed attempts for the current iteration.
    pub attempts: u32,
    pub running: bool,
    pub halt_requested: bool,
    pub last_params: Value,
    pub phase: Phase,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            batch_count: 0,
            iteration: 0,
            completed: 0,
            failed: 0,
            attempts: 0,
            running: false,
            halt_requested: false,
            last_params: Value::Object(Map::new()),
            phase: Phase::Idle,
        }
    }
}

impl RunState {
    /// Zero the per-batch fields, keeping the lifetime batch count.
    pub fn reset(&mut self) {
        *self = Self {
            batch_count: self.batch_count,
            ..Self::default()
        };
    }
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEnd {
    Finished,
    Aborted,
}

/// Result of a completed `start`/`resume` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub end: BatchEnd,
    /// State at the moment the batch ended.
    pub state: RunState,
}

impl BatchOutcome {
    pub fn is_finished(&self) -> bool {
        self.end == BatchEnd::Finished
    }

    pub fn is_aborted(&self) -> bool {
        self.end == BatchEnd::Aborted
    }
}
