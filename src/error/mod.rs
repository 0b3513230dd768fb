//! Error types for the batch controller.
//!
//! Usage errors (`AlreadyRunning`, `BatchLimitExceeded`, `NoSavedState`,
//! `MalformedState`, `Running`) are returned synchronously to the caller of
//! `start`/`resume`/`reset` and never mutate run state. Task failures are not
//! errors at this level: they travel through [`crate::task::TaskOutcome`] and
//! are handled by the retry policy.

use std::io;

use thiserror::Error;

/// Errors reported to callers of the controller's lifecycle operations.
#[derive(Error, Debug)]
pub enum BatchError {
    /// A batch is already in flight on this controller.
    #[error("batch already running")]
    AlreadyRunning,

    /// The controller has used up its lifetime batch budget.
    #[error("maximum batches exceeded (limit {max})")]
    BatchLimitExceeded { max: u32 },

    /// Nothing has been persisted under the configured state key.
    #[error("parameters from last batch not found under key '{key}'")]
    NoSavedState { key: String },

    /// The persisted record could not be read or decoded.
    #[error("saved state under key '{key}' is malformed: {reason}")]
    MalformedState { key: String, reason: String },

    /// The requested operation is only allowed while idle.
    #[error("operation not allowed while a batch is running")]
    Running,
}

/// Errors raised by [`crate::store::StateStore`] backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_limit_message_includes_limit() {
        let err = BatchError::BatchLimitExceeded { max: 3 };
        assert_eq!(err.to_string(), "maximum batches exceeded (limit 3)");
    }

    #[test]
    fn test_malformed_state_message() {
        let err = BatchError::MalformedState {
            key: "batch_last_params".to_string(),
            reason: "expected value".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch_last_params"));
        assert!(msg.contains("expected value"));
    }

    #[test]
    fn test_store_error_from_io() {
        let err: StoreError = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().starts_with("IO error"));
    }
}
