//! batchloop - retryable, resumable iteration controller
//!
//! Runs an externally supplied asynchronous unit of work in sequential
//! batches: counts successes and failures, retries failed attempts after a
//! delay, persists the last input so a batch can be resumed, and stops on an
//! iteration cap, an unrecoverable failure, or a graceful halt request.
//!
//! ```no_run
//! use batchloop::controller::IterationController;
//! use batchloop::settings::BatchSettings;
//! use batchloop::task::{task_fn, TaskOutcome};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = IterationController::builder(task_fn(|params| async move {
//!     TaskOutcome::success(params)
//! }))
//! .settings(BatchSettings::new().with_max_iterations(Some(5)))
//! .build()?;
//!
//! let outcome = controller.start(json!({"page": 1})).await?;
//! assert!(outcome.is_finished());
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod error;
pub mod logging;
pub mod settings;
pub mod status;
pub mod store;
pub mod task;

pub use controller::{BatchOutcome, IterationController, Phase, RunState, StopHandle};
pub use error::{BatchError, StoreError};
pub use settings::BatchSettings;
pub use status::{StatusEvent, StatusKind, StatusSink};
pub use store::StateStore;
pub use task::{TaskOutcome, TaskRunner};
