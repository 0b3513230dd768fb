//! The unit of work driven by the controller.
//!
//! A [`TaskRunner`] is invoked once per attempt with the current params and
//! reports exactly one [`TaskOutcome`]. The controller never runs two
//! invocations at the same time.

pub mod command;

pub use command::CommandTask;

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

/// Result of one task invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The iteration succeeded; `next` feeds the following iteration.
    Success(Value),
    /// The attempt failed. `next` is used only if the iteration is later
    /// skipped; retries reuse the params of the failed attempt.
    Failure { message: String, next: Value },
    /// Finish the batch now.
    ExplicitEnd,
}

impl TaskOutcome {
    pub fn success(next: Value) -> Self {
        Self::Success(next)
    }

    pub fn failure(message: impl Into<String>, next: Value) -> Self {
        Self::Failure {
            message: message.into(),
            next,
        }
    }
}

/// Externally supplied unit of work.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, params: &Value) -> TaskOutcome;
}

/// Adapter turning an async closure into a [`TaskRunner`].
pub struct FnTask<F> {
    f: F,
}

/// Wrap `f` as a task runner.
///
/// ```
/// use batchloop::task::{task_fn, TaskOutcome};
///
/// let task = task_fn(|params| async move { TaskOutcome::success(params) });
/// # let _ = task;
/// ```
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    FnTask { f }
}

#[async_trait]
impl<F, Fut> TaskRunner for FnTask<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    async fn run(&self, params: &Value) -> TaskOutcome {
        (self.f)(params.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(
            TaskOutcome::failure("boom", json!({})),
            TaskOutcome::Failure {
                message: "boom".to_string(),
                next: json!({}),
            }
        );
    }

    #[tokio::test]
    async fn test_task_fn_receives_params() {
        let task = task_fn(|params: Value| async move {
            let n = params["n"].as_u64().unwrap_or(0);
            TaskOutcome::success(json!({ "n": n + 1 }))
        });

        let outcome = task.run(&json!({"n": 41})).await;
        assert_eq!(outcome, TaskOutcome::Success(json!({"n": 42})));
    }
}
