//! Iteration controller.
//!
//! Drives one [`TaskRunner`] through a batch of sequential iterations:
//!
//! ```text
//! Idle ──start/resume──▶ Running ──failure, attempts left──▶ RetryWaiting
//!                         │  ▲                                   │
//!                         │  └──────────── delay elapsed ────────┘
//!                         ├── cap reached / explicit end / halt ──▶ Finished
//!                         └── attempts exhausted, !allow_fail ────▶ Aborted
//! ```
//!
//! Each transition queues the next attempt (immediately or after the retry
//! delay) and the loop picks it up; nothing recurses. A halt requested with
//! [`IterationController::stop`] is only observed when the next attempt is
//! about to begin, so an in-flight task invocation or retry delay always
//! runs to completion first.

pub mod retry;
pub mod state;

pub use retry::{FailureAction, RetryPolicy};
pub use state::{BatchEnd, BatchOutcome, Phase, RunState};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::BatchError;
use crate::settings::{BatchSettings, SettingsError};
use crate::status::{StatusEvent, StatusKind, StatusSink, TracingSink};
use crate::store::{MemoryStore, StateStore};
use crate::task::{TaskOutcome, TaskRunner};

/// Failure message for params that are not a JSON object.
pub const INVALID_PARAMS_MESSAGE: &str = "Params must be an object";

/// Callback invoked with the last params when a batch ends.
pub type Hook = Box<dyn Fn(&Value) + Send + Sync>;

struct Inner {
    settings: BatchSettings,
    policy: RetryPolicy,
    task: Arc<dyn TaskRunner>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn StatusSink>,
    on_end: Option<Hook>,
    on_die: Option<Hook>,
    state: Mutex<RunState>,
}

/// Where the loop goes after an attempt.
enum Step {
    Continue(Value),
    Finish,
    Abort,
}

/// Handle to a retrying, resumable batch runner.
///
/// Cloning is cheap and every clone drives the same state, so one clone can
/// run a batch while another calls [`stop`](Self::stop) or
/// [`snapshot`](Self::snapshot).
#[derive(Clone)]
pub struct IterationController {
    inner: Arc<Inner>,
}

impl IterationController {
    /// Start building a controller around `task`.
    pub fn builder(task: impl TaskRunner + 'static) -> ControllerBuilder {
        ControllerBuilder::new(Arc::new(task))
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.inner.settings
    }

    /// Copy of the current run state.
    pub fn snapshot(&self) -> RunState {
        self.state().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Handle that can only request a stop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            controller: self.clone(),
        }
    }

    /// Run a new batch starting from `params` and wait for it to end.
    ///
    /// # Errors
    ///
    /// - [`BatchError::AlreadyRunning`] if a batch is in flight
    /// - [`BatchError::BatchLimitExceeded`] if `max_batches` batches have
    ///   already been started
    ///
    /// Neither error touches the run state.
    #[instrument(level = "info", skip(self, params), fields(state_key = %self.inner.settings.state_key))]
    pub async fn start(&self, params: Value) -> Result<BatchOutcome, BatchError> {
        let batch = self.admit()?;
        info!(batch, "batch started");
        Ok(self.run_batch(params).await)
    }

    /// Run a new batch from the params persisted by the last attempt.
    ///
    /// # Errors
    ///
    /// - [`BatchError::AlreadyRunning`] or [`BatchError::BatchLimitExceeded`],
    ///   checked before the store is read
    /// - [`BatchError::NoSavedState`] if nothing is stored under the state key
    /// - [`BatchError::MalformedState`] if the stored record cannot be read or
    ///   decoded
    #[instrument(level = "info", skip(self), fields(state_key = %self.inner.settings.state_key))]
    pub async fn resume(&self) -> Result<BatchOutcome, BatchError> {
        self.ensure_admissible()?;
        let params = match self.last_saved_params().await? {
            Some(params) => params,
            None => {
                self.emit(StatusKind::Error, "Parameters from last batch not found.");
                return Err(BatchError::NoSavedState {
                    key: self.inner.settings.state_key.clone(),
                });
            }
        };
        debug!(params = %params, "resuming from saved params");
        self.start(params).await
    }

    /// Read the persisted params without starting anything.
    pub async fn last_saved_params(&self) -> Result<Option<Value>, BatchError> {
        let key = &self.inner.settings.state_key;
        let malformed = |reason: String| BatchError::MalformedState {
            key: key.clone(),
            reason,
        };

        let raw = self
            .inner
            .store
            .get(key)
            .await
            .map_err(|e| malformed(e.to_string()))?;

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| malformed(e.to_string())),
        }
    }

    /// Ask the running batch to finish at the next iteration boundary.
    ///
    /// Does not interrupt an in-flight task invocation. The flag is cleared
    /// when the next batch starts.
    pub fn stop(&self) {
        self.state().halt_requested = true;
        info!("graceful stop requested");
        self.emit(StatusKind::Info, "Graceful batch stop requested.");
    }

    /// Reinitialize the per-batch state. The lifetime batch count is kept.
    ///
    /// # Errors
    ///
    /// [`BatchError::Running`] while a batch is in flight.
    pub fn reset(&self) -> Result<(), BatchError> {
        let mut state = self.state();
        if state.running {
            return Err(BatchError::Running);
        }
        state.reset();
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Render `template` at the current iteration and hand it to the sink.
    fn emit(&self, kind: StatusKind, template: &str) {
        let iteration = self.state().iteration;
        self.emit_at(kind, template, iteration);
    }

    fn emit_at(&self, kind: StatusKind, template: &str, iteration: u32) {
        let event = StatusEvent::render(kind, template, iteration);
        self.inner.sink.on_status(&event);
    }

    /// Why a new batch cannot start right now, if it cannot.
    fn rejection(&self, state: &RunState) -> Option<(BatchError, &'static str)> {
        let max_batches = self.inner.settings.max_batches;
        if state.running {
            Some((BatchError::AlreadyRunning, "Batch already running."))
        } else if state.batch_count >= max_batches {
            Some((
                BatchError::BatchLimitExceeded { max: max_batches },
                "Maximum batches exceeded.",
            ))
        } else {
            None
        }
    }

    fn reject(&self, err: BatchError, message: &str) -> BatchError {
        warn!(%err, "batch rejected");
        self.emit(StatusKind::Error, message);
        err
    }

    /// Run the usage checks without claiming a batch.
    fn ensure_admissible(&self) -> Result<(), BatchError> {
        let rejected = self.rejection(&self.state());
        match rejected {
            Some((err, message)) => Err(self.reject(err, message)),
            None => Ok(()),
        }
    }

    /// Check the usage preconditions and claim a new batch.
    fn admit(&self) -> Result<u32, BatchError> {
        let (err, message) = {
            let mut state = self.state();
            match self.rejection(&state) {
                Some(rejected) => rejected,
                None => {
                    state.reset();
                    state.batch_count += 1;
                    state.running = true;
                    state.phase = Phase::Running;
                    return Ok(state.batch_count);
                }
            }
        };
        Err(self.reject(err, message))
    }

    async fn run_batch(&self, params: Value) -> BatchOutcome {
        let mut params = params;
        loop {
            // Hand the thread back between attempts so a stop() from another
            // task can land even when the task itself never suspends.
            tokio::task::yield_now().await;
            let started = Instant::now();

            if self.state().halt_requested {
                debug!("halt observed at iteration boundary");
                return self.finish();
            }

            let outcome = if params.is_object() {
                self.begin_attempt(&params).await;
                self.inner.task.run(&params).await
            } else {
                TaskOutcome::failure(INVALID_PARAMS_MESSAGE, params)
            };

            let step = match outcome {
                TaskOutcome::Success(next) => self.on_success(started, next),
                TaskOutcome::Failure { message, next } => self.on_failure(&message, next).await,
                TaskOutcome::ExplicitEnd => {
                    debug!("task requested explicit end");
                    Step::Finish
                }
            };

            match step {
                Step::Continue(next) => params = next,
                Step::Finish => return self.finish(),
                Step::Abort => return self.abort(),
            }
        }
    }

    /// Record `params` as the current input and persist it.
    async fn begin_attempt(&self, params: &Value) {
        {
            let mut state = self.state();
            state.running = true;
            state.phase = Phase::Running;
            state.last_params = params.clone();
            debug!(
                iteration = state.iteration,
                attempt = state.attempts + 1,
                "running task"
            );
        }

        let settings = &self.inner.settings;
        let saved = self
            .inner
            .store
            .set(&settings.state_key, &params.to_string(), settings.state_ttl())
            .await;
        if let Err(e) = saved {
            warn!(error = %e, key = %settings.state_key, "failed to persist params");
        }
    }

    fn on_success(&self, started: Instant, next: Value) -> Step {
        let secs = started.elapsed().as_secs_f64();
        let (iteration, cap_reached) = {
            let mut state = self.state();
            state.completed += 1;
            state.attempts = 0;
            let cap_reached = self
                .inner
                .settings
                .iteration_cap()
                .is_some_and(|cap| state.iteration + 1 >= cap);
            (state.iteration, cap_reached)
        };

        self.emit_at(
            StatusKind::Success,
            &format!("Task %i complete ({secs:.3}s)"),
            iteration,
        );

        if cap_reached {
            return Step::Finish;
        }
        self.state().iteration += 1;
        Step::Continue(next)
    }

    async fn on_failure(&self, message: &str, next: Value) -> Step {
        let (iteration, attempts) = {
            let mut state = self.state();
            state.attempts += 1;
            (state.iteration, state.attempts)
        };
        debug!(iteration, attempts, message, "task failed");

        self.emit_at(
            StatusKind::Error,
            &format!(
                "Task %i failed (attempt {attempts}/{}). {message}",
                self.inner.policy.max_attempts
            ),
            iteration,
        );

        match self.inner.policy.on_failure(attempts) {
            FailureAction::Retry { delay } => {
                self.state().phase = Phase::RetryWaiting;
                tokio::time::sleep(delay).await;
                let retry_params = self.state().last_params.clone();
                Step::Continue(retry_params)
            }
            FailureAction::Skip => {
                {
                    let mut state = self.state();
                    state.failed += 1;
                    state.iteration += 1;
                    state.attempts = 0;
                }
                self.emit_at(
                    StatusKind::Error,
                    &format!("Task %i failed after {attempts} attempts. Skipped."),
                    iteration,
                );
                Step::Continue(next)
            }
            FailureAction::Abort => {
                self.state().failed += 1;
                self.emit_at(
                    StatusKind::Error,
                    &format!("Task %i failed after {attempts} attempts. Stopped."),
                    iteration,
                );
                Step::Abort
            }
        }
    }

    fn finish(&self) -> BatchOutcome {
        let (iteration, failed) = {
            let state = self.state();
            (state.iteration, state.failed)
        };
        if failed > 0 {
            self.emit_at(
                StatusKind::Error,
                &format!("%i Tasks complete with {failed} errors"),
                iteration,
            );
        } else {
            self.emit_at(StatusKind::Success, "%i Tasks complete", iteration);
        }

        let outcome = self.conclude(Phase::Finished, BatchEnd::Finished);
        info!(
            completed = outcome.state.completed,
            failed = outcome.state.failed,
            "batch finished"
        );
        if let Some(hook) = &self.inner.on_end {
            hook(&outcome.state.last_params);
        }
        outcome
    }

    fn abort(&self) -> BatchOutcome {
        let outcome = self.conclude(Phase::Aborted, BatchEnd::Aborted);
        let params = &outcome.state.last_params;
        error!(
            params = %params,
            failed = outcome.state.failed,
            "batch aborted"
        );
        self.inner.sink.on_dump(params);
        if let Some(hook) = &self.inner.on_die {
            hook(params);
        }
        outcome
    }

    fn conclude(&self, phase: Phase, end: BatchEnd) -> BatchOutcome {
        let mut state = self.state();
        state.running = false;
        state.phase = phase;
        BatchOutcome {
            end,
            state: state.clone(),
        }
    }
}

/// Capability to request a graceful stop, e.g. from a signal handler.
#[derive(Clone)]
pub struct StopHandle {
    controller: IterationController,
}

impl StopHandle {
    pub fn stop(&self) {
        self.controller.stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.controller.state().halt_requested
    }
}

/// Builder for [`IterationController`].
pub struct ControllerBuilder {
    task: Arc<dyn TaskRunner>,
    settings: BatchSettings,
    store: Option<Arc<dyn StateStore>>,
    sink: Option<Arc<dyn StatusSink>>,
    on_end: Option<Hook>,
    on_die: Option<Hook>,
}

impl ControllerBuilder {
    fn new(task: Arc<dyn TaskRunner>) -> Self {
        Self {
            task,
            settings: BatchSettings::default(),
            store: None,
            sink: None,
            on_end: None,
            on_die: None,
        }
    }

    pub fn settings(mut self, settings: BatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Persistence backend. Defaults to a [`MemoryStore`].
    pub fn store(mut self, store: impl StateStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Share an existing store, e.g. between controllers.
    pub fn shared_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Event observer. Defaults to [`TracingSink`].
    pub fn sink(mut self, sink: impl StatusSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Called with the last params when a batch finishes normally.
    pub fn on_end(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Box::new(hook));
        self
    }

    /// Called with the last params when a batch aborts.
    pub fn on_die(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_die = Some(Box::new(hook));
        self
    }

    /// # Errors
    ///
    /// Returns an error if the settings fail validation.
    pub fn build(self) -> Result<IterationController, SettingsError> {
        self.settings.validate()?;

        let controller = IterationController {
            inner: Arc::new(Inner {
                policy: RetryPolicy::from_settings(&self.settings),
                settings: self.settings,
                task: self.task,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
                on_end: self.on_end,
                on_die: self.on_die,
                state: Mutex::new(RunState::default()),
            }),
        };
        controller.emit(StatusKind::Info, "Awaiting start.");
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{BatchEvent, ChannelSink, NullSink};
    use crate::task::task_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_settings() -> BatchSettings {
        BatchSettings::new().with_delay_attempts(Duration::from_millis(1))
    }

    fn echo_task() -> impl TaskRunner {
        task_fn(|params: Value| async move { TaskOutcome::success(params) })
    }

    #[tokio::test]
    async fn test_builder_emits_awaiting_start() {
        let (sink, mut rx) = ChannelSink::new();
        let _controller = IterationController::builder(echo_task())
            .sink(sink)
            .build()
            .unwrap();

        match rx.recv().await {
            Some(BatchEvent::Status(event)) => {
                assert_eq!(event.kind, StatusKind::Info);
                assert_eq!(event.message, "Awaiting start.");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_builder_rejects_invalid_settings() {
        let result = IterationController::builder(echo_task())
            .settings(BatchSettings::new().with_state_key(""))
            .build();
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_success_counts_and_params_flow() {
        let controller = IterationController::builder(task_fn(|params: Value| async move {
            let n = params["n"].as_u64().unwrap_or(0);
            TaskOutcome::success(json!({ "n": n + 1 }))
        }))
        .settings(quick_settings().with_max_iterations(Some(3)))
        .sink(NullSink)
        .build()
        .unwrap();

        let outcome = controller.start(json!({"n": 0})).await.unwrap();

        assert!(outcome.is_finished());
        assert_eq!(outcome.state.completed, 3);
        assert_eq!(outcome.state.iteration, 2);
        assert_eq!(outcome.state.last_params, json!({"n": 2}));
        assert!(!outcome.state.running);
        assert_eq!(controller.phase(), Phase::Finished);
    }

    #[tokio::test]
    async fn test_reset_while_idle_keeps_batch_count() {
        let controller = IterationController::builder(echo_task())
            .settings(quick_settings().with_max_iterations(Some(1)))
            .sink(NullSink)
            .build()
            .unwrap();

        controller.start(json!({})).await.unwrap();
        controller.reset().unwrap();

        let state = controller.snapshot();
        assert_eq!(state.batch_count, 1);
        assert_eq!(state.completed, 0);
        assert_eq!(state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_reset_while_running_is_rejected() {
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let controller = IterationController::builder(task_fn(move |params: Value| {
            let mut release = release_rx.clone();
            async move {
                let _ = release.wait_for(|go| *go).await;
                TaskOutcome::success(params)
            }
        }))
        .settings(quick_settings().with_max_iterations(Some(1)))
        .sink(NullSink)
        .build()
        .unwrap();

        let runner = controller.clone();
        let batch = tokio::spawn(async move { runner.start(json!({})).await });
        while !controller.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(controller.reset(), Err(BatchError::Running)));

        release_tx.send(true).unwrap();
        assert!(batch.await.unwrap().unwrap().is_finished());
        assert!(controller.reset().is_ok());
    }

    #[tokio::test]
    async fn test_attempts_reset_after_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let controller = IterationController::builder(task_fn(move |params: Value| {
            let call = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                // Attempts 0 and 1 fail, every later attempt succeeds.
                if call < 2 {
                    TaskOutcome::failure("flaky", params)
                } else {
                    TaskOutcome::success(params)
                }
            }
        }))
        .settings(quick_settings().with_max_attempts(3).with_max_iterations(Some(2)))
        .sink(NullSink)
        .build()
        .unwrap();

        let outcome = controller.start(json!({})).await.unwrap();

        assert!(outcome.is_finished());
        assert_eq!(outcome.state.attempts, 0);
        assert_eq!(outcome.state.failed, 0);
        assert_eq!(outcome.state.completed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_status_mentions_attempt_and_message() {
        let (sink, mut rx) = ChannelSink::new();
        let controller = IterationController::builder(task_fn(|params: Value| async move {
            TaskOutcome::failure("disk full", params)
        }))
        .settings(quick_settings().with_max_attempts(1))
        .sink(sink)
        .build()
        .unwrap();

        controller.start(json!({})).await.unwrap();

        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BatchEvent::Status(status) = event {
                messages.push(status.message);
            }
        }
        assert_eq!(
            messages,
            vec![
                "Awaiting start.".to_string(),
                "Task 1 failed (attempt 1/1). disk full".to_string(),
                "Task 1 failed after 1 attempts. Stopped.".to_string(),
            ]
        );
    }
}
