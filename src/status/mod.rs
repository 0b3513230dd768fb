//! Status events emitted by the controller.
//!
//! The controller reports every transition as a [`StatusEvent`] through a
//! [`StatusSink`]. Messages are written as templates in which the literal
//! `%i` placeholder stands for the 1-based iteration number; the controller
//! renders the template before handing the event to the sink.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Placeholder substituted with `iteration + 1` in status templates.
pub const ITERATION_PLACEHOLDER: &str = "%i";

/// Kind of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Informational, neither success nor failure.
    Info,
    /// An iteration or batch completed successfully.
    Success,
    /// An attempt failed or the caller misused the controller.
    Error,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Info => write!(f, "info"),
            StatusKind::Success => write!(f, "success"),
            StatusKind::Error => write!(f, "error"),
        }
    }
}

/// A rendered status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub message: String,
}

impl StatusEvent {
    /// Render `template` for the given 0-based iteration.
    ///
    /// Only the first `%i` is substituted.
    pub fn render(kind: StatusKind, template: &str, iteration: u32) -> Self {
        let message = template.replacen(
            ITERATION_PLACEHOLDER,
            &(u64::from(iteration) + 1).to_string(),
            1,
        );
        Self { kind, message }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Everything a sink can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Status(StatusEvent),
    /// Last params of an aborted batch, for diagnostics.
    Dump(Value),
}

/// Observer for controller events.
///
/// Called synchronously from the controller's control flow, so
/// implementations must not block.
pub trait StatusSink: Send + Sync {
    fn on_status(&self, event: &StatusEvent);

    fn on_dump(&self, _params: &Value) {}
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn on_status(&self, _event: &StatusEvent) {}
}

/// Sink that forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn on_status(&self, event: &StatusEvent) {
        match event.kind {
            StatusKind::Info => tracing::info!(target: "batchloop::status", "{}", event.message),
            StatusKind::Success => {
                tracing::info!(target: "batchloop::status", success = true, "{}", event.message)
            }
            StatusKind::Error => tracing::warn!(target: "batchloop::status", "{}", event.message),
        }
    }

    fn on_dump(&self, params: &Value) {
        tracing::error!(target: "batchloop::status", params = %params, "last batch parameters");
    }
}

/// Sink that pushes events into an unbounded channel.
///
/// Events sent after the receiver is dropped are silently discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<BatchEvent>,
}

impl ChannelSink {
    /// Create a sink together with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl StatusSink for ChannelSink {
    fn on_status(&self, event: &StatusEvent) {
        let _ = self.sender.send(BatchEvent::Status(event.clone()));
    }

    fn on_dump(&self, params: &Value) {
        let _ = self.sender.send(BatchEvent::Dump(params.clone()));
    }
}
