//! Host notifications.
//!
//! Everything the lifecycle reports outward travels as an `InstanceEvent`
//! over a broadcast channel. Under the dedicated-thread policy most of these
//! are published from the worker thread, so consumers must not assume which
//! thread delivers them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Stage at which a cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Exposure,
    EntryScript,
    Worker,
}

/// A notification produced by an instance lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    InstanceReady,
    ScriptBegin,
    BeginPlay,
    InitPassEnd,
    Tick { delta: f32 },
    EndPlay,
    Message { name: String, payload: String },
    Failed { stage: FailureStage, message: String },
}

impl InstanceEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            InstanceEvent::InstanceReady => "instance-ready",
            InstanceEvent::ScriptBegin => "script-begin",
            InstanceEvent::BeginPlay => "begin-play",
            InstanceEvent::InitPassEnd => "init-pass-end",
            InstanceEvent::Tick { .. } => "tick",
            InstanceEvent::EndPlay => "end-play",
            InstanceEvent::Message { .. } => "message",
            InstanceEvent::Failed { .. } => "failed",
        }
    }
}

/// Cloneable publisher for instance notifications.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<InstanceEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: InstanceEvent) {
        tracing::trace!(event = event.name(), "publish");
        let _ = self.tx.send(event);
    }

    /// Publish on the generic message channel.
    pub fn emit(&self, name: impl Into<String>, payload: impl Into<String>) {
        self.publish(InstanceEvent::Message {
            name: name.into(),
            payload: payload.into(),
        });
    }
}
