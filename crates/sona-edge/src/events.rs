//! Lifecycle and hardware events published by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::telemetry::HardwareAlert;

/// Public engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Train,
    Update,
    Validate,
    Optimize,
    Reset,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Train => "train",
            Operation::Update => "update",
            Operation::Validate => "validate",
            Operation::Optimize => "optimize",
            Operation::Reset => "reset",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

/// Event category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// An operation started, completed or failed.
    Lifecycle { operation: Operation, phase: Phase },
    /// The sampler raised an alert.
    HardwareAlert { alert: String },
}

/// One notification for the pub/sub bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    /// Pseudonymous user tag; never the raw user id.
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EngineEvent {
    /// Lifecycle event for a user operation.
    pub fn lifecycle(operation: Operation, phase: Phase, user_tag: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: EventKind::Lifecycle { operation, phase },
            user_id: Some(user_tag.to_string()),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Event mirroring a hardware alert.
    pub fn hardware(alert: &HardwareAlert) -> Self {
        let payload = serde_json::to_value(alert).unwrap_or(serde_json::Value::Null);
        Self {
            kind: EventKind::HardwareAlert { alert: alert.name().to_string() },
            user_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Dotted event name, e.g. `train.completed` or `hardware.thermal`.
    pub fn event_type(&self) -> String {
        match &self.kind {
            EventKind::Lifecycle { operation, phase } => format!("{}.{}", operation.as_str(), phase.as_str()),
            EventKind::HardwareAlert { alert } => format!("hardware.{alert}"),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.kind, EventKind::Lifecycle { phase: Phase::Failed, .. })
    }
}

/// In-process fire-and-forget event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = %event.event_type(), "Publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
