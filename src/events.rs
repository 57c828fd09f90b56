//! Per-session progress event fan-out.
//!
//! Mirrors every state-machine transition and planner/action outcome to
//! subscribers over a broadcast channel. Delivery is best-effort: publishing
//! with no receivers is not an error, and a subscriber that falls behind the
//! channel capacity loses the oldest events rather than blocking the engine.
//! Late subscribers see only events emitted after they subscribed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::guardrail::Severity;
use crate::types::LifecycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStart,
    TaskPause,
    TaskResume,
    TaskCancel,
    TaskComplete,
    TaskError,
    PlanGenerated,
    ActionExecuted,
    StateUpdate,
    SecurityAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventActor {
    System,
    Planner,
    Actor,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: EventActor,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl SessionEvent {
    pub fn new(event_type: EventType, actor: EventActor, state: LifecycleState) -> Self {
        Self {
            event_type,
            actor,
            state: state.as_str().to_string(),
            data: None,
            timestamp: Utc::now(),
            severity: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Broadcast-backed bus owned by one session.
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers. Errors (no receivers) are
    /// swallowed: the bus is observational only.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
