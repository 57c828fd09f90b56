//! Session data model.
//!
//! A [`Session`] is the durable record behind one automation context: one
//! browser client, one ordered task list, one lifecycle state machine. The
//! whole record serializes to JSON and round-trips through the session store
//! on every mutation, so a session survives host restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::{Action, ActionResult};
use crate::config::SessionConfig;

/// Lifecycle state of the per-session execution machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Planning,
    Executing,
    WaitingForBrowser,
    Paused,
    Completed,
    Error,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Planning => "planning",
            LifecycleState::Executing => "executing",
            LifecycleState::WaitingForBrowser => "waiting_for_browser",
            LifecycleState::Paused => "paused",
            LifecycleState::Completed => "completed",
            LifecycleState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One natural-language task submitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: u8,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            priority: 0,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// Viewport geometry reported by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, alias = "scrollX")]
    pub scroll_x: i32,
    #[serde(default, alias = "scrollY")]
    pub scroll_y: i32,
}

/// Immutable snapshot of the remote browser. Updates replace the whole
/// record; the content cache is keyed on URL + content type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserState {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Rendered textual representation of the DOM.
    #[serde(default)]
    pub dom: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default, alias = "canGoBack")]
    pub can_go_back: bool,
    #[serde(default, alias = "canGoForward")]
    pub can_go_forward: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One planned step inside a strategic plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action_type: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRisk {
    pub description: String,
    #[serde(default)]
    pub likelihood: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default)]
    pub mitigation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRevision {
    pub revised_at: DateTime<Utc>,
    pub reason: String,
}

/// The planner's multi-step roadmap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategicPlan {
    pub strategy: String,
    #[serde(default)]
    pub estimated_steps: u32,
    /// Confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub planned_actions: Vec<PlannedAction>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub risks: Vec<PlanRisk>,
    #[serde(default)]
    pub revisions: Vec<PlanRevision>,
}

/// History entry pairing a delivered action with the client's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    pub result: ActionResult,
    pub step: u32,
    pub recorded_at: DateTime<Utc>,
}

/// One planner invocation: what went in, what came out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerRecord {
    pub step: u32,
    pub task_description: String,
    #[serde(default)]
    pub input_url: String,
    pub output: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Threat detected and redacted in untrusted content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub threat: String,
    pub severity: String,
    pub context: String,
    pub detected_at: DateTime<Utc>,
}

/// Passive per-session accumulator, persisted alongside the session.
///
/// `total_steps` counts planning cycles; `planner_invocations` counts full
/// strategic-plan refreshes. The two diverge when a cycle consumes a queued
/// planned action without consulting the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub planner_invocations: u32,
    #[serde(default)]
    pub successful_actions: u32,
    #[serde(default)]
    pub failed_actions: u32,
    #[serde(default)]
    pub retried_actions: u32,
    #[serde(default)]
    pub total_execution_ms: u64,
    #[serde(default)]
    pub llm_calls: u32,
    #[serde(default)]
    pub llm_tokens: u64,
    #[serde(default)]
    pub cache_hit_rate: f64,
    #[serde(default)]
    pub security_threats: u32,
}

/// Durable record behind one automation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub current_task_index: usize,
    #[serde(default)]
    pub step_count: u32,
    pub execution_state: LifecycleState,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Zero or one action currently queued for the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_action: Option<Action>,
    /// The action popped by `next-action` and awaiting its result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_action: Option<Action>,
    #[serde(default)]
    pub action_history: Vec<ActionRecord>,
    #[serde(default)]
    pub planner_history: Vec<PlannerRecord>,
    #[serde(default)]
    pub security_events: Vec<SecurityEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_state: Option<BrowserState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<StrategicPlan>,
    pub config: SessionConfig,
    #[serde(default)]
    pub metrics: SessionMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tasks: Vec::new(),
            current_task_index: 0,
            step_count: 0,
            execution_state: LifecycleState::Idle,
            consecutive_failures: 0,
            queued_action: None,
            in_flight_action: None,
            action_history: Vec::new(),
            planner_history: Vec::new(),
            security_events: Vec::new(),
            browser_state: None,
            plan: None,
            config,
            metrics: SessionMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current_task_index)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.get_mut(self.current_task_index)
    }

    /// Index of the next pending task after the current one, if any.
    pub fn next_pending_task(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .skip(self.current_task_index + 1)
            .find(|(_, task)| task.status == TaskStatus::Pending)
            .map(|(index, _)| index)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
