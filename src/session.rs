//! Per-session execution engine.
//!
//! Each session is a cooperative single-writer actor: every mutation of the
//! [`Session`] record happens under one lock and is followed by a durable
//! write, so a session survives host restarts. Planning cycles are spawned
//! as detached tasks from `execute` and from `action-result` arrival (never
//! a polling loop) and cooperate with ingress through the lifecycle state; a
//! double-spawn guard keeps at most one cycle in flight.
//!
//! The state machine:
//!
//! ```text
//! IDLE -> PLANNING -> WAITING_FOR_BROWSER -> EXECUTING -> PLANNING -> ...
//!            |                                              |
//!            +-> COMPLETED (taskComplete)                   +-> ERROR (maxFailures)
//!            +-> ERROR (planner failure / maxSteps)
//! any non-terminal -> PAUSED (pause) -> PLANNING (resume)
//! any non-terminal -> COMPLETED (cancel)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionResult};
use crate::cache::{ContentCache, ContentType};
use crate::config::SessionConfig;
use crate::coordinator::{Coordinator, LlmUsage, PlannerInput};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventActor, EventBus, EventType, SessionEvent};
use crate::guardrail::Severity;
use crate::llm::ChatModel;
use crate::metrics;
use crate::queue::ActionQueue;
use crate::retry::ErrorCategory;
use crate::storage::{replay_key, session_key, SessionStore};
use crate::types::{
    ActionRecord, BrowserState, LifecycleState, PlanRevision, PlannerRecord, SecurityEvent,
    Session, Task, TaskStatus,
};

/// Reply to a `next-action` poll.
#[derive(Debug, Clone)]
pub struct NextActionReply {
    pub action: Option<Action>,
    pub waiting: bool,
    pub task_complete: bool,
}

pub struct SessionEngine {
    id: String,
    state: Mutex<Session>,
    coordinator: parking_lot::Mutex<Option<Arc<Coordinator>>>,
    queue: ActionQueue,
    cache: ContentCache,
    bus: EventBus,
    store: Arc<dyn SessionStore>,
    planning_in_flight: AtomicBool,
}

impl SessionEngine {
    pub fn new(id: impl Into<String>, config: SessionConfig, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let id = id.into();
        let cache = ContentCache::new(config.cache.clone());
        Arc::new(Self {
            state: Mutex::new(Session::new(id.clone(), config)),
            coordinator: parking_lot::Mutex::new(None),
            queue: ActionQueue::new(),
            cache,
            bus: EventBus::default(),
            store,
            planning_in_flight: AtomicBool::new(false),
            id,
        })
    }

    /// Rebuild an engine around a session loaded from storage. The model is
    /// not persisted, so the coordinator is re-created lazily on the next
    /// `execute`.
    pub fn from_session(session: Session, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let cache = ContentCache::new(session.config.cache.clone());
        let queue = ActionQueue::new();
        if let Some(action) = session.queued_action.clone() {
            queue.enqueue(action);
        }
        Arc::new(Self {
            id: session.id.clone(),
            state: Mutex::new(session),
            coordinator: parking_lot::Mutex::new(None),
            queue,
            cache,
            bus: EventBus::default(),
            store,
            planning_in_flight: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn set_model(&self, model: Arc<dyn ChatModel>) {
        *self.coordinator.lock() = Some(Arc::new(Coordinator::new(model)));
    }

    pub fn has_model(&self) -> bool {
        self.coordinator.lock().is_some()
    }

    fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.coordinator.lock().clone()
    }

    pub async fn snapshot(&self) -> Session {
        self.state.lock().await.clone()
    }

    /// Write the current session state to storage immediately; used right
    /// after creation so a fresh session is durable before it is announced.
    pub async fn persist_now(&self) {
        let session = self.state.lock().await;
        self.persist(&session).await;
    }

    fn emit(&self, event: SessionEvent) {
        self.bus.publish(event);
    }

    async fn persist(&self, session: &Session) {
        match serde_json::to_value(session) {
            Ok(value) => {
                if let Err(err) = self.store.put(&session_key(&session.id), value).await {
                    warn!(session_id = %session.id, %err, "failed to persist session");
                }
            }
            Err(err) => warn!(session_id = %session.id, %err, "failed to serialize session"),
        }
    }

    /// Submit a task and start planning. Valid from idle or a terminal state;
    /// a session with a task in progress rejects a second `execute`.
    pub async fn execute(
        self: &Arc<Self>,
        description: &str,
        config_override: Option<SessionConfig>,
    ) -> EngineResult<String> {
        if description.trim().is_empty() {
            return Err(EngineError::invalid_request("task must not be empty"));
        }
        if !self.has_model() {
            return Err(EngineError::invalid_request(
                "no model configured for this session",
            ));
        }

        let task_id = {
            let mut session = self.state.lock().await;
            match session.execution_state {
                LifecycleState::Idle | LifecycleState::Completed | LifecycleState::Error => {}
                LifecycleState::Paused => {
                    return Err(EngineError::invalid_state("session is paused"));
                }
                _ => {
                    return Err(EngineError::invalid_state("a task is already running"));
                }
            }

            if let Some(config) = config_override {
                session.config = config;
            }
            let task = Task::new(description);
            let task_id = task.id.clone();
            session.tasks.push(task);
            session.current_task_index = session.tasks.len() - 1;
            session.execution_state = LifecycleState::Planning;
            session.consecutive_failures = 0;
            session.touch();
            self.persist(&session).await;
            task_id
        };

        self.spawn_planning();
        Ok(task_id)
    }

    /// Append a follow-up task. If the session is idle or terminal, advance
    /// to it immediately; otherwise it runs when the current task finishes.
    pub async fn follow_up(self: &Arc<Self>, description: &str) -> EngineResult<String> {
        if description.trim().is_empty() {
            return Err(EngineError::invalid_request("task must not be empty"));
        }

        let (task_id, start_now) = {
            let mut session = self.state.lock().await;
            let task = Task::new(description);
            let task_id = task.id.clone();
            session.tasks.push(task);

            let start_now = matches!(
                session.execution_state,
                LifecycleState::Idle | LifecycleState::Completed | LifecycleState::Error
            );
            if start_now {
                if let Some(next) = session.next_pending_task() {
                    session.current_task_index = next;
                } else {
                    session.current_task_index = session.tasks.len() - 1;
                }
                session.execution_state = LifecycleState::Planning;
                session.consecutive_failures = 0;
            }
            session.touch();
            self.persist(&session).await;
            (task_id, start_now)
        };

        if start_now {
            self.spawn_planning();
        }
        Ok(task_id)
    }

    /// Deliver the queued action to the polling client, if one is ready.
    pub async fn next_action(&self) -> NextActionReply {
        let mut session = self.state.lock().await;
        if session.execution_state == LifecycleState::WaitingForBrowser {
            if let Some(action) = self.queue.pop() {
                session.queued_action = None;
                session.in_flight_action = Some(action.clone());
                session.execution_state = LifecycleState::Executing;
                session.touch();
                self.persist(&session).await;
                return NextActionReply {
                    action: Some(action),
                    waiting: false,
                    task_complete: false,
                };
            }
        }
        NextActionReply {
            action: None,
            waiting: true,
            task_complete: session.execution_state == LifecycleState::Completed,
        }
    }

    /// Record the client's result for the in-flight action and resume
    /// planning (driven by result arrival, never by polling).
    pub async fn action_result(self: &Arc<Self>, mut result: ActionResult) -> EngineResult<()> {
        let resume_planning = {
            let mut session = self.state.lock().await;
            let action = match session.in_flight_action.take() {
                Some(action) => action,
                // The client may execute without polling first; fall back to
                // the queued action.
                None => match session.queued_action.take() {
                    Some(queued) => {
                        self.queue.drain();
                        queued
                    }
                    None => {
                        return Err(EngineError::invalid_state(
                            "no action is awaiting a result",
                        ));
                    }
                },
            };

            result.step = session.step_count;
            let success = result.success;
            let screenshot = result.screenshot.clone();
            let browser_state = result.browser_state.take();

            session.metrics.total_execution_ms += result.duration_ms;
            if success {
                session.metrics.successful_actions += 1;
                session.consecutive_failures = 0;
            } else {
                session.metrics.failed_actions += 1;
                session.consecutive_failures += 1;
            }

            let record = ActionRecord {
                action: action.clone(),
                result,
                step: session.step_count,
                recorded_at: Utc::now(),
            };
            session.action_history.push(record);

            if let Some(new_state) = browser_state {
                self.apply_browser_state(&mut session, new_state);
            }
            if let Some(image) = screenshot {
                if self.cache.enabled() {
                    if let Some(url) = session.browser_state.as_ref().map(|s| s.url.clone()) {
                        self.cache.put(ContentType::Screenshot, &url, &image);
                    }
                }
            }

            self.emit(
                SessionEvent::new(
                    EventType::ActionExecuted,
                    EventActor::Actor,
                    session.execution_state,
                )
                .with_data(json!({
                    "action_id": action.id,
                    "action_type": action.action_type.as_str(),
                    "success": success,
                    "step": session.step_count,
                })),
            );

            if !success && session.consecutive_failures >= session.config.max_failures {
                let reason = format!(
                    "{} consecutive action failures",
                    session.consecutive_failures
                );
                self.fail_current_task(&mut session, &reason);
                session.touch();
                self.persist(&session).await;
                return Ok(());
            }

            let resume = matches!(
                session.execution_state,
                LifecycleState::Executing | LifecycleState::WaitingForBrowser
            );
            if resume {
                session.execution_state = LifecycleState::Planning;
            }
            session.touch();
            self.persist(&session).await;
            resume
        };

        if resume_planning {
            self.spawn_planning();
        }
        Ok(())
    }

    /// Replace the browser snapshot (the `state` ingress).
    pub async fn update_state(&self, new_state: BrowserState) -> EngineResult<()> {
        let mut session = self.state.lock().await;
        self.apply_browser_state(&mut session, new_state);
        self.emit(
            SessionEvent::new(
                EventType::StateUpdate,
                EventActor::User,
                session.execution_state,
            )
            .with_data(json!({
                "url": session.browser_state.as_ref().map(|s| s.url.clone()),
            })),
        );
        session.touch();
        self.persist(&session).await;
        Ok(())
    }

    fn apply_browser_state(&self, session: &mut Session, mut new_state: BrowserState) {
        if new_state.timestamp.is_none() {
            new_state.timestamp = Some(Utc::now());
        }
        let old_url = session
            .browser_state
            .as_ref()
            .map(|state| state.url.clone())
            .filter(|url| !url.is_empty());

        if self.cache.enabled() {
            let navigated = old_url.as_deref() != Some(new_state.url.as_str());
            if navigated && !new_state.url.is_empty() {
                self.cache
                    .invalidate_for_navigation(old_url.as_deref(), &new_state.url);
            }
            if !new_state.dom.is_empty() {
                self.cache
                    .put(ContentType::Dom, &new_state.url, &new_state.dom);
            }
            if let Some(image) = new_state.screenshot.as_deref() {
                self.cache.put(ContentType::Screenshot, &new_state.url, image);
            }
        }

        session.browser_state = Some(new_state);
    }

    pub async fn pause(&self) -> EngineResult<()> {
        let mut session = self.state.lock().await;
        if session.execution_state.is_terminal() {
            return Err(EngineError::invalid_state("session already finished"));
        }
        session.execution_state = LifecycleState::Paused;
        if let Some(task) = session.current_task_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Paused;
            }
        }
        self.emit(SessionEvent::new(
            EventType::TaskPause,
            EventActor::User,
            LifecycleState::Paused,
        ));
        session.touch();
        self.persist(&session).await;
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>) -> EngineResult<()> {
        let plan_again = {
            let mut session = self.state.lock().await;
            if session.execution_state != LifecycleState::Paused {
                return Err(EngineError::invalid_state("session is not paused"));
            }
            // Return to where the pause interrupted: an undelivered action
            // keeps its place in the handoff instead of being planned twice.
            session.execution_state = if session.in_flight_action.is_some() {
                LifecycleState::Executing
            } else if session.queued_action.is_some() {
                LifecycleState::WaitingForBrowser
            } else {
                LifecycleState::Planning
            };
            if let Some(task) = session.current_task_mut() {
                if task.status == TaskStatus::Paused {
                    task.status = TaskStatus::Running;
                }
            }
            self.emit(SessionEvent::new(
                EventType::TaskResume,
                EventActor::User,
                session.execution_state,
            ));
            session.touch();
            self.persist(&session).await;
            session.execution_state == LifecycleState::Planning
        };
        if plan_again {
            self.spawn_planning();
        }
        Ok(())
    }

    /// Cancel the session: the current task is marked cancelled, the queue is
    /// drained, and the state machine terminates. A planner call already in
    /// flight finishes normally; its result is discarded.
    pub async fn cancel(&self) -> EngineResult<()> {
        let mut session = self.state.lock().await;
        if session.execution_state.is_terminal() {
            return Ok(());
        }
        self.queue.drain();
        session.queued_action = None;
        session.in_flight_action = None;
        if let Some(task) = session.current_task_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
            }
        }
        session.execution_state = LifecycleState::Completed;
        metrics::record_task_finished("cancelled");
        self.emit(SessionEvent::new(
            EventType::TaskCancel,
            EventActor::User,
            LifecycleState::Completed,
        ));
        session.touch();
        self.persist(&session).await;
        Ok(())
    }

    /// Export the action history, final browser state and metrics under the
    /// replay key.
    pub async fn export_replay(&self) -> EngineResult<String> {
        let session = self.state.lock().await;
        let key = replay_key(&session.id);
        let record = json!({
            "session_id": session.id,
            "action_history": session.action_history,
            "browser_state": session.browser_state,
            "metrics": session.metrics,
            "exported_at": Utc::now(),
        });
        self.store.put(&key, record).await?;
        info!(session_id = %session.id, "replay exported");
        Ok(key)
    }

    /// Run the extractor role over caller-supplied content.
    pub async fn extract(
        &self,
        fields: &[String],
        content: &str,
        extraction_prompt: Option<&str>,
    ) -> EngineResult<(Map<String, Value>, f64)> {
        let coordinator = self.coordinator().ok_or_else(|| {
            EngineError::invalid_request("no model configured for this session")
        })?;
        let config = self.state.lock().await.config.clone();

        let outcome = coordinator
            .extract(fields, content, extraction_prompt, &config)
            .await?;

        let mut session = self.state.lock().await;
        self.merge_usage(&mut session, outcome.usage);
        self.record_security(&mut session, outcome.security);
        session.touch();
        self.persist(&session).await;
        Ok((outcome.extracted_data, outcome.confidence))
    }

    fn merge_usage(&self, session: &mut Session, usage: LlmUsage) {
        session.metrics.llm_calls += usage.calls;
        session.metrics.llm_tokens += usage.tokens;
        if usage.retried {
            session.metrics.retried_actions += 1;
        }
        metrics::record_llm_calls(usage.calls as u64);
    }

    fn record_security(&self, session: &mut Session, events: Vec<SecurityEvent>) {
        for event in events {
            metrics::record_security_threat(&event.threat);
            session.metrics.security_threats += 1;
            let severity = match event.severity.as_str() {
                "critical" => Severity::Critical,
                "high" => Severity::High,
                "medium" => Severity::Medium,
                _ => Severity::Low,
            };
            self.emit(
                SessionEvent::new(
                    EventType::SecurityAlert,
                    EventActor::System,
                    session.execution_state,
                )
                .with_data(json!({
                    "threat": event.threat,
                    "context": event.context,
                }))
                .with_severity(severity),
            );
            session.security_events.push(event);
        }
    }

    fn fail_current_task(&self, session: &mut Session, error: &str) {
        if let Some(task) = session.current_task_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                task.completed_at = Some(Utc::now());
            }
        }
        session.execution_state = LifecycleState::Error;
        metrics::record_task_finished("failed");
        self.emit(
            SessionEvent::new(EventType::TaskError, EventActor::System, LifecycleState::Error)
                .with_data(json!({"error": error})),
        );
    }

    fn complete_current_task(&self, session: &mut Session, result: Option<String>) {
        if let Some(task) = session.current_task_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Completed;
                task.result = result.clone();
                task.completed_at = Some(Utc::now());
            }
        }
        metrics::record_task_finished("completed");
        self.emit(
            SessionEvent::new(
                EventType::TaskComplete,
                EventActor::System,
                LifecycleState::Completed,
            )
            .with_data(json!({"result": result})),
        );
    }

    /// Kick off the detached planning loop. At most one loop runs per
    /// session; a second spawn while one is in flight is a no-op.
    pub(crate) fn spawn_planning(self: &Arc<Self>) {
        if self.planning_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while engine.planning_cycle_once().await {}
            engine.planning_in_flight.store(false, Ordering::SeqCst);
            // An ingress may have re-entered PLANNING while this loop was
            // exiting; pick that request up instead of dropping it.
            let pending =
                { engine.state.lock().await.execution_state == LifecycleState::Planning };
            if pending {
                engine.spawn_planning();
            }
        });
    }

    /// One planning cycle. Returns true when another cycle should run
    /// immediately (task advancement or an invalid planner action).
    async fn planning_cycle_once(self: &Arc<Self>) -> bool {
        struct CycleInput {
            task_description: String,
            browser_state: Option<BrowserState>,
            history: Vec<ActionRecord>,
            plan: Option<crate::types::StrategicPlan>,
            step: u32,
            config: SessionConfig,
            force_refresh: bool,
        }

        // Phase 1: pre-call bookkeeping under the session lock.
        let input = {
            let mut session = self.state.lock().await;
            if session.execution_state != LifecycleState::Planning {
                return false;
            }
            let Some(task) = session.current_task() else {
                session.execution_state = LifecycleState::Idle;
                self.persist(&session).await;
                return false;
            };
            let task_description = task.description.clone();

            if let Some(task) = session.current_task_mut() {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    self.emit(
                        SessionEvent::new(
                            EventType::TaskStart,
                            EventActor::System,
                            LifecycleState::Planning,
                        )
                        .with_data(json!({
                            "task_id": task.id,
                            "description": task.description,
                        })),
                    );
                }
            }

            session.step_count += 1;
            session.metrics.total_steps += 1;
            if session.step_count > session.config.max_steps {
                self.fail_current_task(&mut session, "max_steps_reached");
                session.touch();
                self.persist(&session).await;
                return false;
            }

            session.metrics.cache_hit_rate = self.cache.stats().hit_rate;

            let force_refresh = session.plan.is_none()
                || (session.config.planning_interval > 0
                    && session.step_count % session.config.planning_interval == 0);
            if force_refresh {
                session.metrics.planner_invocations += 1;
            }

            let input = CycleInput {
                task_description,
                browser_state: session.browser_state.clone(),
                history: session.action_history.clone(),
                plan: if force_refresh {
                    None
                } else {
                    session.plan.clone()
                },
                step: session.step_count,
                config: session.config.clone(),
                force_refresh,
            };
            session.touch();
            self.persist(&session).await;
            input
        };

        let Some(coordinator) = self.coordinator() else {
            let mut session = self.state.lock().await;
            self.fail_current_task(&mut session, "no model configured");
            self.persist(&session).await;
            return false;
        };

        // Phase 2: the model call happens outside the lock so pause/cancel
        // ingress stays responsive.
        let started_at = Utc::now();
        let planned = coordinator
            .plan(PlannerInput {
                task_description: &input.task_description,
                browser_state: input.browser_state.as_ref(),
                history: &input.history,
                plan: input.plan.as_ref(),
                step: input.step,
                config: &input.config,
            })
            .await;
        let finished_at = Utc::now();

        // Phase 3: apply the decision, unless the session moved on.
        let mut session = self.state.lock().await;
        if session.execution_state != LifecycleState::Planning {
            debug!(
                session_id = %session.id,
                state = session.execution_state.as_str(),
                "discarding planner result after state change"
            );
            return false;
        }

        let outcome = match planned {
            Ok(outcome) => outcome,
            Err(err) => {
                let category = err.category();
                if category == ErrorCategory::UserInputRequired {
                    session.execution_state = LifecycleState::Paused;
                    if let Some(task) = session.current_task_mut() {
                        task.status = TaskStatus::Paused;
                    }
                    self.emit(
                        SessionEvent::new(
                            EventType::TaskPause,
                            EventActor::System,
                            LifecycleState::Paused,
                        )
                        .with_data(json!({
                            "reason": "user_input_required",
                            "message": err.to_string(),
                        })),
                    );
                } else {
                    self.fail_current_task(&mut session, &err.to_string());
                }
                session.touch();
                self.persist(&session).await;
                return false;
            }
        };

        self.merge_usage(&mut session, outcome.usage);
        self.record_security(&mut session, outcome.security);

        session.planner_history.push(PlannerRecord {
            step: input.step,
            task_description: input.task_description.clone(),
            input_url: input
                .browser_state
                .as_ref()
                .map(|state| state.url.clone())
                .unwrap_or_default(),
            output: outcome.raw_response,
            started_at,
            finished_at,
        });

        if let Some(mut plan) = outcome.output.plan {
            if input.force_refresh && session.plan.is_some() {
                plan.revisions.push(PlanRevision {
                    revised_at: Utc::now(),
                    reason: format!("forced refresh at step {}", input.step),
                });
            }
            session.plan = Some(plan);
        }
        self.emit(
            SessionEvent::new(
                EventType::PlanGenerated,
                EventActor::Planner,
                LifecycleState::Planning,
            )
            .with_data(json!({
                "step": input.step,
                "confidence": outcome.output.confidence,
                "task_complete": outcome.output.task_complete,
            })),
        );

        if outcome.output.task_complete {
            let advanced = self.finish_task(&mut session, outcome.output.result).await;
            return advanced;
        }

        let Some(action) = outcome.output.next_action else {
            // Unreachable after parse validation; re-plan rather than wedge.
            warn!(session_id = %session.id, "planner omitted nextAction; replanning");
            session.touch();
            self.persist(&session).await;
            return true;
        };

        let verdict = coordinator.act(&action, &session.config);
        if verdict.task_complete {
            let advanced = self
                .finish_task(&mut session, verdict.completion_result)
                .await;
            return advanced;
        }
        if !verdict.success {
            // Invalid action from the model; the next cycle re-prompts and
            // the step cap bounds how long this can go on.
            warn!(
                session_id = %session.id,
                error = verdict.error.as_deref().unwrap_or("unknown"),
                "planner produced an invalid action; replanning"
            );
            session.touch();
            self.persist(&session).await;
            return true;
        }

        self.queue.enqueue(action.clone());
        session.queued_action = Some(action);
        session.execution_state = LifecycleState::WaitingForBrowser;
        session.touch();
        self.persist(&session).await;
        false
    }

    /// Complete the current task, then either advance to the next pending
    /// task (returns true: run another cycle) or terminate the session.
    async fn finish_task(&self, session: &mut Session, result: Option<String>) -> bool {
        self.complete_current_task(session, result);

        if let Some(next) = session.next_pending_task() {
            session.current_task_index = next;
            session.consecutive_failures = 0;
            session.execution_state = LifecycleState::Planning;
            session.touch();
            self.persist(session).await;
            return true;
        }

        session.execution_state = LifecycleState::Completed;
        session.touch();
        self.persist(session).await;
        if session.config.enable_replay {
            let key = replay_key(&session.id);
            let record = json!({
                "session_id": session.id,
                "action_history": session.action_history,
                "browser_state": session.browser_state,
                "metrics": session.metrics,
                "exported_at": Utc::now(),
            });
            if let Err(err) = self.store.put(&key, record).await {
                warn!(session_id = %session.id, %err, "failed to export replay");
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionType;
    use crate::llm::mock::MockChatModel;
    use crate::storage::InMemoryStore;
    use std::time::Duration;

    fn navigate_response() -> String {
        json!({
            "strategy": "visit the site",
            "estimatedSteps": 2,
            "confidence": 0.9,
            "nextAction": {"type": "navigate", "url": "https://example.com"},
            "taskComplete": false,
            "reasoning": "open the page"
        })
        .to_string()
    }

    fn complete_response(result: &str) -> String {
        json!({"taskComplete": true, "result": result}).to_string()
    }

    async fn wait_for_state(engine: &Arc<SessionEngine>, expected: LifecycleState) {
        for _ in 0..200 {
            if engine.snapshot().await.execution_state == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "session never reached {:?}; current {:?}",
            expected,
            engine.snapshot().await.execution_state
        );
    }

    fn engine_with_model(model: Arc<MockChatModel>) -> Arc<SessionEngine> {
        let engine = SessionEngine::new("s-test", SessionConfig::default(), InMemoryStore::shared());
        engine.set_model(model);
        engine
    }

    #[tokio::test]
    async fn happy_path_two_steps() {
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        model.push_text(complete_response("Arrived"));
        let engine = engine_with_model(model);

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;

        let reply = engine.next_action().await;
        let action = reply.action.unwrap();
        assert_eq!(action.action_type, ActionType::Navigate);
        assert_eq!(engine.snapshot().await.execution_state, LifecycleState::Executing);

        engine
            .action_result(ActionResult::success_with_state(BrowserState {
                url: "https://example.com".to_string(),
                title: "Example".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();
        wait_for_state(&engine, LifecycleState::Completed).await;

        let session = engine.snapshot().await;
        assert_eq!(session.action_history.len(), 1);
        assert_eq!(session.step_count, 2);
        assert_eq!(session.metrics.successful_actions, 1);
        assert_eq!(session.metrics.failed_actions, 0);
        let task = &session.tasks[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("Arrived"));
    }

    #[tokio::test]
    async fn consecutive_failures_fail_the_task() {
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        model.push_text(navigate_response());
        let engine = SessionEngine::new(
            "s-fail",
            SessionConfig {
                max_failures: 2,
                ..Default::default()
            },
            InMemoryStore::shared(),
        );
        engine.set_model(model);

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;

        engine.next_action().await.action.unwrap();
        engine
            .action_result(ActionResult::failure("element not found"))
            .await
            .unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;

        engine.next_action().await.action.unwrap();
        engine
            .action_result(ActionResult::failure("element not found"))
            .await
            .unwrap();
        wait_for_state(&engine, LifecycleState::Error).await;

        let session = engine.snapshot().await;
        assert_eq!(session.tasks[0].status, TaskStatus::Failed);
        assert_eq!(session.metrics.failed_actions, 2);

        // No further actions are produced.
        let reply = engine.next_action().await;
        assert!(reply.waiting);
        assert!(!reply.task_complete);
    }

    #[tokio::test]
    async fn one_success_resets_the_failure_counter() {
        let model = Arc::new(MockChatModel::new());
        for _ in 0..3 {
            model.push_text(navigate_response());
        }
        model.push_text(complete_response("done"));
        let engine = SessionEngine::new(
            "s-reset",
            SessionConfig {
                max_failures: 2,
                ..Default::default()
            },
            InMemoryStore::shared(),
        );
        engine.set_model(model);

        engine.execute("Visit example.com", None).await.unwrap();

        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
        engine.next_action().await.action.unwrap();
        engine
            .action_result(ActionResult::failure("flaky"))
            .await
            .unwrap();

        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
        engine.next_action().await.action.unwrap();
        engine
            .action_result(ActionResult::success_with_state(BrowserState {
                url: "https://example.com".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
        engine.next_action().await.action.unwrap();
        engine
            .action_result(ActionResult::failure("flaky again"))
            .await
            .unwrap();

        // One failure after a success: counter is 1, task keeps going.
        wait_for_state(&engine, LifecycleState::Completed).await;
        let session = engine.snapshot().await;
        assert_eq!(session.consecutive_failures, 1);
        assert_eq!(session.tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn max_steps_breach_fails_on_next_cycle() {
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        model.push_text(navigate_response());
        let engine = SessionEngine::new(
            "s-steps",
            SessionConfig {
                max_steps: 2,
                ..Default::default()
            },
            InMemoryStore::shared(),
        );
        engine.set_model(model);

        engine.execute("loop forever", None).await.unwrap();
        for _ in 0..2 {
            wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
            engine.next_action().await.action.unwrap();
            engine
                .action_result(ActionResult::success_with_state(BrowserState {
                    url: "https://example.com".to_string(),
                    ..Default::default()
                }))
                .await
                .unwrap();
        }

        wait_for_state(&engine, LifecycleState::Error).await;
        let session = engine.snapshot().await;
        assert_eq!(session.tasks[0].error.as_deref(), Some("max_steps_reached"));
        // The third cycle failed before consulting the model.
        assert_eq!(session.step_count, 3);
    }

    #[tokio::test]
    async fn cancel_drains_the_queue() {
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        let engine = engine_with_model(model);

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;

        engine.cancel().await.unwrap();
        let session = engine.snapshot().await;
        assert_eq!(session.execution_state, LifecycleState::Completed);
        assert_eq!(session.tasks[0].status, TaskStatus::Cancelled);
        assert!(session.queued_action.is_none());

        let reply = engine.next_action().await;
        assert!(reply.waiting);
        assert!(reply.task_complete);
    }

    #[tokio::test]
    async fn pause_skips_planning_until_resume() {
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        model.push_text(complete_response("done"));
        let engine = engine_with_model(model.clone());

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
        engine.next_action().await.action.unwrap();

        engine.pause().await.unwrap();
        engine
            .action_result(ActionResult::success_with_state(BrowserState {
                url: "https://example.com".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        // Paused: the result is recorded but no new planning happens.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.snapshot().await.execution_state, LifecycleState::Paused);
        assert_eq!(model.calls(), 1);

        engine.resume().await.unwrap();
        wait_for_state(&engine, LifecycleState::Completed).await;
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn follow_up_preserves_history_across_tasks() {
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        model.push_text(complete_response("Arrived"));
        let engine = engine_with_model(model.clone());

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
        engine.next_action().await.action.unwrap();
        engine
            .action_result(ActionResult::success_with_state(BrowserState {
                url: "https://example.com".to_string(),
                title: "Example".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();
        wait_for_state(&engine, LifecycleState::Completed).await;

        model.push_text(complete_response("Title read"));
        engine.follow_up("Now read the title").await.unwrap();
        wait_for_state(&engine, LifecycleState::Completed).await;

        let session = engine.snapshot().await;
        assert_eq!(session.tasks.len(), 2);
        assert_eq!(session.tasks[1].status, TaskStatus::Completed);
        // The second task's planner prompt saw the first task's navigate.
        let prompt = model.request_text(2).unwrap();
        assert!(prompt.contains("navigate"));
        assert!(prompt.contains("Now read the title"));
    }

    #[tokio::test]
    async fn planner_retry_exhaustion_fails_the_task() {
        let model = Arc::new(MockChatModel::new());
        for _ in 0..4 {
            model.push_error("fetch failed");
        }
        let engine = SessionEngine::new(
            "s-retry",
            SessionConfig {
                retry: crate::config::RetryStrategy {
                    backoff_ms: 1,
                    max_backoff_ms: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
            InMemoryStore::shared(),
        );
        engine.set_model(model.clone());

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::Error).await;
        assert_eq!(model.calls(), 4);
        let session = engine.snapshot().await;
        assert_eq!(session.tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn captcha_errors_pause_the_task() {
        let model = Arc::new(MockChatModel::new());
        model.push_error("captcha required on this page");
        let engine = engine_with_model(model);

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::Paused).await;
        let session = engine.snapshot().await;
        assert_eq!(session.tasks[0].status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn navigation_invalidates_cache_tiers() {
        use crate::cache::ContentType;

        let engine =
            SessionEngine::new("s-cache", SessionConfig::default(), InMemoryStore::shared());
        engine
            .update_state(BrowserState {
                url: "https://a.com/page1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        engine.cache().put(ContentType::Dom, "https://a.com/page1", "<html/>");
        engine.cache().put(ContentType::Api, "https://a.com/feed", "{}");
        engine
            .cache()
            .put(ContentType::Screenshot, "https://a.com/page1", "img");

        // Cross-host navigation clears every tier.
        engine
            .update_state(BrowserState {
                url: "https://b.com/home".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(engine.cache().len(ContentType::Dom), 0);
        assert_eq!(engine.cache().len(ContentType::Screenshot), 0);
        assert_eq!(engine.cache().len(ContentType::Api), 0);

        // Same-host navigation clears the DOM tier only.
        engine.cache().put(ContentType::Dom, "https://b.com/home", "<html/>");
        engine.cache().put(ContentType::Api, "https://b.com/feed", "{}");
        engine
            .update_state(BrowserState {
                url: "https://b.com/page2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(engine.cache().len(ContentType::Dom), 0);
        assert_eq!(engine.cache().len(ContentType::Api), 1);
    }

    #[tokio::test]
    async fn reload_restores_session_from_storage() {
        let store = InMemoryStore::shared();
        let model = Arc::new(MockChatModel::new());
        model.push_text(navigate_response());
        let engine = SessionEngine::new("s-reload", SessionConfig::default(), store.clone());
        engine.set_model(model);

        engine.execute("Visit example.com", None).await.unwrap();
        wait_for_state(&engine, LifecycleState::WaitingForBrowser).await;
        drop(engine);

        let blob = store.get(&session_key("s-reload")).await.unwrap().unwrap();
        let session: Session = serde_json::from_value(blob).unwrap();
        let revived = SessionEngine::from_session(session, store);
        assert!(!revived.has_model());

        // The queued action survived the restart and is still deliverable.
        let reply = revived.next_action().await;
        assert_eq!(reply.action.unwrap().action_type, ActionType::Navigate);
    }
}
