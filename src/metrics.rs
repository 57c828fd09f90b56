//! Process-wide prometheus counters.
//!
//! Per-session accounting lives in `SessionMetrics` and is persisted with
//! the session; the registry here only aggregates across sessions for the
//! `/metrics` endpoint.

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();
static SESSIONS_CREATED: OnceCell<IntCounter> = OnceCell::new();
static LLM_CALLS: OnceCell<IntCounter> = OnceCell::new();
static SECURITY_THREATS: OnceCell<IntCounterVec> = OnceCell::new();
static TASKS_FINISHED: OnceCell<IntCounterVec> = OnceCell::new();

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();

        let sessions = IntCounter::new(
            "browserpilot_sessions_created_total",
            "Sessions created since process start",
        )
        .expect("create sessions counter");
        if let Err(err) = registry.register(Box::new(sessions.clone())) {
            error!(?err, "failed to register sessions counter");
        }
        let _ = SESSIONS_CREATED.set(sessions);

        let llm_calls = IntCounter::new(
            "browserpilot_llm_calls_total",
            "LLM chat invocations across all sessions",
        )
        .expect("create llm calls counter");
        if let Err(err) = registry.register(Box::new(llm_calls.clone())) {
            error!(?err, "failed to register llm calls counter");
        }
        let _ = LLM_CALLS.set(llm_calls);

        let threats = IntCounterVec::new(
            Opts::new(
                "browserpilot_security_threats_total",
                "Guardrail findings grouped by threat category",
            ),
            &["category"],
        )
        .expect("create security threats counter");
        if let Err(err) = registry.register(Box::new(threats.clone())) {
            error!(?err, "failed to register security threats counter");
        }
        let _ = SECURITY_THREATS.set(threats);

        let tasks = IntCounterVec::new(
            Opts::new(
                "browserpilot_tasks_finished_total",
                "Tasks reaching a terminal status",
            ),
            &["status"],
        )
        .expect("create tasks counter");
        if let Err(err) = registry.register(Box::new(tasks.clone())) {
            error!(?err, "failed to register tasks counter");
        }
        let _ = TASKS_FINISHED.set(tasks);
    });
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

pub fn record_session_created() {
    register_metrics();
    if let Some(counter) = SESSIONS_CREATED.get() {
        counter.inc();
    }
}

pub fn record_llm_calls(count: u64) {
    if count == 0 {
        return;
    }
    register_metrics();
    if let Some(counter) = LLM_CALLS.get() {
        counter.inc_by(count);
    }
}

pub fn record_security_threat(category: &str) {
    register_metrics();
    if let Some(counter) = SECURITY_THREATS.get() {
        counter.with_label_values(&[category]).inc();
    }
}

pub fn record_task_finished(status: &str) {
    register_metrics();
    if let Some(counter) = TASKS_FINISHED.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Render the registry in prometheus text format.
pub fn encode_text() -> Result<String, String> {
    register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&global_registry().gather(), &mut buffer)
        .map_err(|err| err.to_string())?;
    String::from_utf8(buffer).map_err(|err| err.to_string())
}
