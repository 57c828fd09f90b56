//! HTTP boundary: one route per ingress operation, JSON envelopes, SSE event
//! stream, permissive CORS.

use std::time::Duration;

use async_stream::stream;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::actions::ActionResult;
use crate::config::SessionConfig;
use crate::errors::EngineError;
use crate::metrics;
use crate::session::SessionEngine;
use crate::types::BrowserState;

use super::state::{ModelSpec, ServeState};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/create", post(create_session_handler))
        .route("/sessions/:id/execute", post(execute_handler))
        .route("/sessions/:id/follow-up", post(follow_up_handler))
        .route("/sessions/:id/next-action", get(next_action_handler))
        .route("/sessions/:id/action-result", post(action_result_handler))
        .route("/sessions/:id/state", post(state_handler))
        .route("/sessions/:id/pause", post(pause_handler))
        .route("/sessions/:id/resume", post(resume_handler))
        .route("/sessions/:id/cancel", post(cancel_handler))
        .route("/sessions/:id/history", get(history_handler))
        .route("/sessions/:id/events", get(events_handler))
        .route("/sessions/:id/replay", post(replay_handler))
        .route("/sessions/:id/extract", post(extract_handler))
        .fallback(not_found_handler)
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

fn engine_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidState(_) => StatusCode::CONFLICT,
        EngineError::Categorized { .. } | EngineError::Parse(_) => StatusCode::BAD_GATEWAY,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()})))
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn accept<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(inner)| inner)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

async fn resolve(state: &ServeState, session_id: &str) -> ApiResult<std::sync::Arc<SessionEngine>> {
    state.resolve(session_id).await.map_err(engine_error)
}

async fn health_handler(State(state): State<ServeState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "live_sessions": state.session_ids().len(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_text() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            warn!(%err, "failed to encode prometheus metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

async fn not_found_handler() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "unknown route"})),
    )
}

async fn list_sessions_handler(State(state): State<ServeState>) -> ApiResult<Json<Value>> {
    let mut ids: Vec<String> = state
        .store()
        .list_keys("session-")
        .await
        .map_err(engine_error)?
        .into_iter()
        .filter_map(|key| key.strip_prefix("session-").map(str::to_string))
        .collect();
    for live in state.session_ids() {
        if !ids.contains(&live) {
            ids.push(live);
        }
    }
    ids.sort();
    Ok(Json(json!({"success": true, "sessions": ids})))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default, alias = "extensionId")]
    #[allow(dead_code)]
    extension_id: Option<String>,
    #[serde(default)]
    config: Option<SessionConfig>,
}

async fn create_session_handler(
    State(state): State<ServeState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let payload = accept(body)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let engine = SessionEngine::new(
        session_id.clone(),
        payload.config.unwrap_or_default(),
        state.store(),
    );
    engine.persist_now().await;
    state.insert(engine);
    metrics::record_session_created();
    Ok(Json(json!({
        "sessionId": session_id,
        "durableObjectId": session_id,
    })))
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    task: String,
    #[serde(default, alias = "apiKey")]
    api_key: Option<String>,
    #[serde(default)]
    vision: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    config: Option<SessionConfig>,
}

async fn execute_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let payload = accept(body)?;
    let engine = resolve(&state, &session_id).await?;

    let api_key = payload
        .api_key
        .or_else(|| state.default_api_key().map(str::to_string))
        .ok_or_else(|| bad_request("missing apiKey".to_string()))?;
    let spec = ModelSpec {
        api_key,
        model: payload.model,
        provider: payload.provider,
        vision: payload.vision,
    };
    let model = state.model_factory().build(&spec).map_err(engine_error)?;
    engine.set_model(model);

    let task_id = engine
        .execute(&payload.task, payload.config)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({"success": true, "taskId": task_id})))
}

#[derive(Debug, Deserialize)]
struct FollowUpRequest {
    task: String,
}

async fn follow_up_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
    body: Result<Json<FollowUpRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let payload = accept(body)?;
    let engine = resolve(&state, &session_id).await?;
    let task_id = engine.follow_up(&payload.task).await.map_err(engine_error)?;
    Ok(Json(json!({"success": true, "taskId": task_id})))
}

async fn next_action_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let engine = resolve(&state, &session_id).await?;
    let reply = engine.next_action().await;
    match reply.action {
        Some(action) => Ok(Json(json!({
            "action": action,
            "waiting": false,
            "taskComplete": false,
        }))),
        None => Ok(Json(json!({
            "waiting": true,
            "taskComplete": reply.task_complete,
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct ActionResultRequest {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    screenshot: Option<String>,
    #[serde(default, alias = "domState")]
    dom_state: Option<BrowserState>,
    #[serde(default, alias = "durationMs")]
    duration_ms: u64,
}

async fn action_result_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
    body: Result<Json<ActionResultRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let payload = accept(body)?;
    let engine = resolve(&state, &session_id).await?;
    let result = ActionResult {
        success: payload.success,
        data: payload.result,
        error: payload.error,
        screenshot: payload.screenshot,
        browser_state: payload.dom_state,
        duration_ms: payload.duration_ms,
        step: 0,
    };
    engine.action_result(result).await.map_err(engine_error)?;
    Ok(Json(json!({"success": true})))
}

async fn state_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
    body: Result<Json<BrowserState>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let payload = accept(body)?;
    let engine = resolve(&state, &session_id).await?;
    engine.update_state(payload).await.map_err(engine_error)?;
    Ok(Json(json!({"success": true})))
}

async fn pause_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let engine = resolve(&state, &session_id).await?;
    engine.pause().await.map_err(engine_error)?;
    Ok(Json(json!({"success": true})))
}

async fn resume_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let engine = resolve(&state, &session_id).await?;
    engine.resume().await.map_err(engine_error)?;
    Ok(Json(json!({"success": true})))
}

async fn cancel_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let engine = resolve(&state, &session_id).await?;
    engine.cancel().await.map_err(engine_error)?;
    Ok(Json(json!({"success": true})))
}

async fn history_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let engine = resolve(&state, &session_id).await?;
    let session = engine.snapshot().await;
    Ok(Json(json!({
        "sessionId": session.id,
        "tasks": session.tasks,
        "currentTaskIndex": session.current_task_index,
        "executionState": session.execution_state,
        "actionHistory": session.action_history,
        "plannerHistory": session.planner_history,
        "securityEvents": session.security_events,
        "metrics": session.metrics,
        "stepCount": session.step_count,
    })))
}

async fn events_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let engine = resolve(&state, &session_id).await?;
    let mut receiver = engine.subscribe_events();

    let stream = stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(payload) => {
                        yield Ok::<Event, std::convert::Infallible>(
                            Event::default().data(payload),
                        );
                    }
                    Err(err) => {
                        warn!(%err, "failed to serialize session event");
                    }
                },
                // A lagged subscriber loses old events but stays attached.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn replay_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let engine = resolve(&state, &session_id).await?;
    let replay_id = engine.export_replay().await.map_err(engine_error)?;
    Ok(Json(json!({"success": true, "replayId": replay_id})))
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    fields: Vec<String>,
    content: String,
    #[serde(default, alias = "extractionPrompt")]
    extraction_prompt: Option<String>,
}

async fn extract_handler(
    State(state): State<ServeState>,
    Path(session_id): Path<String>,
    body: Result<Json<ExtractRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let payload = accept(body)?;
    let engine = resolve(&state, &session_id).await?;
    let (data, confidence) = engine
        .extract(
            &payload.fields,
            &payload.content,
            payload.extraction_prompt.as_deref(),
        )
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "success": true,
        "data": data,
        "confidence": confidence,
    })))
}
