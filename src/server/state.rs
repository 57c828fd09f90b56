//! Shared state behind the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::errors::{EngineError, EngineResult};
use crate::llm::openai::{OpenAiChatModel, OpenAiConfig};
use crate::llm::ChatModel;
use crate::session::SessionEngine;
use crate::storage::{session_key, SessionStore};
use crate::types::Session;

/// Model selection carried by an `execute` request.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub api_key: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub vision: bool,
}

/// Seam for constructing chat models, so tests can plug in a scripted model.
pub trait ModelFactory: Send + Sync {
    fn build(&self, spec: &ModelSpec) -> EngineResult<Arc<dyn ChatModel>>;
}

/// Default factory: OpenAI-compatible endpoints.
pub struct OpenAiModelFactory;

impl ModelFactory for OpenAiModelFactory {
    fn build(&self, spec: &ModelSpec) -> EngineResult<Arc<dyn ChatModel>> {
        let mut config = OpenAiConfig {
            api_key: spec.api_key.clone(),
            vision: spec.vision,
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        if let Some(model) = &spec.model {
            config.model = model.clone();
        }
        match spec.provider.as_deref() {
            None | Some("openai") => {}
            Some(other) => {
                return Err(EngineError::invalid_request(format!(
                    "unknown provider: {other}"
                )));
            }
        }
        Ok(Arc::new(OpenAiChatModel::new(config)?))
    }
}

#[derive(Clone)]
pub struct ServeState {
    sessions: Arc<DashMap<String, Arc<SessionEngine>>>,
    store: Arc<dyn SessionStore>,
    model_factory: Arc<dyn ModelFactory>,
    /// Process-wide API credential used when the request carries none.
    default_api_key: Option<String>,
}

impl ServeState {
    pub fn new(store: Arc<dyn SessionStore>, model_factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            store,
            model_factory,
            default_api_key: std::env::var("BROWSERPILOT_API_KEY").ok(),
        }
    }

    pub fn with_default_api_key(mut self, api_key: Option<String>) -> Self {
        self.default_api_key = api_key;
        self
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    pub fn model_factory(&self) -> &Arc<dyn ModelFactory> {
        &self.model_factory
    }

    pub fn default_api_key(&self) -> Option<&str> {
        self.default_api_key.as_deref()
    }

    pub fn insert(&self, engine: Arc<SessionEngine>) {
        self.sessions.insert(engine.id().to_string(), engine);
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Resolve a session: live instance first, then a reload from storage
    /// (the process may have restarted since the session was created).
    pub async fn resolve(&self, session_id: &str) -> EngineResult<Arc<SessionEngine>> {
        if let Some(engine) = self.sessions.get(session_id) {
            return Ok(engine.clone());
        }
        let Some(blob) = self.store.get(&session_key(session_id)).await? else {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        };
        let session: Session = serde_json::from_value(blob)
            .map_err(|err| EngineError::storage(format!("corrupt session blob: {err}")))?;
        let engine = SessionEngine::from_session(session, self.store.clone());
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| engine.clone());
        Ok(entry.clone())
    }
}
