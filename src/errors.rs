use thiserror::Error;

use crate::retry::ErrorCategory;

/// Errors emitted by the session engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Raised when an ingress request is malformed or missing required fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Raised when the requested session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Raised when an operation is illegal in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An LLM or transport failure carrying its retry classification.
    #[error("{category} error: {message}")]
    Categorized {
        category: ErrorCategory,
        message: String,
    },

    /// Raised when the model's response cannot be parsed into a decision.
    #[error("planner response unparseable: {0}")]
    Parse(String),

    /// Raised when persisting or loading session state fails.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn categorized(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Categorized {
            category,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Retry classification of this error. Parse failures are recoverable so
    /// the retry executor may re-attempt the model call; uncategorized errors
    /// fall back to substring classification of the message.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Categorized { category, .. } => *category,
            EngineError::Parse(_) => ErrorCategory::Recoverable,
            EngineError::Storage(_) => ErrorCategory::Recoverable,
            other => ErrorCategory::classify(&other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
