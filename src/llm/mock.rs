//! Deterministic scripted model for tests and offline development.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{EngineError, EngineResult};

use super::{ChatModel, ChatOutcome, ChatRequest};

enum Scripted {
    Text(String),
    Error(String),
}

/// Replays queued responses in order; an empty script yields an error so a
/// runaway loop fails fast instead of hanging a test.
pub struct MockChatModel {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
    vision: bool,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            vision: false,
        }
    }

    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.script.lock().push_back(Scripted::Text(text.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.script.lock().push_back(Scripted::Error(message.into()));
    }

    /// Number of chat calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Full prompt text of the `n`-th call, for content assertions.
    pub fn request_text(&self, n: usize) -> Option<String> {
        self.requests.lock().get(n).map(|request| {
            request
                .messages
                .iter()
                .map(|message| message.content.clone())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }
}

impl Default for MockChatModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn chat(&self, request: ChatRequest) -> EngineResult<ChatOutcome> {
        self.requests.lock().push(request);
        match self.script.lock().pop_front() {
            Some(Scripted::Text(text)) => {
                let completion_tokens = (text.len() / 4).max(1) as u64;
                Ok(ChatOutcome {
                    text,
                    prompt_tokens: 128,
                    completion_tokens,
                })
            }
            Some(Scripted::Error(message)) => Err(EngineError::invalid_request(message)),
            None => Err(EngineError::invalid_request(
                "mock model script exhausted",
            )),
        }
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[tokio::test]
    async fn replays_script_in_order() {
        let model = MockChatModel::new();
        model.push_text("{\"ok\":1}");
        model.push_error("fetch failed");

        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.0,
        };

        let first = model.chat(request.clone()).await.unwrap();
        assert_eq!(first.text, "{\"ok\":1}");

        let second = model.chat(request).await.unwrap_err();
        assert!(second.to_string().contains("fetch failed"));
        assert_eq!(model.calls(), 2);
    }
}
