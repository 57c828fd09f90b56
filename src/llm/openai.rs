//! OpenAI-compatible chat provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::{EngineError, EngineResult};
use crate::retry::ErrorCategory;

use super::{ChatModel, ChatOutcome, ChatRequest};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub timeout: Duration,
    pub vision: bool,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
            vision: true,
        }
    }
}

pub struct OpenAiChatModel {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiChatModel {
    pub fn new(config: OpenAiConfig) -> EngineResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(EngineError::invalid_request("missing API key for provider"));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                EngineError::invalid_request(format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self { client, config })
    }

    fn encode_message(message: &super::ChatMessage) -> Value {
        match &message.image_base64 {
            None => json!({
                "role": message.role.as_str(),
                "content": message.content,
            }),
            Some(image) => json!({
                "role": message.role.as_str(),
                "content": [
                    {"type": "text", "text": message.content},
                    {
                        "type": "image_url",
                        "image_url": {"url": format!("data:image/png;base64,{image}")}
                    }
                ],
            }),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn chat(&self, request: ChatRequest) -> EngineResult<ChatOutcome> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "temperature": request.temperature,
            "response_format": {"type": "json_object"},
            "messages": request
                .messages
                .iter()
                .map(Self::encode_message)
                .collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let message = format!("provider request failed: {err}");
                let category = if err.is_timeout() {
                    ErrorCategory::Timeout
                } else {
                    ErrorCategory::Network
                };
                EngineError::categorized(category, message)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            let message = format!("provider returned {status}: {text}");
            warn!(%status, "chat completion request rejected");
            return Err(EngineError::categorized(
                ErrorCategory::classify(&message),
                message,
            ));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|err| {
            EngineError::categorized(
                ErrorCategory::Recoverable,
                format!("provider response invalid: {err}"),
            )
        })?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content.into_text())
            .ok_or_else(|| {
                EngineError::categorized(
                    ErrorCategory::Recoverable,
                    "provider response missing content",
                )
            })?;

        let usage = completion.usage.unwrap_or_default();
        Ok(ChatOutcome {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    fn supports_vision(&self) -> bool {
        self.config.vision
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    content: ChatCompletionContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatCompletionContent {
    Text(String),
    Parts(Vec<ChatCompletionPart>),
}

impl ChatCompletionContent {
    fn into_text(self) -> Option<String> {
        match self {
            ChatCompletionContent::Text(value) => Some(value),
            ChatCompletionContent::Parts(parts) => {
                let text = parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("\n");
                (!text.is_empty()).then_some(text)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
