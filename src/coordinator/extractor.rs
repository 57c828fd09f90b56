//! Extractor role: pull structured fields out of page content.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde_json::{Map, Value};

use crate::config::SessionConfig;
use crate::errors::EngineResult;
use crate::llm::parse::parse_extraction_response;
use crate::llm::{ChatMessage, ChatRequest};
use crate::retry::execute_with_retry;
use crate::types::SecurityEvent;

use super::prompt::PromptBuilder;
use super::{Coordinator, LlmUsage};

/// Extraction runs at temperature zero so repeated calls over the same
/// content give the same answer.
const EXTRACTOR_TEMPERATURE: f32 = 0.0;

pub struct ExtractorOutcome {
    pub extracted_data: Map<String, Value>,
    pub confidence: f64,
    pub usage: LlmUsage,
    pub security: Vec<SecurityEvent>,
}

impl Coordinator {
    pub async fn extract(
        &self,
        fields: &[String],
        content: &str,
        extraction_prompt: Option<&str>,
        config: &SessionConfig,
    ) -> EngineResult<ExtractorOutcome> {
        let (sanitized, security) =
            self.sanitize_untrusted(content, config.strict_security, "extractor:content");

        let messages = vec![
            ChatMessage::system(PromptBuilder::extractor_system_prompt()),
            ChatMessage::user(PromptBuilder::extractor_user_prompt(
                fields,
                &sanitized.text,
                extraction_prompt,
            )),
        ];

        let calls = AtomicU32::new(0);
        let tokens = AtomicU64::new(0);
        let model = self.model().clone();

        let outcome = execute_with_retry(
            || {
                let request = ChatRequest {
                    messages: messages.clone(),
                    temperature: EXTRACTOR_TEMPERATURE,
                };
                let model = model.clone();
                let calls = &calls;
                let tokens = &tokens;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let reply = model.chat(request).await?;
                    tokens.fetch_add(reply.total_tokens(), Ordering::SeqCst);
                    parse_extraction_response(&reply.text, fields)
                }
            },
            &config.retry,
            "extractor",
        )
        .await?;

        let (extracted_data, confidence) = outcome.value;
        Ok(ExtractorOutcome {
            extracted_data,
            confidence,
            usage: LlmUsage {
                calls: calls.load(Ordering::SeqCst),
                tokens: tokens.load(Ordering::SeqCst),
                retried: outcome.attempts > 1,
            },
            security,
        })
    }
}
