//! Multi-agent coordinator.
//!
//! Owns the three roles sharing one LLM capability: the planner decides the
//! next browser action, the actor validates and dispatches it, and the
//! extractor pulls structured fields out of page content. Every model call
//! goes through the guardrail filter (untrusted content) and the retry
//! executor (transient failures).

mod actor;
mod extractor;
mod planner;
mod prompt;

pub use actor::ActorOutcome;
pub use extractor::ExtractorOutcome;
pub use planner::{PlannerInput, PlannerOutcome};

use std::sync::Arc;

use chrono::Utc;

use crate::guardrail::{GuardrailFilter, SanitizeOutcome};
use crate::llm::ChatModel;
use crate::types::SecurityEvent;

/// Token and call accounting for one role invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmUsage {
    pub calls: u32,
    pub tokens: u64,
    /// True when the retry executor needed more than one attempt.
    pub retried: bool,
}

pub struct Coordinator {
    model: Arc<dyn ChatModel>,
    guardrail: GuardrailFilter,
}

impl Coordinator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            guardrail: GuardrailFilter::new(),
        }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub(crate) fn guardrail(&self) -> &GuardrailFilter {
        &self.guardrail
    }

    /// Sanitize one piece of untrusted content, turning findings into
    /// security events for the session log.
    pub(crate) fn sanitize_untrusted(
        &self,
        text: &str,
        strict: bool,
        context: &str,
    ) -> (SanitizeOutcome, Vec<SecurityEvent>) {
        let outcome = self.guardrail.sanitize(text, strict);
        let events = outcome
            .threats
            .iter()
            .map(|finding| SecurityEvent {
                threat: finding.category.as_str().to_string(),
                severity: finding.severity.as_str().to_string(),
                context: context.to_string(),
                detected_at: Utc::now(),
            })
            .collect();
        (outcome, events)
    }
}
