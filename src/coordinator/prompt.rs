//! Prompt assembly for the planner and extractor roles.

use crate::actions::ActionType;
use crate::config::SessionConfig;
use crate::guardrail::GuardrailFilter;
use crate::types::{ActionRecord, BrowserState, StrategicPlan};

/// How many trailing history entries the planner sees.
const HISTORY_TAIL: usize = 8;

pub struct PromptBuilder;

impl PromptBuilder {
    pub fn planner_system_prompt(config: &SessionConfig) -> String {
        let vocabulary = ActionType::ALL
            .iter()
            .filter(|tag| config.is_tool_enabled(**tag))
            .map(|tag| tag.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "You are a browser-automation planner. At each step you receive the task, the \
             current browser state, and the history of executed actions; respond with a single \
             JSON object and nothing else.\n\
             Available action types: {vocabulary}.\n\
             Respond with fields: strategy, estimatedSteps, confidence, nextAction (an object \
             with a \"type\" field plus its parameters and reasoning), plannedActions, \
             successCriteria, risks, taskComplete, result. When the task is finished set \
             taskComplete to true and put the answer in result; otherwise nextAction is \
             required. Emit at most {max_actions} planned actions per step.",
            max_actions = config.max_actions_per_step,
        )
    }

    pub fn planner_user_prompt(
        task_description: &str,
        sanitized_dom: Option<&str>,
        browser_state: Option<&BrowserState>,
        history: &[ActionRecord],
        plan: Option<&StrategicPlan>,
        step: u32,
        max_steps: u32,
    ) -> String {
        let mut sections = Vec::new();
        sections.push(format!("Task: {}", task_description.trim()));
        sections.push(format!("Step {step} of {max_steps}."));

        if let Some(state) = browser_state {
            sections.push(format!(
                "Current page: {} ({})",
                state.url,
                if state.title.is_empty() {
                    "untitled"
                } else {
                    &state.title
                }
            ));
        }

        if let Some(dom) = sanitized_dom {
            sections.push(GuardrailFilter::wrap_untrusted(dom));
        }

        if !history.is_empty() {
            let tail = history
                .iter()
                .rev()
                .take(HISTORY_TAIL)
                .rev()
                .map(|record| {
                    format!(
                        "- step {}: {} -> {}",
                        record.step,
                        record.action.action_type.as_str(),
                        if record.result.success {
                            "ok"
                        } else {
                            record.result.error.as_deref().unwrap_or("failed")
                        }
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Action history (most recent last):\n{tail}"));
        }

        if let Some(plan) = plan {
            let remaining = plan
                .planned_actions
                .iter()
                .map(|planned| format!("- {}: {}", planned.action_type, planned.reasoning))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!(
                "Current strategy: {}\nPlanned actions:\n{remaining}",
                plan.strategy
            ));
        }

        sections.join("\n\n")
    }

    pub fn extractor_system_prompt() -> &'static str {
        "You extract structured data from web page content. Respond with a single JSON object \
         mapping each requested field name to its extracted value; use null for fields the \
         content does not contain. Do not invent values."
    }

    pub fn extractor_user_prompt(
        fields: &[String],
        sanitized_content: &str,
        extraction_prompt: Option<&str>,
    ) -> String {
        let mut sections = Vec::new();
        sections.push(format!("Fields to extract: {}", fields.join(", ")));
        if let Some(prompt) = extraction_prompt {
            sections.push(format!("Guidance: {prompt}"));
        }
        sections.push(GuardrailFilter::wrap_untrusted(sanitized_content));
        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    #[test]
    fn system_prompt_lists_only_enabled_tools() {
        let config = SessionConfig {
            tools_enabled: Some(vec![ActionType::Navigate, ActionType::Click]),
            ..Default::default()
        };
        let prompt = PromptBuilder::planner_system_prompt(&config);
        assert!(prompt.contains("navigate"));
        assert!(prompt.contains("click"));
        assert!(prompt.contains("complete"));
        assert!(!prompt.contains("search_google"));
    }

    #[test]
    fn user_prompt_carries_task_and_dom() {
        let prompt = PromptBuilder::planner_user_prompt(
            "Visit example.com",
            Some("<html>safe</html>"),
            None,
            &[],
            None,
            1,
            50,
        );
        assert!(prompt.contains("Visit example.com"));
        assert!(prompt.contains("<untrusted_content>"));
        assert!(prompt.contains("Step 1 of 50."));
    }
}
