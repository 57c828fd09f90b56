//! Actor role: validate an action and decide how it is dispatched.
//!
//! The engine never drives a browser; for every non-terminal action the
//! actor's outcome tells the session to queue it and wait for the client's
//! result. `complete` actions short-circuit into task completion.

use serde_json::Value;
use tracing::debug;

use crate::actions::{Action, ActionType};
use crate::config::SessionConfig;

use super::Coordinator;

#[derive(Debug, Clone)]
pub struct ActorOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub needs_retry: bool,
    /// Whether executing this action is expected to change the page.
    pub browser_state_changed: bool,
    pub task_complete: bool,
    pub completion_result: Option<String>,
}

impl ActorOutcome {
    fn rejected(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            needs_retry: false,
            browser_state_changed: false,
            task_complete: false,
            completion_result: None,
        }
    }
}

impl Coordinator {
    /// Validate `action` against the vocabulary and the configured whitelist.
    pub fn act(&self, action: &Action, config: &SessionConfig) -> ActorOutcome {
        if !config.is_tool_enabled(action.action_type) {
            return ActorOutcome::rejected(format!(
                "action type {} is not enabled for this session",
                action.action_type.as_str()
            ));
        }

        if let Some(error) = validate_params(action) {
            return ActorOutcome::rejected(error);
        }

        if action.action_type == ActionType::Complete {
            let result = action.completion_result();
            debug!(action_id = %action.id, "actor observed completion action");
            return ActorOutcome {
                success: true,
                data: None,
                error: None,
                needs_retry: false,
                browser_state_changed: false,
                task_complete: true,
                completion_result: result,
            };
        }

        ActorOutcome {
            success: true,
            data: None,
            error: None,
            needs_retry: false,
            browser_state_changed: mutates_page(action.action_type),
            task_complete: false,
            completion_result: None,
        }
    }
}

/// Minimal per-type parameter checks; the browser client performs the real
/// execution-time validation.
fn validate_params(action: &Action) -> Option<String> {
    let required: &[&str] = match action.action_type {
        ActionType::Navigate => &["url"],
        ActionType::Click | ActionType::Hover | ActionType::ScrollToElement => &["selector"],
        ActionType::Type => &["selector", "text"],
        ActionType::Select | ActionType::Dropdown => &["selector", "value"],
        ActionType::SearchGoogle => &["query"],
        ActionType::KeyPress => &["key"],
        ActionType::KeyCombo => &["keys"],
        _ => &[],
    };
    for key in required {
        if !action.params.contains_key(*key) {
            return Some(format!(
                "action {} missing required parameter '{key}'",
                action.action_type.as_str()
            ));
        }
    }
    None
}

fn mutates_page(action_type: ActionType) -> bool {
    !matches!(
        action_type,
        ActionType::Screenshot
            | ActionType::Extract
            | ActionType::CacheContent
            | ActionType::Wait
            | ActionType::Complete
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockChatModel;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(MockChatModel::new()))
    }

    fn navigate_action() -> Action {
        let mut params = Map::new();
        params.insert("url".to_string(), json!("https://example.com"));
        Action::new(ActionType::Navigate, params, String::new())
    }

    #[test]
    fn valid_action_is_dispatched() {
        let outcome = coordinator().act(&navigate_action(), &SessionConfig::default());
        assert!(outcome.success);
        assert!(!outcome.task_complete);
        assert!(outcome.browser_state_changed);
    }

    #[test]
    fn whitelist_rejects_disabled_types() {
        let config = SessionConfig {
            tools_enabled: Some(vec![ActionType::Click]),
            ..Default::default()
        };
        let outcome = coordinator().act(&navigate_action(), &config);
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not enabled"));
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let action = Action::new(ActionType::Navigate, Map::new(), String::new());
        let outcome = coordinator().act(&action, &SessionConfig::default());
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("url"));
    }

    #[test]
    fn complete_carries_its_result() {
        let mut params = Map::new();
        params.insert("result".to_string(), json!("all done"));
        let action = Action::new(ActionType::Complete, params, String::new());
        let outcome = coordinator().act(&action, &SessionConfig::default());
        assert!(outcome.task_complete);
        assert_eq!(outcome.completion_result.as_deref(), Some("all done"));
    }
}
