//! Browser action vocabulary.
//!
//! Actions are produced by the planner and executed by the remote browser
//! client; the engine itself never drives a browser. Each action carries a
//! typed tag, a parameter bag whose schema depends on the tag, and the
//! planner's reasoning for audit purposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::BrowserState;

/// Supported browser directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Navigate to a URL (`url`).
    Navigate,
    /// Click an element (`selector` or `index`).
    Click,
    /// Type text into an element (`selector`, `text`, optional `submit`).
    Type,
    /// Hover over an element (`selector`).
    Hover,
    /// Select an option from a native select (`selector`, `value`).
    Select,
    /// Scroll the page (`direction`, optional `amount`).
    Scroll,
    /// Scroll an element into view (`selector`).
    ScrollToElement,
    /// Open a new tab (`url` optional).
    NewTab,
    /// Switch to another tab (`index`).
    SwitchTab,
    /// Close the current tab.
    CloseTab,
    /// Wait for a duration (`ms`) or condition (`condition`).
    Wait,
    /// Capture a screenshot of the current viewport.
    Screenshot,
    /// Extract structured content from the page (`fields`).
    Extract,
    /// Ask the client to send page content for caching (`content_type`).
    CacheContent,
    /// Press a single key (`key`).
    KeyPress,
    /// Press a key combination (`keys`).
    KeyCombo,
    /// Open and pick from a custom dropdown widget (`selector`, `value`).
    Dropdown,
    /// Run a Google search (`query`).
    SearchGoogle,
    /// Follow pagination to the next page (`selector` optional).
    NextPage,
    /// Signal task completion (`result`).
    Complete,
}

impl ActionType {
    /// All known action tags, used to describe the vocabulary to the planner
    /// and to validate whitelists.
    pub const ALL: &'static [ActionType] = &[
        ActionType::Navigate,
        ActionType::Click,
        ActionType::Type,
        ActionType::Hover,
        ActionType::Select,
        ActionType::Scroll,
        ActionType::ScrollToElement,
        ActionType::NewTab,
        ActionType::SwitchTab,
        ActionType::CloseTab,
        ActionType::Wait,
        ActionType::Screenshot,
        ActionType::Extract,
        ActionType::CacheContent,
        ActionType::KeyPress,
        ActionType::KeyCombo,
        ActionType::Dropdown,
        ActionType::SearchGoogle,
        ActionType::NextPage,
        ActionType::Complete,
    ];

    /// Wire name of the tag (the snake_case serde form).
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Navigate => "navigate",
            ActionType::Click => "click",
            ActionType::Type => "type",
            ActionType::Hover => "hover",
            ActionType::Select => "select",
            ActionType::Scroll => "scroll",
            ActionType::ScrollToElement => "scroll_to_element",
            ActionType::NewTab => "new_tab",
            ActionType::SwitchTab => "switch_tab",
            ActionType::CloseTab => "close_tab",
            ActionType::Wait => "wait",
            ActionType::Screenshot => "screenshot",
            ActionType::Extract => "extract",
            ActionType::CacheContent => "cache_content",
            ActionType::KeyPress => "key_press",
            ActionType::KeyCombo => "key_combo",
            ActionType::Dropdown => "dropdown",
            ActionType::SearchGoogle => "search_google",
            ActionType::NextPage => "next_page",
            ActionType::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<ActionType> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == value.trim())
    }
}

/// A single browser directive queued for the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(action_type: ActionType, params: Map<String, Value>, reasoning: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_type,
            params,
            reasoning,
            created_at: Utc::now(),
        }
    }

    /// Convenience accessor for string-valued parameters.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// The completion result carried by a `complete` action, if any.
    pub fn completion_result(&self) -> Option<String> {
        if self.action_type != ActionType::Complete {
            return None;
        }
        self.param_str("result")
            .or_else(|| self.param_str("text"))
            .map(|value| value.to_string())
    }
}

/// Outcome reported by the browser client for one executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_state: Option<BrowserState>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Step number this result corresponds to.
    #[serde(default)]
    pub step: u32,
}

impl ActionResult {
    pub fn success_with_state(state: BrowserState) -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            screenshot: None,
            browser_state: Some(state),
            duration_ms: 0,
            step: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            screenshot: None,
            browser_state: None,
            duration_ms: 0,
            step: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_round_trips_through_wire_name() {
        for tag in ActionType::ALL {
            assert_eq!(ActionType::parse(tag.as_str()), Some(*tag));
        }
        assert_eq!(ActionType::parse("teleport"), None);
    }

    #[test]
    fn action_serializes_with_type_tag() {
        let mut params = Map::new();
        params.insert("url".to_string(), json!("https://example.com"));
        let action = Action::new(ActionType::Navigate, params, "open the site".to_string());

        let encoded = serde_json::to_string(&action).unwrap();
        assert!(encoded.contains("\"type\":\"navigate\""));
        assert!(encoded.contains("https://example.com"));
    }

    #[test]
    fn completion_result_only_for_complete_actions() {
        let mut params = Map::new();
        params.insert("result".to_string(), json!("done"));
        let done = Action::new(ActionType::Complete, params.clone(), String::new());
        assert_eq!(done.completion_result().as_deref(), Some("done"));

        let nav = Action::new(ActionType::Navigate, params, String::new());
        assert_eq!(nav.completion_result(), None);
    }
}
