//! Parsing of loosely-typed model output.
//!
//! Models return JSON, frequently wrapped in fenced code blocks or prose.
//! Responses are first located with [`extract_json_object`], then parsed into
//! a permissive intermediate (every field optional, unknown fields ignored)
//! and finally validated into typed output. A response missing its required
//! fields is a recoverable parse error, so the retry layer may re-ask.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::actions::{Action, ActionType};
use crate::errors::{EngineError, EngineResult};
use crate::types::{PlanRisk, PlannedAction, StrategicPlan};

/// Locate the first JSON object in raw model output, tolerating fenced code
/// blocks and surrounding prose.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }

    // Fenced block, e.g. ```json\n{...}\n```
    if let Some(open) = trimmed.find("```") {
        let rest = &trimmed[open + 3..];
        let body = rest
            .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_')
            .trim_start();
        if let Some(close) = body.find("```") {
            let block = body[..close].trim();
            if block.starts_with('{') {
                return Some(block.to_string());
            }
        }
    }

    // Fall back to brace matching over the whole text.
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in trimmed[start..].char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(trimmed[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Validated planner decision.
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: Option<StrategicPlan>,
    pub next_action: Option<Action>,
    pub reasoning: String,
    pub confidence: f64,
    pub needs_revision: bool,
    pub task_complete: bool,
    pub result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPlannerResponse {
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default, alias = "estimatedSteps")]
    estimated_steps: Option<u32>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default, alias = "nextAction")]
    next_action: Option<RawAction>,
    #[serde(default, alias = "plannedActions")]
    planned_actions: Vec<RawPlannedAction>,
    #[serde(default, alias = "successCriteria")]
    success_criteria: Vec<String>,
    #[serde(default)]
    risks: Vec<RawRisk>,
    #[serde(default, alias = "taskComplete")]
    task_complete: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "needsRevision")]
    needs_revision: bool,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(rename = "type", alias = "action")]
    action_type: String,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(flatten)]
    params: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawPlannedAction {
    #[serde(rename = "type", alias = "action", alias = "actionType")]
    action_type: String,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawRisk {
    description: String,
    #[serde(default)]
    likelihood: Option<String>,
    #[serde(default)]
    impact: Option<String>,
    #[serde(default)]
    mitigation: Option<String>,
}

/// Parse and validate a planner response.
pub fn parse_planner_response(raw_text: &str) -> EngineResult<PlannerOutput> {
    let json = extract_json_object(raw_text)
        .ok_or_else(|| EngineError::Parse("planner response contains no JSON object".into()))?;
    let raw: RawPlannerResponse = serde_json::from_str(&json)
        .map_err(|err| EngineError::Parse(format!("planner JSON invalid: {err}")))?;

    let reasoning = raw.reasoning.clone().unwrap_or_default();

    let next_action = match raw.next_action {
        Some(action) => Some(convert_action(action, &reasoning)?),
        None => None,
    };
    if !raw.task_complete && next_action.is_none() {
        return Err(EngineError::Parse(
            "planner response missing nextAction while task is incomplete".into(),
        ));
    }

    let confidence = raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
    let plan = raw.strategy.map(|strategy| StrategicPlan {
        strategy,
        estimated_steps: raw.estimated_steps.unwrap_or(0),
        confidence,
        planned_actions: raw
            .planned_actions
            .into_iter()
            .map(|planned| PlannedAction {
                action_type: planned.action_type,
                reasoning: planned.reasoning.unwrap_or_default(),
                priority: planned.priority.unwrap_or(0),
            })
            .collect(),
        success_criteria: raw.success_criteria,
        risks: raw
            .risks
            .into_iter()
            .map(|risk| PlanRisk {
                description: risk.description,
                likelihood: risk.likelihood.unwrap_or_default(),
                impact: risk.impact.unwrap_or_default(),
                mitigation: risk.mitigation.unwrap_or_default(),
            })
            .collect(),
        revisions: Vec::new(),
    });

    Ok(PlannerOutput {
        plan,
        next_action,
        reasoning,
        confidence,
        needs_revision: raw.needs_revision,
        task_complete: raw.task_complete,
        result: raw.result,
    })
}

fn convert_action(raw: RawAction, fallback_reasoning: &str) -> EngineResult<Action> {
    let action_type = ActionType::parse(&raw.action_type).ok_or_else(|| {
        EngineError::Parse(format!("unknown action type: {}", raw.action_type))
    })?;
    let reasoning = raw
        .reasoning
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| fallback_reasoning.to_string());
    Ok(Action::new(action_type, raw.params, reasoning))
}

/// Parse an extraction response: every requested field must appear in the
/// returned map, with `null` recorded for fields the model omitted.
pub fn parse_extraction_response(
    raw_text: &str,
    fields: &[String],
) -> EngineResult<(Map<String, Value>, f64)> {
    let json = extract_json_object(raw_text)
        .ok_or_else(|| EngineError::Parse("extraction response contains no JSON object".into()))?;
    let parsed: Value = serde_json::from_str(&json)
        .map_err(|err| EngineError::Parse(format!("extraction JSON invalid: {err}")))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| EngineError::Parse("extraction response is not an object".into()))?;

    let mut extracted = Map::new();
    let mut found = 0usize;
    for field in fields {
        match object.get(field) {
            Some(value) if !value.is_null() => {
                extracted.insert(field.clone(), value.clone());
                found += 1;
            }
            _ => {
                extracted.insert(field.clone(), Value::Null);
            }
        }
    }

    let computed = if fields.is_empty() {
        1.0
    } else {
        found as f64 / fields.len() as f64
    };
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|value| value.clamp(0.0, 1.0))
        .unwrap_or(computed);
    Ok((extracted, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_plain_and_fenced_objects() {
        assert_eq!(
            extract_json_object("{\"a\":1}").as_deref(),
            Some("{\"a\":1}")
        );
        let fenced = "Here you go:\n```json\n{\"a\": {\"b\": 2}}\n```\ndone";
        assert_eq!(
            extract_json_object(fenced).as_deref(),
            Some("{\"a\": {\"b\": 2}}")
        );
        let inline = "prefix {\"a\": \"brace } in string\"} suffix";
        assert_eq!(
            extract_json_object(inline).as_deref(),
            Some("{\"a\": \"brace } in string\"}")
        );
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn parses_full_planner_response() {
        let raw = json!({
            "strategy": "navigate then read",
            "estimatedSteps": 2,
            "confidence": 0.9,
            "nextAction": {"type": "navigate", "url": "https://example.com"},
            "plannedActions": [
                {"type": "navigate", "reasoning": "open site", "priority": 1}
            ],
            "successCriteria": ["page is open"],
            "risks": [{"description": "site down", "likelihood": "low"}],
            "taskComplete": false,
            "reasoning": "start by visiting the site"
        })
        .to_string();

        let output = parse_planner_response(&raw).unwrap();
        assert!(!output.task_complete);
        let action = output.next_action.unwrap();
        assert_eq!(action.action_type, ActionType::Navigate);
        assert_eq!(action.param_str("url"), Some("https://example.com"));
        let plan = output.plan.unwrap();
        assert_eq!(plan.estimated_steps, 2);
        assert_eq!(plan.planned_actions.len(), 1);
    }

    #[test]
    fn completion_without_action_is_valid() {
        let raw = r#"{"taskComplete": true, "result": "Arrived"}"#;
        let output = parse_planner_response(raw).unwrap();
        assert!(output.task_complete);
        assert_eq!(output.result.as_deref(), Some("Arrived"));
        assert!(output.next_action.is_none());
    }

    #[test]
    fn missing_next_action_is_a_parse_error() {
        let raw = r#"{"taskComplete": false, "reasoning": "hmm"}"#;
        let err = parse_planner_response(raw).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn unknown_action_type_is_a_parse_error() {
        let raw = r#"{"taskComplete": false, "nextAction": {"type": "teleport"}}"#;
        assert!(parse_planner_response(raw).is_err());
    }

    #[test]
    fn extraction_records_missing_fields_as_null() {
        let fields = vec!["title".to_string(), "price".to_string()];
        let raw = r#"{"title": "Widget"}"#;
        let (extracted, confidence) = parse_extraction_response(raw, &fields).unwrap();
        assert_eq!(extracted["title"], json!("Widget"));
        assert_eq!(extracted["price"], Value::Null);
        assert!((confidence - 0.5).abs() < f64::EPSILON);
    }
}
