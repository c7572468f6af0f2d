//! Workflow Planning
//!
//! A [`PlanSource`] turns a free-text request into a [`Workflow`]. Language
//! model planners usually wrap the JSON plan in prose or a fenced code
//! block, so [`parse_plan`] digs the document out before deserializing.
//!
//! Planned workflows are untrusted: they go through the same validation as
//! hand-written ones.

use async_trait::async_trait;
use log::{debug, error};
use serde_json::Value;
use thiserror::Error;

use super::model::Workflow;
use super::registry::ToolSpec;

/// Errors from producing or parsing a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner response contains no JSON object")]
    NotFound,

    #[error("invalid workflow format: {0}")]
    InvalidFormat(#[from] serde_json::Error),

    #[error("planner failed: {0}")]
    Source(String),
}

/// Something that can plan a workflow for a request.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plan(&self, request: &str, context: Option<&Value>) -> Result<Workflow, PlanError>;
}

/// Extracts and parses a workflow from planner output.
///
/// Looks, in order, for a ```` ```json ```` fence, any ```` ``` ```` fence,
/// then the span from the first `{` to the last `}`.
pub fn parse_plan(text: &str) -> Result<Workflow, PlanError> {
    let document = extract_document(text).ok_or(PlanError::NotFound)?;
    debug!("Extracted plan document ({} bytes)", document.len());

    serde_json::from_str(document).map_err(|e| {
        error!("Failed to parse workflow plan: {}", e);
        PlanError::InvalidFormat(e)
    })
}

fn extract_document(text: &str) -> Option<&str> {
    if let Some(body) = fenced(text, "```json") {
        return Some(body);
    }
    if let Some(body) = fenced(text, "```") {
        return Some(body);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn fenced<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Builds a planning prompt listing the available tool actions.
pub fn planning_prompt(request: &str, tools: &[ToolSpec], context: Option<&Value>) -> String {
    let catalog: Vec<Value> = tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "tool": t.tool,
                "action": t.action,
                "description": t.description,
                "required": t.params.required,
                "optional": t.params.optional,
            })
        })
        .collect();
    let catalog = serde_json::to_string_pretty(&catalog).unwrap_or_default();

    let context = context
        .and_then(|c| serde_json::to_string_pretty(c).ok())
        .map(|c| format!("\nAdditional Context:\n{}\n", c))
        .unwrap_or_default();

    format!(
        r#"You are a workflow planning system. Plan a multi-step workflow to accomplish the user's request.

User Request: {request}
{context}
Available Tools:
{catalog}

Return ONLY valid JSON in this format:
{{
    "steps": [
        {{
            "id": "step_1",
            "tool": "tool_name",
            "action": "action_name",
            "params": {{}},
            "depends_on": []
        }}
    ]
}}

Rules:
- Use tool and action names exactly as shown
- Include all required parameters for each action
- A parameter value "$step_id" or "$step_id.field" passes an earlier step's output
- Only reference steps listed (directly or transitively) in depends_on
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::{InMemoryRegistry, ParamSchema, ToolRegistry};
    use serde_json::json;

    #[test]
    fn test_parse_json_fence() {
        let text = "Here is the plan:\n```json\n{\"steps\": [{\"id\": \"s1\", \"tool\": \"t\", \"action\": \"a\"}]}\n```\nDone.";
        let workflow = parse_plan(text).unwrap();
        assert_eq!(workflow.steps[0].id, "s1");
    }

    #[test]
    fn test_parse_plain_fence() {
        let text = "```\n{\"steps\": []}\n```";
        assert!(parse_plan(text).unwrap().is_empty());
    }

    #[test]
    fn test_parse_bare_object_with_prose() {
        let text = r#"Sure! {"steps": [{"id": "a", "tool": "t", "action": "x", "params": {"q": {"n": 1}}}]} hope that helps"#;
        let workflow = parse_plan(text).unwrap();
        assert_eq!(workflow.steps[0].params["q"], json!({"n": 1}));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let text = r#"{"steps": [{"id": "a", "tool": "t", "action": "x", "retry_on_error": true}], "expected_output": "x"}"#;
        assert_eq!(parse_plan(text).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_no_json() {
        assert!(matches!(parse_plan("I cannot help with that"), Err(PlanError::NotFound)));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_plan("```json\n{\"steps\": [\n```"),
            Err(PlanError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_planning_prompt_lists_tools() {
        let mut registry = InMemoryRegistry::new();
        registry.register("weather", "forecast", ParamSchema::required(&["city"]));
        let spec = registry.resolve("weather", "forecast").unwrap();

        let context = json!({"user": "ops"});
        let prompt = planning_prompt("Check the weather", &[spec], Some(&context));

        assert!(prompt.contains("Check the weather"));
        assert!(prompt.contains("\"forecast\""));
        assert!(prompt.contains("\"city\""));
        assert!(prompt.contains("Additional Context"));
    }
}
