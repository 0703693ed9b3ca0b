//! Plan model and structural validation

use crate::error::{Error, Result};
use crate::resolver::VariableResolver;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Declared complexity of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Few steps, no branching data flow
    Simple,
    /// Several steps with inter-step references
    Medium,
    /// Long multi-tool flows
    Complex,
}

/// One tool invocation in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based, strictly increasing, dense
    pub step_id: u32,
    /// What the step does
    pub description: String,
    /// Tool to invoke; must be registered at execution time
    pub tool: String,
    /// Arguments, possibly containing `{{steps.N.field}}` references
    #[serde(default)]
    pub tool_input: Map<String, Value>,
    /// Step ids this step depends on (subset of prior ids)
    #[serde(default)]
    pub dependencies: Vec<u32>,
    /// Why the model chose this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// A validated DAG of tool invocations derived from a user request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// `flow_<unix_ts>_<8hex>`
    #[serde(default)]
    pub flow_id: String,
    /// The request this plan answers
    #[serde(default)]
    pub original_query: String,
    /// MD5 of the raw request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_hash: Option<String>,
    /// Creation timestamp (RFC3339)
    #[serde(default)]
    pub created_at: String,
    /// Seconds the model took to produce the plan
    #[serde(default)]
    pub generation_time: f64,
    /// Step count estimated by the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_steps: Option<u32>,
    /// One-paragraph strategy summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_strategy: Option<String>,
    /// Declared complexity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_level: Option<Complexity>,
    /// The steps, in id order
    pub steps: Vec<PlanStep>,
    /// Flow id this plan was cloned from, when reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<String>,
    /// Reflection chain owned by this plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_chain_id: Option<String>,
}

impl Plan {
    /// Parse a raw model response into a plan
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::PlanValidation(e.to_string()))
    }

    /// Serialize to a JSON value
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Tools referenced by the plan, deduplicated in step order
    #[must_use]
    pub fn tools(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .filter(|s| seen.insert(s.tool.clone()))
            .map(|s| s.tool.clone())
            .collect()
    }

    /// Look up a step by id
    #[must_use]
    pub fn step(&self, step_id: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Validate the top-level and per-step shape
    ///
    /// Step ids must be the dense sequence `1..N`; descriptions and tool
    /// names must be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::PlanValidation("'steps' must not be empty".into()));
        }

        let mut ids: Vec<u32> = self.steps.iter().map(|s| s.step_id).collect();
        ids.sort_unstable();
        for (index, id) in ids.iter().enumerate() {
            let expected = (index + 1) as u32;
            if *id != expected {
                return Err(Error::PlanValidation(format!(
                    "step ids must be the dense sequence 1..{}, found {id} at position {expected}",
                    self.steps.len()
                )));
            }
        }

        for step in &self.steps {
            if step.description.trim().is_empty() {
                return Err(Error::PlanValidation(format!(
                    "step {} has an empty description",
                    step.step_id
                )));
            }
            if step.tool.trim().is_empty() {
                return Err(Error::PlanValidation(format!(
                    "step {} has an empty tool name",
                    step.step_id
                )));
            }
        }
        Ok(())
    }

    /// Validate dependency targets and variable-reference ordering
    ///
    /// Dependencies must name existing prior steps and never the step
    /// itself. Every `{{steps.k.field}}` reference in `tool_input` must
    /// target a step with `k < step_id`; self- and forward-references are
    /// structural errors caught here, not at resolution time.
    pub fn validate_dependencies(&self) -> Result<()> {
        let ids: HashSet<u32> = self.steps.iter().map(|s| s.step_id).collect();

        for step in &self.steps {
            for dep in &step.dependencies {
                if *dep == step.step_id {
                    return Err(Error::PlanValidation(format!(
                        "step {} depends on itself",
                        step.step_id
                    )));
                }
                if !ids.contains(dep) {
                    return Err(Error::PlanValidation(format!(
                        "step {} depends on missing step {dep}",
                        step.step_id
                    )));
                }
            }

            for referenced in
                VariableResolver::referenced_steps(&Value::Object(step.tool_input.clone()))
            {
                if referenced >= step.step_id {
                    return Err(Error::PlanValidation(format!(
                        "step {} references step {referenced}, which does not precede it",
                        step.step_id
                    )));
                }
                if !ids.contains(&referenced) {
                    return Err(Error::PlanValidation(format!(
                        "step {} references missing step {referenced}",
                        step.step_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Build a flow id from the current time and the normalised request
#[must_use]
pub fn new_flow_id(query: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let digest = format!("{:x}", md5::compute(query.as_bytes()));
    format!("flow_{timestamp}_{}", &digest[..8])
}

/// MD5 hex digest of a query
#[must_use]
pub fn query_hash(query: &str) -> String {
    format!("{:x}", md5::compute(query.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(step_id: u32, tool: &str, deps: Vec<u32>, input: Value) -> PlanStep {
        PlanStep {
            step_id,
            description: format!("step {step_id}"),
            tool: tool.to_string(),
            tool_input: input.as_object().cloned().unwrap_or_default(),
            dependencies: deps,
            reasoning: None,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan {
            flow_id: "flow_1_abcd1234".into(),
            original_query: "q".into(),
            query_hash: None,
            created_at: "2026-08-01T00:00:00Z".into(),
            generation_time: 0.0,
            estimated_steps: None,
            overall_strategy: None,
            complexity_level: Some(Complexity::Simple),
            steps,
            reused_from: None,
            reflection_chain_id: None,
        }
    }

    #[test]
    fn test_valid_plan_passes() {
        let plan = plan(vec![
            step(1, "ocr", vec![], json!({})),
            step(2, "llm", vec![1], json!({"content": "{{steps.1.content}}"})),
        ]);
        plan.validate().unwrap();
        plan.validate_dependencies().unwrap();
    }

    #[test]
    fn test_empty_steps_rejected() {
        let plan = plan(vec![]);
        assert!(matches!(plan.validate(), Err(Error::PlanValidation(_))));
    }

    #[test]
    fn test_non_dense_ids_rejected() {
        let plan = plan(vec![step(1, "a", vec![], json!({})), step(3, "b", vec![], json!({}))]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let plan = plan(vec![step(1, "a", vec![], json!({})), step(1, "b", vec![], json!({}))]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let plan = plan(vec![step(1, "a", vec![1], json!({}))]);
        assert!(plan.validate_dependencies().is_err());
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let plan = plan(vec![step(1, "a", vec![], json!({})), step(2, "b", vec![9], json!({}))]);
        assert!(plan.validate_dependencies().is_err());
    }

    #[test]
    fn test_forward_reference_rejected() {
        let plan = plan(vec![
            step(1, "a", vec![], json!({"x": "{{steps.2.content}}"})),
            step(2, "b", vec![], json!({})),
        ]);
        assert!(plan.validate_dependencies().is_err());
    }

    #[test]
    fn test_self_reference_rejected() {
        let plan = plan(vec![step(1, "a", vec![], json!({"x": "{{steps.1.out}}"}))]);
        assert!(plan.validate_dependencies().is_err());
    }

    #[test]
    fn test_step_zero_reference_rejected() {
        let plan = plan(vec![step(1, "a", vec![], json!({"x": "{{steps.0.out}}"}))]);
        // 0 never precedes step 1 in a dense 1..N plan
        assert!(plan.validate_dependencies().is_err());
    }

    #[test]
    fn test_from_value_accepts_model_shape() {
        let raw = json!({
            "overall_strategy": "capture then summarise",
            "complexity_level": "medium",
            "steps": [
                {"step_id": 1, "description": "capture", "tool": "screenshot", "tool_input": {}},
                {"step_id": 2, "description": "summarise", "tool": "llm",
                 "tool_input": {"content": "{{steps.1.content}}"}, "dependencies": [1]}
            ]
        });
        let plan = Plan::from_value(raw).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.complexity_level, Some(Complexity::Medium));
        assert!(plan.flow_id.is_empty());
    }

    #[test]
    fn test_round_trip_preserves_step_order() {
        let plan = plan(vec![
            step(1, "a", vec![], json!({})),
            step(2, "b", vec![1], json!({})),
            step(3, "c", vec![2], json!({})),
        ]);
        let value = plan.to_value();
        let back = Plan::from_value(value).unwrap();
        let ids: Vec<u32> = back.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_tools_deduplicated_in_order() {
        let plan = plan(vec![
            step(1, "ocr", vec![], json!({})),
            step(2, "llm", vec![1], json!({})),
            step(3, "ocr", vec![], json!({})),
        ]);
        assert_eq!(plan.tools(), vec!["ocr".to_string(), "llm".to_string()]);
    }

    #[test]
    fn test_flow_id_shape() {
        let flow_id = new_flow_id("summarise chat");
        let parts: Vec<&str> = flow_id.split('_').collect();
        assert_eq!(parts[0], "flow");
        assert_eq!(parts[2].len(), 8);
    }
}
