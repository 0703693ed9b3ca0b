//! Reflector: post-mortem classification and insight extraction

use crate::chain::{preview, ReflectionChain, ReflectionStage};
use crate::error::{Error, Result};
use crate::trace::ExecutionTrace;
use planweave_llm::{ChatOptions, SharedModelClient};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

/// Error kinds that mark a workflow-design failure
///
/// These are structural: the plan itself referenced a missing tool, a bad
/// variable, a broken dependency, or failed to parse.
pub const WORKFLOW_ERROR_KINDS: [&str; 4] = [
    "ToolNotFound",
    "VariableResolutionError",
    "DependencyError",
    "PlanParsingError",
];

/// Error kinds that originate inside a tool call
const TOOL_ERROR_KINDS: [&str; 2] = ["ToolError", "ToolResultInvalid"];

/// How a finished trace is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    /// Plan-design problem
    Workflow,
    /// Problem inside a tool call
    Tool,
    /// Both signals present
    Mixed,
    /// Ran to completion with no complaint
    Success,
    /// Completed but the user reported bad output
    QualityIssue,
}

impl OutcomeClass {
    /// The `failure_type` value stored in insight documents
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Tool => "tool",
            Self::Mixed => "mixed",
            Self::Success => "success",
            Self::QualityIssue => "quality_issue",
        }
    }
}

/// Analyses finished traces into structured insights
pub struct Reflector {
    model: SharedModelClient,
}

impl Reflector {
    /// Create a reflector
    #[must_use]
    pub fn new(model: SharedModelClient) -> Self {
        Self { model }
    }

    /// Analyse a trace: classify, then extract insights for the class
    ///
    /// The returned document always carries a `failure_type` field naming
    /// the class.
    #[instrument(skip(self, trace), fields(trace_id = %trace.trace_id))]
    pub async fn analyze_trace(&self, trace: &ExecutionTrace) -> Result<Value> {
        if trace.is_success() {
            return self.identify_success_patterns(trace).await;
        }
        let class = self.classify_failure(trace).await?;
        info!(class = class.as_str(), "Failure classified");
        match class {
            OutcomeClass::Workflow => self.analyze_workflow_failure(trace).await,
            OutcomeClass::Tool => self.analyze_tool_failure(trace).await,
            _ => self.analyze_mixed_failure(trace).await,
        }
    }

    /// Classify a failed trace: rules first, model for ambiguity
    pub async fn classify_failure(&self, trace: &ExecutionTrace) -> Result<OutcomeClass> {
        let Some(failure) = trace.failure_info() else {
            return Ok(OutcomeClass::Mixed);
        };

        if WORKFLOW_ERROR_KINDS
            .iter()
            .any(|kind| failure.error_kind.contains(kind))
        {
            return Ok(OutcomeClass::Workflow);
        }
        if TOOL_ERROR_KINDS
            .iter()
            .any(|kind| failure.error_kind.contains(kind))
        {
            return Ok(OutcomeClass::Tool);
        }

        // Ambiguous: ask the model
        let prompt = format!(
            "A workflow execution failed. Decide whether the cause is the workflow \
             design or the tool call.\n\n\
             Task: {}\n\
             Failed step: {}\n\
             Error kind: {}\n\
             Error: {}\n\n\
             Workflow structure:\n{}\n\n\
             Return JSON only:\n\
             {{\"failure_type\": \"workflow|tool|mixed\", \"confidence\": 0.9, \"reasoning\": \"...\"}}\n\n\
             workflow = step dependencies, ordering, tool selection, variable references;\n\
             tool = parameters, tool-internal logic, tool prompts;\n\
             mixed = both.",
            trace.task_description,
            failure.step_id,
            failure.error_kind,
            failure.error,
            preview(&trace.plan_json.to_string(), 1000),
        );
        let (value, _) = self
            .model
            .complete_json(&prompt, &ChatOptions::default())
            .await?;
        let label = value
            .get("failure_type")
            .and_then(|v| v.as_str())
            .unwrap_or("mixed")
            .to_lowercase();
        Ok(if label.contains("workflow") {
            OutcomeClass::Workflow
        } else if label.contains("tool") {
            OutcomeClass::Tool
        } else {
            OutcomeClass::Mixed
        })
    }

    /// Extract insights from a workflow-design failure
    pub async fn analyze_workflow_failure(&self, trace: &ExecutionTrace) -> Result<Value> {
        let failure = trace.failure_info();
        let prompt = format!(
            "You are a workflow design expert. Analyse this failed workflow.\n\n\
             Task: {}\n\n\
             Workflow:\n{}\n\n\
             Executed steps: {:?}\n\
             Failed step: {:?}\n\
             Error: {}\n\n\
             Consider step dependencies, ordering, missing intermediate steps, tool \
             selection, and variable references.\n\n\
             Return JSON only:\n\
             {{\n\
               \"failure_type\": \"workflow\",\n\
               \"root_cause\": \"...\",\n\
               \"workflow_issues\": [{{\"issue\": \"...\", \"location\": \"...\", \"suggestion\": \"...\"}}],\n\
               \"improved_workflow_strategy\": \"...\"\n\
             }}",
            trace.task_description,
            preview(&trace.plan_json.to_string(), 2000),
            trace.execution_result.executed_steps,
            failure.map(|f| f.step_id),
            failure.map(|f| f.error.as_str()).unwrap_or(""),
        );
        let mut insights = self.ask(&prompt).await.map_err(|e| {
            Error::Reflection(format!("workflow failure analysis failed: {e}"))
        })?;
        insights["failure_type"] = json!("workflow");
        Ok(insights)
    }

    /// Extract insights from a tool failure
    pub async fn analyze_tool_failure(&self, trace: &ExecutionTrace) -> Result<Value> {
        let failure = trace.failure_info();
        let detail = trace.failed_step_detail();
        let tool_name = detail.map(|d| d.tool_name.as_str()).unwrap_or("unknown");
        let schema_constraint = detail
            .map(|d| Self::schema_constraint(&d.tool_metadata_snapshot))
            .unwrap_or_default();

        let prompt = format!(
            "You are a tool invocation expert. Analyse this failed tool call.\n\n\
             Task: {}\n\
             Failed step: {:?}\n\
             Tool: {tool_name}\n\
             Tool input:\n{}\n\
             Error: {}\n\
             Error chain:\n{}\n\n\
             Consider parameter values, parameter types, missing required parameters, \
             and whether the tool's internal prompt needs rewriting.{schema_constraint}\n\n\
             Return JSON only:\n\
             {{\n\
               \"failure_type\": \"tool\",\n\
               \"tool_name\": \"{tool_name}\",\n\
               \"root_cause\": \"...\",\n\
               \"parameter_issues\": [{{\"parameter\": \"...\", \"issue\": \"...\", \"suggested_value\": \"...\"}}],\n\
               \"tool_prompt_optimization\": {{\"needs_optimization\": false, \"suggested_prompt\": \"...\"}},\n\
               \"tool_usage_best_practice\": \"...\"\n\
             }}",
            trace.task_description,
            failure.map(|f| f.step_id),
            detail
                .map(|d| preview(&d.tool_input.to_string(), 1000))
                .unwrap_or_default(),
            failure.map(|f| f.error.as_str()).unwrap_or(""),
            failure
                .map(|f| preview(&f.traceback, 1000))
                .unwrap_or_default(),
        );
        let mut insights = self
            .ask(&prompt)
            .await
            .map_err(|e| Error::Reflection(format!("tool failure analysis failed: {e}")))?;
        insights["failure_type"] = json!("tool");
        Ok(insights)
    }

    /// Extract insights when both workflow and tool signals are present
    pub async fn analyze_mixed_failure(&self, trace: &ExecutionTrace) -> Result<Value> {
        let failure = trace.failure_info();
        let prompt = format!(
            "You are a workflow diagnostician. This execution failed; analyse both the \
             workflow design and the tool calls.\n\n\
             Task: {}\n\n\
             Workflow:\n{}\n\n\
             Failed step: {:?}\n\
             Error: {}\n\
             Executed steps: {:?}\n\n\
             Return JSON only:\n\
             {{\n\
               \"failure_type\": \"mixed\",\n\
               \"workflow_analysis\": {{\"has_workflow_issues\": true, \"issues\": [], \"suggestions\": []}},\n\
               \"tool_analysis\": {{\"has_tool_issues\": true, \"issues\": [], \"suggestions\": []}},\n\
               \"primary_cause\": \"workflow|tool\"\n\
             }}",
            trace.task_description,
            preview(&trace.plan_json.to_string(), 2000),
            failure.map(|f| f.step_id),
            failure.map(|f| f.error.as_str()).unwrap_or(""),
            trace.execution_result.executed_steps,
        );
        let mut insights = self
            .ask(&prompt)
            .await
            .map_err(|e| Error::Reflection(format!("mixed failure analysis failed: {e}")))?;
        insights["failure_type"] = json!("mixed");
        Ok(insights)
    }

    /// Extract success patterns
    ///
    /// Tolerates a model failure with a default insight: losing a success
    /// record must not fail the pipeline.
    pub async fn identify_success_patterns(&self, trace: &ExecutionTrace) -> Result<Value> {
        let prompt = format!(
            "This workflow executed successfully. Extract the reusable experience.\n\n\
             Task: {}\n\n\
             Workflow:\n{}\n\n\
             Executed steps: {:?}\n\
             Total time: {:.2}s\n\
             Tools used: {:?}\n\n\
             Return JSON only:\n\
             {{\n\
               \"success_strategies\": [\"...\"],\n\
               \"tool_best_practices\": {{\"tool_name\": \"practice\"}},\n\
               \"workflow_patterns\": [\"...\"]\n\
             }}",
            trace.task_description,
            preview(&trace.plan_json.to_string(), 2000),
            trace.execution_result.executed_steps,
            trace.execution_result.execution_time,
            trace.tools_used,
        );
        match self.ask(&prompt).await {
            Ok(mut insights) => {
                insights["failure_type"] = json!("success");
                Ok(insights)
            }
            Err(e) => {
                warn!(error = %e, "Success analysis failed, using default insight");
                Ok(json!({
                    "failure_type": "success",
                    "success_strategies": ["workflow executed successfully"],
                    "tool_best_practices": {},
                }))
            }
        }
    }

    /// Analyse a quality complaint about a successful run
    ///
    /// The prompt embeds the offending tool's output schema and forbids the
    /// rewritten prompt from defining a new JSON format: the schema already
    /// owns the output shape.
    #[instrument(skip(self, trace, feedback, chain))]
    pub async fn analyze_quality_issue(
        &self,
        trace: &ExecutionTrace,
        feedback: &str,
        chain: Option<&mut ReflectionChain>,
    ) -> Result<Value> {
        // The complaint usually names the misbehaving tool; fall back to the
        // last model-backed step
        let problem_detail = trace
            .step_details
            .iter()
            .rev()
            .find(|d| feedback.contains(&d.tool_name))
            .or_else(|| {
                trace
                    .step_details
                    .iter()
                    .rev()
                    .find(|d| !d.tool_metadata_snapshot.is_null())
            });
        let schema_constraint = problem_detail
            .map(|d| Self::schema_constraint(&d.tool_metadata_snapshot))
            .unwrap_or_default();

        let steps_rendered = preview(
            &serde_json::to_string(&trace.step_details).unwrap_or_default(),
            2000,
        );
        let prompt = format!(
            "Execution succeeded but the user reports poor output quality.\n\n\
             Task: {}\n\n\
             Executed steps:\n{steps_rendered}\n\n\
             User feedback:\n{feedback}\n\n\
             Analyse the gap between actual and expected output, locate the root \
             cause, and propose how to rewrite the responsible tool's prompt.\
             {schema_constraint}\n\n\
             The rewritten prompt must describe WHAT to extract or produce and how to \
             organise it. It must NOT define a JSON format or name output fields; the \
             tool's output schema already fixes the response shape.\n\n\
             Return JSON only:\n\
             {{\n\
               \"problem_step\": 1,\n\
               \"root_cause\": \"...\",\n\
               \"improvement_suggestions\": [\"...\"],\n\
               \"prompt_optimization\": {{\"tool\": \"...\", \"suggested_prompt\": \"...\"}}\n\
             }}",
            trace.task_description,
        );

        if let Some(chain) = chain {
            chain.add_entry(
                ReflectionStage::QualityAnalysis,
                json!({
                    "task_description": trace.task_description,
                    "user_feedback": feedback,
                    "analysis_prompt": preview(&prompt, 500),
                    "prompt_length": prompt.chars().count(),
                }),
                Value::Null,
                json!({"model": self.model.model_info().model}),
                "",
            );
            let mut insights = self
                .ask(&prompt)
                .await
                .map_err(|e| Error::Reflection(format!("quality analysis failed: {e}")))?;
            insights["failure_type"] = json!("quality_issue");
            chain.add_entry(
                ReflectionStage::QualityAnalysisResult,
                Value::Null,
                json!({
                    "problem_step": insights.get("problem_step"),
                    "root_cause": insights.get("root_cause"),
                    "improvement_suggestions": insights.get("improvement_suggestions"),
                    "prompt_optimization": insights.get("prompt_optimization"),
                }),
                Value::Null,
                format!(
                    "quality issue identified: {}",
                    insights
                        .get("root_cause")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                ),
            );
            Ok(insights)
        } else {
            let mut insights = self
                .ask(&prompt)
                .await
                .map_err(|e| Error::Reflection(format!("quality analysis failed: {e}")))?;
            insights["failure_type"] = json!("quality_issue");
            Ok(insights)
        }
    }

    fn schema_constraint(metadata_snapshot: &Value) -> String {
        let Some(schema) = metadata_snapshot.get("output_schema").filter(|s| !s.is_null()) else {
            return String::new();
        };
        format!(
            "\n\nConstraint: the tool declares this output schema and the rewritten \
             prompt must stay compliant with it:\n{schema}\n\
             Do not define a new JSON format in the prompt. Describe the content to \
             produce and require it to be merged into a single text string.",
        )
    }

    async fn ask(&self, prompt: &str) -> Result<Value> {
        let (value, _completion) = self
            .model
            .complete_json(prompt, &ChatOptions::default())
            .await?;
        Ok(value)
    }
}
