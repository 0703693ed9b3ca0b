//! Plan executor: sequential DAG execution with trace capture

use crate::error::{Error, Result};
use crate::parser::PlanParser;
use crate::plan::{Plan, PlanStep};
use crate::progress::ProgressBus;
use crate::resolver::VariableResolver;
use planweave_ace::{AceGenerator, ReflectionChain, ReflectionStage};
use planweave_tools::{Tool, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Outcome envelope of a successful execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether every step completed
    pub success: bool,
    /// Steps that ran, in execution order
    pub executed_steps: Vec<u32>,
    /// Output of each executed step
    pub step_results: BTreeMap<u32, Value>,
    /// Output of the final step, for convenience
    pub final_step: Value,
    /// The topological order that was executed
    pub execution_order: Vec<u32>,
    /// Total wall-clock seconds
    pub execution_time: f64,
    /// The executed flow
    pub flow_id: String,
}

/// Pre-flight check of plan tools against registered handles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolValidation {
    /// Whether every required tool has a handle
    pub valid: bool,
    /// Required tools with no handle
    pub missing_tools: Vec<String>,
    /// Registered tool names
    pub available_tools: Vec<String>,
    /// Tools the plan requires
    pub required_tools: Vec<String>,
}

/// Executes plans step by step
///
/// Execution is sequential per session: one logical stream, steps in
/// topological order, `step_start`/`step_done` visible in order.
/// Cancellation is honoured between steps, never mid-tool-call.
pub struct PlanExecutor {
    progress: Arc<ProgressBus>,
}

impl PlanExecutor {
    /// Create an executor publishing on the given bus
    #[must_use]
    pub fn new(progress: Arc<ProgressBus>) -> Self {
        Self { progress }
    }

    /// Check that every tool the plan references has a registered handle
    #[must_use]
    pub fn validate_tools(plan: &Plan, registry: &ToolRegistry) -> ToolValidation {
        let required = plan.tools();
        let available = registry.names();
        let missing: Vec<String> = required
            .iter()
            .filter(|tool| !registry.has(tool))
            .cloned()
            .collect();
        ToolValidation {
            valid: missing.is_empty(),
            missing_tools: missing,
            available_tools: available,
            required_tools: required,
        }
    }

    /// Execute a plan
    ///
    /// The ACE generator records the trace; the reflection chain records
    /// tool-level model activity. Any failure is returned as a typed error
    /// after the trace has been updated; the caller finalises the trace and
    /// runs reflection.
    #[instrument(skip_all, fields(flow_id = %plan.flow_id))]
    pub async fn execute(
        &self,
        plan: &Plan,
        registry: &ToolRegistry,
        ace: &mut AceGenerator,
        mut chain: Option<&mut ReflectionChain>,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        info!("Executing plan");
        let started = Instant::now();

        ace.start_trace(&plan.original_query, plan.to_value());

        // Fail fast before step 1 when a handle is missing
        let validation = Self::validate_tools(plan, registry);
        if !validation.valid {
            let missing = validation.missing_tools[0].clone();
            let err = Error::ToolNotFound(missing);
            ace.record_failure(0, &err.to_string(), err.kind(), String::new(), Vec::new());
            return Err(err);
        }

        let parsed = match PlanParser::parse(plan) {
            Ok(parsed) => parsed,
            Err(err) => {
                ace.record_failure(0, &err.to_string(), err.kind(), String::new(), Vec::new());
                return Err(err);
            }
        };

        if let Some(session_id) = session_id {
            self.progress.publish_task_start(session_id, &plan.flow_id);
        }

        let mut step_results: BTreeMap<u32, Value> = BTreeMap::new();
        let mut executed_steps: Vec<u32> = Vec::new();

        for &step_id in &parsed.execution_order {
            if cancel.is_cancelled() {
                let err = Error::Cancelled;
                ace.record_failure(
                    step_id,
                    &err.to_string(),
                    err.kind(),
                    String::new(),
                    executed_steps.clone(),
                );
                return Err(err);
            }

            let step = &parsed.step_map[&step_id];
            if let Some(session_id) = session_id {
                self.progress
                    .publish_step_start(session_id, step_id, &step.tool, &step.description);
            }

            match self
                .execute_step(step, registry, &step_results, ace, chain.as_deref_mut())
                .await
            {
                Ok(result) => {
                    step_results.insert(step_id, result);
                    executed_steps.push(step_id);
                    if let Some(session_id) = session_id {
                        self.progress.publish_step_done(
                            session_id,
                            step_id,
                            &step.tool,
                            &step.description,
                        );
                    }
                }
                Err(err) => {
                    error!(step_id, error = %err, "Step failed");
                    if let Some(session_id) = session_id {
                        self.progress.publish_step_error(
                            session_id,
                            step_id,
                            &step.tool,
                            &err.to_string(),
                        );
                    }
                    ace.record_failure(
                        step_id,
                        &err.to_string(),
                        err.kind(),
                        format!("{err:?}"),
                        executed_steps.clone(),
                    );
                    return Err(Error::PlanExecution {
                        message: err.to_string(),
                        step_id: Some(step_id),
                        executed_steps,
                    });
                }
            }
        }

        let execution_time = started.elapsed().as_secs_f64();
        ace.record_success(executed_steps.clone(), step_results.clone(), execution_time);
        info!(
            steps = executed_steps.len(),
            execution_time, "Plan executed successfully"
        );

        let final_step = parsed
            .execution_order
            .last()
            .and_then(|id| step_results.get(id))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(ExecutionResult {
            success: true,
            executed_steps,
            step_results,
            final_step,
            execution_order: parsed.execution_order,
            execution_time,
            flow_id: plan.flow_id.clone(),
        })
    }

    async fn execute_step(
        &self,
        step: &PlanStep,
        registry: &ToolRegistry,
        step_results: &BTreeMap<u32, Value>,
        ace: &mut AceGenerator,
        mut chain: Option<&mut ReflectionChain>,
    ) -> Result<Value> {
        debug!(step_id = step.step_id, tool = %step.tool, "Executing step");

        let tool = registry
            .get(&step.tool)
            .ok_or_else(|| Error::ToolNotFound(step.tool.clone()))?;
        let metadata = tool.metadata();
        let metadata_snapshot = json!({
            "output_schema": metadata.output_schema,
            "input_parameters": metadata.input_parameters,
            "kind": metadata.kind,
        });

        // Model-backed tools may reference their own schema in prompts
        let schema_text = metadata
            .output_schema
            .as_ref()
            .filter(|_| metadata.kind.is_model_backed())
            .map(|schema| schema.to_string());
        let mut resolver =
            VariableResolver::new(step_results.clone()).with_current_tool_schema(schema_text);

        let resolved = resolver.resolve(&Value::Object(step.tool_input.clone()))?;
        if !resolver.replacements().is_empty() {
            debug!(
                count = resolver.replacements().len(),
                "Placeholders substituted"
            );
        }
        let args: Map<String, Value> = resolved
            .as_object()
            .cloned()
            .unwrap_or_default();

        if let Some(chain) = chain.as_deref_mut() {
            let prompt = args.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
            chain.add_entry(
                ReflectionStage::ToolExecution,
                json!({
                    "step_id": step.step_id,
                    "tool_name": step.tool,
                    "description": step.description,
                    "tool_input": Value::Object(args.clone()),
                    "prompt": planweave_ace::chain::preview(prompt, 500),
                    "prompt_length": prompt.chars().count(),
                }),
                Value::Null,
                Value::Null,
                "",
            );
        }

        let step_started = Instant::now();
        let outcome = self.invoke_tool(tool.as_ref(), &step.tool, args.clone()).await;
        let duration = step_started.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => {
                debug!(step_id = step.step_id, duration, "Step finished");
                if let Some(chain) = chain.as_deref_mut() {
                    let rendered = result.to_string();
                    chain.add_entry(
                        ReflectionStage::ToolExecutionResult,
                        Value::Null,
                        json!({
                            "step_id": step.step_id,
                            "tool_name": step.tool,
                            "result": planweave_ace::chain::preview(&rendered, 1000),
                            "result_length": rendered.chars().count(),
                            "execution_time": duration,
                            "success": true,
                        }),
                        Value::Null,
                        "",
                    );
                }
                ace.record_step_execution(
                    step.step_id,
                    &step.tool,
                    Value::Object(args),
                    Some(result.clone()),
                    duration,
                    None,
                    metadata_snapshot,
                );
                Ok(result)
            }
            Err(err) => {
                ace.record_step_execution(
                    step.step_id,
                    &step.tool,
                    Value::Object(args),
                    None,
                    duration,
                    Some(err.to_string()),
                    metadata_snapshot,
                );
                Err(err)
            }
        }
    }

    /// Invoke a tool and validate its result contract
    ///
    /// The result must be a mapping; when the tool declares an output schema
    /// the mapping must carry a string `content` field.
    async fn invoke_tool(
        &self,
        tool: &dyn Tool,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> Result<Value> {
        let result = tool
            .invoke(args)
            .await
            .map_err(|e| Error::ToolInvocation {
                tool: tool_name.to_string(),
                message: e.to_string(),
            })?;

        if !result.is_object() {
            return Err(Error::ToolResultInvalid {
                tool: tool_name.to_string(),
                message: format!("expected a mapping, got {}", json_type(&result)),
            });
        }
        if tool.metadata().output_schema.is_some()
            && !result
                .get("content")
                .map(Value::is_string)
                .unwrap_or(false)
        {
            return Err(Error::ToolResultInvalid {
                tool: tool_name.to_string(),
                message: "declared output schema requires a string 'content' field".into(),
            });
        }
        Ok(result)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
