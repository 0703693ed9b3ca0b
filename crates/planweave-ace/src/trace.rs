//! Execution traces: the structured record of one plan run

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-step execution detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDetail {
    /// Step id
    pub step_id: u32,
    /// Tool invoked
    pub tool_name: String,
    /// Resolved tool input
    pub tool_input: Value,
    /// Tool output, absent when the step failed
    pub tool_output: Option<Value>,
    /// Step duration in seconds
    pub duration: f64,
    /// Error text when the step failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Snapshot of the tool's metadata at invocation time
    #[serde(default)]
    pub tool_metadata_snapshot: Value,
    /// When the step finished
    pub timestamp: String,
}

/// Failure details of a trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Step that failed
    pub step_id: u32,
    /// Human-readable error
    pub error: String,
    /// Error kind, e.g. `ToolNotFound`, `VariableResolutionError`
    pub error_kind: String,
    /// Captured error chain
    #[serde(default)]
    pub traceback: String,
}

/// Outcome of the execution
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionRecord {
    /// Whether every step completed
    pub success: bool,
    /// Steps that ran, in execution order
    #[serde(default)]
    pub executed_steps: Vec<u32>,
    /// Output of each executed step
    #[serde(default)]
    pub step_results: BTreeMap<u32, Value>,
    /// Total wall-clock seconds
    #[serde(default)]
    pub execution_time: f64,
    /// Failure details when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

/// The complete record of one execution, input to the Reflector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Unique trace id
    pub trace_id: String,
    /// Flow this trace belongs to
    pub flow_id: String,
    /// The task description
    pub task_description: String,
    /// Snapshot of the plan at execution start
    pub plan_json: Value,
    /// Tools invoked, in first-use order
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Per-step details
    #[serde(default)]
    pub step_details: Vec<StepDetail>,
    /// Final outcome
    pub execution_result: ExecutionRecord,
    /// When the trace was opened
    pub timestamp: String,
}

impl ExecutionTrace {
    /// Open a trace at execution start
    #[must_use]
    pub fn start(task_description: impl Into<String>, plan_json: Value) -> Self {
        let flow_id = plan_json
            .get("flow_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        Self {
            trace_id: Uuid::new_v4().to_string(),
            flow_id,
            task_description: task_description.into(),
            plan_json,
            tools_used: Vec::new(),
            step_details: Vec::new(),
            execution_result: ExecutionRecord::default(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Record one step invocation
    #[allow(clippy::too_many_arguments)]
    pub fn add_step_detail(
        &mut self,
        step_id: u32,
        tool_name: &str,
        tool_input: Value,
        tool_output: Option<Value>,
        duration: f64,
        error: Option<String>,
        tool_metadata_snapshot: Value,
    ) {
        self.step_details.push(StepDetail {
            step_id,
            tool_name: tool_name.to_string(),
            tool_input,
            tool_output,
            duration,
            error,
            tool_metadata_snapshot,
            timestamp: Utc::now().to_rfc3339(),
        });
        if !self.tools_used.iter().any(|t| t == tool_name) {
            self.tools_used.push(tool_name.to_string());
        }
    }

    /// Finalise as success
    pub fn set_success(
        &mut self,
        executed_steps: Vec<u32>,
        step_results: BTreeMap<u32, Value>,
        execution_time: f64,
    ) {
        self.execution_result = ExecutionRecord {
            success: true,
            executed_steps,
            step_results,
            execution_time,
            failure_info: None,
        };
    }

    /// Finalise as failure
    pub fn set_failure(
        &mut self,
        step_id: u32,
        error: &str,
        error_kind: &str,
        traceback: String,
        executed_steps: Vec<u32>,
    ) {
        self.execution_result.success = false;
        self.execution_result.executed_steps = executed_steps;
        self.execution_result.failure_info = Some(FailureInfo {
            step_id,
            error: error.to_string(),
            error_kind: error_kind.to_string(),
            traceback,
        });
    }

    /// Whether the execution succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.execution_result.success
    }

    /// Failure details, when any
    #[must_use]
    pub fn failure_info(&self) -> Option<&FailureInfo> {
        self.execution_result.failure_info.as_ref()
    }

    /// Detail of the step that failed
    #[must_use]
    pub fn failed_step_detail(&self) -> Option<&StepDetail> {
        let failed = self.failure_info()?.step_id;
        self.step_details.iter().find(|d| d.step_id == failed)
    }
}
