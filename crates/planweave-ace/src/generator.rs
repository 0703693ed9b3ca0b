//! ACE generator: trace capture shadowing the executor
//!
//! The generator owns the trace of the execution in flight. `ExecutionTrace`
//! feeds the Reflector's automatic analysis; the `ReflectionChain` serves
//! debugging. They overlap in subject but not in purpose, so both stay
//! complete.

use crate::error::Result;
use crate::trace::ExecutionTrace;
use planweave_store::StorageManager;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Records the execution trace of one plan run
///
/// `current` is owned by a single execution at a time; the executor drives
/// it and finalises it into persistent storage.
pub struct AceGenerator {
    storage: StorageManager,
    current: Option<ExecutionTrace>,
}

impl AceGenerator {
    /// Create a generator persisting into the given store
    #[must_use]
    pub fn new(storage: StorageManager) -> Self {
        Self {
            storage,
            current: None,
        }
    }

    /// Begin a trace for a plan run
    pub fn start_trace(&mut self, task_description: &str, plan_json: Value) {
        debug!("Opening execution trace");
        self.current = Some(ExecutionTrace::start(task_description, plan_json));
    }

    /// Record one step invocation
    #[allow(clippy::too_many_arguments)]
    pub fn record_step_execution(
        &mut self,
        step_id: u32,
        tool_name: &str,
        tool_input: Value,
        tool_output: Option<Value>,
        duration: f64,
        error: Option<String>,
        tool_metadata_snapshot: Value,
    ) {
        let Some(trace) = self.current.as_mut() else {
            warn!("No trace in progress, step not recorded");
            return;
        };
        trace.add_step_detail(
            step_id,
            tool_name,
            tool_input,
            tool_output,
            duration,
            error,
            tool_metadata_snapshot,
        );
    }

    /// Record a successful run
    pub fn record_success(
        &mut self,
        executed_steps: Vec<u32>,
        step_results: BTreeMap<u32, Value>,
        execution_time: f64,
    ) {
        let Some(trace) = self.current.as_mut() else {
            warn!("No trace in progress, success not recorded");
            return;
        };
        trace.set_success(executed_steps, step_results, execution_time);
    }

    /// Record a failed run
    pub fn record_failure(
        &mut self,
        step_id: u32,
        error: &str,
        error_kind: &str,
        traceback: String,
        executed_steps: Vec<u32>,
    ) {
        let Some(trace) = self.current.as_mut() else {
            warn!("No trace in progress, failure not recorded");
            return;
        };
        trace.set_failure(step_id, error, error_kind, traceback, executed_steps);
    }

    /// Persist and hand back the finished trace
    pub fn finalize_trace(&mut self) -> Result<Option<ExecutionTrace>> {
        let Some(trace) = self.current.take() else {
            return Ok(None);
        };
        self.storage.save_trace(&trace.trace_id, &trace)?;
        info!(trace_id = %trace.trace_id, success = trace.is_success(), "Trace finalised");
        Ok(Some(trace))
    }

    /// The trace currently in progress
    #[must_use]
    pub fn current_trace(&self) -> Option<&ExecutionTrace> {
        self.current.as_ref()
    }

    /// Load a persisted trace
    pub fn load_trace(&self, trace_id: &str) -> Result<Option<ExecutionTrace>> {
        self.storage.load_trace(trace_id).map_err(Into::into)
    }

    /// Most recent traces, newest first
    pub fn recent_traces(&self, limit: usize) -> Result<Vec<ExecutionTrace>> {
        self.storage.load_recent_traces(limit).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn generator() -> (TempDir, AceGenerator) {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        (dir, AceGenerator::new(storage))
    }

    #[test]
    fn test_full_success_cycle_persists() {
        let (_dir, mut generator) = generator();
        generator.start_trace("do x", json!({"flow_id": "flow_1", "steps": []}));
        generator.record_step_execution(
            1,
            "ocr",
            json!({"path": "img.png"}),
            Some(json!({"content": "text"})),
            0.2,
            None,
            json!({}),
        );
        let mut results = BTreeMap::new();
        results.insert(1, json!({"content": "text"}));
        generator.record_success(vec![1], results, 0.2);

        let trace = generator.finalize_trace().unwrap().unwrap();
        assert!(trace.is_success());
        assert!(generator.current_trace().is_none());

        let loaded = generator.load_trace(&trace.trace_id).unwrap().unwrap();
        assert_eq!(loaded.tools_used, vec!["ocr".to_string()]);
    }

    #[test]
    fn test_failure_cycle() {
        let (_dir, mut generator) = generator();
        generator.start_trace("do y", json!({"flow_id": "flow_2", "steps": []}));
        generator.record_step_execution(1, "llm", json!({}), None, 0.1, Some("bad".into()), json!({}));
        generator.record_failure(1, "bad", "ToolError", "trace...".into(), vec![]);

        let trace = generator.finalize_trace().unwrap().unwrap();
        assert!(!trace.is_success());
        assert_eq!(trace.failure_info().unwrap().error_kind, "ToolError");
    }

    #[test]
    fn test_record_without_trace_is_noop() {
        let (_dir, mut generator) = generator();
        generator.record_success(vec![], BTreeMap::new(), 0.0);
        assert!(generator.finalize_trace().unwrap().is_none());
    }

    #[test]
    fn test_recent_traces() {
        let (_dir, mut generator) = generator();
        for i in 0..3 {
            generator.start_trace("t", json!({"flow_id": format!("flow_{i}"), "steps": []}));
            generator.record_success(vec![], BTreeMap::new(), 0.0);
            generator.finalize_trace().unwrap();
        }
        assert_eq!(generator.recent_traces(2).unwrap().len(), 2);
    }
}
