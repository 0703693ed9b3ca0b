//! Reflection chains: the chronological record of one flow's decisions
//!
//! A chain records model inputs and outputs at each stage so a developer can
//! replay how a plan came to be. It never touches files itself; persistence
//! goes through the storage manager.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stage a chain entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionStage {
    /// Plan generation model input
    PlanGeneration,
    /// Plan generation model output
    PlanGenerationResult,
    /// Tool invocation input
    ToolExecution,
    /// Tool invocation output
    ToolExecutionResult,
    /// Quality analysis model input
    QualityAnalysis,
    /// Quality analysis model output
    QualityAnalysisResult,
    /// Prompt rewrite produced by the curator
    PromptOptimization,
}

/// One entry in a reflection chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionChainEntry {
    /// Sequential id, `entry_001` onwards
    pub entry_id: String,
    /// When the entry was appended
    pub timestamp: String,
    /// Stage
    pub stage: ReflectionStage,
    /// Stage input payload
    #[serde(default)]
    pub input_data: Value,
    /// Stage output payload
    #[serde(default)]
    pub output_data: Value,
    /// Model that produced the output, when one was involved
    #[serde(default)]
    pub model_info: Value,
    /// Free-text analysis note
    #[serde(default)]
    pub analysis: String,
}

/// Append-only chain of reflection entries for one flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionChain {
    /// Chain id, `chain_<YYYYMMDD_HHMMSS>_<8hex>`
    pub chain_id: String,
    /// The task the chain belongs to
    pub task_description: String,
    /// When the chain was opened
    pub created_at: String,
    /// Entries in append order
    #[serde(default)]
    pub entries: Vec<ReflectionChainEntry>,
}

impl ReflectionChain {
    /// Open a chain for a task
    #[must_use]
    pub fn new(task_description: impl Into<String>) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        Self {
            chain_id: format!("chain_{stamp}_{suffix}"),
            task_description: task_description.into(),
            created_at: Utc::now().to_rfc3339(),
            entries: Vec::new(),
        }
    }

    /// Append an entry and return its id
    pub fn add_entry(
        &mut self,
        stage: ReflectionStage,
        input_data: Value,
        output_data: Value,
        model_info: Value,
        analysis: impl Into<String>,
    ) -> &ReflectionChainEntry {
        let entry = ReflectionChainEntry {
            entry_id: format!("entry_{:03}", self.entries.len() + 1),
            timestamp: Utc::now().to_rfc3339(),
            stage,
            input_data,
            output_data,
            model_info,
            analysis: analysis.into(),
        };
        self.entries.push(entry);
        self.entries.last().expect("entry was just pushed")
    }

    /// Entries of one stage, in order
    #[must_use]
    pub fn entries_for_stage(&self, stage: ReflectionStage) -> Vec<&ReflectionChainEntry> {
        self.entries.iter().filter(|e| e.stage == stage).collect()
    }
}

/// Truncate a payload string for chain storage
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
