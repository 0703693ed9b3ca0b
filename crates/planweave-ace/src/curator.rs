//! Curator: distils reflector insights into context entries

use crate::chain::{preview, ReflectionChain, ReflectionStage};
use crate::context::{ContextEntry, ContextEntryType, EntrySource};
use crate::context_manager::ContextManager;
use crate::error::{Error, Result};
use crate::trace::ExecutionTrace;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Character-ratio similarity above which two entries are duplicates
const DEDUP_THRESHOLD: f64 = 0.85;
/// Maximum entries kept per task class, by score
const MAX_ENTRIES_PER_CLASS: usize = 100;

/// Turns insight documents into scored context entries
///
/// Deduplication is intentionally cheap and deterministic: character-ratio
/// similarity, not embeddings. Embeddings are for retrieval only.
pub struct Curator {
    context_manager: Arc<ContextManager>,
}

impl Curator {
    /// Create a curator over the context store
    #[must_use]
    pub fn new(context_manager: Arc<ContextManager>) -> Self {
        Self { context_manager }
    }

    /// Distil an insight document into new entries
    #[instrument(skip(self, insights, trace, chain))]
    pub async fn curate_insights(
        &self,
        insights: &Value,
        trace: &ExecutionTrace,
        chain: Option<&mut ReflectionChain>,
    ) -> Result<Vec<ContextEntry>> {
        let failure_type = insights
            .get("failure_type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let task_class = self
            .context_manager
            .identify_task_class(&trace.task_description)
            .await?;

        let entries = match failure_type {
            "workflow" => self.curate_workflow_failure(insights, trace, &task_class),
            "tool" => self.curate_tool_failure(insights, trace, &task_class),
            "mixed" => self.curate_mixed_failure(insights, trace, &task_class),
            "success" => self.curate_success(insights, trace, &task_class),
            "quality_issue" => {
                self.curate_quality_issue(insights, trace, &task_class, chain)
                    .await?
            }
            other => {
                debug!(failure_type = other, "Unknown insight type, nothing curated");
                Vec::new()
            }
        };
        info!(count = entries.len(), failure_type, "Insights curated");
        Ok(entries)
    }

    /// Merge new entries into a task class: dedup, sort by score, cap, save
    pub async fn update_context(
        &self,
        task_class: &str,
        new_entries: Vec<ContextEntry>,
    ) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut merged = self.context_manager.load_context(task_class).await?;
        merged.extend(new_entries);

        let mut deduplicated = Self::deduplicate(merged);
        deduplicated.sort_by(|a, b| b.metadata.score.cmp(&a.metadata.score));
        if deduplicated.len() > MAX_ENTRIES_PER_CLASS {
            deduplicated.truncate(MAX_ENTRIES_PER_CLASS);
        }

        self.context_manager
            .save_context(task_class, deduplicated)
            .await
            .map_err(|e| Error::Curation(format!("context update failed: {e}")))
    }

    fn curate_workflow_failure(
        &self,
        insights: &Value,
        trace: &ExecutionTrace,
        task_class: &str,
    ) -> Vec<ContextEntry> {
        let root_cause = str_field(insights, "root_cause");
        let strategy = str_field(insights, "improved_workflow_strategy");

        let mut content = format!("[error pattern] {root_cause}\n[improved strategy] {strategy}\n");
        if let Some(issues) = insights.get("workflow_issues").and_then(|v| v.as_array()) {
            content.push_str("[issues]\n");
            for issue in issues {
                content.push_str(&format!(
                    "- {}: {}\n",
                    str_field(issue, "issue"),
                    str_field(issue, "suggestion"),
                ));
            }
        }

        let mut entry = ContextEntry::new(ContextEntryType::ErrorPattern, content)
            .with_initial_counts(0, 1)
            .with_related_task(task_class);
        for tool in &trace.tools_used {
            entry = entry.with_related_tool(tool.as_str());
        }
        entry.add_example(trace.task_description.as_str(), "failure", root_cause);
        vec![entry]
    }

    fn curate_tool_failure(
        &self,
        insights: &Value,
        trace: &ExecutionTrace,
        task_class: &str,
    ) -> Vec<ContextEntry> {
        let tool_name = str_field(insights, "tool_name");
        let root_cause = str_field(insights, "root_cause");
        let best_practice = str_field(insights, "tool_usage_best_practice");

        let mut content =
            format!("[tool] {tool_name}\n[failure cause] {root_cause}\n[best practice] {best_practice}\n");
        if let Some(params) = insights.get("parameter_issues").and_then(|v| v.as_array()) {
            if !params.is_empty() {
                content.push_str("[parameter advice]\n");
                for param in params {
                    content.push_str(&format!(
                        "- {}: {}\n",
                        str_field(param, "parameter"),
                        str_field(param, "issue"),
                    ));
                }
            }
        }

        let mut entry = ContextEntry::new(ContextEntryType::ToolUsage, content)
            .with_initial_counts(0, 1)
            .with_related_tool(tool_name)
            .with_related_task(task_class);
        entry.add_example(trace.task_description.as_str(), "failure", root_cause);
        vec![entry]
    }

    fn curate_mixed_failure(
        &self,
        insights: &Value,
        trace: &ExecutionTrace,
        task_class: &str,
    ) -> Vec<ContextEntry> {
        let mut entries = Vec::new();

        let analyses = [
            ("workflow_analysis", "has_workflow_issues", ContextEntryType::ErrorPattern, "[workflow issues]"),
            ("tool_analysis", "has_tool_issues", ContextEntryType::ToolUsage, "[tool issues]"),
        ];
        for (key, flag, entry_type, header) in analyses {
            let Some(analysis) = insights.get(key) else {
                continue;
            };
            if analysis.get(flag).and_then(|v| v.as_bool()) != Some(true) {
                continue;
            }
            let mut content = format!("{header}\n");
            for issue in analysis
                .get("issues")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                content.push_str(&format!("- {}\n", issue.as_str().unwrap_or_default()));
            }
            content.push_str("[suggestions]\n");
            for suggestion in analysis
                .get("suggestions")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                content.push_str(&format!("- {}\n", suggestion.as_str().unwrap_or_default()));
            }

            let mut entry = ContextEntry::new(entry_type, content)
                .with_initial_counts(0, 1)
                .with_related_task(task_class);
            for tool in &trace.tools_used {
                entry = entry.with_related_tool(tool.as_str());
            }
            entries.push(entry);
        }
        entries
    }

    fn curate_success(
        &self,
        insights: &Value,
        trace: &ExecutionTrace,
        task_class: &str,
    ) -> Vec<ContextEntry> {
        let mut entries = Vec::new();

        let strategies: Vec<&str> = insights
            .get("success_strategies")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
            .collect();
        let patterns: Vec<&str> = insights
            .get("workflow_patterns")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
            .collect();

        if !strategies.is_empty() || !patterns.is_empty() {
            let mut content = String::from("[success strategies]\n");
            for strategy in &strategies {
                content.push_str(&format!("- {strategy}\n"));
            }
            if !patterns.is_empty() {
                content.push_str("[workflow patterns]\n");
                for pattern in &patterns {
                    content.push_str(&format!("- {pattern}\n"));
                }
            }

            let mut entry = ContextEntry::new(ContextEntryType::Strategy, content)
                .with_initial_counts(1, 0)
                .with_related_task(task_class);
            for tool in &trace.tools_used {
                entry = entry.with_related_tool(tool.as_str());
            }
            entry.add_example(trace.task_description.as_str(), "success", "workflow executed successfully");
            entries.push(entry);
        }

        if let Some(practices) = insights.get("tool_best_practices").and_then(|v| v.as_object()) {
            for (tool_name, practice) in practices {
                let content = format!(
                    "[tool] {tool_name}\n[best practice] {}\n",
                    practice.as_str().unwrap_or_default()
                );
                entries.push(
                    ContextEntry::new(ContextEntryType::ToolUsage, content)
                        .with_initial_counts(1, 0)
                        .with_related_tool(tool_name)
                        .with_related_task(task_class),
                );
            }
        }
        entries
    }

    /// Quality issues carry the optimised prompt for plan-time injection
    ///
    /// Before writing, the new entry is compared against existing same-tool
    /// entries; a near-duplicate bumps `last_used` instead of cloning.
    async fn curate_quality_issue(
        &self,
        insights: &Value,
        trace: &ExecutionTrace,
        task_class: &str,
        chain: Option<&mut ReflectionChain>,
    ) -> Result<Vec<ContextEntry>> {
        let root_cause = str_field(insights, "root_cause");
        let suggestions: Vec<&str> = insights
            .get("improvement_suggestions")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
            .collect();

        let Some(optimization) = insights.get("prompt_optimization") else {
            return Ok(Vec::new());
        };
        let tool_name = str_field(optimization, "tool");
        let suggested_prompt = str_field(optimization, "suggested_prompt");
        if suggested_prompt.is_empty() {
            debug!("Quality insight has no suggested prompt, nothing curated");
            return Ok(Vec::new());
        }

        if let Some(chain) = chain {
            let original_prompt = trace
                .step_details
                .iter()
                .find(|d| d.tool_name == tool_name)
                .and_then(|d| d.tool_input.get("prompt"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            chain.add_entry(
                ReflectionStage::PromptOptimization,
                json!({
                    "tool_name": tool_name,
                    "original_prompt": preview(original_prompt, 300),
                    "problem": root_cause,
                    "improvement_suggestions": suggestions,
                }),
                json!({"optimized_prompt": suggested_prompt}),
                Value::Null,
                format!("prompt rewritten for {tool_name}: {root_cause}"),
            );
        }

        let mut content = format!(
            "[prompt optimization] {tool_name}\n[problem] {root_cause}\n[optimized prompt]\n{suggested_prompt}\n"
        );
        if !suggestions.is_empty() {
            content.push_str("[suggestions]\n");
            for suggestion in &suggestions {
                content.push_str(&format!("- {suggestion}\n"));
            }
        }

        // Same-tool dedup against existing entries for the class
        let mut existing = self.context_manager.load_context(task_class).await?;
        for entry in existing.iter_mut() {
            if entry.entry_type != ContextEntryType::ToolUsage {
                continue;
            }
            if !entry.metadata.related_tools.iter().any(|t| t == tool_name) {
                continue;
            }
            if strsim::normalized_levenshtein(&content, &entry.content) > DEDUP_THRESHOLD {
                info!(entry_id = %entry.entry_id, "Near-duplicate optimisation, bumping last_used");
                entry.touch();
                self.context_manager
                    .save_context(task_class, existing)
                    .await?;
                return Ok(Vec::new());
            }
        }

        let mut entry = ContextEntry::new(ContextEntryType::ToolUsage, content)
            .with_initial_counts(0, 1)
            .with_source(EntrySource::QualityFeedback)
            .with_related_tool(tool_name)
            .with_related_task(task_class)
            .with_optimized_prompt(suggested_prompt);
        entry.add_example(trace.task_description.as_str(), "quality_issue", root_cause);
        Ok(vec![entry])
    }

    /// Drop near-duplicate entries, keeping the first occurrence
    #[must_use]
    pub fn deduplicate(entries: Vec<ContextEntry>) -> Vec<ContextEntry> {
        let mut unique: Vec<ContextEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            let duplicate = unique.iter().any(|kept| {
                strsim::normalized_levenshtein(&entry.content, &kept.content) > DEDUP_THRESHOLD
            });
            if !duplicate {
                unique.push(entry);
            }
        }
        unique
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{EmbeddingCache, LlmAnalyzer};
    use planweave_llm::{MockEmbedder, MockModelClient};
    use planweave_store::StorageManager;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MockModelClient>, Arc<ContextManager>, Curator) {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let model = Arc::new(MockModelClient::new());
        let embeddings = Arc::new(EmbeddingCache::new(
            storage.clone(),
            Arc::new(MockEmbedder::new(64)),
        ));
        let analyzer = Arc::new(LlmAnalyzer::new(model.clone(), embeddings, storage.clone()));
        let manager = Arc::new(ContextManager::new(storage, analyzer));
        let curator = Curator::new(manager.clone());
        (dir, model, manager, curator)
    }

    fn trace() -> ExecutionTrace {
        let mut trace = ExecutionTrace::start(
            "summarise wechat chat",
            json!({"flow_id": "flow_1", "steps": []}),
        );
        trace.add_step_detail(
            1,
            "vl_extract",
            json!({"prompt": "extract it"}),
            Some(json!({"content": "..."})),
            0.2,
            None,
            json!({}),
        );
        trace
    }

    fn classification() -> &'static str {
        r#"{"primary_category": "chat_analysis", "sub_category": "wechat_extraction"}"#
    }

    #[tokio::test]
    async fn test_tool_failure_creates_negative_tool_usage_entry() {
        let (_dir, model, _manager, curator) = setup();
        model.push_response(classification());

        let insights = json!({
            "failure_type": "tool",
            "tool_name": "vl_extract",
            "root_cause": "wrong image path",
            "tool_usage_best_practice": "pass absolute paths",
        });
        let entries = curator.curate_insights(&insights, &trace(), None).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, ContextEntryType::ToolUsage);
        assert_eq!(entries[0].metadata.score, -1);
        assert!(entries[0].metadata.related_tools.contains(&"vl_extract".to_string()));
        assert_eq!(entries[0].examples[0].result, "failure");
    }

    #[tokio::test]
    async fn test_success_creates_positive_entries() {
        let (_dir, model, _manager, curator) = setup();
        model.push_response(classification());

        let insights = json!({
            "failure_type": "success",
            "success_strategies": ["extract first, analyse second"],
            "workflow_patterns": ["vl then llm"],
            "tool_best_practices": {"vl_extract": "ask for one text block"},
        });
        let entries = curator.curate_insights(&insights, &trace(), None).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.metadata.score == 1));
        assert!(entries.iter().any(|e| e.entry_type == ContextEntryType::Strategy));
        assert!(entries.iter().any(|e| e.entry_type == ContextEntryType::ToolUsage));
    }

    #[tokio::test]
    async fn test_quality_issue_carries_optimized_prompt() {
        let (_dir, model, _manager, curator) = setup();
        model.push_response(classification());

        let insights = json!({
            "failure_type": "quality_issue",
            "root_cause": "speaker tags lost",
            "improvement_suggestions": ["keep speaker tags"],
            "prompt_optimization": {
                "tool": "vl_extract",
                "suggested_prompt": "extract every message with its speaker tag"
            },
        });
        let entries = curator.curate_insights(&insights, &trace(), None).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata.source, EntrySource::QualityFeedback);
        assert_eq!(
            entries[0].metadata.optimized_prompt.as_deref(),
            Some("extract every message with its speaker tag")
        );
    }

    #[tokio::test]
    async fn test_duplicate_quality_insight_bumps_existing() {
        let (_dir, model, manager, curator) = setup();
        // Two classifications: one per curate call
        model.push_response(classification());

        let insights = json!({
            "failure_type": "quality_issue",
            "root_cause": "speaker tags lost",
            "prompt_optimization": {
                "tool": "vl_extract",
                "suggested_prompt": "extract every message with its speaker tag"
            },
        });
        let first = curator.curate_insights(&insights, &trace(), None).await.unwrap();
        curator
            .update_context("chat_analysis-wechat_extraction", first)
            .await
            .unwrap();

        // The classification is cached now; the second pass sees the stored entry
        let second = curator.curate_insights(&insights, &trace(), None).await.unwrap();
        assert!(second.is_empty());

        let stored = manager
            .load_context("chat_analysis-wechat_extraction")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_update_context_caps_at_hundred() {
        let (_dir, _model, manager, curator) = setup();
        let mut entries = Vec::new();
        for i in 0i64..120 {
            // Hash-derived content keeps every pair well under the dedup
            // threshold
            let body = format!("{:x}", md5::compute(i.to_string().as_bytes()));
            let entry = ContextEntry::new(ContextEntryType::Knowledge, body)
                .with_initial_counts(i % 7, 0);
            entries.push(entry);
        }
        curator.update_context("general", entries).await.unwrap();

        let stored = manager.load_context("general").await.unwrap();
        assert_eq!(stored.len(), 100);
        // Sorted by score descending
        assert!(stored.first().unwrap().metadata.score >= stored.last().unwrap().metadata.score);
    }

    #[test]
    fn test_deduplicate_drops_near_identical() {
        let a = ContextEntry::new(ContextEntryType::Knowledge, "use absolute paths when calling ocr tools");
        let b = ContextEntry::new(ContextEntryType::Knowledge, "use absolute paths when calling ocr tool");
        let c = ContextEntry::new(ContextEntryType::Knowledge, "always scroll before the second capture");
        let unique = Curator::deduplicate(vec![a, b, c]);
        assert_eq!(unique.len(), 2);
    }
}
