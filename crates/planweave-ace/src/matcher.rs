//! Task matcher: exact and semantic lookup of reusable historical plans

use crate::error::{Error, Result};
use planweave_search::TaskIndex;
use planweave_store::StorageManager;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, instrument, warn};

static WORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+").expect("WORD_REGEX is a compile-time constant"));

/// Mirror of a plan plus its execution history, one per flow id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// `task_<flow_id>`
    pub task_id: String,
    /// Flow id of the plan this record mirrors
    pub flow_id: String,
    /// The original task description
    pub task_description: String,
    /// Full plan snapshot at generation time
    pub plan_json: Value,
    /// Execution outcome; `None` until the first execution finishes
    #[serde(default)]
    pub success: Option<bool>,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: String,
    /// Last execution timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<String>,
    /// Keywords extracted from the description
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Flow id this record's plan was cloned from, when reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<String>,
}

/// Finds reusable historical plans by exact or semantic match
pub struct TaskMatcher {
    storage: StorageManager,
    index: Arc<TaskIndex>,
}

impl TaskMatcher {
    /// Similarity threshold for silent plan reuse
    pub const REUSE_THRESHOLD: f32 = 0.85;
    /// Similarity threshold for general retrieval
    pub const RETRIEVAL_THRESHOLD: f32 = 0.80;
    /// Default candidate count pulled from the index
    pub const DEFAULT_TOP_K: usize = 20;

    /// Create a matcher over the task record store and vector index
    #[must_use]
    pub fn new(storage: StorageManager, index: Arc<TaskIndex>) -> Self {
        Self { storage, index }
    }

    /// Find a plan whose saved description normalises to exactly the query
    ///
    /// Only successful tasks qualify. The latest plan file is preferred over
    /// the record's snapshot so external edits are honoured.
    #[instrument(skip(self, description))]
    pub fn find_exact_plan(&self, description: &str) -> Result<Option<Value>> {
        let normalized = self.storage.normalize_task_description(description);

        let records: Vec<TaskRecord> = self.storage.load_all_tasks(usize::MAX)?;
        for record in records {
            if record.success != Some(true) {
                continue;
            }
            let saved = self
                .storage
                .normalize_task_description(&record.task_description);
            if saved != normalized {
                continue;
            }
            info!(flow_id = %record.flow_id, "Exact plan match");

            // The plan file may carry edits made after the record snapshot
            if let Ok(Some(latest)) = self.storage.load_plan::<Value>(&record.flow_id) {
                debug!("Using latest plan file over record snapshot");
                return Ok(Some(latest));
            }
            return Ok(Some(record.plan_json));
        }
        debug!("No exact plan match");
        Ok(None)
    }

    /// Find similar historical tasks above a similarity threshold
    ///
    /// Embeds the query, searches the index, then loads each candidate's
    /// task record from disk. Records whose files went missing are logged
    /// and skipped.
    #[instrument(skip(self, description), fields(threshold = threshold))]
    pub async fn find_similar_plans(
        &self,
        description: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<(TaskRecord, f32)>> {
        if self.index.is_empty() {
            debug!("Task index empty, skipping retrieval");
            return Ok(Vec::new());
        }

        let query = self.index.embed_query(description).await?;
        let matches = self.index.search_similar_tasks(&query, top_k)?;

        let mut results = Vec::new();
        for candidate in matches {
            if candidate.similarity < threshold {
                continue;
            }
            match self.storage.load_task::<TaskRecord>(&candidate.flow_id)? {
                Some(record) => results.push((record, candidate.similarity)),
                None => {
                    warn!(flow_id = %candidate.flow_id, "Indexed task has no record file, skipping");
                }
            }
        }
        info!(found = results.len(), "Similar task retrieval done");
        Ok(results)
    }

    /// Persist the task record and upsert the vector index entry
    ///
    /// Index failures are logged but never fail the mapping: the record on
    /// disk is the source of truth and the index can be rebuilt.
    #[instrument(skip(self, description, plan))]
    pub async fn save_task_mapping(
        &self,
        description: &str,
        plan: &Value,
        success: Option<bool>,
    ) -> Result<String> {
        let flow_id = plan
            .get("flow_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::TaskMatching("plan has no flow_id".to_string()))?
            .to_string();
        let task_id = format!("task_{flow_id}");

        let record = TaskRecord {
            task_id: task_id.clone(),
            flow_id: flow_id.clone(),
            task_description: description.to_string(),
            plan_json: plan.clone(),
            success,
            created_at: plan
                .get("created_at")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            last_executed_at: None,
            keywords: Self::extract_keywords(description),
            reused_from: plan
                .get("reused_from")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };
        self.storage.save_task(&flow_id, &record)?;

        let metadata = json!({
            "task_id": task_id,
            "success": success,
            "created_at": record.created_at,
            "steps_count": plan.get("steps").and_then(|s| s.as_array()).map_or(0, Vec::len),
            "complexity_level": plan.get("complexity_level").and_then(|v| v.as_str()).unwrap_or(""),
            "app_name": plan.get("app_name").and_then(|v| v.as_str()).unwrap_or(""),
        });
        if let Err(e) = self
            .index
            .add_task(&flow_id, description, None, metadata)
            .await
        {
            warn!(flow_id = %flow_id, error = %e, "Index upsert failed, record saved anyway");
        }
        Ok(task_id)
    }

    /// Update a record's success flag after execution or quality feedback
    pub fn update_task_success(&self, flow_id: &str, success: bool) -> Result<()> {
        let Some(mut record) = self.storage.load_task::<TaskRecord>(flow_id)? else {
            return Err(Error::TaskMatching(format!(
                "no task record for flow '{flow_id}'"
            )));
        };
        record.success = Some(success);
        record.last_executed_at = Some(chrono::Utc::now().to_rfc3339());
        self.storage.save_task(flow_id, &record)?;
        Ok(())
    }

    /// Task history, newest first
    pub fn task_history(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        self.storage.load_all_tasks(limit).map_err(Error::from)
    }

    /// Extract cheap keywords from a description
    #[must_use]
    pub fn extract_keywords(text: &str) -> Vec<String> {
        WORD_REGEX
            .find_iter(&text.to_lowercase())
            .map(|m| m.as_str().to_string())
            .filter(|w| w.chars().count() > 1)
            .take(10)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planweave_llm::MockEmbedder;
    use tempfile::TempDir;

    fn setup() -> (TempDir, TaskMatcher) {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let index = Arc::new(
            TaskIndex::open(&storage.vector_db_dir(), Arc::new(MockEmbedder::new(64))).unwrap(),
        );
        let matcher = TaskMatcher::new(storage, index);
        (dir, matcher)
    }

    fn plan(flow_id: &str, query: &str) -> Value {
        json!({
            "flow_id": flow_id,
            "original_query": query,
            "created_at": "2026-08-01T00:00:00Z",
            "complexity_level": "simple",
            "steps": [
                {"step_id": 1, "description": "d", "tool": "ocr", "tool_input": {}, "dependencies": []}
            ]
        })
    }

    #[tokio::test]
    async fn test_exact_match_requires_success() {
        let (_dir, matcher) = setup();
        matcher
            .save_task_mapping("Summarise WeChat chat", &plan("flow_1_a", "Summarise WeChat chat"), None)
            .await
            .unwrap();

        // Unknown outcome does not qualify for silent reuse
        assert!(matcher.find_exact_plan("summarise wechat chat").unwrap().is_none());

        matcher.update_task_success("flow_1_a", true).unwrap();
        let hit = matcher.find_exact_plan("  Summarise   WECHAT chat ").unwrap();
        assert_eq!(hit.unwrap()["flow_id"], "flow_1_a");
    }

    #[tokio::test]
    async fn test_exact_match_prefers_latest_plan_file() {
        let (_dir, matcher) = setup();
        matcher
            .save_task_mapping("task x", &plan("flow_2_b", "task x"), Some(true))
            .await
            .unwrap();

        // An external edit rewrites the plan file
        let mut edited = plan("flow_2_b", "task x");
        edited["overall_strategy"] = json!("edited by hand");
        matcher.storage.save_plan("flow_2_b", &edited).unwrap();

        let hit = matcher.find_exact_plan("task x").unwrap().unwrap();
        assert_eq!(hit["overall_strategy"], "edited by hand");
    }

    #[tokio::test]
    async fn test_similar_plans_threshold_filters() {
        let (_dir, matcher) = setup();
        matcher
            .save_task_mapping("extract pdf tables", &plan("flow_3_c", "extract pdf tables"), Some(true))
            .await
            .unwrap();

        let same = matcher
            .find_similar_plans("extract pdf tables", 0.85, 5)
            .await
            .unwrap();
        assert_eq!(same.len(), 1);
        assert!(same[0].1 > 0.99);

        let different = matcher
            .find_similar_plans("reply to the slack thread", 0.85, 5)
            .await
            .unwrap();
        assert!(different.is_empty());
    }

    #[tokio::test]
    async fn test_missing_record_file_is_skipped() {
        let (_dir, matcher) = setup();
        matcher
            .save_task_mapping("orphaned task", &plan("flow_4_d", "orphaned task"), Some(true))
            .await
            .unwrap();
        std::fs::remove_file(matcher.storage.task_file("flow_4_d")).unwrap();

        let hits = matcher
            .find_similar_plans("orphaned task", 0.85, 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_save_task_mapping_is_idempotent_in_index() {
        let (_dir, matcher) = setup();
        for _ in 0..3 {
            matcher
                .save_task_mapping("repeat me", &plan("flow_5_e", "repeat me"), Some(true))
                .await
                .unwrap();
        }
        let hits = matcher.find_similar_plans("repeat me", 0.85, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_task_history_newest_first() {
        let (_dir, matcher) = setup();
        matcher
            .save_task_mapping("first", &plan("flow_6_f", "first"), Some(true))
            .await
            .unwrap();
        matcher
            .save_task_mapping("second", &plan("flow_7_g", "second"), Some(false))
            .await
            .unwrap();

        let history = matcher.task_history(10).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_extract_keywords() {
        let keywords = TaskMatcher::extract_keywords("Summarise the WeChat chat, a quick test");
        assert!(keywords.contains(&"summarise".to_string()));
        assert!(keywords.contains(&"wechat".to_string()));
        assert!(!keywords.contains(&"a".to_string()));
    }
}
