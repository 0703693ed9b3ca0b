//! Context store: retrieval, scoring, and maintenance per task class

use crate::analyzer::{EmbeddingCache, LlmAnalyzer};
use crate::context::ContextEntry;
use crate::error::{Error, Result};
use planweave_store::StorageManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Characters of entry content used for similarity scoring
const CONTENT_PREFIX_CHARS: usize = 500;
/// Similarity threshold for semantic reuse of the classification call
const CLASSIFY_SEMANTIC_THRESHOLD: f32 = 0.95;

/// Manages context entries grouped by task class
///
/// The per-class cache is process-wide; writes flush to disk inside the same
/// critical section so a reader never sees memory ahead of disk.
pub struct ContextManager {
    storage: StorageManager,
    analyzer: Arc<LlmAnalyzer>,
    cache: Mutex<HashMap<String, Vec<ContextEntry>>>,
}

impl ContextManager {
    /// Default number of entries returned by retrieval
    pub const DEFAULT_TOP_K: usize = 5;
    /// Entries below this score are pruned during maintenance
    pub const DEFAULT_PRUNE_THRESHOLD: i64 = -3;

    /// Create a context manager
    #[must_use]
    pub fn new(storage: StorageManager, analyzer: Arc<LlmAnalyzer>) -> Self {
        Self {
            storage,
            analyzer,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load the entries of a task class (cached after first read)
    pub async fn load_context(&self, task_class: &str) -> Result<Vec<ContextEntry>> {
        let mut cache = self.cache.lock().await;
        if let Some(entries) = cache.get(task_class) {
            return Ok(entries.clone());
        }
        let entries: Vec<ContextEntry> = self.storage.load_context(task_class)?;
        cache.insert(task_class.to_string(), entries.clone());
        Ok(entries)
    }

    /// Save the entries of a task class, updating the cache in the same
    /// critical section
    pub async fn save_context(&self, task_class: &str, entries: Vec<ContextEntry>) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.storage.save_context(task_class, &entries)?;
        cache.insert(task_class.to_string(), entries);
        Ok(())
    }

    /// Derive the task class of a description via a cached model call
    ///
    /// Returns `primary-sub` (e.g. `chat_analysis-wechat_extraction`), or
    /// `general` when the model omits a sub-category.
    #[instrument(skip(self, description))]
    pub async fn identify_task_class(&self, description: &str) -> Result<String> {
        let normalized = self.storage.normalize_task_description(description);
        let cache_key = format!("task_type_{}", EmbeddingCache::text_key(&normalized));
        let prompt = Self::classification_prompt(description);

        let value = self
            .analyzer
            .analyze_with_cache(&prompt, &cache_key, Some(CLASSIFY_SEMANTIC_THRESHOLD))
            .await?;

        let primary = value
            .get("primary_category")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        let sub = value
            .get("sub_category")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let class = if sub.is_empty() {
            primary
        } else {
            format!("{primary}-{sub}")
        };
        debug!(task_class = %class, "Task classified");
        Ok(class)
    }

    fn classification_prompt(description: &str) -> String {
        format!(
            "Classify the following task by its core intent.\n\n\
             Task: {description}\n\n\
             Categories:\n\
             1. chat_analysis (sub: wechat_extraction, qq_extraction, general_chat)\n\
             2. text_generation (sub: continuation, rewrite, summarize, expansion, translation)\n\
             3. document_analysis (sub: pdf_extraction, image_ocr, table_extraction, general_doc)\n\
             4. image_processing (sub: content_extraction, screenshot_analysis, visual_qa)\n\
             5. automation (sub: ui_automation, workflow_automation)\n\
             6. general (sub: other)\n\n\
             Return JSON only:\n\
             {{\"primary_category\": \"...\", \"sub_category\": \"...\", \"confidence\": 0.95, \"reasoning\": \"...\"}}"
        )
    }

    /// Retrieve the entries most relevant to a description
    ///
    /// Score = 0.7 · cosine similarity of the entry's content prefix against
    /// the description + 0.3 · feedback weight. Entries whose similarity
    /// cannot be computed are skipped with a warning.
    #[instrument(skip(self, description), fields(top_k = top_k))]
    pub async fn retrieve_relevant(
        &self,
        description: &str,
        task_class: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ContextEntry>> {
        let task_class = match task_class {
            Some(class) => class.to_string(),
            None => self.identify_task_class(description).await?,
        };
        let entries = self.load_context(&task_class).await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(ContextEntry, f32)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let prefix = entry.content_prefix(CONTENT_PREFIX_CHARS).to_string();
            match self.analyzer.similarity(description, &prefix).await {
                Ok(similarity) => {
                    let score = 0.7 * similarity + 0.3 * entry.feedback_weight();
                    scored.push((entry, score));
                }
                Err(e) => {
                    warn!(entry_id = %entry.entry_id, error = %e, "Skipping entry, similarity failed");
                }
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(top_k).map(|(e, _)| e).collect())
    }

    /// Mark an entry useful; returns false when the id is unknown
    pub async fn mark_useful(&self, entry_id: &str) -> Result<bool> {
        self.mark(entry_id, true).await
    }

    /// Mark an entry harmful; returns false when the id is unknown
    pub async fn mark_harmful(&self, entry_id: &str) -> Result<bool> {
        self.mark(entry_id, false).await
    }

    async fn mark(&self, entry_id: &str, useful: bool) -> Result<bool> {
        for task_class in self.storage.list_task_classes()? {
            let mut entries = self.load_context(&task_class).await?;
            if let Some(entry) = entries.iter_mut().find(|e| e.entry_id == entry_id) {
                entry.mark(useful);
                entry.touch();
                self.save_context(&task_class, entries).await?;
                info!(entry_id, useful, "Entry feedback recorded");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Find an entry by id across every task class
    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<ContextEntry>> {
        for task_class in self.storage.list_task_classes()? {
            let entries = self.load_context(&task_class).await?;
            if let Some(entry) = entries.into_iter().find(|e| e.entry_id == entry_id) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Delete an entry by id; returns false when the id is unknown
    pub async fn delete_entry(&self, entry_id: &str) -> Result<bool> {
        for task_class in self.storage.list_task_classes()? {
            let mut entries = self.load_context(&task_class).await?;
            let before = entries.len();
            entries.retain(|e| e.entry_id != entry_id);
            if entries.len() < before {
                self.save_context(&task_class, entries).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Prune entries whose score fell below the threshold, across all classes
    pub async fn cleanup_low_score_entries(&self, threshold: i64) -> Result<usize> {
        let mut removed = 0;
        for task_class in self.storage.list_task_classes()? {
            let mut entries = self.load_context(&task_class).await?;
            let before = entries.len();
            entries.retain(|e| e.metadata.score >= threshold);
            if entries.len() < before {
                removed += before - entries.len();
                self.save_context(&task_class, entries).await?;
            }
        }
        if removed > 0 {
            info!(removed, "Low-score entries pruned");
        }
        Ok(removed)
    }

    /// Drop the in-memory class cache
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    /// The storage manager backing this store
    #[must_use]
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// The analyzer used for classification and similarity
    #[must_use]
    pub fn analyzer(&self) -> &Arc<LlmAnalyzer> {
        &self.analyzer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextEntry, ContextEntryType};
    use planweave_llm::{MockEmbedder, MockModelClient};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MockModelClient>, ContextManager) {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let model = Arc::new(MockModelClient::new());
        let embeddings = Arc::new(EmbeddingCache::new(
            storage.clone(),
            Arc::new(MockEmbedder::new(64)),
        ));
        let analyzer = Arc::new(LlmAnalyzer::new(model.clone(), embeddings, storage.clone()));
        (dir, model, ContextManager::new(storage, analyzer))
    }

    #[tokio::test]
    async fn test_identify_task_class_joins_categories() {
        let (_dir, model, manager) = setup();
        model.push_response(
            r#"{"primary_category": "chat_analysis", "sub_category": "wechat_extraction", "confidence": 0.9}"#,
        );
        let class = manager.identify_task_class("summarise wechat chat").await.unwrap();
        assert_eq!(class, "chat_analysis-wechat_extraction");
    }

    #[tokio::test]
    async fn test_identify_task_class_without_sub() {
        let (_dir, model, manager) = setup();
        model.push_response(r#"{"primary_category": "general"}"#);
        let class = manager.identify_task_class("do a thing").await.unwrap();
        assert_eq!(class, "general");
    }

    #[tokio::test]
    async fn test_retrieve_relevant_ranks_by_similarity_and_feedback() {
        let (_dir, _model, manager) = setup();
        // Same content as query embeds identically; the other entry is far away
        let close = ContextEntry::new(ContextEntryType::Strategy, "summarise the group chat");
        let far = ContextEntry::new(ContextEntryType::Strategy, "rotate a pdf ninety degrees");
        manager
            .save_context("chat_analysis-general_chat", vec![far, close.clone()])
            .await
            .unwrap();

        let hits = manager
            .retrieve_relevant(
                "summarise the group chat",
                Some("chat_analysis-general_chat"),
                1,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, close.entry_id);
    }

    #[tokio::test]
    async fn test_retrieve_from_empty_class_is_empty() {
        let (_dir, _model, manager) = setup();
        let hits = manager
            .retrieve_relevant("anything", Some("unknown-class"), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_mark_useful_persists_score() {
        let (_dir, _model, manager) = setup();
        let entry = ContextEntry::new(ContextEntryType::ToolUsage, "x");
        let id = entry.entry_id.clone();
        manager.save_context("general", vec![entry]).await.unwrap();

        assert!(manager.mark_useful(&id).await.unwrap());
        manager.clear_cache().await;
        let reloaded = manager.load_context("general").await.unwrap();
        assert_eq!(reloaded[0].metadata.score, 1);
    }

    #[tokio::test]
    async fn test_mark_unknown_entry_returns_false() {
        let (_dir, _model, manager) = setup();
        assert!(!manager.mark_useful("no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_prunes_low_scores() {
        let (_dir, _model, manager) = setup();
        let keep = ContextEntry::new(ContextEntryType::Strategy, "good").with_initial_counts(1, 0);
        let drop = ContextEntry::new(ContextEntryType::ErrorPattern, "bad").with_initial_counts(0, 5);
        manager.save_context("general", vec![keep, drop]).await.unwrap();

        let removed = manager
            .cleanup_low_score_entries(ContextManager::DEFAULT_PRUNE_THRESHOLD)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = manager.load_context("general").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "good");
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let (_dir, _model, manager) = setup();
        let entry = ContextEntry::new(ContextEntryType::Knowledge, "to delete");
        let id = entry.entry_id.clone();
        manager.save_context("general", vec![entry]).await.unwrap();

        assert!(manager.delete_entry(&id).await.unwrap());
        assert!(manager.get_entry(&id).await.unwrap().is_none());
    }
}
