//! Cached LLM analysis and the shared embedding cache

use crate::error::Result;
use planweave_llm::{cosine_similarity, ChatOptions, SharedEmbeddingProvider, SharedModelClient};
use planweave_store::StorageManager;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Persisted text-to-vector map shared across sessions
///
/// Keys are the MD5 hex digest of the text bytes. The backing file is
/// `cache/llm/embeddings.json`; a missing or unparseable file initialises to
/// empty without failing. All access is serialised by one lock and every
/// mutation persists before the lock is released.
pub struct EmbeddingCache {
    storage: StorageManager,
    embedder: SharedEmbeddingProvider,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Load the cache from disk (empty when absent)
    #[must_use]
    pub fn new(storage: StorageManager, embedder: SharedEmbeddingProvider) -> Self {
        let loaded: HashMap<String, Vec<f32>> = storage
            .load_json_lenient(&storage.embedding_cache_file())
            .unwrap_or_default();
        if !loaded.is_empty() {
            info!(entries = loaded.len(), "Embedding cache loaded");
        }
        Self {
            storage,
            embedder,
            cache: Mutex::new(loaded),
        }
    }

    /// Hash a text into its cache key
    #[must_use]
    pub fn text_key(text: &str) -> String {
        format!("{:x}", md5::compute(text.as_bytes()))
    }

    /// Get the embedding of a text, computing and persisting on a miss
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    pub async fn get_or_compute(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::text_key(text);
        {
            let cache = self.cache.lock().await;
            if let Some(vector) = cache.get(&key) {
                debug!("Embedding cache hit");
                return Ok(vector.clone());
            }
        }

        let vector = self.embedder.embed(text).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(key, vector.clone());
        if let Err(e) = self
            .storage
            .save_json(&self.storage.embedding_cache_file(), &*cache)
        {
            warn!(error = %e, "Failed to persist embedding cache");
        }
        Ok(vector)
    }

    /// Cosine similarity between two texts
    pub async fn similarity(&self, a: &str, b: &str) -> Result<f32> {
        let va = self.get_or_compute(a).await?;
        let vb = self.get_or_compute(b).await?;
        Ok(cosine_similarity(&va, &vb))
    }

    /// Find the cached text whose embedding is closest to `query_vector`
    ///
    /// Returns `(text_key, similarity)` of the best entry at or above the
    /// threshold.
    pub async fn find_closest(
        &self,
        query_vector: &[f32],
        threshold: f32,
    ) -> Option<(String, f32)> {
        let cache = self.cache.lock().await;
        let mut best: Option<(String, f32)> = None;
        for (key, vector) in cache.iter() {
            let similarity = cosine_similarity(query_vector, vector);
            if similarity < threshold {
                continue;
            }
            if best.as_ref().is_none_or(|(_, s)| similarity > *s) {
                best = Some((key.clone(), similarity));
            }
        }
        best
    }

    /// Number of cached embeddings
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }

    /// Drop every cached vector (memory and disk)
    pub async fn clear(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.clear();
        self.storage
            .save_json(&self.storage.embedding_cache_file(), &*cache)?;
        Ok(())
    }
}

/// Prefix separating semantic-cache disk entries from caller keys
const SEMANTIC_KEY_PREFIX: &str = "sem_";

/// Cached JSON-mode model calls with optional semantic reuse
///
/// Two-level cache: exact (memory then disk, keyed by the caller's
/// `cache_key`) and semantic (opt-in per call; the prompt embedding is
/// compared against every prior prompt and a close-enough match returns its
/// answer, warm-filling the exact cache under the new key).
pub struct LlmAnalyzer {
    model: SharedModelClient,
    embeddings: std::sync::Arc<EmbeddingCache>,
    storage: StorageManager,
    memory: Mutex<HashMap<String, Value>>,
    max_cache_entries: usize,
    cache_expiry: Duration,
}

impl LlmAnalyzer {
    /// Default maximum number of answer-cache files kept on disk
    pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;
    /// Default answer-cache expiry
    pub const DEFAULT_CACHE_EXPIRY_DAYS: u64 = 30;

    /// Create an analyzer and run startup cache hygiene
    #[must_use]
    pub fn new(
        model: SharedModelClient,
        embeddings: std::sync::Arc<EmbeddingCache>,
        storage: StorageManager,
    ) -> Self {
        let analyzer = Self {
            model,
            embeddings,
            storage,
            memory: Mutex::new(HashMap::new()),
            max_cache_entries: Self::DEFAULT_MAX_CACHE_ENTRIES,
            cache_expiry: Duration::from_secs(Self::DEFAULT_CACHE_EXPIRY_DAYS * 24 * 3600),
        };
        if let Err(e) = analyzer.cleanup_old_cache() {
            warn!(error = %e, "Answer cache cleanup failed");
        }
        analyzer
    }

    /// The shared embedding cache
    #[must_use]
    pub fn embeddings(&self) -> &std::sync::Arc<EmbeddingCache> {
        &self.embeddings
    }

    /// Cached JSON-mode model call
    ///
    /// `semantic_threshold` enables the semantic cache: a prior prompt with
    /// cosine similarity at or above the threshold answers the call without
    /// touching the model.
    #[instrument(skip(self, prompt), fields(cache_key = %cache_key))]
    pub async fn analyze_with_cache(
        &self,
        prompt: &str,
        cache_key: &str,
        semantic_threshold: Option<f32>,
    ) -> Result<Value> {
        // Exact cache: memory first, then disk
        {
            let memory = self.memory.lock().await;
            if let Some(value) = memory.get(cache_key) {
                debug!("Exact cache hit (memory)");
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.storage.load_llm_cache::<Value>(cache_key) {
            debug!("Exact cache hit (disk)");
            self.memory
                .lock()
                .await
                .insert(cache_key.to_string(), value.clone());
            return Ok(value);
        }

        // Semantic cache: closest prior prompt above the threshold. An
        // identical prompt cached under another key matches itself here,
        // which is exactly the reuse we want.
        let prompt_key = EmbeddingCache::text_key(prompt);
        if let Some(threshold) = semantic_threshold {
            let query_vector = self.embeddings.get_or_compute(prompt).await?;
            if let Some((best_key, similarity)) = self
                .embeddings
                .find_closest(&query_vector, threshold)
                .await
            {
                let semantic_key = format!("{SEMANTIC_KEY_PREFIX}{best_key}");
                if let Some(value) = self.storage.load_llm_cache::<Value>(&semantic_key) {
                    info!(similarity, "Semantic cache hit");
                    // Warm-fill the exact cache under the new key
                    self.storage.save_llm_cache(cache_key, &value)?;
                    self.memory
                        .lock()
                        .await
                        .insert(cache_key.to_string(), value.clone());
                    return Ok(value);
                }
            }
        }

        // Miss: call the model
        let options = ChatOptions::default();
        let (value, completion) = self.model.complete_json(prompt, &options).await?;
        debug!(
            duration = completion.duration,
            "Model answered, caching result"
        );

        self.storage.save_llm_cache(cache_key, &value)?;
        self.memory
            .lock()
            .await
            .insert(cache_key.to_string(), value.clone());

        if semantic_threshold.is_some() {
            // Store the prompt embedding and the answer under the prompt's
            // own key so future similar prompts can find it
            self.embeddings.get_or_compute(prompt).await?;
            self.storage
                .save_llm_cache(&format!("{SEMANTIC_KEY_PREFIX}{prompt_key}"), &value)?;
        }
        Ok(value)
    }

    /// Cosine similarity between two texts via the embedding cache
    pub async fn similarity(&self, a: &str, b: &str) -> Result<f32> {
        self.embeddings.similarity(a, b).await
    }

    /// Drop the in-memory exact cache
    pub async fn clear_memory_cache(&self) {
        self.memory.lock().await.clear();
    }

    /// Evict expired and over-cap answer-cache files
    ///
    /// Age first, then LRU by file mtime past `max_cache_entries`. The
    /// shared embeddings file is never touched.
    pub fn cleanup_old_cache(&self) -> Result<usize> {
        let dir = self.storage.llm_cache_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let embeddings_file = self.storage.embedding_cache_file();
        let now = std::time::SystemTime::now();

        let mut files: Vec<(std::path::PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(planweave_store::Error::Io)? {
            let entry = entry.map_err(planweave_store::Error::Io)?;
            let path = entry.path();
            if path == embeddings_file || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }
        files.sort_by_key(|(_, mtime)| *mtime);

        let mut removed = 0;
        files.retain(|(path, mtime)| {
            let expired = now
                .duration_since(*mtime)
                .map(|age| age > self.cache_expiry)
                .unwrap_or(false);
            if expired && std::fs::remove_file(path).is_ok() {
                removed += 1;
                return false;
            }
            true
        });

        if files.len() > self.max_cache_entries {
            let excess = files.len() - self.max_cache_entries;
            for (path, _) in files.iter().take(excess) {
                if std::fs::remove_file(path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "Answer cache cleaned");
        }
        Ok(removed)
    }
}
