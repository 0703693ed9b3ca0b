//! Flow-id keyed task retrieval over the vector index
//!
//! The index only stores vectors; the task description and its metadata
//! envelope live in a JSON sidecar so search results can be returned without
//! touching the task records on disk.

use crate::error::Result;
use crate::index::{IndexConfig, VectorIndex};
use planweave_llm::SharedEmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEntry {
    document: String,
    metadata: serde_json::Value,
}

/// One similar-task hit
#[derive(Debug, Clone)]
pub struct TaskMatch {
    /// Flow id of the matched task
    pub flow_id: String,
    /// Cosine similarity in `[0, 1]`
    pub similarity: f32,
    /// Metadata envelope stored at insertion time
    pub metadata: serde_json::Value,
    /// The indexed task description
    pub document: String,
}

/// Task index: vectors keyed by flow id, with metadata and documents
pub struct TaskIndex {
    index: VectorIndex,
    embedder: SharedEmbeddingProvider,
    entries: RwLock<HashMap<String, TaskEntry>>,
    entries_path: PathBuf,
}

impl TaskIndex {
    const BASE_NAME: &'static str = "tasks";

    /// Open the task index under `dir`, creating it when absent
    ///
    /// A directory that exists but cannot be read is a hard error; the
    /// engine refuses to run with silently degraded matching.
    pub fn open(dir: &Path, embedder: SharedEmbeddingProvider) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let base = dir.join(Self::BASE_NAME);
        let config = IndexConfig::new(embedder.dimensions());
        let index = VectorIndex::open(&base, config)?;

        let entries_path = dir.join("task_entries.json");
        let entries: HashMap<String, TaskEntry> = if entries_path.exists() {
            let body = std::fs::read_to_string(&entries_path)?;
            serde_json::from_str(&body)?
        } else {
            HashMap::new()
        };

        info!(tasks = entries.len(), dir = %dir.display(), "Task index ready");
        Ok(Self {
            index,
            embedder,
            entries: RwLock::new(entries),
            entries_path,
        })
    }

    /// Insert or update a task (upsert semantics)
    ///
    /// When `vector` is absent the description is embedded automatically.
    #[instrument(skip(self, text, vector, metadata), fields(flow_id = %flow_id))]
    pub async fn add_task(
        &self,
        flow_id: &str,
        text: &str,
        vector: Option<Vec<f32>>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let vector = match vector {
            Some(v) => v,
            None => self.embedder.embed(text).await?,
        };
        self.index.upsert(flow_id, &vector)?;
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                flow_id.to_string(),
                TaskEntry {
                    document: text.to_string(),
                    metadata,
                },
            );
        }
        self.persist()?;
        debug!("Task indexed");
        Ok(())
    }

    /// Search for similar tasks, best match first
    pub fn search_similar_tasks(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<TaskMatch>> {
        let hits = self.index.search(query_vector, top_k)?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let entry = entries.get(&hit.id)?;
                Some(TaskMatch {
                    flow_id: hit.id,
                    similarity: hit.similarity,
                    metadata: entry.metadata.clone(),
                    document: entry.document.clone(),
                })
            })
            .collect())
    }

    /// Embed a query through the shared provider
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embedder.embed(text).await?)
    }

    /// Number of indexed tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the index holds no tasks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn persist(&self) -> Result<()> {
        self.index.save()?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let body = serde_json::to_string_pretty(&*entries)?;
        std::fs::write(&self.entries_path, body)?;
        Ok(())
    }
}
