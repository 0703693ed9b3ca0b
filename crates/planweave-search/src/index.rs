//! HNSW vector index over usearch
//!
//! Cosine metric only: task descriptions and context prefixes are text
//! embeddings, and every similarity threshold in the engine is calibrated
//! for `similarity = 1 - cosine_distance`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, instrument};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

/// Configuration for the vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Vector dimensions
    pub dimensions: usize,
    /// Connectivity parameter (higher = more accurate, slower)
    pub connectivity: usize,
    /// Expansion factor for add operations
    pub expansion_add: usize,
    /// Expansion factor for search operations
    pub expansion_search: usize,
    /// Initial capacity
    pub capacity: usize,
}

impl IndexConfig {
    /// Create a configuration with defaults tuned for task descriptions
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            capacity: 4096,
        }
    }

    fn to_options(&self) -> IndexOptions {
        IndexOptions {
            dimensions: self.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.connectivity,
            expansion_add: self.expansion_add,
            expansion_search: self.expansion_search,
            multi: false,
        }
    }
}

/// One search hit: external id plus cosine similarity in `[0, 1]`
#[derive(Debug, Clone)]
pub struct ScoredId {
    /// External string id
    pub id: String,
    /// `1 - cosine_distance`, clamped at 0
    pub similarity: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyMapping {
    mappings: Vec<(String, u64)>,
    next_key: u64,
}

/// Persistent HNSW index with a string-id to u64-key mapping
pub struct VectorIndex {
    index: usearch::Index,
    id_to_key: RwLock<HashMap<String, u64>>,
    key_to_id: RwLock<HashMap<u64, String>>,
    next_key: AtomicU64,
    config: IndexConfig,
    path: Option<PathBuf>,
}

impl VectorIndex {
    /// Create a new in-memory index
    pub fn new(config: IndexConfig) -> Result<Self> {
        let index = usearch::Index::new(&config.to_options())
            .map_err(|e| Error::Index(format!("failed to create index: {e}")))?;
        index
            .reserve(config.capacity)
            .map_err(|e| Error::Index(format!("failed to reserve capacity: {e}")))?;

        Ok(Self {
            index,
            id_to_key: RwLock::new(HashMap::new()),
            key_to_id: RwLock::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            config,
            path: None,
        })
    }

    /// Open a persistent index, loading existing files when present
    pub fn open(path: &Path, config: IndexConfig) -> Result<Self> {
        let index_path = path.with_extension("usearch");
        let mapping_path = path.with_extension("mapping.json");

        if index_path.exists() && mapping_path.exists() {
            info!(path = %index_path.display(), "Loading existing vector index");
            return Self::load(&index_path, &mapping_path, config);
        }

        let mut index = Self::new(config)?;
        index.path = Some(path.to_path_buf());
        Ok(index)
    }

    fn load(index_path: &Path, mapping_path: &Path, config: IndexConfig) -> Result<Self> {
        let index = usearch::Index::new(&config.to_options())
            .map_err(|e| Error::Index(format!("failed to create index: {e}")))?;
        let path_str = index_path
            .to_str()
            .ok_or_else(|| Error::Index("non-UTF8 index path".to_string()))?;
        index
            .load(path_str)
            .map_err(|e| Error::Index(format!("failed to load index: {e}")))?;

        let body = std::fs::read_to_string(mapping_path)?;
        let mapping: KeyMapping = serde_json::from_str(&body)?;
        let id_to_key: HashMap<String, u64> = mapping.mappings.iter().cloned().collect();
        let key_to_id: HashMap<u64, String> =
            mapping.mappings.into_iter().map(|(id, k)| (k, id)).collect();

        info!(vectors = id_to_key.len(), "Vector index loaded");

        Ok(Self {
            index,
            id_to_key: RwLock::new(id_to_key),
            key_to_id: RwLock::new(key_to_id),
            next_key: AtomicU64::new(mapping.next_key),
            config,
            path: Some(index_path.with_extension("")),
        })
    }

    /// Persist the index and its id mapping
    #[instrument(skip(self))]
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Index("no path set for persistent index".to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let index_path = path.with_extension("usearch");
        let path_str = index_path
            .to_str()
            .ok_or_else(|| Error::Index("non-UTF8 index path".to_string()))?;
        self.index
            .save(path_str)
            .map_err(|e| Error::Index(format!("failed to save index: {e}")))?;

        let id_to_key = self.id_to_key.read().unwrap_or_else(|e| e.into_inner());
        let mapping = KeyMapping {
            mappings: id_to_key.iter().map(|(id, k)| (id.clone(), *k)).collect(),
            next_key: self.next_key.load(Ordering::SeqCst),
        };
        let body = serde_json::to_string_pretty(&mapping)?;
        std::fs::write(path.with_extension("mapping.json"), body)?;
        Ok(())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or replace a vector under the given id
    #[instrument(skip(self, vector), fields(id = %id))]
    pub fn upsert(&self, id: &str, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;

        let existing = {
            let id_to_key = self.id_to_key.read().unwrap_or_else(|e| e.into_inner());
            id_to_key.get(id).copied()
        };
        if let Some(key) = existing {
            self.index
                .remove(key)
                .map_err(|e| Error::Index(format!("failed to replace vector: {e}")))?;
            self.index
                .add(key, vector)
                .map_err(|e| Error::Index(format!("failed to add vector: {e}")))?;
            debug!(key, "Replaced vector");
            return Ok(());
        }

        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        if self.index.size() >= self.index.capacity() {
            let new_capacity = std::cmp::max(self.index.capacity() * 2, 64);
            self.index
                .reserve(new_capacity)
                .map_err(|e| Error::Index(format!("failed to expand capacity: {e}")))?;
        }
        self.index
            .add(key, vector)
            .map_err(|e| Error::Index(format!("failed to add vector: {e}")))?;

        let mut id_to_key = self.id_to_key.write().unwrap_or_else(|e| e.into_inner());
        let mut key_to_id = self.key_to_id.write().unwrap_or_else(|e| e.into_inner());
        id_to_key.insert(id.to_string(), key);
        key_to_id.insert(key, id.to_string());
        Ok(())
    }

    /// Remove a vector; unknown ids are a no-op
    pub fn remove(&self, id: &str) -> Result<bool> {
        let key = {
            let id_to_key = self.id_to_key.read().unwrap_or_else(|e| e.into_inner());
            id_to_key.get(id).copied()
        };
        let Some(key) = key else {
            return Ok(false);
        };
        self.index
            .remove(key)
            .map_err(|e| Error::Index(format!("failed to remove vector: {e}")))?;
        let mut id_to_key = self.id_to_key.write().unwrap_or_else(|e| e.into_inner());
        let mut key_to_id = self.key_to_id.write().unwrap_or_else(|e| e.into_inner());
        id_to_key.remove(id);
        key_to_id.remove(&key);
        Ok(true)
    }

    /// Nearest-neighbour search, best matches first
    #[instrument(skip(self, query), fields(top_k = top_k))]
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredId>> {
        self.check_dimensions(query)?;

        let matches = self
            .index
            .search(query, top_k)
            .map_err(|e| Error::Search(format!("search failed: {e}")))?;

        let key_to_id = self.key_to_id.read().unwrap_or_else(|e| e.into_inner());
        let results = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                let id = key_to_id.get(key)?.clone();
                Some(ScoredId {
                    id,
                    similarity: (1.0 - distance).max(0.0),
                })
            })
            .collect();
        Ok(results)
    }

    /// Check whether an id is indexed
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        let id_to_key = self.id_to_key.read().unwrap_or_else(|e| e.into_inner());
        id_to_key.contains_key(id)
    }

    /// Number of indexed vectors
    #[must_use]
    pub fn len(&self) -> usize {
        let id_to_key = self.id_to_key.read().unwrap_or_else(|e| e.into_inner());
        id_to_key.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index configuration
    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> VectorIndex {
        VectorIndex::new(IndexConfig::new(4)).unwrap()
    }

    #[test]
    fn test_upsert_and_search() {
        let index = index();
        index.upsert("t1", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.upsert("t2", &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, "t1");
        assert!(hits[0].similarity > 0.99);
    }

    #[test]
    fn test_upsert_replaces() {
        let index = index();
        index.upsert("t1", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.upsert("t1", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.len(), 1);

        let hits = index.search(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, "t1");
        assert!(hits[0].similarity > 0.99);
    }

    #[test]
    fn test_remove() {
        let index = index();
        index.upsert("t1", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(index.remove("t1").unwrap());
        assert!(!index.remove("t1").unwrap());
        assert!(index.is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = index();
        let result = index.upsert("t1", &[1.0, 0.0]);
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("tasks");

        let index = VectorIndex::open(&base, IndexConfig::new(4)).unwrap();
        index.upsert("t1", &[0.0, 0.0, 1.0, 0.0]).unwrap();
        index.save().unwrap();

        let reloaded = VectorIndex::open(&base, IndexConfig::new(4)).unwrap();
        assert_eq!(reloaded.len(), 1);
        let hits = reloaded.search(&[0.0, 0.0, 1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, "t1");
    }
}
