//! Embedding provider trait for semantic similarity
//!
//! Embedding providers convert text into dense vector representations. The
//! engine uses them for task reuse and context retrieval; the concrete
//! endpoint is a transport concern and lives outside the core.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the embedding dimension
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model(&self) -> &str;
}

/// Shared embedding provider handle
pub type SharedEmbeddingProvider = Arc<dyn EmbeddingProvider>;

/// Cosine similarity between two vectors
///
/// Returns 0.0 for zero-norm inputs instead of dividing by zero.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Deterministic embedder for tests
///
/// Derives a unit vector from the MD5 digest of the text, so identical texts
/// always embed identically and distinct texts land far apart. No network,
/// no model download.
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    /// Create a mock embedder with the given dimensionality
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let digest = md5::compute(text.as_bytes());
        let mut vector = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            let byte = digest.0[i % 16];
            // Spread bytes across [-1, 1] and decorrelate repeated positions
            let value = f32::from(byte) / 127.5 - 1.0;
            let twist = ((i / 16) as f32).mul_add(0.37, 1.0);
            vector.push(value / twist);
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        "mock-embed"
    }
}
