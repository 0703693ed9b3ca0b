//! Error types for planweave-search

use thiserror::Error;

/// Error type for vector search operations
#[derive(Error, Debug)]
pub enum Error {
    /// Index operation failed
    #[error("Index error: {0}")]
    Index(String),

    /// Search operation failed
    #[error("Search error: {0}")]
    Search(String),

    /// Dimension mismatch between vector and index
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimensions
        expected: usize,
        /// Actual dimensions
        actual: usize,
    },

    /// Embedding the query or document failed
    #[error("Embedding error: {0}")]
    Embedding(#[from] planweave_llm::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for vector search operations
pub type Result<T> = std::result::Result<T, Error>;
