//! Error types for planweave-llm

use thiserror::Error;

/// Error type for model client operations
#[derive(Error, Debug)]
pub enum Error {
    /// Completion request failed
    #[error("Completion error: {0}")]
    Completion(String),

    /// Embedding request failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// JSON could not be extracted from a model response
    #[error("Parse error: {0}")]
    Parse(String),

    /// Call exceeded its configured timeout
    #[error("Timeout after {0}s")]
    Timeout(u64),
}

/// Result type for model client operations
pub type Result<T> = std::result::Result<T, Error>;
