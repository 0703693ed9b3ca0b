//! Error types for planweave-tools

use thiserror::Error;

/// Error type for tool catalogue operations
#[derive(Error, Debug)]
pub enum Error {
    /// Metadata failed pool-insertion validation
    #[error("Invalid tool metadata for '{name}': {reason}")]
    InvalidMetadata {
        /// Tool name
        name: String,
        /// What was missing or malformed
        reason: String,
    },

    /// Tool not present in the pool or registry
    #[error("Tool '{0}' not found")]
    NotFound(String),

    /// Tool invocation failed inside the tool
    #[error("Tool invocation failed: {0}")]
    Invocation(#[from] anyhow::Error),

    /// Metadata cache access failed
    #[error("Storage error: {0}")]
    Storage(#[from] planweave_store::Error),

    /// Model analysis failed
    #[error("Model error: {0}")]
    Model(#[from] planweave_llm::Error),
}

/// Result type for tool catalogue operations
pub type Result<T> = std::result::Result<T, Error>;
