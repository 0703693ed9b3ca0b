//! Error types for planweave-ace

use thiserror::Error;

/// Error type for the adaptive context engine
#[derive(Error, Debug)]
pub enum Error {
    /// Context store operation failed
    #[error("Context error: {0}")]
    Context(String),

    /// Trace reflection failed
    #[error("Reflection error: {0}")]
    Reflection(String),

    /// Insight curation failed
    #[error("Curation error: {0}")]
    Curation(String),

    /// Task matching failed
    #[error("Task matching error: {0}")]
    TaskMatching(String),

    /// Model call failed
    #[error("Model error: {0}")]
    Model(#[from] planweave_llm::Error),

    /// Storage access failed
    #[error("Storage error: {0}")]
    Storage(#[from] planweave_store::Error),

    /// Vector index access failed
    #[error("Search error: {0}")]
    Search(#[from] planweave_search::Error),
}

/// Result type for the adaptive context engine
pub type Result<T> = std::result::Result<T, Error>;
