//! Error types for planweave-store

use thiserror::Error;

/// Error type for storage operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persistent file exists but cannot be parsed
    #[error("Corrupt file {path}: {reason}")]
    Corrupt {
        /// Path of the offending file
        path: String,
        /// Parse failure description
        reason: String,
    },
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;
