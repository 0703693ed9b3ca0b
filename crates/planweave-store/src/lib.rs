//! Planweave Store - Layered JSON Storage
//!
//! This crate owns the work directory and its four-layer layout:
//! - `persistent/`: plans, task records, context entries, traces, reflections
//! - `cache/`: LLM answer cache, embedding cache, prompt caches, tool metadata
//! - `runtime/`: current-execution scratch and tool outputs
//! - `config/`: tool configuration per task namespace
//!
//! All components go through `StorageManager` instead of touching files
//! directly. Writes to externally-editable files (plans, task records) are
//! atomic; loads of missing files return `None` rather than erroring.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod manager;

pub use error::{Error, Result};
pub use manager::StorageManager;

/// Get the default work directory
#[must_use]
pub fn default_work_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|p| p.join(".planweave"))
        .unwrap_or_else(|| std::path::PathBuf::from(".planweave"))
}
