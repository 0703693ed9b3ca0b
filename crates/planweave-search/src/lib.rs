//! Planweave Search - Vector Index and Task Retrieval
//!
//! This crate provides the similarity substrate:
//! - `VectorIndex`: HNSW cosine index using usearch, persisted on disk
//! - `TaskIndex`: flow-id keyed layer with a metadata/document sidecar and
//!   auto-embedding of task descriptions
//!
//! The index must be available at startup; a broken persistence directory is
//! a hard error because a silent in-memory fallback would degrade matching
//! quality without anyone noticing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod index;
pub mod tasks;

pub use error::{Error, Result};
pub use index::{IndexConfig, ScoredId, VectorIndex};
pub use tasks::{TaskIndex, TaskMatch};
