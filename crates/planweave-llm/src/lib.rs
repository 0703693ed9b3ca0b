//! Planweave LLM - Model Client Abstraction
//!
//! This crate provides the language-model capability surface for Planweave:
//! - `ModelClient`: chat-completion trait with tolerant JSON extraction
//! - `ChatOptions`: per-call generation options
//! - `EmbeddingProvider`: text-to-vector trait for semantic similarity
//! - `MockModelClient` / `MockEmbedder`: scripted implementations for tests
//!
//! Transport adapters (OpenAI-compatible endpoints etc.) live outside the
//! core; the engine only ever sees these traits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod embeddings;
pub mod error;
pub mod json;

pub use client::{
    ChatOptions, Completion, MockModelClient, ModelClient, ModelInfo, SharedModelClient,
};
pub use embeddings::{cosine_similarity, EmbeddingProvider, MockEmbedder, SharedEmbeddingProvider};
pub use error::{Error, Result};
pub use json::extract_json;
