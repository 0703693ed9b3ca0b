//! Planweave Tools - Two-Tier Tool Catalogue
//!
//! This crate provides the tool surface the engine plans against:
//! - `ToolMetadata` / `ToolKind` / `ParameterSpec`: uniform tool metadata
//! - `Tool`: the invocation contract (`args map -> result map`)
//! - `ToolPool`: every tool the host has advertised, validated at insertion
//! - `ToolRegistry`: the subset activated for planning and execution
//! - `ToolUnderstandingAgent`: model-derived metadata, cached per code hash
//!
//! The engine never interprets tool outputs semantically; it only requires
//! that `llm`/`vl` tools return a `content` field per their output schema.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod metadata;
pub mod pool;
pub mod registry;
pub mod understanding;

pub use error::{Error, Result};
pub use metadata::{FnTool, ParameterSpec, Tool, ToolKind, ToolMetadata};
pub use pool::ToolPool;
pub use registry::ToolRegistry;
pub use understanding::ToolUnderstandingAgent;
