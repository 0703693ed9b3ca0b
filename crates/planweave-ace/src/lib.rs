//! Planweave ACE - Adaptive Context Engine
//!
//! The plan/execute/reflect learning loop:
//! - `ContextEntry` / `ContextManager`: typed, scored experience per task class
//! - `EmbeddingCache` / `LlmAnalyzer`: cached model calls with semantic reuse
//! - `TaskMatcher`: exact and semantic lookup of reusable historical plans
//! - `ExecutionTrace` / `AceGenerator`: trace capture during execution
//! - `ReflectionChain`: chronological record of planning decisions
//! - `Reflector`: post-mortem classification and insight extraction
//! - `Curator`: insight distillation into the context store
//!
//! Context entries written by the Curator are visible to the next plan
//! generation in the same process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod analyzer;
pub mod chain;
pub mod context;
pub mod context_manager;
pub mod curator;
pub mod error;
pub mod generator;
pub mod matcher;
pub mod reflector;
pub mod trace;

pub use analyzer::{EmbeddingCache, LlmAnalyzer};
pub use chain::{ReflectionChain, ReflectionChainEntry, ReflectionStage};
pub use context::{ContextEntry, ContextEntryType, EntryExample, EntryMetadata, EntrySource};
pub use context_manager::ContextManager;
pub use curator::Curator;
pub use error::{Error, Result};
pub use generator::AceGenerator;
pub use matcher::{TaskMatcher, TaskRecord};
pub use reflector::{OutcomeClass, Reflector, WORKFLOW_ERROR_KINDS};
pub use trace::{ExecutionRecord, ExecutionTrace, FailureInfo, StepDetail};
