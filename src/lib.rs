//! Planweave - Self-Improving Workflow Orchestration
//!
//! Planweave turns a natural-language request plus a pool of registered
//! tools into a validated, dependency-ordered execution plan, runs that plan
//! while streaming progress, and learns from every execution so subsequent
//! plans for similar requests get faster and better.
//!
//! This crate re-exports the workspace:
//! - [`core`]: plan model, parser, resolver, executor, generator, orchestrator
//! - [`ace`]: the adaptive context engine (traces, reflection, curation)
//! - [`tools`]: tool pool, registry, and metadata derivation
//! - [`search`]: the vector index and task retrieval substrate
//! - [`store`]: the layered JSON storage
//! - [`llm`]: the model client capability surface
//!
//! # Example
//!
//! ```ignore
//! use planweave::core::{Orchestrator, OrchestratorConfig};
//!
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::with_work_dir("./planweave-data"),
//!     model_client,
//!     embedding_provider,
//! )?;
//! orchestrator.add_tool(my_tool)?;
//!
//! let plan = orchestrator.generate_plan("summarise the chat", None).await?;
//! let result = orchestrator.execute_plan(&plan, None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use planweave_ace as ace;
pub use planweave_core as core;
pub use planweave_llm as llm;
pub use planweave_search as search;
pub use planweave_store as store;
pub use planweave_tools as tools;

pub use planweave_core::{Orchestrator, OrchestratorConfig};
