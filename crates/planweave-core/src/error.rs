//! Error types for planweave-core

use thiserror::Error;

/// Error type for plan generation, parsing, and execution
#[derive(Error, Debug)]
pub enum Error {
    /// Plan generation failed
    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    /// Plan JSON could not be parsed into a workflow
    #[error("Plan parsing failed: {0}")]
    PlanParsing(String),

    /// Plan shape or field validation failed
    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    /// A step failed during execution
    #[error("Plan execution failed at step {step_id:?}: {message}")]
    PlanExecution {
        /// Human-readable failure summary
        message: String,
        /// Step that failed, when known
        step_id: Option<u32>,
        /// Steps that completed before the failure
        executed_steps: Vec<u32>,
    },

    /// A step references a tool with no registered handle
    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    /// Dependency graph is malformed or cyclic
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// A `{{steps.N.field}}` reference could not be resolved
    #[error("Variable resolution failed: {0}")]
    VariableResolution(String),

    /// A tool call failed inside the tool
    #[error("Tool '{tool}' failed: {message}")]
    ToolInvocation {
        /// The tool that failed
        tool: String,
        /// Failure description
        message: String,
    },

    /// A tool returned a value that violates its contract
    #[error("Tool '{tool}' returned an invalid result: {message}")]
    ToolResultInvalid {
        /// The offending tool
        tool: String,
        /// What was wrong with the result
        message: String,
    },

    /// The session was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// A call exceeded its timeout
    #[error("Timeout after {0}s")]
    Timeout(u64),

    /// Model client failure
    #[error("Model error: {0}")]
    Model(#[from] planweave_llm::Error),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] planweave_store::Error),

    /// Vector index failure
    #[error("Search error: {0}")]
    Search(#[from] planweave_search::Error),

    /// Tool catalogue failure
    #[error("Tool error: {0}")]
    Tools(#[from] planweave_tools::Error),

    /// Adaptive context engine failure
    #[error("ACE error: {0}")]
    Ace(#[from] planweave_ace::Error),
}

impl Error {
    /// Stable kind string recorded in traces and used by the Reflector
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanGeneration(_) => "PlanGenerationError",
            Self::PlanParsing(_) => "PlanParsingError",
            Self::PlanValidation(_) => "PlanValidationError",
            Self::PlanExecution { .. } => "PlanExecutionError",
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::Dependency(_) => "DependencyError",
            Self::VariableResolution(_) => "VariableResolutionError",
            Self::ToolInvocation { .. } => "ToolError",
            Self::ToolResultInvalid { .. } => "ToolResultInvalid",
            Self::Cancelled => "Cancelled",
            Self::Timeout(_) => "Timeout",
            Self::Model(_) => "ModelClientError",
            Self::Storage(_) => "StorageError",
            Self::Search(_) => "SearchError",
            Self::Tools(_) => "ToolCatalogueError",
            Self::Ace(_) => "ACEError",
        }
    }

    /// Steps that completed before an execution failure
    #[must_use]
    pub fn executed_steps(&self) -> &[u32] {
        match self {
            Self::PlanExecution { executed_steps, .. } => executed_steps,
            _ => &[],
        }
    }
}

/// Result type for plan generation, parsing, and execution
pub type Result<T> = std::result::Result<T, Error>;
