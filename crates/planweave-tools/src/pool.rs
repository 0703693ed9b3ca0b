//! Tool pool: every tool the host has advertised

use crate::error::{Error, Result};
use crate::metadata::{Tool, ToolMetadata};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Pool of known tools
///
/// Insertion validates metadata completeness. The pool survives across
/// sessions; the registry is the per-session activated subset.
pub struct ToolPool {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Add a tool to the pool
    ///
    /// Fails with `InvalidMetadata` when the tool's metadata is incomplete;
    /// missing fields are a host programming error.
    pub fn insert(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let metadata = tool.metadata();
        metadata.validate()?;
        let name = metadata.name.clone();
        debug!(tool = %name, kind = %metadata.kind, "Tool added to pool");
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, tool);
        Ok(())
    }

    /// Get a tool handle by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Check whether a tool is pooled
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Sorted tool names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Metadata of every pooled tool, sorted by name
    #[must_use]
    pub fn list_metadata(&self) -> Vec<ToolMetadata> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut metadata: Vec<ToolMetadata> =
            tools.values().map(|t| t.metadata().clone()).collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }

    /// Render the catalogue of every pooled tool for a recommendation prompt
    #[must_use]
    pub fn catalogue(&self) -> String {
        let blocks: Vec<String> = self
            .list_metadata()
            .iter()
            .map(ToolMetadata::render_for_prompt)
            .collect();
        blocks.join("\n\n")
    }

    /// Number of pooled tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolPool {
    fn default() -> Self {
        Self::new()
    }
}
