//! Tool registry: the subset activated for planning and execution

use crate::error::{Error, Result};
use crate::metadata::{Tool, ToolMetadata};
use crate::pool::ToolPool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Registry of activated tools
///
/// A tool moves from pool to registry when recommended for a request or
/// required by a reused plan. Effectively append-only within a session; the
/// orchestrator clears it between unrelated sessions.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Activate a pooled tool by name
    pub fn activate(&self, pool: &ToolPool, name: &str) -> Result<()> {
        let tool = pool.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        debug!(tool = %name, "Tool activated");
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), tool);
        Ok(())
    }

    /// Register a tool handle directly (bypassing the pool)
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.metadata().name.clone();
        debug!(tool = %name, "Tool registered");
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, tool);
    }

    /// Get an activated tool handle
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Metadata of an activated tool
    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<ToolMetadata> {
        self.get(name).map(|t| t.metadata().clone())
    }

    /// Check whether a tool is activated
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Sorted activated tool names
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

    /// Snapshot of every activated handle, keyed by name
    #[must_use]
    pub fn handles(&self) -> HashMap<String, Arc<dyn Tool>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Render the catalogue of activated tools for the planning prompt
    #[must_use]
    pub fn catalogue(&self) -> String {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut metadata: Vec<&Arc<dyn Tool>> = tools.values().collect();
        metadata.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        if metadata.is_empty() {
            return "No tools available".to_string();
        }
        metadata
            .iter()
            .map(|t| t.metadata().render_for_prompt())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Number of activated tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the registry between unrelated sessions
    pub fn clear(&self) {
        self.tools.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FnTool, ToolKind};

    fn pool_with(names: &[&str]) -> ToolPool {
        let pool = ToolPool::new();
        for name in names {
            pool.insert(FnTool::shared(
                ToolMetadata::new(*name, format!("{name} tool"), ToolKind::Function),
                |args| Ok(serde_json::Value::Object(args)),
            ))
            .unwrap();
        }
        pool
    }

    #[test]
    fn test_activate_from_pool() {
        let pool = pool_with(&["ocr", "scroll"]);
        let registry = ToolRegistry::new();

        registry.activate(&pool, "ocr").unwrap();
        assert!(registry.has("ocr"));
        assert!(!registry.has("scroll"));
        assert_eq!(registry.names(), vec!["ocr".to_string()]);
    }

    #[test]
    fn test_activate_unknown_tool_fails() {
        let pool = pool_with(&[]);
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.activate(&pool, "nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_clear() {
        let pool = pool_with(&["ocr"]);
        let registry = ToolRegistry::new();
        registry.activate(&pool, "ocr").unwrap();

        registry.clear();
        assert!(registry.is_empty());
        assert!(pool.contains("ocr"));
    }

    #[test]
    fn test_empty_catalogue_message() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.catalogue(), "No tools available");
    }
}
