//! Tool understanding agent: model-derived metadata manifests

use crate::error::Result;
use crate::metadata::{Tool, ToolMetadata};
use planweave_llm::{ChatOptions, SharedModelClient};
use planweave_store::StorageManager;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Derives structured metadata for pool tools
///
/// Results are cached per source hash; a matching hash skips the model call
/// entirely. Analysis failure never fails registration; the declared
/// metadata is the fallback.
pub struct ToolUnderstandingAgent {
    model: SharedModelClient,
    storage: StorageManager,
}

impl ToolUnderstandingAgent {
    /// Create an understanding agent
    #[must_use]
    pub fn new(model: SharedModelClient, storage: StorageManager) -> Self {
        Self { model, storage }
    }

    /// Produce the metadata manifest for a tool
    ///
    /// `source` is the tool's source text when the host can provide it; the
    /// declared metadata alone is hashed otherwise.
    pub async fn analyze(&self, tool: &dyn Tool, source: Option<&str>) -> Result<ToolMetadata> {
        let declared = tool.metadata().clone();
        let code_hash = Self::hash_source(&declared, source);

        if let Some(cached) = self
            .storage
            .load_tool_metadata::<ToolMetadata>(&declared.name)
        {
            if cached.code_hash.as_deref() == Some(code_hash.as_str()) {
                debug!(tool = %declared.name, "Metadata cache hit");
                return Ok(cached);
            }
        }

        let mut manifest = match self.analyze_with_model(&declared, source).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(tool = %declared.name, error = %e, "Tool analysis failed, keeping declared metadata");
                declared.clone()
            }
        };
        manifest.code_hash = Some(code_hash);
        if manifest.kind.is_model_backed() {
            manifest.ensure_content_in_schema();
        }

        self.storage
            .save_tool_metadata(&manifest.name, &manifest)?;
        info!(tool = %manifest.name, "Tool metadata manifest saved");
        Ok(manifest)
    }

    async fn analyze_with_model(
        &self,
        declared: &ToolMetadata,
        source: Option<&str>,
    ) -> Result<ToolMetadata> {
        let prompt = Self::build_analysis_prompt(declared, source);
        let (value, _completion) = self
            .model
            .complete_json(&prompt, &ChatOptions::default())
            .await?;

        let mut manifest = declared.clone();
        manifest.capabilities = string_list(&value, "capabilities");
        manifest.limitations = string_list(&value, "limitations");
        manifest.best_practices = string_list(&value, "best_practices");
        manifest.use_cases = string_list(&value, "use_cases");
        if let Some(purpose) = value.get("tool_purpose").and_then(|v| v.as_str()) {
            manifest.tool_purpose = purpose.to_string();
        }
        Ok(manifest)
    }

    fn build_analysis_prompt(declared: &ToolMetadata, source: Option<&str>) -> String {
        let mut prompt = format!(
            "Analyse the following tool and describe how a planner should use it.\n\n\
             Name: {}\n\
             Kind: {}\n\
             Declared description: {}\n\
             Declared parameters: {}\n",
            declared.name,
            declared.kind,
            declared.description,
            serde_json::to_string(&declared.input_parameters).unwrap_or_default(),
        );
        if let Some(schema) = &declared.output_schema {
            prompt.push_str(&format!(
                "Output schema: {}\n",
                serde_json::to_string(schema).unwrap_or_default()
            ));
        }
        if let Some(source) = source {
            prompt.push_str(&format!("\nSource:\n{source}\n"));
        }
        prompt.push_str(
            "\nReturn JSON only:\n\
             {\n\
               \"capabilities\": [\"what the tool can do, one item per concrete ability\"],\n\
               \"limitations\": [\"what it cannot do or where it degrades\"],\n\
               \"best_practices\": [\"how to call it for good results\"],\n\
               \"use_cases\": [\"tasks it fits\"],\n\
               \"tool_purpose\": \"one-sentence core purpose\"\n\
             }",
        );
        prompt
    }

    fn hash_source(declared: &ToolMetadata, source: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        match source {
            Some(source) => hasher.update(source.as_bytes()),
            None => {
                let serialized = serde_json::to_string(declared).unwrap_or_default();
                hasher.update(serialized.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

fn string_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
