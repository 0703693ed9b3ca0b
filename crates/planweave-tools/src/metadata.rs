//! Tool metadata model and invocation contract

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Tool kind; governs whether a prompt parameter is expected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Pure code, no model call
    Function,
    /// Text-only model call
    Llm,
    /// Vision-language model call
    Vl,
}

impl ToolKind {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Llm => "llm",
            Self::Vl => "vl",
        }
    }

    /// Whether tools of this kind carry a prompt and an output schema
    #[must_use]
    pub fn is_model_backed(&self) -> bool {
        matches!(self, Self::Llm | Self::Vl)
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared shape of one input parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Value type, e.g. "string", "integer"
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the parameter must be present in `tool_input`
    #[serde(default)]
    pub required: bool,
    /// Default value when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl ParameterSpec {
    /// Create a required parameter of the given type
    #[must_use]
    pub fn required(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: true,
            default: None,
            description: description.into(),
        }
    }

    /// Create an optional parameter of the given type
    #[must_use]
    pub fn optional(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: false,
            default: None,
            description: description.into(),
        }
    }
}

/// Uniform tool metadata
///
/// Captured at pool insertion and immutable thereafter; regeneration by the
/// understanding agent produces a new version under the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Unique tool name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Tool kind
    pub kind: ToolKind,
    /// Declared input parameters
    #[serde(default)]
    pub input_parameters: BTreeMap<String, ParameterSpec>,
    /// JSON-schema fragment of the output; mandatory for `llm`/`vl` kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// What the tool can do (understanding agent)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// What it cannot do
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limitations: Vec<String>,
    /// How to use it well
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub best_practices: Vec<String>,
    /// When to reach for it
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub use_cases: Vec<String>,
    /// One-line purpose summary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_purpose: String,
    /// Hash of the analysed source, for understanding-agent cache hits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
}

impl ToolMetadata {
    /// Create metadata with the mandatory fields
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            input_parameters: BTreeMap::new(),
            output_schema: None,
            capabilities: Vec::new(),
            limitations: Vec::new(),
            best_practices: Vec::new(),
            use_cases: Vec::new(),
            tool_purpose: String::new(),
            code_hash: None,
        }
    }

    /// Add an input parameter
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.input_parameters.insert(name.into(), spec);
        self
    }

    /// Set the output schema
    #[must_use]
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Validate completeness for pool insertion
    ///
    /// Missing fields are a programming error in the host, so they are
    /// refused at registration rather than discovered mid-plan.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::InvalidMetadata {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };
        if self.name.trim().is_empty() {
            return fail("empty name");
        }
        if self.description.trim().is_empty() {
            return fail("empty description");
        }
        for (param, spec) in &self.input_parameters {
            if spec.kind.trim().is_empty() {
                return fail(&format!("parameter '{param}' has no type"));
            }
        }
        if self.kind.is_model_backed() {
            match &self.output_schema {
                None => return fail("llm/vl tools must declare an output_schema"),
                Some(schema) => {
                    let has_content = schema
                        .get("properties")
                        .and_then(|p| p.get("content"))
                        .is_some();
                    if !has_content {
                        return fail("output_schema must declare a 'content' property");
                    }
                }
            }
        }
        Ok(())
    }

    /// Field names declared by the output schema
    #[must_use]
    pub fn output_field_names(&self) -> Vec<String> {
        self.output_schema
            .as_ref()
            .and_then(|s| s.get("properties"))
            .and_then(|p| p.as_object())
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Patch the output schema so it declares a `content: string` property
    pub fn ensure_content_in_schema(&mut self) {
        let schema = self.output_schema.get_or_insert_with(|| {
            serde_json::json!({"type": "object", "properties": {}, "required": []})
        });
        let Some(obj) = schema.as_object_mut() else {
            return;
        };
        let properties = obj
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(properties) = properties.as_object_mut() {
            properties.entry("content").or_insert_with(|| {
                serde_json::json!({
                    "type": "string",
                    "description": "the complete result as a single text string"
                })
            });
        }
        let required = obj
            .entry("required")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(required) = required.as_array_mut() {
            if !required.iter().any(|v| v == "content") {
                required.push(Value::String("content".to_string()));
            }
        }
    }

    /// Render the prompt-facing catalogue entry for this tool
    ///
    /// Includes parameter shapes and output-schema field names so the model
    /// can write correct `{{steps.N.field}}` references.
    #[must_use]
    pub fn render_for_prompt(&self) -> String {
        let mut lines = vec![
            format!("Tool: {}", self.name),
            format!("Kind: {}", self.kind),
            format!("Description: {}", self.description),
        ];
        if !self.tool_purpose.is_empty() {
            lines.push(format!("Purpose: {}", self.tool_purpose));
        }

        let mut required = Vec::new();
        let mut optional = Vec::new();
        for (name, spec) in &self.input_parameters {
            let rendered = format!("  - {name}: {}  # {}", spec.kind, spec.description);
            if spec.required {
                required.push(rendered);
            } else {
                optional.push(rendered);
            }
        }
        if !required.is_empty() {
            lines.push("Required parameters (tool_input must include):".to_string());
            lines.extend(required);
        }
        if !optional.is_empty() {
            lines.push("Optional parameters:".to_string());
            lines.extend(optional);
        }

        if !self.capabilities.is_empty() {
            lines.push(format!("Capabilities: {}", self.capabilities.join("; ")));
        }
        if !self.limitations.is_empty() {
            lines.push(format!("Limitations: {}", self.limitations.join("; ")));
        }
        if !self.best_practices.is_empty() {
            lines.push(format!("Best practices: {}", self.best_practices.join("; ")));
        }
        if !self.use_cases.is_empty() {
            lines.push(format!("Use cases: {}", self.use_cases.join("; ")));
        }

        if let Some(schema) = &self.output_schema {
            lines.push(format!(
                "Output schema: {}",
                serde_json::to_string(schema).unwrap_or_default()
            ));
            let fields = self.output_field_names();
            if let Some(first) = fields.first() {
                lines.push(format!(
                    "Reference this tool's output as {{{{steps.N.{first}}}}} (fields: {})",
                    fields.join(", ")
                ));
            }
        }
        lines.join("\n")
    }
}

/// Invocation contract every tool implements
///
/// Tools receive resolved arguments as a JSON map and return an opaque JSON
/// value. The executor validates that the value is a mapping; the engine
/// never interprets it beyond the `content` requirement for model-backed
/// tools. Implementations may close over per-tool clients but must be safe
/// to call from the worker pool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's metadata
    fn metadata(&self) -> &ToolMetadata;

    /// Invoke the tool with resolved arguments
    async fn invoke(&self, args: Map<String, Value>) -> anyhow::Result<Value>;
}

type SyncToolFn = dyn Fn(Map<String, Value>) -> anyhow::Result<Value> + Send + Sync;

/// Tool backed by a synchronous closure
///
/// The host adapts real tools behind this; tests script step behaviour with
/// it directly.
pub struct FnTool {
    metadata: ToolMetadata,
    func: Arc<SyncToolFn>,
}

impl FnTool {
    /// Wrap a closure as a tool
    pub fn new<F>(metadata: ToolMetadata, func: F) -> Self
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            metadata,
            func: Arc::new(func),
        }
    }

    /// Wrap a closure as a shared tool handle
    pub fn shared<F>(metadata: ToolMetadata, func: F) -> Arc<dyn Tool>
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Arc::new(Self::new(metadata, func))
    }
}

#[async_trait]
impl Tool for FnTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn invoke(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        (self.func)(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn llm_metadata() -> ToolMetadata {
        ToolMetadata::new("general_llm_processor", "Run an LLM over text", ToolKind::Llm)
            .with_parameter("prompt", ParameterSpec::required("string", "task prompt"))
            .with_output_schema(json!({
                "type": "object",
                "properties": {"content": {"type": "string"}},
                "required": ["content"]
            }))
    }

    #[test]
    fn test_validate_accepts_complete_metadata() {
        assert!(llm_metadata().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_llm_without_schema() {
        let metadata = ToolMetadata::new("bad", "desc", ToolKind::Llm);
        assert!(matches!(
            metadata.validate(),
            Err(Error::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_schema_without_content() {
        let metadata = ToolMetadata::new("bad", "desc", ToolKind::Vl).with_output_schema(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}}
        }));
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_validate_allows_function_without_schema() {
        let metadata = ToolMetadata::new("scroll", "Scroll the window", ToolKind::Function);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_ensure_content_in_schema_adds_property() {
        let mut metadata = ToolMetadata::new("vl", "extract", ToolKind::Vl)
            .with_output_schema(json!({"type": "object", "properties": {"text": {}}}));
        metadata.ensure_content_in_schema();

        let schema = metadata.output_schema.unwrap();
        assert!(schema["properties"]["content"].is_object());
        assert!(schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "content"));
    }

    #[test]
    fn test_output_field_names() {
        let fields = llm_metadata().output_field_names();
        assert_eq!(fields, vec!["content".to_string()]);
    }

    #[test]
    fn test_render_for_prompt_mentions_reference_syntax() {
        let rendered = llm_metadata().render_for_prompt();
        assert!(rendered.contains("general_llm_processor"));
        assert!(rendered.contains("{{steps.N.content}}"));
        assert!(rendered.contains("Required parameters"));
    }

    #[tokio::test]
    async fn test_fn_tool_invokes() {
        let tool = FnTool::new(
            ToolMetadata::new("echo", "Echo input", ToolKind::Function),
            |args| Ok(json!({"content": args["text"]})),
        );
        let mut args = Map::new();
        args.insert("text".to_string(), json!("hi"));
        let out = tool.invoke(args).await.unwrap();
        assert_eq!(out["content"], "hi");
    }
}
