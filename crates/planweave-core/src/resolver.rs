//! Variable resolver for `{{steps.N.field}}` references
//!
//! Double-brace references are primary; the single-brace legacy form is
//! accepted but substituted only where it does not overlap a double-brace
//! match. When an entire value is a single reference the referenced value is
//! returned with its type preserved; references mixed with literal text
//! stringify.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

static DOUBLE_BRACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{steps\.(\d+)\.([^}]+)\}\}").expect("DOUBLE_BRACE is a compile-time constant")
});
static SINGLE_BRACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{steps\.(\d+)\.([^}]+)\}").expect("SINGLE_BRACE is a compile-time constant")
});
/// The schema placeholder model-backed tools may embed in their prompts
const SCHEMA_PLACEHOLDER: &str = "{{current_tool_schema}}";

/// One recorded substitution
#[derive(Debug, Clone)]
pub struct Replacement {
    /// The matched placeholder text
    pub placeholder: String,
    /// The value substituted in
    pub value: Value,
    /// JSON type name of the value
    pub value_type: &'static str,
}

struct ReferenceMatch {
    start: usize,
    end: usize,
    step_id: u32,
    field_path: String,
}

/// Resolves references against prior step outputs
pub struct VariableResolver {
    steps: BTreeMap<u32, Value>,
    current_tool_schema: Option<String>,
    replacements: Vec<Replacement>,
}

impl VariableResolver {
    /// Create a resolver over the outputs of executed steps
    #[must_use]
    pub fn new(steps: BTreeMap<u32, Value>) -> Self {
        Self {
            steps,
            current_tool_schema: None,
            replacements: Vec::new(),
        }
    }

    /// Make the invoked tool's output schema available to its own prompt
    #[must_use]
    pub fn with_current_tool_schema(mut self, schema: Option<String>) -> Self {
        self.current_tool_schema = schema;
        self
    }

    /// Resolve every reference in a value tree
    pub fn resolve(&mut self, value: &Value) -> Result<Value> {
        match value {
            Value::String(text) => self.resolve_string(text),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, inner) in map {
                    resolved.insert(key.clone(), self.resolve(inner)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => {
                let resolved: Result<Vec<Value>> =
                    items.iter().map(|item| self.resolve(item)).collect();
                Ok(Value::Array(resolved?))
            }
            other => Ok(other.clone()),
        }
    }

    /// Substitutions performed so far
    #[must_use]
    pub fn replacements(&self) -> &[Replacement] {
        &self.replacements
    }

    /// Whether a value tree contains any reference (either brace form)
    #[must_use]
    pub fn has_references(value: &Value) -> bool {
        match value {
            Value::String(text) => {
                DOUBLE_BRACE.is_match(text) || SINGLE_BRACE.is_match(text)
            }
            Value::Object(map) => map.values().any(Self::has_references),
            Value::Array(items) => items.iter().any(Self::has_references),
            _ => false,
        }
    }

    /// Step ids referenced anywhere in a value tree
    #[must_use]
    pub fn referenced_steps(value: &Value) -> Vec<u32> {
        let mut ids = Vec::new();
        Self::collect_referenced_steps(value, &mut ids);
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn collect_referenced_steps(value: &Value, ids: &mut Vec<u32>) {
        match value {
            Value::String(text) => {
                for captures in DOUBLE_BRACE.captures_iter(text) {
                    if let Ok(id) = captures[1].parse() {
                        ids.push(id);
                    }
                }
                for captures in SINGLE_BRACE.captures_iter(text) {
                    if let Ok(id) = captures[1].parse() {
                        ids.push(id);
                    }
                }
            }
            Value::Object(map) => {
                for inner in map.values() {
                    Self::collect_referenced_steps(inner, ids);
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::collect_referenced_steps(item, ids);
                }
            }
            _ => {}
        }
    }

    fn resolve_string(&mut self, text: &str) -> Result<Value> {
        let text = self.substitute_schema_placeholder(text);
        let matches = Self::find_matches(&text);
        if matches.is_empty() {
            return Ok(Value::String(text));
        }

        // The whole value is one reference: preserve the original type
        if matches.len() == 1 && matches[0].start == 0 && matches[0].end == text.len() {
            let value = self.extract_value(matches[0].step_id, &matches[0].field_path)?;
            self.record(&text[matches[0].start..matches[0].end], &value);
            return Ok(value);
        }

        // Mixed with literal text: substitute stringified values,
        // double-brace matches first, then the remaining single-brace ones
        let mut result = String::with_capacity(text.len());
        let mut cursor = 0;
        for reference in &matches {
            result.push_str(&text[cursor..reference.start]);
            let value = self.extract_value(reference.step_id, &reference.field_path)?;
            self.record(&text[reference.start..reference.end], &value);
            result.push_str(&value_to_string(&value));
            cursor = reference.end;
        }
        result.push_str(&text[cursor..]);
        Ok(Value::String(result))
    }

    fn substitute_schema_placeholder(&self, text: &str) -> String {
        match (&self.current_tool_schema, text.contains(SCHEMA_PLACEHOLDER)) {
            (Some(schema), true) => text.replace(SCHEMA_PLACEHOLDER, schema),
            _ => text.to_string(),
        }
    }

    /// Collect reference matches: every double-brace match, plus single-brace
    /// matches on spans no double-brace match touches. Sorted by position.
    fn find_matches(text: &str) -> Vec<ReferenceMatch> {
        let mut matches: Vec<ReferenceMatch> = DOUBLE_BRACE
            .captures_iter(text)
            .filter_map(|captures| {
                let whole = captures.get(0)?;
                Some(ReferenceMatch {
                    start: whole.start(),
                    end: whole.end(),
                    step_id: captures[1].parse().ok()?,
                    field_path: captures[2].to_string(),
                })
            })
            .collect();

        let double_spans: Vec<(usize, usize)> =
            matches.iter().map(|m| (m.start, m.end)).collect();
        for captures in SINGLE_BRACE.captures_iter(text) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let overlaps = double_spans
                .iter()
                .any(|(start, end)| whole.start() < *end && whole.end() > *start);
            if overlaps {
                continue;
            }
            let Ok(step_id) = captures[1].parse() else {
                continue;
            };
            matches.push(ReferenceMatch {
                start: whole.start(),
                end: whole.end(),
                step_id,
                field_path: captures[2].to_string(),
            });
        }
        matches.sort_by_key(|m| m.start);
        matches
    }

    fn extract_value(&self, step_id: u32, field_path: &str) -> Result<Value> {
        let step_result = self.steps.get(&step_id).ok_or_else(|| {
            Error::VariableResolution(format!("no result for step {step_id}"))
        })?;

        let mut current = step_result;
        for field in field_path.split('.') {
            current = match field.find('[') {
                Some(bracket) => {
                    let close = field.find(']').ok_or_else(|| {
                        Error::VariableResolution(format!("malformed index in '{field}'"))
                    })?;
                    let name = &field[..bracket];
                    let index: usize = field[bracket + 1..close].parse().map_err(|_| {
                        Error::VariableResolution(format!(
                            "invalid array index in '{field}'"
                        ))
                    })?;

                    let container = if name.is_empty() {
                        current
                    } else {
                        current.get(name).ok_or_else(|| {
                            Error::VariableResolution(format!(
                                "step {step_id} result has no field '{name}'"
                            ))
                        })?
                    };
                    let items = container.as_array().ok_or_else(|| {
                        Error::VariableResolution(format!("field '{name}' is not an array"))
                    })?;
                    items.get(index).ok_or_else(|| {
                        Error::VariableResolution(format!(
                            "index {index} out of range for field '{name}' (len {})",
                            items.len()
                        ))
                    })?
                }
                None => current.get(field).ok_or_else(|| {
                    Error::VariableResolution(format!(
                        "step {step_id} result has no field '{field}'"
                    ))
                })?,
            };
        }
        Ok(current.clone())
    }

    fn record(&mut self, placeholder: &str, value: &Value) {
        debug!(placeholder, "Placeholder resolved");
        self.replacements.push(Replacement {
            placeholder: placeholder.to_string(),
            value: value.clone(),
            value_type: json_type_name(value),
        });
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Python-style stringification for mixed-text substitution
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
