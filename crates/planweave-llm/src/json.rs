//! Tolerant JSON extraction from model responses
//!
//! Models wrap JSON in prose, Markdown fences, or truncate it mid-object.
//! The pipeline tries, in order: raw parse, fence stripping, balanced-object
//! slicing, truncation repair (appending the missing closers). Only when all
//! strategies miss does extraction fail.

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

static FENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("FENCE_REGEX is a compile-time constant")
});

/// Extract a JSON value from raw model output
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();

    // Strategy 1: the response is already valid JSON
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Strategy 2: JSON inside a Markdown fence
    if let Some(captures) = FENCE_REGEX.captures(trimmed) {
        if let Some(inner) = captures.get(1) {
            if let Ok(value) = serde_json::from_str(inner.as_str().trim()) {
                debug!("Extracted JSON from fenced block");
                return Ok(value);
            }
        }
    }

    // Strategy 3: slice from the first '{' to the last '}'
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            let slice = &trimmed[start..=end];
            if let Ok(value) = serde_json::from_str(slice) {
                debug!("Extracted JSON by object slicing");
                return Ok(value);
            }
        }
    }

    // Strategy 4: truncated object, append the missing closers
    if let Some(start) = trimmed.find('{') {
        let tail = trimmed[start..].trim_end();
        if let Some(repaired) = repair_truncated(tail) {
            if let Ok(value) = serde_json::from_str(&repaired) {
                warn!("Recovered truncated JSON by appending closers");
                return Ok(value);
            }
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(Error::Parse(format!(
        "no JSON object found in response (len {}): {preview}",
        trimmed.len()
    )))
}

/// Append the closers a truncated object is missing
///
/// Tracks unmatched openers outside string literals and closes them
/// innermost-first. Returns `None` when the text is already balanced
/// (nothing to repair).
fn repair_truncated(text: &str) -> Option<String> {
    let mut pending: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => pending.push('}'),
            '[' if !in_string => pending.push(']'),
            '}' | ']' if !in_string => {
                pending.pop();
            }
            _ => {}
        }
    }

    if pending.is_empty() && !in_string {
        return None;
    }

    let mut repaired = text.to_string();
    // A truncated string literal needs its closing quote first
    if in_string {
        repaired.push('"');
    }
    // Strip a trailing comma left by mid-list truncation
    while repaired.ends_with(',') || repaired.ends_with(' ') {
        repaired.pop();
    }
    while let Some(closer) = pending.pop() {
        repaired.push(closer);
    }
    Some(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_json() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_fenced_json() {
        let value = extract_json("Sure!\n```json\n{\"a\": [1, 2]}\n```\nDone.").unwrap();
        assert_eq!(value["a"][1], 2);
    }

    #[test]
    fn test_fence_without_language_tag() {
        let value = extract_json("```\n{\"b\": \"x\"}\n```").unwrap();
        assert_eq!(value["b"], "x");
    }

    #[test]
    fn test_object_embedded_in_prose() {
        let value = extract_json("The plan is {\"steps\": []} as requested.").unwrap();
        assert!(value["steps"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_object_repaired() {
        let value = extract_json(r#"{"steps": [{"step_id": 1, "tool": "ocr""#).unwrap();
        assert_eq!(value["steps"][0]["step_id"], 1);
        assert_eq!(value["steps"][0]["tool"], "ocr");
    }

    #[test]
    fn test_truncated_list_with_trailing_comma() {
        let value = extract_json(r#"{"tools": ["a", "b","#).unwrap();
        assert_eq!(value["tools"][1], "b");
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let value = extract_json(r#"{"text": "a } b { c"}"#).unwrap();
        assert_eq!(value["text"], "a } b { c");
    }

    #[test]
    fn test_no_json_fails() {
        let err = extract_json("I cannot help with that.").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
