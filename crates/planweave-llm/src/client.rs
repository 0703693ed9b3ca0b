//! Model client trait and scripted mock implementation
//!
//! The engine treats the model client as pure capability: no hidden state,
//! no retries beyond what `ChatOptions` configures. Every completion carries
//! its duration and truncated previews so callers can forward them into logs
//! and reflection chains.

use crate::error::{Error, Result};
use crate::json::extract_json;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Maximum characters kept in prompt/response previews
const PREVIEW_CHARS: usize = 200;

/// Per-call generation options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Maximum tokens for the response
    pub max_tokens: Option<u32>,
    /// Call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ChatOptions {
    /// Create options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the timeout in seconds
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Static information about the backing model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider name (e.g. "openai-compatible")
    pub provider: String,
    /// Model identifier
    pub model: String,
}

/// A finished completion with observability data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Response text
    pub text: String,
    /// Wall-clock duration in seconds
    pub duration: f64,
    /// Truncated prompt preview
    pub prompt_preview: String,
    /// Truncated response preview
    pub response_preview: String,
}

impl Completion {
    /// Build a completion from raw text, stamping previews and duration
    #[must_use]
    pub fn new(prompt: &str, text: String, duration: f64) -> Self {
        let prompt_preview = truncate_chars(prompt, PREVIEW_CHARS);
        let response_preview = truncate_chars(&text, PREVIEW_CHARS);
        Self {
            text,
            duration,
            prompt_preview,
            response_preview,
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}...")
    }
}

/// Trait for chat-completion backends
///
/// Implementations must be safe to call concurrently from worker tasks.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run a completion and return the response text with observability data
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        options: &ChatOptions,
    ) -> Result<Completion>;

    /// Get static model information
    fn model_info(&self) -> ModelInfo;

    /// Run a completion and extract a JSON value from the response
    ///
    /// Applies the tolerant extraction pipeline: raw parse, fence stripping,
    /// balanced-object slicing, truncation repair. Fails with `Error::Parse`
    /// only after every strategy misses.
    async fn complete_json(
        &self,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<(serde_json::Value, Completion)> {
        let completion = self.complete(prompt, None, options).await?;
        let value = extract_json(&completion.text)?;
        debug!(
            duration = completion.duration,
            response_len = completion.text.len(),
            "Extracted JSON from completion"
        );
        Ok((value, completion))
    }
}

/// Shared model client handle
pub type SharedModelClient = Arc<dyn ModelClient>;

/// Scripted model client for tests and offline wiring
///
/// Responses are popped FIFO; when the queue is empty the fallback response
/// is returned. Every prompt is recorded for assertion.
pub struct MockModelClient {
    responses: Mutex<VecDeque<String>>,
    fallback: String,
    calls: Mutex<Vec<String>>,
}

impl MockModelClient {
    /// Create a mock with no scripted responses and a `{}` fallback
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: "{}".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always answers with the same text
    #[must_use]
    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a scripted response
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response.into());
    }

    /// Prompts seen so far, in call order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of completions served
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn complete(
        &self,
        prompt: &str,
        _system_prompt: Option<&str>,
        _options: &ChatOptions,
    ) -> Result<Completion> {
        let start = Instant::now();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        let text = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        Ok(Completion::new(
            prompt,
            text,
            start.elapsed().as_secs_f64(),
        ))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "mock".to_string(),
            model: "mock-chat".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_pops_responses_in_order() {
        let client = MockModelClient::new();
        client.push_response("first");
        client.push_response("second");

        let a = client
            .complete("p1", None, &ChatOptions::default())
            .await
            .unwrap();
        let b = client
            .complete("p2", None, &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert_eq!(client.calls(), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_falls_back_when_empty() {
        let client = MockModelClient::with_fallback("done");
        let c = client
            .complete("p", None, &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(c.text, "done");
    }

    #[tokio::test]
    async fn test_complete_json_extracts_value() {
        let client = MockModelClient::new();
        client.push_response(r#"Here you go: ```json {"ok": true} ```"#);

        let (value, completion) = client
            .complete_json("p", &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
        assert!(completion.prompt_preview.starts_with('p'));
    }

    #[test]
    fn test_completion_previews_truncate() {
        let long = "x".repeat(500);
        let c = Completion::new(&long, long.clone(), 0.1);
        assert!(c.prompt_preview.ends_with("..."));
        assert!(c.prompt_preview.len() < long.len());
    }

    #[test]
    fn test_chat_options_builder() {
        let options = ChatOptions::new().with_temperature(0.2).with_timeout(30);
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.timeout_secs, 30);
    }
}
