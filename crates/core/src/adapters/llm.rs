//! # Language Model Adapter
//!
//! HTTP client for the configured LLM provider, and the JSON-completion
//! helper stage processors use. Provider differences are handled here once.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    classify_http_failure, AdapterError, AdapterRequest, Capability, CapabilityAdapter,
    IdempotencyKey, ScopedCapabilities,
};
use crate::models::{ModelConfig, WireFormat};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Language-model capability backed by a provider's HTTP API
pub struct LanguageModelAdapter {
    config: ModelConfig,
    api_key: String,
    client: reqwest::Client,
}

impl LanguageModelAdapter {
    pub fn new(config: ModelConfig, api_key: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Permanent(format!("http client: {}", e)))?;
        Ok(Self {
            config,
            api_key: api_key.into(),
            client,
        })
    }

    /// Build from the provider's API-key environment variable. `None` when
    /// the key is not set, which leaves the capability unregistered.
    pub fn from_env(config: ModelConfig, timeout: Duration) -> Option<Result<Self, AdapterError>> {
        let key = std::env::var(config.provider.api_key_env()).ok()?;
        if key.trim().is_empty() {
            return None;
        }
        Some(Self::new(config, key, timeout))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn request_body(&self, system: &str, prompt: &str) -> (String, Value) {
        let endpoint = self.config.endpoint();
        match self.config.provider.wire_format() {
            WireFormat::AnthropicMessages => (
                format!("{}/messages", endpoint),
                json!({
                    "model": self.config.model,
                    "max_tokens": self.config.max_tokens,
                    "system": system,
                    "messages": [{"role": "user", "content": prompt}],
                }),
            ),
            WireFormat::OpenAiChat => (
                format!("{}/chat/completions", endpoint),
                json!({
                    "model": self.config.model,
                    "max_tokens": self.config.max_tokens,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": prompt},
                    ],
                }),
            ),
        }
    }

    fn completion_text(&self, body: &Value) -> Option<String> {
        match self.config.provider.wire_format() {
            WireFormat::AnthropicMessages => body["content"].as_array().map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            }),
            WireFormat::OpenAiChat => body["choices"][0]["message"]["content"]
                .as_str()
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl CapabilityAdapter for LanguageModelAdapter {
    fn name(&self) -> &str {
        self.config.provider.display_name()
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::LanguageModel]
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<Value, AdapterError> {
        if request.operation != "complete" {
            return Err(AdapterError::Permanent(format!(
                "language model does not support '{}'",
                request.operation
            )));
        }
        let system = request.params["system"].as_str().unwrap_or_default();
        let prompt = request.params["prompt"]
            .as_str()
            .ok_or_else(|| AdapterError::Permanent("missing parameter 'prompt'".into()))?;

        let (url, body) = self.request_body(system, prompt);
        let builder = self.client.post(&url).json(&body);
        let builder = match self.config.provider.wire_format() {
            WireFormat::AnthropicMessages => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            WireFormat::OpenAiChat => builder.bearer_auth(&self.api_key),
        };

        // Completions have no side effects, so every failure is retry-safe.
        let response = builder.send().await.map_err(|e| {
            classify_http_failure(None, !e.is_connect(), true, &e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(Some(status.as_u16()), true, true, &detail));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Transient(format!("unreadable completion: {}", e)))?;
        let text = self
            .completion_text(&body)
            .ok_or_else(|| AdapterError::Transient("completion carried no text".into()))?;

        Ok(json!({ "text": text }))
    }
}

/// Strip markdown fences and surrounding prose from a model reply.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let start = trimmed.find(|c: char| c == '{' || c == '[');
    let end = trimmed.rfind(|c: char| c == '}' || c == ']');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

/// Ask the model for JSON and decode it into `T`.
///
/// Unparseable output counts as a transient failure: the same prompt is
/// likely to succeed on a re-invocation.
pub async fn complete_json<T: DeserializeOwned>(
    caps: &ScopedCapabilities,
    system: &str,
    prompt: &str,
    key: IdempotencyKey,
) -> Result<T, AdapterError> {
    let reply = caps
        .invoke(
            Capability::LanguageModel,
            "complete",
            json!({ "system": system, "prompt": prompt }),
            key,
        )
        .await?;

    let text = reply["text"]
        .as_str()
        .ok_or_else(|| AdapterError::Transient("completion carried no text".into()))?;

    serde_json::from_str(extract_json(text)).map_err(|e| {
        tracing::warn!(error = %e, "Model returned malformed JSON");
        AdapterError::Transient(format!("malformed model output: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterRegistry, ScriptedLanguageModel};
    use crate::models::LlmProvider;
    use crate::workflow::Stage;
    use serde::Deserialize;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug, Deserialize)]
    struct Answer {
        value: u32,
    }

    #[test]
    fn test_extract_json_strips_fences() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Sure! {\"a\": [1]} hope that helps"), "{\"a\": [1]}");
        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn test_wire_formats() {
        let anthropic = LanguageModelAdapter::new(ModelConfig::default(), "k", Duration::from_secs(1)).unwrap();
        let (url, body) = anthropic.request_body("sys", "hi");
        assert!(url.ends_with("/messages"));
        assert_eq!(body["system"], "sys");
        let text = anthropic.completion_text(&json!({"content": [{"type": "text", "text": "ok"}]}));
        assert_eq!(text.as_deref(), Some("ok"));

        let openai = LanguageModelAdapter::new(
            ModelConfig::with_provider(LlmProvider::OpenAI, "gpt-4o"),
            "k",
            Duration::from_secs(1),
        )
        .unwrap();
        let (url, body) = openai.request_body("sys", "hi");
        assert!(url.ends_with("/chat/completions"));
        assert_eq!(body["messages"][0]["role"], "system");
        let text = openai.completion_text(&json!({"choices": [{"message": {"content": "ok"}}]}));
        assert_eq!(text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_complete_json_classifies_garbage_as_transient() {
        let model = ScriptedLanguageModel::new();
        model.push_text("I cannot answer that");
        model.push_text("```json\n{\"value\": 7}\n```");
        let registry = AdapterRegistry::new(Duration::from_secs(1)).with(Arc::new(model));
        let caps = registry.scoped(&[Capability::LanguageModel], Instant::now() + Duration::from_secs(5));

        let key = || IdempotencyKey::new("r", Stage::Extraction, "llm");
        let err = complete_json::<Answer>(&caps, "s", "p", key()).await.unwrap_err();
        assert!(err.is_transient());

        let answer: Answer = complete_json(&caps, "s", "p", key()).await.unwrap();
        assert_eq!(answer.value, 7);
    }
}
