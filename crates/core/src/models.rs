//! # SuperMon Models
//!
//! Language-model provider and model selection for the language-model
//! capability adapter.

use serde::{Deserialize, Serialize};

/// Supported LLM providers
///
/// - Anthropic (Claude) - `ANTHROPIC_API_KEY`
/// - OpenAI (GPT) - `OPENAI_API_KEY`
/// - Gemini (Google) - `GEMINI_API_KEY`
/// - OpenRouter (Gateway) - `OPENROUTER_API_KEY`
/// - Grok (xAI) - `XAI_API_KEY`
/// - DeepSeek - `DEEPSEEK_API_KEY`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    OpenRouter,
    Grok,
    DeepSeek,
}

/// Request/response shape spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `POST /messages`
    AnthropicMessages,
    /// `POST /chat/completions`
    OpenAiChat,
}

impl LlmProvider {
    /// Get all available providers
    pub fn all() -> Vec<LlmProvider> {
        vec![
            LlmProvider::Anthropic,
            LlmProvider::OpenAI,
            LlmProvider::Gemini,
            LlmProvider::OpenRouter,
            LlmProvider::Grok,
            LlmProvider::DeepSeek,
        ]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(LlmProvider::Anthropic),
            "openai" => Some(LlmProvider::OpenAI),
            "gemini" | "google" => Some(LlmProvider::Gemini),
            "openrouter" => Some(LlmProvider::OpenRouter),
            "grok" | "xai" => Some(LlmProvider::Grok),
            "deepseek" => Some(LlmProvider::DeepSeek),
            _ => None,
        }
    }

    /// Display name for logs and the API
    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "Anthropic",
            LlmProvider::OpenAI => "OpenAI",
            LlmProvider::Gemini => "Gemini",
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::Grok => "Grok",
            LlmProvider::DeepSeek => "DeepSeek",
        }
    }

    /// Environment variable holding the API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::Gemini => "GEMINI_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
            LlmProvider::Grok => "XAI_API_KEY",
            LlmProvider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::OpenAI => "https://api.openai.com/v1",
            LlmProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
            LlmProvider::Grok => "https://api.x.ai/v1",
            LlmProvider::DeepSeek => "https://api.deepseek.com/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAI => "gpt-4o",
            LlmProvider::Gemini => "gemini-2.0-flash",
            LlmProvider::OpenRouter => "anthropic/claude-sonnet-4",
            LlmProvider::Grok => "grok-2-latest",
            LlmProvider::DeepSeek => "deepseek-chat",
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        match self {
            LlmProvider::Anthropic => WireFormat::AnthropicMessages,
            _ => WireFormat::OpenAiChat,
        }
    }

    /// Whether this provider supports custom base URL
    pub fn supports_base_url(&self) -> bool {
        matches!(self.wire_format(), WireFormat::OpenAiChat)
    }
}

/// Configuration for LLM model selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// LLM provider to use
    #[serde(default)]
    pub provider: LlmProvider,
    /// Model name (e.g., "claude-sonnet-4-20250514", "gpt-4o")
    pub model: String,
    /// Optional base URL override for OpenAI-compatible APIs
    #[serde(default)]
    pub base_url: Option<String>,
    /// Completion token limit
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::with_provider(LlmProvider::Anthropic, LlmProvider::Anthropic.default_model())
    }
}

impl ModelConfig {
    /// Create config for a specific provider
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            max_tokens: default_max_tokens(),
        }
    }

    /// Set base URL (for OpenAI-compatible endpoints)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Selection from `SUPERMON_LLM_PROVIDER`, `SUPERMON_LLM_MODEL` and
    /// `SUPERMON_LLM_BASE_URL`, defaulting to Anthropic.
    pub fn from_env() -> Self {
        let provider = std::env::var("SUPERMON_LLM_PROVIDER")
            .ok()
            .and_then(|p| LlmProvider::parse(&p))
            .unwrap_or_default();
        let model = std::env::var("SUPERMON_LLM_MODEL")
            .unwrap_or_else(|_| provider.default_model().to_string());
        let mut config = Self::with_provider(provider, model);
        if let Ok(url) = std::env::var("SUPERMON_LLM_BASE_URL") {
            if provider.supports_base_url() && !url.trim().is_empty() {
                config = config.with_base_url(url);
            }
        }
        config
    }

    /// Base URL actually used for requests
    pub fn endpoint(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.provider, LlmProvider::Anthropic);
        assert!(config.model.contains("claude"));
        assert_eq!(config.endpoint(), "https://api.anthropic.com/v1");
    }

    #[test]
    fn test_provider_parse_and_display() {
        assert_eq!(LlmProvider::parse("OpenAI"), Some(LlmProvider::OpenAI));
        assert_eq!(LlmProvider::parse("xai"), Some(LlmProvider::Grok));
        assert_eq!(LlmProvider::parse("mystery"), None);
        assert_eq!(LlmProvider::Anthropic.display_name(), "Anthropic");
    }

    #[test]
    fn test_base_url_support() {
        assert!(LlmProvider::OpenAI.supports_base_url());
        assert!(!LlmProvider::Anthropic.supports_base_url());

        let config = ModelConfig::with_provider(LlmProvider::OpenAI, "local")
            .with_base_url("http://localhost:11434/v1/");
        assert_eq!(config.endpoint(), "http://localhost:11434/v1");
    }

    #[test]
    fn test_model_config_serialization() {
        let config = ModelConfig::with_provider(LlmProvider::OpenAI, "gpt-4o");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("openai"));
        assert!(json.contains("gpt-4o"));

        let back: ModelConfig = serde_json::from_str(r#"{"model": "x"}"#).unwrap();
        assert_eq!(back.provider, LlmProvider::Anthropic);
        assert_eq!(back.max_tokens, 4096);
    }
}
