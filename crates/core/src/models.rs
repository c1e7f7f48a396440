//! # Prism Models
//!
//! Centralized LLM configuration types for the Prism system.
//! Shared by the planner, the worker pool and the synthesizer so that
//! every call in one orchestration run targets the same backend.

use serde::{Deserialize, Serialize};

/// Default model used when no override is configured
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default completion endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";

/// Environment variable holding the backend credential
pub const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Per-call timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Per-call timeout for synthesis, which produces the longest output
pub const DEFAULT_SYNTHESIS_TIMEOUT_SECS: u64 = 300;

/// Configuration for LLM model selection
///
/// ## Example
/// ```rust,ignore
/// use prism_core::models::ModelConfig;
///
/// let config = ModelConfig::new("claude-3-5-haiku-latest").with_max_tokens(2048);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Model name (e.g., "claude-sonnet-4-20250514")
    pub model: String,
    /// Maximum output tokens per completion
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Optional endpoint override (proxies, compatible gateways)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable the API key is read from
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            temperature: 0.0,
            base_url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// Create a new model config with default limits
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set base URL (for compatible endpoints)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}
