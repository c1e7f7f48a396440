//! Request and response types for a single completion call.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A system content block, optionally annotated for remote caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    /// Request the backend to cache everything up to and including this block
    #[serde(default)]
    pub cache: bool,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cache: false,
        }
    }

    pub fn cached(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One completion request. Credentials are never part of it; the backend
/// attaches them at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-attempt limit overriding the client's default
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            model: model.into(),
            system: Vec::new(),
            messages: Vec::new(),
            max_tokens,
            temperature,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_system(mut self, block: SystemBlock) -> Self {
        self.system.push(block);
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Whether any system block carries a cache annotation
    pub fn requests_cache(&self) -> bool {
        self.system.iter().any(|b| b.cache)
    }

    /// Text of the last user message, used by tests and logging
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Serialize to the backend wire format
    pub fn to_body(&self, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": stream,
            "messages": self.messages,
        });

        // A plain string when no block needs annotation, a block list otherwise
        if self.system.len() == 1 && !self.system[0].cache {
            body["system"] = serde_json::json!(self.system[0].text);
        } else if !self.system.is_empty() {
            let blocks: Vec<serde_json::Value> = self
                .system
                .iter()
                .map(|b| {
                    let mut block = serde_json::json!({ "type": "text", "text": b.text });
                    if b.cache {
                        block["cache_control"] = serde_json::json!({ "type": "ephemeral" });
                    }
                    block
                })
                .collect();
            body["system"] = serde_json::json!(blocks);
        }

        body
    }
}

/// Token accounting for one or more calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_creation_tokens: u32,
}

impl UsageStats {
    pub fn add(&mut self, other: &UsageStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}

/// Result of a completed call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: UsageStats,
    pub stop_reason: Option<String>,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}
