//! Anthropic Messages API backend
//!
//! Sends one request per call and, for streaming calls, decodes the
//! server-sent event stream into text deltas. Retries and timeouts live in
//! [`super::ModelClient`], not here.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::error::LlmError;
use super::types::{Completion, CompletionRequest, UsageStats};
use super::{CompletionBackend, LlmResult};
use crate::models::ModelConfig;

/// Current API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    client: reqwest::Client,
    config: ModelConfig,
}

impl AnthropicBackend {
    pub fn new(config: &ModelConfig) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Network {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn api_key(&self) -> LlmResult<String> {
        self.config.api_key().ok_or_else(|| LlmError::MissingApiKey {
            env_var: self.config.api_key_env.clone(),
        })
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> LlmResult<reqwest::Response> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(self.config.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request.to_body(stream))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let response = self.send(request, false).await?;
        let body = response.text().await?;
        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Parse {
                message: e.to_string(),
            })?;
        Ok(parsed.into_completion())
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> LlmResult<Completion> {
        let response = self.send(request, true).await?;
        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for delta in decoder.push(&chunk)? {
                // A dropped receiver only means nobody is listening
                let _ = tx.send(delta).await;
            }
        }
        for delta in decoder.finish()? {
            let _ = tx.send(delta).await;
        }

        Ok(decoder.into_completion())
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
}

impl WireUsage {
    fn into_stats(self) -> UsageStats {
        UsageStats {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cache_read_input_tokens.unwrap_or(0),
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

impl MessagesResponse {
    fn into_completion(self) -> Completion {
        let text = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Completion {
            text,
            usage: self.usage.into_stats(),
            stop_reason: self.stop_reason,
        }
    }
}

/// Incremental decoder for the messages event stream.
///
/// Only `data:` lines matter; event names are repeated inside the JSON
/// payload's `type` field.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    text: String,
    usage: UsageStats,
    stop_reason: Option<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the text deltas of every completed line.
    /// A multi-byte character split across chunks stays buffered until its
    /// line is complete.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> LlmResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = self.handle_line(line.trim_end())? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    /// Flush a trailing line without newline
    pub(crate) fn finish(&mut self) -> LlmResult<Vec<String>> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        Ok(self.handle_line(rest.trim_end())?.into_iter().collect())
    }

    pub(crate) fn into_completion(self) -> Completion {
        Completion {
            text: self.text,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }

    fn handle_line(&mut self, line: &str) -> LlmResult<Option<String>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(None);
        }

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable stream event");
                return Ok(None);
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                let usage = message.usage.into_stats();
                self.usage.input_tokens = usage.input_tokens;
                self.usage.cache_read_tokens = usage.cache_read_tokens;
                self.usage.cache_creation_tokens = usage.cache_creation_tokens;
            }
            StreamEvent::ContentBlockDelta {
                delta: Delta::TextDelta { text },
            } => {
                self.text.push_str(&text);
                return Ok(Some(text));
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                }
            }
            StreamEvent::Error { error } => {
                return Err(match error.kind.as_str() {
                    "overloaded_error" => LlmError::Server {
                        status: 529,
                        message: error.message,
                    },
                    "rate_limit_error" => LlmError::RateLimited {
                        message: error.message,
                    },
                    "api_error" => LlmError::Server {
                        status: 500,
                        message: error.message,
                    },
                    _ => LlmError::InvalidRequest {
                        message: error.message,
                    },
                });
            }
            _ => {}
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}
