//! # Model Client
//!
//! The only network boundary in Prism. A [`CompletionBackend`] performs one
//! attempt against the remote endpoint; [`ModelClient`] wraps it with the
//! per-call timeout and bounded exponential backoff every stage relies on.
//!
//! ```text
//! Planner / Workers / Synthesizer
//!   └── ModelClient (timeout + retry)
//!         └── CompletionBackend (AnthropicBackend, or a fake in tests)
//! ```

pub mod anthropic;
pub mod error;
pub mod retry;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use anthropic::AnthropicBackend;
pub use error::LlmError;
pub use retry::RetryPolicy;
pub use types::{Completion, CompletionRequest, Message, Role, SystemBlock, UsageStats};

use crate::models::ModelConfig;

pub type LlmResult<T> = Result<T, LlmError>;

/// A single-attempt completion transport
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Send a request and wait for the whole completion
    async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion>;

    /// Send a request and forward text deltas on `tx` as they arrive.
    ///
    /// Returns the accumulated completion once the stream ends.
    async fn stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> LlmResult<Completion>;
}

/// Completion client shared by every stage of a run
#[derive(Clone)]
pub struct ModelClient {
    backend: Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ModelClient {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(crate::models::DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Client talking to the configured Anthropic endpoint
    pub fn anthropic(config: &ModelConfig) -> LlmResult<Self> {
        let backend = AnthropicBackend::new(config)?;
        Ok(Self::new(Arc::new(backend)).with_timeout(Duration::from_secs(config.timeout_secs)))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Blocking-style completion with retry
    pub async fn complete(&self, request: &CompletionRequest) -> LlmResult<Completion> {
        let mut attempt = 0;
        loop {
            let limit = self.timeout_for(request);
            let result = match tokio::time::timeout(limit, self.backend.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    secs: limit.as_secs(),
                }),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.backoff(attempt, &e).await;
                }
                other => return other,
            }
        }
    }

    /// Streaming completion with retry.
    ///
    /// A retried attempt streams from the start again, so a consumer may see
    /// a partial prefix twice when a stream breaks mid-way.
    pub async fn stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<String>,
    ) -> LlmResult<Completion> {
        let mut attempt = 0;
        loop {
            let limit = self.timeout_for(request);
            let result =
                match tokio::time::timeout(limit, self.backend.stream(request, tx.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        secs: limit.as_secs(),
                    }),
                };
            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.backoff(attempt, &e).await;
                }
                other => return other,
            }
        }
    }

    fn timeout_for(&self, request: &CompletionRequest) -> Duration {
        request.timeout.unwrap_or(self.timeout)
    }

    async fn backoff(&self, attempt: u32, error: &LlmError) {
        let delay = self.retry.delay_for(attempt);
        tracing::warn!(
            backend = self.backend.name(),
            attempt,
            max_retries = self.retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient completion failure, backing off"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
