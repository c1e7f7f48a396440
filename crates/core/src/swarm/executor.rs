//! # Execution Engine
//!
//! Fans delegated subtasks out over a bounded worker pool and gathers the
//! results back into plan order.
//!
//! ```text
//! prepare (pure)         run
//! ─────────────          ─────────────────────────────────────────────
//! skill lookup     →     [warm-up call]  →  Semaphore(max_workers)
//! context slice          shared block        └── JoinSet of workers
//!                                                 └── results[idx]
//! ```
//!
//! Cancellation is cooperative: a worker checks the [`InterruptToken`]
//! after it gets a pool slot and before it sends anything. Calls already in
//! flight run to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::cache::{content_hash, CacheController};
use crate::client::{
    Completion, CompletionRequest, LlmResult, Message, ModelClient, SystemBlock, UsageStats,
};
use crate::context;
use crate::models::ModelConfig;
use crate::skills::{Skill, SkillRegistry};

use super::events::{EventSink, OrchestrationEventKind};
use super::plan::Subtask;
use super::preview;

pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Hard upper bound on concurrent workers
pub const MAX_WORKERS_CAP: usize = 10;

pub fn clamp_workers(requested: usize) -> usize {
    requested.clamp(1, MAX_WORKERS_CAP)
}

/// Caller-owned cancellation flag. The engine only reads it.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken(Arc<AtomicBool>);

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Receives text deltas for one subtask as they arrive
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks keyed by subtask id
pub type StreamCallbacks = HashMap<usize, StreamCallback>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub subtask_id: usize,
    /// Model output, or the error message
    pub output: String,
    pub status: ExecutionStatus,
    pub cache_hit: bool,
    #[serde(default)]
    pub usage: UsageStats,
}

impl ExecutionResult {
    pub fn ok(subtask_id: usize, completion: Completion, cache_hit: bool) -> Self {
        Self {
            subtask_id,
            output: completion.text,
            status: ExecutionStatus::Ok,
            cache_hit,
            usage: completion.usage,
        }
    }

    pub fn error(subtask_id: usize, message: impl Into<String>) -> Self {
        Self {
            subtask_id,
            output: message.into(),
            status: ExecutionStatus::Error,
            cache_hit: false,
            usage: UsageStats::default(),
        }
    }

    pub fn cancelled(subtask_id: usize) -> Self {
        Self {
            subtask_id,
            output: "cancelled before dispatch".to_string(),
            status: ExecutionStatus::Cancelled,
            cache_hit: false,
            usage: UsageStats::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

/// A delegated subtask with its skill and context slice resolved
#[derive(Debug, Clone)]
pub struct DelegatedSubtask {
    pub id: usize,
    pub task: String,
    pub skill: Skill,
    pub context: String,
    /// The slice is byte-identical to the shared block, which is sent in
    /// its place
    pub uses_shared: bool,
    /// The pointer did not resolve and the whole document was substituted
    pub fell_back: bool,
}

pub struct Executor {
    client: ModelClient,
    registry: Arc<SkillRegistry>,
    cache: Arc<CacheController>,
    config: ModelConfig,
    events: EventSink,
}

impl Executor {
    pub fn new(
        client: ModelClient,
        registry: Arc<SkillRegistry>,
        cache: Arc<CacheController>,
        config: ModelConfig,
    ) -> Self {
        Self {
            client,
            registry,
            cache,
            config,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Resolve skills and context slices for every delegated subtask.
    /// Self-answered subtasks are skipped.
    pub fn prepare(
        &self,
        context: &str,
        subtasks: &[Subtask],
        shared_context: Option<&str>,
    ) -> Vec<DelegatedSubtask> {
        subtasks
            .iter()
            .filter(|s| !s.is_self_answered())
            .map(|s| {
                let skill = match s.skill.as_deref() {
                    Some(name) => self.registry.get(name),
                    None => self.registry.default_skill(),
                };
                let resolution = context::resolve(context, s.context_pointer.as_ref());
                let uses_shared = shared_context.is_some_and(|shared| shared == resolution.text);
                DelegatedSubtask {
                    id: s.id,
                    task: s.task.clone(),
                    skill: skill.clone(),
                    context: resolution.text,
                    uses_shared,
                    fell_back: resolution.fell_back,
                }
            })
            .collect()
    }

    /// Prepare and run in one step
    pub async fn execute(
        &self,
        context: &str,
        subtasks: &[Subtask],
        shared_context: Option<&str>,
        interrupt: Option<&InterruptToken>,
        max_workers: usize,
        callbacks: &StreamCallbacks,
    ) -> Vec<ExecutionResult> {
        let prepared = self.prepare(context, subtasks, shared_context);
        self.run(prepared, shared_context, interrupt, max_workers, callbacks)
            .await
    }

    /// Run prepared subtasks; results come back in input order
    pub async fn run(
        &self,
        subtasks: Vec<DelegatedSubtask>,
        shared_context: Option<&str>,
        interrupt: Option<&InterruptToken>,
        max_workers: usize,
        callbacks: &StreamCallbacks,
    ) -> Vec<ExecutionResult> {
        let total = subtasks.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = clamp_workers(max_workers);
        let ids: Vec<usize> = subtasks.iter().map(|s| s.id).collect();
        let interrupted = || interrupt.is_some_and(InterruptToken::is_interrupted);

        let worker = Arc::new(Worker {
            client: self.client.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            shared: shared_context.map(|text| SharedBlock::new(text, &self.cache)),
            events: self.events.clone(),
        });

        tracing::info!(total, workers, "executing subtasks");

        let mut results: Vec<Option<ExecutionResult>> = vec![None; total];
        let mut queue: Vec<(usize, DelegatedSubtask)> = subtasks.into_iter().enumerate().collect();

        // A cold shared block is written by one call before the fan-out so
        // the rest of the batch reads it instead of each creating it.
        if worker.needs_warmup() {
            if let Some(pos) = queue.iter().position(|(_, s)| s.uses_shared) {
                let (idx, subtask) = queue.remove(pos);
                results[idx] = Some(if interrupted() {
                    worker.cancel(&subtask)
                } else {
                    tracing::debug!(subtask = subtask.id, "warming shared context");
                    let callback = callbacks.get(&subtask.id).cloned();
                    worker.run(subtask, callback).await
                });
            }
        }

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set = JoinSet::new();

        for (idx, subtask) in queue {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(error = %e, "worker pool closed");
                    break;
                }
            };
            if interrupted() {
                results[idx] = Some(worker.cancel(&subtask));
                continue;
            }

            let worker = worker.clone();
            let callback = callbacks.get(&subtask.id).cloned();
            join_set.spawn(async move {
                let _permit = permit; // Hold the slot until the call returns
                (idx, worker.run(subtask, callback).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => tracing::error!(error = %e, "worker task panicked"),
            }
        }

        results
            .into_iter()
            .zip(ids)
            .map(|(result, id)| {
                result.unwrap_or_else(|| ExecutionResult::error(id, "worker stopped without a result"))
            })
            .collect()
    }
}

struct SharedBlock {
    text: String,
    hash: String,
    eligible: bool,
}

impl SharedBlock {
    fn new(text: &str, cache: &CacheController) -> Self {
        Self {
            text: text.to_string(),
            hash: content_hash(text),
            eligible: cache.is_cache_eligible(text),
        }
    }
}

struct Worker {
    client: ModelClient,
    cache: Arc<CacheController>,
    config: ModelConfig,
    shared: Option<SharedBlock>,
    events: EventSink,
}

impl Worker {
    fn needs_warmup(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|block| block.eligible && !self.cache.is_warm(&block.hash))
    }

    fn request(&self, subtask: &DelegatedSubtask) -> CompletionRequest {
        let mut request = CompletionRequest::new(
            &self.config.model,
            self.config.max_tokens,
            self.config.temperature,
        );

        let user = match &self.shared {
            Some(block) if subtask.uses_shared => {
                request = request.with_system(if block.eligible {
                    SystemBlock::cached(block.text.clone())
                } else {
                    SystemBlock::text(block.text.clone())
                });
                format!(
                    "The full document is provided above.\n\n## Task\n{}",
                    subtask.task
                )
            }
            _ => format!(
                "<context>\n{}\n</context>\n\n## Task\n{}",
                subtask.context, subtask.task
            ),
        };

        request
            .with_system(SystemBlock::text(subtask.skill.render_system_prompt()))
            .with_message(Message::user(user))
    }

    fn cancel(&self, subtask: &DelegatedSubtask) -> ExecutionResult {
        tracing::info!(subtask = subtask.id, "interrupted, subtask not dispatched");
        self.events
            .emit_subtask(OrchestrationEventKind::SubtaskCancelled, subtask.id, None);
        ExecutionResult::cancelled(subtask.id)
    }

    async fn run(&self, subtask: DelegatedSubtask, callback: Option<StreamCallback>) -> ExecutionResult {
        let request = self.request(&subtask);
        let annotated = request.requests_cache();
        let warm_before = annotated
            && self
                .shared
                .as_ref()
                .is_some_and(|block| self.cache.is_warm(&block.hash));

        self.events.emit_subtask(
            OrchestrationEventKind::SubtaskDispatched,
            subtask.id,
            Some(serde_json::json!({
                "skill": subtask.skill.name,
                "context_chars": subtask.context.len(),
                "shared_context": subtask.uses_shared,
            })),
        );
        tracing::debug!(
            subtask = subtask.id,
            skill = %subtask.skill.name,
            task = %preview(&subtask.task, 120),
            "dispatching subtask"
        );

        let outcome = match callback {
            Some(callback) => self.stream(&request, callback).await,
            None => self.client.complete(&request).await,
        };

        match outcome {
            Ok(completion) => {
                if annotated {
                    if let Some(block) = &self.shared {
                        self.cache.mark_warmed(&block.hash, self.cache.ttl());
                    }
                }
                let cache_hit = warm_before || completion.usage.cache_read_tokens > 0;
                tracing::info!(
                    subtask = subtask.id,
                    skill = %subtask.skill.name,
                    cache_hit,
                    output_tokens = completion.usage.output_tokens,
                    "subtask completed"
                );
                self.events.emit_subtask(
                    OrchestrationEventKind::SubtaskCompleted,
                    subtask.id,
                    Some(serde_json::json!({ "cache_hit": cache_hit })),
                );
                ExecutionResult::ok(subtask.id, completion, cache_hit)
            }
            Err(e) => {
                tracing::warn!(subtask = subtask.id, error = %e, "subtask failed");
                self.events.emit_subtask(
                    OrchestrationEventKind::SubtaskFailed,
                    subtask.id,
                    Some(serde_json::json!({ "error": e.to_string() })),
                );
                ExecutionResult::error(subtask.id, e.to_string())
            }
        }
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        callback: StreamCallback,
    ) -> LlmResult<Completion> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let forward = async move {
            while let Some(chunk) = rx.recv().await {
                callback(&chunk);
            }
        };
        let (result, ()) = tokio::join!(self.client.stream(request, tx), forward);
        result
    }
}
