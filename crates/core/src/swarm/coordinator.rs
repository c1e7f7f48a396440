//! # Coordinator
//!
//! Runs one orchestration call from document and task to a synthesized
//! answer, driving the [`Pipeline`] state machine and reporting progress
//! on an optional event channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cache::{content_hash, CacheController};
use crate::client::{LlmError, ModelClient, UsageStats};
use crate::models::{
    ModelConfig, DEFAULT_API_KEY_ENV, DEFAULT_MODEL, DEFAULT_SYNTHESIS_TIMEOUT_SECS,
    DEFAULT_TIMEOUT_SECS,
};
use crate::skills::{Skill, SkillRegistry};

use super::events::{EventSink, OrchestrationEvent, OrchestrationEventKind};
use super::executor::{
    clamp_workers, ExecutionResult, Executor, InterruptToken, StreamCallback, StreamCallbacks,
    DEFAULT_MAX_WORKERS,
};
use super::pipeline::{Pipeline, PipelineStage};
use super::plan::Plan;
use super::planner::Planner;
use super::preview;
use super::synthesizer::Synthesizer;

/// Configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Model used for every stage
    pub model: String,
    /// Output limit for planning and worker calls
    pub max_tokens: u32,
    /// Output limit for the synthesis call
    pub synthesis_max_tokens: u32,
    /// Concurrent workers, clamped to 1..=10
    pub max_workers: usize,
    pub planning_temperature: f32,
    pub worker_temperature: f32,
    pub synthesis_temperature: f32,
    /// Endpoint override (proxies, compatible gateways)
    pub base_url: Option<String>,
    pub api_key_env: String,
    /// Per-call timeout in seconds for planning and worker calls
    pub timeout_secs: u64,
    /// Per-call timeout for synthesis, which writes the longest output
    pub synthesis_timeout_secs: u64,
    /// Log per-subtask outcomes at info instead of debug
    pub verbose: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            synthesis_max_tokens: 8192,
            max_workers: DEFAULT_MAX_WORKERS,
            planning_temperature: 0.0,
            worker_temperature: 0.3,
            synthesis_temperature: 0.3,
            base_url: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            synthesis_timeout_secs: DEFAULT_SYNTHESIS_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

impl CoordinatorConfig {
    fn stage_config(&self, max_tokens: u32, temperature: f32, timeout_secs: u64) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            max_tokens,
            temperature,
            base_url: self.base_url.clone(),
            api_key_env: self.api_key_env.clone(),
            timeout_secs,
        }
    }

    /// Transport settings shared by all stages
    pub fn model_config(&self) -> ModelConfig {
        self.stage_config(self.max_tokens, self.worker_temperature, self.timeout_secs)
    }

    pub fn planning_config(&self) -> ModelConfig {
        self.stage_config(self.max_tokens, self.planning_temperature, self.timeout_secs)
    }

    pub fn worker_config(&self) -> ModelConfig {
        self.stage_config(self.max_tokens, self.worker_temperature, self.timeout_secs)
    }

    pub fn synthesis_config(&self) -> ModelConfig {
        self.stage_config(
            self.synthesis_max_tokens,
            self.synthesis_temperature,
            self.synthesis_timeout_secs,
        )
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend setup failed: {0}")]
    Setup(#[source] LlmError),
    #[error("planning failed: {0}")]
    Planning(#[source] LlmError),
    #[error("synthesis failed: {0}")]
    Synthesis(#[source] LlmError),
}

impl OrchestrationError {
    /// Stage the run stopped in
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            OrchestrationError::Planning(_) | OrchestrationError::Synthesis(_) => {
                Some(PipelineStage::Failed)
            }
            _ => None,
        }
    }
}

/// Outcome of a successful orchestration call
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub run_id: String,
    /// Synthesized answer
    pub result: String,
    pub plan: Plan,
    pub subtask_count: usize,
    pub self_answered: usize,
    pub delegated: usize,
    /// Delegated results in plan order
    pub results: Vec<ExecutionResult>,
    /// Summed over planning, workers and synthesis
    pub usage: UsageStats,
    pub stage: PipelineStage,
}

/// Receives `(subtask_id, delta)` for every delegated subtask
pub type StreamTap = Arc<dyn Fn(usize, &str) + Send + Sync>;

/// The orchestration coordinator
pub struct Coordinator {
    client: ModelClient,
    config: CoordinatorConfig,
    registry: Arc<SkillRegistry>,
    cache: Arc<CacheController>,
    event_tx: Option<mpsc::Sender<OrchestrationEvent>>,
    interrupt: Option<InterruptToken>,
    callbacks: StreamCallbacks,
    tap: Option<StreamTap>,
}

impl Coordinator {
    pub fn new(client: ModelClient, config: CoordinatorConfig) -> Self {
        Self {
            client,
            config,
            registry: Arc::new(SkillRegistry::builtin()),
            cache: Arc::new(CacheController::default()),
            event_tx: None,
            interrupt: None,
            callbacks: StreamCallbacks::new(),
            tap: None,
        }
    }

    /// Coordinator talking to the configured Anthropic endpoint
    pub fn anthropic(config: CoordinatorConfig) -> Result<Self, OrchestrationError> {
        let client = ModelClient::anthropic(&config.model_config())
            .map_err(OrchestrationError::Setup)?;
        Ok(Self::new(client, config))
    }

    /// Replace the whole registry; see [`registry_with`] to extend the
    /// built-ins instead
    pub fn with_skills(mut self, registry: SkillRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Share a cache table across runs so a warm document stays warm
    pub fn with_cache(mut self, cache: Arc<CacheController>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<OrchestrationEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_interrupt(mut self, token: InterruptToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    pub fn with_stream_callbacks(mut self, callbacks: StreamCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Stream every delegated subtask that has no callback of its own.
    /// Subtask ids are only known once the plan exists.
    pub fn with_stream_tap(mut self, tap: StreamTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Run the full pipeline
    #[tracing::instrument(skip(self, context), fields(task_preview = %preview(task, 50), context_chars = context.len()))]
    pub async fn run(
        &self,
        context: &str,
        task: &str,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        if context.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput("context is empty".into()));
        }
        if task.trim().is_empty() {
            return Err(OrchestrationError::InvalidInput("task is empty".into()));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let events = EventSink::new(run_id.clone(), self.event_tx.clone());
        let mut pipeline = Pipeline::new();

        events.emit_with(
            OrchestrationEventKind::PipelineStarted,
            serde_json::json!({ "task": task, "context_chars": context.len() }),
        );
        events.stage(pipeline.stage);

        // === PLANNING ===
        let planner = Planner::new(self.client.clone(), self.config.planning_config());
        let report = match planner.plan(context, task, &self.registry).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "planning failed");
                self.fail(&mut pipeline, &events, &e);
                return Err(OrchestrationError::Planning(e));
            }
        };
        let plan = report.plan;
        let mut usage = report.usage;

        tracing::info!(
            subtasks = plan.len(),
            self_answered = plan.self_answered_count(),
            delegated = plan.delegated_count(),
            fallback = plan.fallback,
            "plan ready"
        );
        events.emit_with(
            OrchestrationEventKind::PlanReady,
            serde_json::to_value(&plan).unwrap_or_default(),
        );

        // === ASSEMBLING ===
        events.stage(pipeline.advance());
        let executor = Executor::new(
            self.client.clone(),
            self.registry.clone(),
            self.cache.clone(),
            self.config.worker_config(),
        )
        .with_events(events.clone());

        let mut prepared = executor.prepare(context, &plan.subtasks, Some(context));
        let shared = self.shared_context(context, prepared.iter().filter(|p| p.uses_shared).count());
        if shared.is_none() {
            for subtask in &mut prepared {
                subtask.uses_shared = false;
            }
        }
        for subtask in prepared.iter().filter(|p| p.fell_back) {
            tracing::warn!(subtask = subtask.id, "context pointer fell back to the full document");
        }

        let callbacks = self.callbacks_for(&plan);

        // === EXECUTING ===
        events.stage(pipeline.advance());
        let results = executor
            .run(
                prepared,
                shared,
                self.interrupt.as_ref(),
                clamp_workers(self.config.max_workers),
                &callbacks,
            )
            .await;
        for result in &results {
            usage.add(&result.usage);
            if self.config.verbose {
                tracing::info!(subtask = result.subtask_id, status = ?result.status, output = %preview(&result.output, 200), "subtask result");
            } else {
                tracing::debug!(subtask = result.subtask_id, status = ?result.status, output = %preview(&result.output, 200), "subtask result");
            }
        }

        // === SYNTHESIZING ===
        events.stage(pipeline.advance());
        let synthesizer = Synthesizer::new(self.client.clone(), self.config.synthesis_config());
        let synthesis = match synthesizer.synthesize(task, &plan, &results).await {
            Ok(synthesis) => synthesis,
            Err(e) => {
                tracing::error!(error = %e, "synthesis failed");
                self.fail(&mut pipeline, &events, &e);
                return Err(OrchestrationError::Synthesis(e));
            }
        };
        usage.add(&synthesis.usage);

        // === DONE ===
        events.stage(pipeline.advance());
        events.emit_with(
            OrchestrationEventKind::PipelineCompleted,
            serde_json::json!({
                "degraded": synthesis.degraded,
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "cache_read_tokens": usage.cache_read_tokens,
            }),
        );
        tracing::info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cache_read_tokens = usage.cache_read_tokens,
            "orchestration complete"
        );

        Ok(OrchestrationResult {
            run_id,
            result: synthesis.text,
            subtask_count: plan.len(),
            self_answered: plan.self_answered_count(),
            delegated: plan.delegated_count(),
            plan,
            results,
            usage,
            stage: pipeline.stage,
        })
    }

    /// The full document is sent as one shared cached block when enough
    /// workers need all of it, or when it is already warm.
    fn shared_context<'a>(&self, context: &'a str, whole_document_subtasks: usize) -> Option<&'a str> {
        if !self.cache.is_cache_eligible(context) {
            return None;
        }
        let worth_sharing = whole_document_subtasks >= 2
            || (whole_document_subtasks == 1 && self.cache.is_warm(&content_hash(context)));
        worth_sharing.then_some(context)
    }

    fn callbacks_for(&self, plan: &Plan) -> StreamCallbacks {
        let mut callbacks = self.callbacks.clone();
        if let Some(tap) = &self.tap {
            for subtask in plan.delegated() {
                let tap = tap.clone();
                let id = subtask.id;
                callbacks
                    .entry(id)
                    .or_insert_with(|| Arc::new(move |delta: &str| tap(id, delta)) as StreamCallback);
            }
        }
        callbacks
    }

    fn fail(&self, pipeline: &mut Pipeline, events: &EventSink, error: &LlmError) {
        let stage = pipeline.stage;
        pipeline.fail();
        events.stage(pipeline.stage);
        events.emit_with(
            OrchestrationEventKind::PipelineFailed,
            serde_json::json!({ "stage": stage, "error": error.to_string() }),
        );
    }
}

/// Built-in skills merged with the caller's. A name clash is rejected
/// unless `allow_override` is set.
pub fn registry_with(
    custom: Option<Vec<Skill>>,
    allow_override: bool,
) -> Result<SkillRegistry, OrchestrationError> {
    let builtin = SkillRegistry::builtin();
    match custom {
        Some(skills) => builtin
            .merged(skills, allow_override)
            .map_err(|e| OrchestrationError::InvalidInput(e.to_string())),
        None => Ok(builtin),
    }
}

/// One-shot entry point against the Anthropic backend
pub async fn orchestrate(
    context: &str,
    task: &str,
    config: CoordinatorConfig,
    skills: Option<Vec<Skill>>,
    allow_override: bool,
) -> Result<OrchestrationResult, OrchestrationError> {
    let registry = registry_with(skills, allow_override)?;
    Coordinator::anthropic(config)?
        .with_skills(registry)
        .run(context, task)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{self, ScriptedBackend};
    use crate::client::{Completion, CompletionRequest};
    use crate::context::ContextPointer;
    use crate::swarm::executor::ExecutionStatus;

    const REPORT: &str = "# Pricing\nThe basic plan costs $10 per seat per month.\nEnterprise is negotiated.\n# Risks\nVendor lock-in through proprietary export formats.\n# Team\nThe total headcount is 250.\n";

    #[derive(Clone, Copy, PartialEq)]
    enum Stage {
        Planner,
        Worker,
        Synthesis,
    }

    fn stage_of(request: &CompletionRequest) -> Stage {
        let first = request.system.first().map(|b| b.text.as_str()).unwrap_or_default();
        if first.starts_with("You are the planning stage") {
            Stage::Planner
        } else if first.starts_with("You are the synthesis stage") {
            Stage::Synthesis
        } else {
            Stage::Worker
        }
    }

    fn with_usage(text: &str) -> Completion {
        Completion {
            text: text.to_string(),
            usage: UsageStats {
                input_tokens: 10,
                output_tokens: 5,
                ..UsageStats::default()
            },
            stop_reason: None,
        }
    }

    fn coordinator(backend: Arc<ScriptedBackend>) -> Coordinator {
        Coordinator::new(testing::client(backend), CoordinatorConfig::default())
    }

    fn worker_requests(backend: &ScriptedBackend) -> Vec<CompletionRequest> {
        backend
            .recorded()
            .into_iter()
            .filter(|r| stage_of(r) == Stage::Worker)
            .collect()
    }

    #[test]
    fn test_coordinator_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.synthesis_config().max_tokens, 8192);
        assert_eq!(config.planning_config().temperature, 0.0);
        assert_eq!(config.worker_config().timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(
            config.synthesis_config().timeout_secs,
            DEFAULT_SYNTHESIS_TIMEOUT_SECS
        );
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"model": "claude-3-5-haiku-latest", "max_workers": 8}"#)
                .unwrap();
        assert_eq!(config.model, "claude-3-5-haiku-latest");
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.synthesis_max_tokens, 8192);
    }

    #[tokio::test]
    async fn test_compare_two_sections_in_one_subtask() {
        let backend = Arc::new(ScriptedBackend::new(|req| {
            Ok(match stage_of(req) {
                Stage::Planner => with_usage(
                    r#"{"subtasks":[{"task":"Compare pricing and risks","skill":"analytical_comparison","context_pointer":{"sections":["Pricing","Risks"]}}]}"#,
                ),
                Stage::Worker => with_usage(
                    "Pricing: $10 per seat is cheap. Risks: lock-in raises switching cost.",
                ),
                Stage::Synthesis => {
                    with_usage("Pricing is low at $10 per seat, but the lock-in risk offsets it.")
                }
            })
        }));

        let result = coordinator(backend.clone())
            .run(REPORT, "compare pricing and risks")
            .await
            .unwrap();

        assert_eq!(result.subtask_count, 1);
        assert_eq!(result.delegated, 1);
        assert_eq!(result.self_answered, 0);
        let subtask = &result.plan.subtasks[0];
        assert_eq!(subtask.skill.as_deref(), Some("analytical_comparison"));
        assert_eq!(
            subtask.context_pointer,
            Some(ContextPointer::sections(["Pricing", "Risks"]))
        );

        let workers = worker_requests(&backend);
        assert_eq!(workers.len(), 1);
        let sent = workers[0].last_user_text().unwrap();
        assert!(sent.contains("$10 per seat") && sent.contains("Vendor lock-in"));
        assert!(!sent.contains("headcount"));

        let answer = result.result.to_lowercase();
        assert!(answer.contains("pricing") && answer.contains("risk"));
        assert_eq!(result.stage, PipelineStage::Done);
        assert_eq!(result.usage.input_tokens, 30);
        assert_eq!(result.usage.output_tokens, 15);
    }

    #[tokio::test]
    async fn test_trivial_lookup_is_self_answered() {
        let backend = Arc::new(ScriptedBackend::new(|req| {
            Ok(match stage_of(req) {
                Stage::Planner => Completion::new(
                    r#"{"subtasks":[{"task":"What is the total headcount?","self":"The total headcount is 250."}]}"#,
                ),
                Stage::Worker => Completion::new("should not be called"),
                Stage::Synthesis => Completion::new(format!(
                    "Final: {}",
                    req.last_user_text().unwrap_or_default()
                )),
            })
        }));

        let result = coordinator(backend.clone())
            .run(REPORT, "what is the total headcount?")
            .await
            .unwrap();

        assert_eq!(result.self_answered, 1);
        assert_eq!(result.delegated, 0);
        assert_eq!(result.self_answered + result.delegated, result.subtask_count);
        assert!(result.results.is_empty());
        assert!(worker_requests(&backend).is_empty());
        assert_eq!(backend.calls(), 2);
        assert!(result.result.contains("250"));
    }

    #[tokio::test]
    async fn test_all_subtasks_failing_still_reaches_done() {
        let backend = Arc::new(ScriptedBackend::new(|req| match stage_of(req) {
            Stage::Planner => Ok(Completion::new(
                r#"{"subtasks":[{"task":"a","skill":"summarization"},{"task":"b","skill":"critique"}]}"#,
            )),
            Stage::Worker => Err(LlmError::InvalidRequest {
                message: "rejected".into(),
            }),
            Stage::Synthesis => Ok(Completion::new("No subtask produced output.")),
        }));

        let result = coordinator(backend)
            .run(REPORT, "review everything")
            .await
            .unwrap();

        assert_eq!(result.stage, PipelineStage::Done);
        assert!(result
            .results
            .iter()
            .all(|r| r.status == ExecutionStatus::Error));
        assert!(result
            .result
            .starts_with("The analysis could not be completed"));
    }

    #[tokio::test]
    async fn test_planning_transport_failure_fails_pipeline() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(LlmError::Authentication {
                message: "invalid x-api-key".into(),
            })
        }));
        let (tx, mut rx) = mpsc::channel(64);

        let err = coordinator(backend)
            .with_event_channel(tx)
            .run(REPORT, "anything")
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::Planning(_)));
        assert_eq!(err.stage(), Some(PipelineStage::Failed));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.last(), Some(&OrchestrationEventKind::PipelineFailed));
    }

    #[tokio::test]
    async fn test_synthesis_transport_failure_fails_pipeline() {
        let backend = Arc::new(ScriptedBackend::new(|req| match stage_of(req) {
            Stage::Planner => Ok(Completion::new(r#"{"subtasks":[{"task":"a","self":"b"}]}"#)),
            _ => Err(LlmError::Authentication {
                message: "revoked".into(),
            }),
        }));

        let err = coordinator(backend)
            .run(REPORT, "anything")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Synthesis(_)));
    }

    #[test]
    fn test_caller_skills_extend_builtins() {
        let review = Skill::new("code_review", "Review source code", "You review code.", "");
        let registry = registry_with(Some(vec![review]), false).unwrap();
        assert!(registry.contains("code_review"));
        assert!(registry.contains("general_analysis"));
        assert_eq!(registry.default_name(), "general_analysis");

        let clash = Skill::new("summarization", "Shorter", "Be brief.", "");
        assert!(matches!(
            registry_with(Some(vec![clash.clone()]), false),
            Err(OrchestrationError::InvalidInput(_))
        ));
        let replaced = registry_with(Some(vec![clash]), true).unwrap();
        assert_eq!(replaced.get("summarization").description, "Shorter");
        assert_eq!(replaced.len(), SkillRegistry::builtin().len());
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let backend = Arc::new(ScriptedBackend::echo("unused"));
        let coordinator = coordinator(backend.clone());

        assert!(matches!(
            coordinator.run("   ", "task").await,
            Err(OrchestrationError::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator.run(REPORT, "").await,
            Err(OrchestrationError::InvalidInput(_))
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_undispatched_subtasks() {
        let backend = Arc::new(ScriptedBackend::new(|req| {
            Ok(match stage_of(req) {
                Stage::Planner => Completion::new(
                    r#"{"subtasks":[{"task":"a","skill":"summarization"},{"task":"b","skill":"extraction"}]}"#,
                ),
                _ => Completion::new("synthesized"),
            })
        }));
        let token = InterruptToken::new();
        token.interrupt();

        let result = coordinator(backend.clone())
            .with_interrupt(token)
            .run(REPORT, "summarize")
            .await
            .unwrap();

        assert!(result
            .results
            .iter()
            .all(|r| r.status == ExecutionStatus::Cancelled));
        assert!(worker_requests(&backend).is_empty());
        assert_eq!(result.stage, PipelineStage::Done);
    }

    #[tokio::test]
    async fn test_whole_document_subtasks_share_cached_block() {
        let document = format!("# Log\n{}", "entry ".repeat(1200));
        let backend = Arc::new(ScriptedBackend::new(|req| {
            Ok(match stage_of(req) {
                Stage::Planner => Completion::new(
                    r#"{"subtasks":[{"task":"a","skill":"summarization"},{"task":"b","skill":"critique"},{"task":"c","skill":"extraction"}]}"#,
                ),
                _ => Completion::new("ok"),
            })
        }));

        let result = coordinator(backend.clone())
            .run(&document, "review the log")
            .await
            .unwrap();

        let workers = worker_requests(&backend);
        assert_eq!(workers.len(), 3);
        assert!(workers.iter().all(|r| r.requests_cache()));
        assert!(workers.iter().all(|r| r.system[0].text == document));
        assert!(!result.results[0].cache_hit);
        assert!(result.results[1].cache_hit && result.results[2].cache_hit);
    }

    #[tokio::test]
    async fn test_stream_tap_sees_every_delegated_subtask() {
        let backend = Arc::new(ScriptedBackend::new(|req| {
            Ok(match stage_of(req) {
                Stage::Planner => Completion::new(
                    r#"{"subtasks":[{"task":"a","skill":"summarization"},{"task":"b","self":"c"},{"task":"d","skill":"critique"}]}"#,
                ),
                Stage::Worker => Completion::new("two words"),
                Stage::Synthesis => Completion::new("done"),
            })
        }));
        let seen = Arc::new(std::sync::Mutex::new(Vec::<(usize, String)>::new()));
        let sink = seen.clone();

        coordinator(backend)
            .with_stream_tap(Arc::new(move |id, delta: &str| {
                sink.lock().unwrap().push((id, delta.to_string()))
            }))
            .run(REPORT, "go")
            .await
            .unwrap();

        let mut ids: Vec<usize> = seen.lock().unwrap().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_events_follow_stage_order() {
        let backend = Arc::new(ScriptedBackend::new(|req| {
            Ok(match stage_of(req) {
                Stage::Planner => Completion::new(
                    r#"{"subtasks":[{"task":"a","skill":"summarization","context_pointer":{"sections":["Team"]}}]}"#,
                ),
                _ => Completion::new("ok"),
            })
        }));
        let (tx, mut rx) = mpsc::channel(64);

        let result = coordinator(backend)
            .with_event_channel(tx)
            .run(REPORT, "who is on the team")
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().all(|e| e.run_id == result.run_id));

        let stages: Vec<_> = events
            .iter()
            .filter(|e| e.kind == OrchestrationEventKind::StageChanged)
            .filter_map(|e| e.data.as_ref().and_then(|d| d["stage"].as_str()).map(String::from))
            .collect();
        assert_eq!(
            stages,
            vec!["planning", "assembling", "executing", "synthesizing", "done"]
        );

        let kinds: Vec<_> = events.iter().map(|e| e.kind.clone()).collect();
        assert_eq!(kinds.first(), Some(&OrchestrationEventKind::PipelineStarted));
        assert_eq!(kinds.last(), Some(&OrchestrationEventKind::PipelineCompleted));
        assert!(kinds.contains(&OrchestrationEventKind::PlanReady));
        assert!(kinds.contains(&OrchestrationEventKind::SubtaskDispatched));
        assert!(kinds.contains(&OrchestrationEventKind::SubtaskCompleted));
    }
}
