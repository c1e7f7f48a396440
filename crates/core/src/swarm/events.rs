//! # Orchestration Events
//!
//! Progress notifications emitted while a run moves through its stages.
//! Delivery is best effort: a full or closed channel never stalls the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::pipeline::PipelineStage;

/// Kind of orchestration event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationEventKind {
    PipelineStarted,
    /// Stage transition; data carries `stage`
    StageChanged,
    /// Plan parsed (or fallen back); data carries the plan
    PlanReady,
    SubtaskDispatched,
    SubtaskCompleted,
    SubtaskFailed,
    /// Subtask skipped because the run was interrupted
    SubtaskCancelled,
    PipelineCompleted,
    PipelineFailed,
}

/// An event in an orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    /// Unique event ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: OrchestrationEventKind,
    /// Run that produced this event
    pub run_id: String,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Related subtask if applicable
    #[serde(default)]
    pub subtask_id: Option<usize>,
}

impl OrchestrationEvent {
    pub fn new(kind: OrchestrationEventKind, run_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            run_id: run_id.to_string(),
            data: None,
            subtask_id: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_subtask(mut self, subtask_id: usize) -> Self {
        self.subtask_id = Some(subtask_id);
        self
    }

    pub fn stage_changed(run_id: &str, stage: PipelineStage) -> Self {
        Self::new(OrchestrationEventKind::StageChanged, run_id)
            .with_data(serde_json::json!({ "stage": stage }))
    }
}

/// Cloneable handle that tags every event with the run id
#[derive(Debug, Clone)]
pub struct EventSink {
    run_id: String,
    tx: Option<mpsc::Sender<OrchestrationEvent>>,
}

impl EventSink {
    pub fn new(run_id: impl Into<String>, tx: Option<mpsc::Sender<OrchestrationEvent>>) -> Self {
        Self {
            run_id: run_id.into(),
            tx,
        }
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self::new("", None)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, kind: OrchestrationEventKind) {
        self.send(OrchestrationEvent::new(kind, &self.run_id));
    }

    pub fn emit_with(&self, kind: OrchestrationEventKind, data: serde_json::Value) {
        self.send(OrchestrationEvent::new(kind, &self.run_id).with_data(data));
    }

    pub fn emit_subtask(
        &self,
        kind: OrchestrationEventKind,
        subtask_id: usize,
        data: Option<serde_json::Value>,
    ) {
        let mut event = OrchestrationEvent::new(kind, &self.run_id).with_subtask(subtask_id);
        event.data = data;
        self.send(event);
    }

    pub fn stage(&self, stage: PipelineStage) {
        self.send(OrchestrationEvent::stage_changed(&self.run_id, stage));
    }

    fn send(&self, event: OrchestrationEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                tracing::debug!(error = %e, "dropping orchestration event");
            }
        }
    }
}
