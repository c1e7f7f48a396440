//! # Swarm Orchestration
//!
//! Decomposes one analytical task over a document and fans it out to
//! skill-specialised workers.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Planner (1 call) → Assembler + Skills (pure) → Executor (N calls) → Synthesizer (1 call)
//! ```

pub mod coordinator;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod plan;
pub mod planner;
pub mod synthesizer;

pub use coordinator::{
    orchestrate, registry_with, Coordinator, CoordinatorConfig, OrchestrationError,
    OrchestrationResult, StreamTap,
};
pub use events::{EventSink, OrchestrationEvent, OrchestrationEventKind};
pub use executor::{
    DelegatedSubtask, ExecutionResult, ExecutionStatus, Executor, InterruptToken,
    StreamCallback, StreamCallbacks, MAX_WORKERS_CAP,
};
pub use pipeline::{Pipeline, PipelineStage};
pub use plan::{parse_plan, ParseOutcome, Plan, Subtask};
pub use planner::{Planner, PlanningReport};
pub use synthesizer::{Synthesis, Synthesizer};

/// First `max_chars` characters of `text`, for log fields
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().nth(max_chars).is_some() {
        out.push_str("...");
    }
    out
}
