//! # Pipeline Stages
//!
//! ```text
//! Planning → Assembling → Executing → Synthesizing → Done
//!     └──────────────────────────────────┴──→ Failed
//! ```
//!
//! `Failed` is only entered from Planning or Synthesizing, after their
//! fallbacks are exhausted. Subtask errors never fail the pipeline.

use serde::{Deserialize, Serialize};

/// Stage of one orchestration call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Decomposing the task
    Planning,
    /// Resolving context slices and skills
    Assembling,
    /// Running delegated subtasks
    Executing,
    /// Combining subtask outputs
    Synthesizing,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Planning => "planning",
            PipelineStage::Assembling => "assembling",
            PipelineStage::Executing => "executing",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pipeline state machine
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub stage: PipelineStage,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            stage: PipelineStage::Planning,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next stage; terminal stages stay put
    pub fn advance(&mut self) -> PipelineStage {
        self.stage = match self.stage {
            PipelineStage::Planning => PipelineStage::Assembling,
            PipelineStage::Assembling => PipelineStage::Executing,
            PipelineStage::Executing => PipelineStage::Synthesizing,
            PipelineStage::Synthesizing => PipelineStage::Done,
            PipelineStage::Done => PipelineStage::Done,
            PipelineStage::Failed => PipelineStage::Failed,
        };
        self.stage
    }

    /// Fail the pipeline.
    ///
    /// Returns false, leaving the stage unchanged, when failing is not
    /// allowed from the current stage.
    pub fn fail(&mut self) -> bool {
        match self.stage {
            PipelineStage::Planning | PipelineStage::Synthesizing => {
                self.stage = PipelineStage::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, PipelineStage::Done | PipelineStage::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.stage == PipelineStage::Done
    }
}
