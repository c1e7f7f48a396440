//! # Prism Core
//!
//! Task orchestration over large documents: plan once, route each subtask
//! only the context it needs, run the subtasks concurrently and synthesize
//! one answer.
//!
//! ## Architecture
//!
//! - `client/` - Model client (retry, timeout, streaming, cache annotations)
//! - `cache` - Shared-context cache eligibility and warm tracking
//! - `context` - Section and line-range context assembly
//! - `skills/` - Skill registry and built-in prompt templates
//! - `swarm/` - Planner, executor, synthesizer and the coordinator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prism_core::swarm::{Coordinator, CoordinatorConfig};
//!
//! let coordinator = Coordinator::anthropic(CoordinatorConfig::default())?;
//! let outcome = coordinator.run(&document, "compare pricing and risks").await?;
//! println!("{}", outcome.result);
//! ```

pub mod cache;
pub mod client;
pub mod context;
pub mod models;
pub mod skills;
pub mod swarm;
