//! # Synthesizer
//!
//! The final completion: every subtask instruction with its output, in plan
//! order, folded into one answer. Failed and cancelled subtasks stay in the
//! prompt, marked unavailable, so the answer can say what it does not cover.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::{CompletionRequest, LlmResult, Message, ModelClient, SystemBlock, UsageStats};
use crate::models::ModelConfig;

use super::executor::{ExecutionResult, ExecutionStatus};
use super::plan::Plan;

const SYNTHESIS_PROMPT: &str = "You are the synthesis stage of a document analysis pipeline. \
You receive the user's original task and the results of the subtasks it was split into. \
Write one integrated answer to the original task. Resolve overlaps, keep concrete figures, \
and do not refer to subtasks, workers or the pipeline. \
If a result is marked (unavailable), state plainly which part of the task could not be covered.";

const DEGRADED_PROMPT: &str = "You are the synthesis stage of a document analysis pipeline. \
Every subtask failed, so no analysis is available. Do not attempt to answer the task from \
general knowledge. Briefly explain that the analysis could not be completed and list the \
failure reasons you were given.";

pub const UNAVAILABLE: &str = "(unavailable)";

/// Final answer and its cost
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub text: String,
    pub usage: UsageStats,
    /// Nothing usable reached synthesis
    pub degraded: bool,
}

/// Fixed opening line of a degraded answer
pub fn incomplete_notice(failed: usize) -> String {
    format!(
        "The analysis could not be completed: all {} subtasks failed or were cancelled.",
        failed
    )
}

pub struct Synthesizer {
    client: ModelClient,
    config: ModelConfig,
}

impl Synthesizer {
    pub fn new(client: ModelClient, config: ModelConfig) -> Self {
        Self { client, config }
    }

    pub async fn synthesize(
        &self,
        task: &str,
        plan: &Plan,
        results: &[ExecutionResult],
    ) -> LlmResult<Synthesis> {
        let by_id: HashMap<usize, &ExecutionResult> =
            results.iter().map(|r| (r.subtask_id, r)).collect();

        let usable = plan.self_answered_count() + results.iter().filter(|r| r.is_ok()).count();
        let degraded = usable == 0;

        let mut body = format!("## Original task\n{}\n\n## Subtask results\n", task);
        for (position, subtask) in plan.subtasks.iter().enumerate() {
            body.push_str(&format!("\n### {}. {}\n", position + 1, subtask.task));
            if let Some(answer) = &subtask.self_answer {
                body.push_str(answer);
            } else {
                match by_id.get(&subtask.id) {
                    Some(r) if r.status == ExecutionStatus::Ok => body.push_str(&r.output),
                    Some(r) => body.push_str(&format!("{}\nReason: {}", UNAVAILABLE, r.output)),
                    None => body.push_str(UNAVAILABLE),
                }
            }
            body.push('\n');
        }

        let system = if degraded {
            tracing::warn!(subtasks = plan.len(), "no usable subtask output, degraded synthesis");
            DEGRADED_PROMPT
        } else {
            SYNTHESIS_PROMPT
        };
        let request = CompletionRequest::new(
            &self.config.model,
            self.config.max_tokens,
            self.config.temperature,
        )
        .with_timeout(Duration::from_secs(self.config.timeout_secs))
        .with_system(SystemBlock::text(system))
        .with_message(Message::user(body));

        let completion = self.client.complete(&request).await?;
        let text = if degraded {
            format!(
                "{}\n\n{}",
                incomplete_notice(plan.delegated_count()),
                completion.text.trim()
            )
        } else {
            completion.text
        };

        Ok(Synthesis {
            text,
            usage: completion.usage,
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{self, ScriptedBackend};
    use crate::client::{Completion, LlmError};
    use crate::swarm::plan::Subtask;
    use std::sync::Arc;

    fn synthesizer(backend: Arc<ScriptedBackend>) -> Synthesizer {
        Synthesizer::new(testing::client(backend), ModelConfig::new("m"))
    }

    fn plan() -> Plan {
        Plan::new(vec![
            Subtask::delegated(0, "Summarize pricing", "summarization", None),
            Subtask::self_answered(1, "Headcount?", "42 people"),
            Subtask::delegated(2, "Assess risks", "risk_assessment", None),
        ])
    }

    #[tokio::test]
    async fn test_prompt_keeps_plan_order_and_marks_unavailable() {
        let backend = Arc::new(ScriptedBackend::echo("integrated"));
        let results = vec![
            ExecutionResult::ok(0, Completion::new("pricing is flat"), false),
            ExecutionResult::error(2, "server error 500"),
        ];

        let synthesis = synthesizer(backend.clone())
            .synthesize("overview please", &plan(), &results)
            .await
            .unwrap();

        assert_eq!(synthesis.text, "integrated");
        assert!(!synthesis.degraded);

        let recorded = backend.recorded();
        let prompt = recorded[0].last_user_text().unwrap();
        let pricing = prompt.find("pricing is flat").unwrap();
        let headcount = prompt.find("42 people").unwrap();
        let risks = prompt.find("### 3. Assess risks").unwrap();
        assert!(pricing < headcount && headcount < risks);
        assert!(prompt[risks..].contains("(unavailable)"));
        assert!(prompt.starts_with("## Original task\noverview please"));
        assert_eq!(
            recorded[0].timeout,
            Some(Duration::from_secs(ModelConfig::new("m").timeout_secs))
        );
    }

    #[tokio::test]
    async fn test_all_failed_still_synthesizes_with_notice() {
        let backend = Arc::new(ScriptedBackend::echo("Both subtasks hit server errors."));
        let plan = Plan::new(vec![
            Subtask::delegated(0, "a", "summarization", None),
            Subtask::delegated(1, "b", "critique", None),
        ]);
        let results = vec![
            ExecutionResult::error(0, "boom"),
            ExecutionResult::cancelled(1),
        ];

        let synthesis = synthesizer(backend.clone())
            .synthesize("task", &plan, &results)
            .await
            .unwrap();

        assert!(synthesis.degraded);
        assert!(synthesis
            .text
            .starts_with("The analysis could not be completed"));
        assert!(synthesis.text.ends_with("Both subtasks hit server errors."));
        assert_eq!(backend.calls(), 1);
        assert_eq!(backend.recorded()[0].system[0].text, DEGRADED_PROMPT);
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(LlmError::Server {
                status: 503,
                message: "overloaded".into(),
            })
        }));
        let results = vec![ExecutionResult::ok(0, Completion::new("x"), false)];

        let result = synthesizer(backend.clone())
            .synthesize("task", &plan(), &results)
            .await;

        tokio_test::assert_err!(result);
        // 1 attempt + 2 retries from the test client
        assert_eq!(backend.calls(), 3);
    }
}
