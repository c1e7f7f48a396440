//! # Planner
//!
//! One completion over the full document that decomposes the task into
//! subtasks. A malformed reply gets one corrective retry; after that the
//! planner degrades to a single default-skill subtask over the whole
//! document instead of failing the run.

use crate::client::{CompletionRequest, LlmResult, Message, ModelClient, SystemBlock, UsageStats};
use crate::context::parse_headers;
use crate::models::ModelConfig;
use crate::skills::SkillRegistry;

use super::plan::{parse_plan, ParseOutcome, Plan};
use super::preview;

const PLANNER_PROMPT: &str = r#"You are the planning stage of a document analysis pipeline.
Break the user's task into the smallest set of independent subtasks that together answer it.

For every subtask choose exactly one of:
- "skill": the name of one skill from the catalog. A worker running that skill receives only the context you point it at.
- "self": a complete answer you give yourself. Use this only for trivial lookups whose answer appears verbatim in the document. Never self-answer anything that needs analysis.

Point each delegated subtask at the smallest part of the document it needs with "context_pointer":
- {"sections": ["Header title", ...]} using header titles exactly as listed, or
- {"lines": [start, end]} for a zero-based, end-exclusive line range, or
- null when the whole document is genuinely required.

Prefer one subtask that compares related material over several that each see a fragment of it.

Reply with a single JSON object and nothing else:
{"subtasks": [{"task": "...", "skill": "...", "context_pointer": ...}, {"task": "...", "self": "..."}]}"#;

const JSON_REMINDER: &str = "Your previous reply could not be used. You must return valid JSON: a single object with a non-empty \"subtasks\" array, each entry having a \"task\" and either a \"skill\" or a \"self\" answer. No prose, no code fences.";

/// Plan together with what it cost to produce
#[derive(Debug, Clone)]
pub struct PlanningReport {
    pub plan: Plan,
    pub usage: UsageStats,
    /// Completion calls made, 1 or 2
    pub attempts: u32,
}

pub struct Planner {
    client: ModelClient,
    config: ModelConfig,
}

impl Planner {
    pub fn new(client: ModelClient, config: ModelConfig) -> Self {
        Self { client, config }
    }

    /// Decompose `task` over `context`.
    ///
    /// Only a transport failure on the first call is an error. A transport
    /// failure on the corrective retry degrades to the single-subtask plan.
    pub async fn plan(
        &self,
        context: &str,
        task: &str,
        registry: &SkillRegistry,
    ) -> LlmResult<PlanningReport> {
        let prompt = build_user_prompt(context, task, registry);
        let request = CompletionRequest::new(
            &self.config.model,
            self.config.max_tokens,
            self.config.temperature,
        )
        .with_system(SystemBlock::text(PLANNER_PROMPT))
        .with_message(Message::user(prompt));

        let first = self.client.complete(&request).await?;
        let mut usage = first.usage;
        tracing::debug!(reply = %preview(&first.text, 400), "planner reply");

        let reason = match parse_plan(&first.text, registry) {
            ParseOutcome::Valid(plan) => {
                return Ok(PlanningReport {
                    plan,
                    usage,
                    attempts: 1,
                })
            }
            ParseOutcome::Invalid(reason) => reason,
        };
        tracing::warn!(%reason, "planner returned an unusable plan, retrying once");

        let retry = request
            .with_message(Message::assistant(first.text))
            .with_message(Message::user(format!("{}\nProblem: {}", JSON_REMINDER, reason)));

        let plan = match self.client.complete(&retry).await {
            Ok(second) => {
                usage.add(&second.usage);
                match parse_plan(&second.text, registry) {
                    ParseOutcome::Valid(plan) => plan,
                    ParseOutcome::Invalid(reason) => {
                        tracing::warn!(%reason, "planner retry unusable, falling back to a single subtask");
                        Plan::single(task, registry)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "planner retry failed, falling back to a single subtask");
                Plan::single(task, registry)
            }
        };

        Ok(PlanningReport {
            plan,
            usage,
            attempts: 2,
        })
    }
}

fn build_user_prompt(context: &str, task: &str, registry: &SkillRegistry) -> String {
    let mut prompt = String::from("## Skill catalog\n");
    for skill in registry.catalog() {
        prompt.push_str(&format!("- {}: {}\n", skill.name, skill.description));
    }

    let headers = parse_headers(context);
    if !headers.is_empty() {
        prompt.push_str("\n## Document headers\n");
        for header in &headers {
            prompt.push_str(&format!(
                "{}{} (line {})\n",
                "  ".repeat(header.level.saturating_sub(1)),
                header.title,
                header.line
            ));
        }
    }

    prompt.push_str(&format!(
        "\n## Document ({} lines)\n<document>\n{}\n</document>\n\n## Task\n{}",
        context.lines().count(),
        context,
        task
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{self, ScriptedBackend};
    use crate::client::{Completion, LlmError};
    use std::sync::Arc;

    const DOC: &str = "# Pricing\nBasic plan $10.\n# Risks\nVendor lock-in.\n";

    fn planner(backend: Arc<ScriptedBackend>) -> Planner {
        Planner::new(testing::client(backend), ModelConfig::new("test-model"))
    }

    #[tokio::test]
    async fn test_valid_plan_first_try() {
        let backend = Arc::new(ScriptedBackend::echo(
            r#"{"subtasks":[{"task":"compare","skill":"analytical_comparison","context_pointer":{"sections":["Pricing","Risks"]}}]}"#,
        ));
        let report = planner(backend.clone())
            .plan(DOC, "compare pricing and risks", &SkillRegistry::builtin())
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.plan.len(), 1);
        assert_eq!(backend.calls(), 1);

        let recorded = backend.recorded();
        let sent = &recorded[0];
        let prompt = sent.last_user_text().unwrap();
        assert!(prompt.contains("analytical_comparison: "));
        assert!(prompt.contains("Risks (line 2)"));
        assert!(prompt.contains("compare pricing and risks"));
        // Catalog carries descriptions, never templates
        assert!(!prompt.contains(crate::skills::prompts::CRITIQUE));
    }

    #[tokio::test]
    async fn test_retry_then_valid() {
        let backend = Arc::new(ScriptedBackend::echo(
            r#"{"subtasks":[{"task":"t","skill":"summarization"}]}"#,
        ));
        backend.push(Ok(Completion::new("Sure! I'd split it into two parts.")));

        let report = planner(backend.clone())
            .plan(DOC, "summarize", &SkillRegistry::builtin())
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert!(!report.plan.fallback);
        let recorded = backend.recorded();
        let retry = &recorded[1];
        assert_eq!(retry.messages.len(), 3);
        assert!(retry
            .last_user_text()
            .unwrap()
            .contains("You must return valid JSON"));
    }

    #[tokio::test]
    async fn test_two_bad_replies_fall_back() {
        let backend = Arc::new(ScriptedBackend::echo("still not json"));
        let report = planner(backend.clone())
            .plan(DOC, "summarize", &SkillRegistry::builtin())
            .await
            .unwrap();

        assert_eq!(backend.calls(), 2);
        assert!(report.plan.fallback);
        assert_eq!(report.plan.subtasks[0].task, "summarize");
        assert_eq!(
            report.plan.subtasks[0].skill.as_deref(),
            Some(crate::skills::DEFAULT_SKILL)
        );
    }

    #[tokio::test]
    async fn test_first_transport_failure_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(LlmError::Authentication {
                message: "bad key".into(),
            })
        }));
        let result = planner(backend)
            .plan(DOC, "summarize", &SkillRegistry::builtin())
            .await;
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_retry_transport_failure_falls_back() {
        let backend = Arc::new(ScriptedBackend::new(|_| {
            Err(LlmError::InvalidRequest {
                message: "too long".into(),
            })
        }));
        backend.push(Ok(Completion::new("garbage")));

        let report = planner(backend)
            .plan(DOC, "summarize", &SkillRegistry::builtin())
            .await
            .unwrap();
        assert!(report.plan.fallback);
    }
}
