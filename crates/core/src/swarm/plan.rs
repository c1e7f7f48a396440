//! # Plan
//!
//! The planner's decomposition of a task and the parser that turns model
//! output into one. Parsing never fails hard: it yields
//! [`ParseOutcome::Invalid`] and the planner decides what to do next.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextPointer;
use crate::skills::SkillRegistry;

/// One unit of work. Exactly one of `skill` and `self_answer` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Position in the plan
    pub id: usize,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    /// `None` designates the whole document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_pointer: Option<ContextPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_answer: Option<String>,
}

impl Subtask {
    pub fn delegated(
        id: usize,
        task: impl Into<String>,
        skill: impl Into<String>,
        context_pointer: Option<ContextPointer>,
    ) -> Self {
        Self {
            id,
            task: task.into(),
            skill: Some(skill.into()),
            context_pointer,
            self_answer: None,
        }
    }

    pub fn self_answered(id: usize, task: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            id,
            task: task.into(),
            skill: None,
            context_pointer: None,
            self_answer: Some(answer.into()),
        }
    }

    pub fn is_self_answered(&self) -> bool {
        self.self_answer.is_some()
    }
}

/// Ordered decomposition of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub subtasks: Vec<Subtask>,
    /// The planner gave up on the model's output and used a single subtask
    #[serde(default)]
    pub fallback: bool,
}

impl Plan {
    pub fn new(subtasks: Vec<Subtask>) -> Self {
        Self {
            subtasks,
            fallback: false,
        }
    }

    /// Single subtask covering the whole task and document
    pub fn single(task: &str, registry: &SkillRegistry) -> Self {
        Self {
            subtasks: vec![Subtask::delegated(
                0,
                task,
                registry.default_name(),
                None,
            )],
            fallback: true,
        }
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn self_answered_count(&self) -> usize {
        self.subtasks.iter().filter(|s| s.is_self_answered()).count()
    }

    pub fn delegated_count(&self) -> usize {
        self.subtasks.len() - self.self_answered_count()
    }

    pub fn delegated(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.iter().filter(|s| !s.is_self_answered())
    }
}

/// Result of parsing planner output
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Valid(Plan),
    Invalid(String),
}

/// Pull the JSON object out of a reply that may wrap it in a code fence
/// or surround it with prose.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let text = text.trim();
    let body = if let Some(start) = text.find("```") {
        let after_fence = &text[start + 3..];
        let after_lang = match after_fence.find('\n') {
            Some(nl) => &after_fence[nl + 1..],
            None => after_fence,
        };
        match after_lang.find("```") {
            Some(end) => &after_lang[..end],
            None => after_lang,
        }
    } else {
        text
    };

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

fn non_empty_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Parse a planner reply against the available skills.
///
/// Unknown or missing skill names are remapped to the registry default.
pub fn parse_plan(text: &str, registry: &SkillRegistry) -> ParseOutcome {
    let Some(json) = extract_json_object(text) else {
        return ParseOutcome::Invalid("no JSON object in planner output".to_string());
    };
    let value: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => return ParseOutcome::Invalid(format!("malformed plan JSON: {}", e)),
    };
    let Some(items) = value.get("subtasks").and_then(Value::as_array) else {
        return ParseOutcome::Invalid("plan has no \"subtasks\" array".to_string());
    };
    if items.is_empty() {
        return ParseOutcome::Invalid("plan has zero subtasks".to_string());
    }

    let mut subtasks = Vec::with_capacity(items.len());
    for (id, item) in items.iter().enumerate() {
        if !item.is_object() {
            return ParseOutcome::Invalid(format!("subtask {} is not an object", id));
        }
        let Some(task) = non_empty_str(item, &["task", "instruction"]) else {
            return ParseOutcome::Invalid(format!("subtask {} has no task", id));
        };

        if let Some(answer) = non_empty_str(item, &["self_answer", "self"]) {
            subtasks.push(Subtask::self_answered(id, task, answer));
            continue;
        }

        let skill = match non_empty_str(item, &["skill"]) {
            Some(name) if registry.contains(name) => name,
            Some(name) => {
                tracing::warn!(subtask = id, skill = %name, "unknown skill, using default");
                registry.default_name()
            }
            None => registry.default_name(),
        };
        let pointer = item
            .get("context_pointer")
            .or_else(|| item.get("context"))
            .and_then(ContextPointer::from_value);

        subtasks.push(Subtask::delegated(id, task, skill, pointer));
    }

    ParseOutcome::Valid(Plan::new(subtasks))
}
