//! # Prism Skills
//!
//! A skill is a named system-prompt template plus a hint about the shape of
//! the output it should produce. The planner sees only names and
//! descriptions; workers receive the full template.
//!
//! ## Registry
//!
//! ```text
//! SkillRegistry (immutable once handed to the coordinator)
//!   ├── built-in skills (prompts.rs)
//!   └── caller skills (merged, never replacing built-ins unless overriding)
//! ```

pub mod prompts;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Skill used whenever a plan names nothing usable
pub const DEFAULT_SKILL: &str = "general_analysis";

/// A registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    #[serde(default)]
    pub output_hint: String,
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        output_hint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            output_hint: output_hint.into(),
        }
    }

    /// Template plus the output hint, as sent to a worker
    pub fn render_system_prompt(&self) -> String {
        let mut prompt = self.system_prompt.trim().to_string();
        if !self.output_hint.trim().is_empty() {
            prompt.push_str("\n\nExpected output shape: ");
            prompt.push_str(self.output_hint.trim());
        }
        prompt
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SkillError {
    #[error("skill '{0}' already exists; register it as an override to replace it")]
    Clash(String),
    #[error("skill registry is empty")]
    Empty,
    #[error("default skill '{0}' is not in the registry")]
    MissingDefault(String),
    #[error("skill name must not be empty")]
    UnnamedSkill,
}

/// Immutable-after-construction table of skills
#[derive(Debug, Clone)]
pub struct SkillRegistry {
    skills: Vec<Skill>,
    default_name: String,
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SkillRegistry {
    /// The built-in table
    pub fn builtin() -> Self {
        let skills = prompts::all_defaults()
            .into_iter()
            .map(|(name, description, template, hint)| Skill::new(name, description, template, hint))
            .collect();
        Self {
            skills,
            default_name: DEFAULT_SKILL.to_string(),
        }
    }

    /// A registry from an explicit list; `default_name` must be among them
    pub fn new(skills: Vec<Skill>, default_name: &str) -> Result<Self, SkillError> {
        if skills.is_empty() {
            return Err(SkillError::Empty);
        }
        let mut registry = Self {
            skills: Vec::with_capacity(skills.len()),
            default_name: default_name.to_string(),
        };
        for skill in skills {
            registry.register(skill)?;
        }
        if registry.lookup(default_name).is_none() {
            return Err(SkillError::MissingDefault(default_name.to_string()));
        }
        Ok(registry)
    }

    /// Add a skill; fails if the name is taken
    pub fn register(&mut self, skill: Skill) -> Result<(), SkillError> {
        if skill.name.trim().is_empty() {
            return Err(SkillError::UnnamedSkill);
        }
        if self.lookup(&skill.name).is_some() {
            return Err(SkillError::Clash(skill.name));
        }
        self.skills.push(skill);
        Ok(())
    }

    /// Add a skill, replacing any entry with the same name in place
    pub fn register_override(&mut self, skill: Skill) -> Result<(), SkillError> {
        if skill.name.trim().is_empty() {
            return Err(SkillError::UnnamedSkill);
        }
        match self.skills.iter_mut().find(|s| s.name == skill.name) {
            Some(existing) => {
                tracing::info!(skill = %skill.name, "overriding skill");
                *existing = skill;
            }
            None => self.skills.push(skill),
        }
        Ok(())
    }

    /// New registry with `custom` merged in; built-ins stay available
    pub fn merged(&self, custom: Vec<Skill>, allow_override: bool) -> Result<Self, SkillError> {
        let mut merged = self.clone();
        for skill in custom {
            if allow_override {
                merged.register_override(skill)?;
            } else {
                merged.register(skill)?;
            }
        }
        Ok(merged)
    }

    pub fn lookup(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// The named skill, or the default one
    pub fn get(&self, name: &str) -> &Skill {
        self.lookup(name).unwrap_or_else(|| self.default_skill())
    }

    pub fn default_skill(&self) -> &Skill {
        // Constructors guarantee the default is present; the first entry
        // is a last resort that is never reached.
        self.lookup(&self.default_name)
            .unwrap_or_else(|| &self.skills[0])
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// All skills in registration order
    pub fn catalog(&self) -> &[Skill] {
        &self.skills
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Merge the skills stored in a JSON file into a copy of this registry
    pub fn load_custom(&self, path: &Path, allow_override: bool) -> anyhow::Result<Self> {
        let custom = read_skills_file(path)?;
        let count = custom.len();
        let merged = self
            .merged(custom, allow_override)
            .with_context(|| format!("Failed to merge skills from {}", path.display()))?;
        tracing::info!(path = %path.display(), count, "loaded custom skills");
        Ok(merged)
    }
}

/// Read a JSON array of skills from disk
pub fn read_skills_file(path: &Path) -> anyhow::Result<Vec<Skill>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read skills file {}", path.display()))?;
    let skills: Vec<Skill> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid skills file {}", path.display()))?;
    Ok(skills)
}
