//! Persisted defaults in `.prism/config.json`.
//!
//! Every field is optional; a set field overrides the built-in default and
//! command-line flags override the file.

use std::path::{Path, PathBuf};

use prism_core::swarm::CoordinatorConfig;
use serde::{Deserialize, Serialize};

/// Runtime directory holding `config.json` and an optional `.env`
pub const PRISM_DIR: &str = ".prism";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Worker sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// JSON array of extra skills
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills_file: Option<PathBuf>,
}

impl PersistedConfig {
    /// Read `<dir>/config.json`. A missing file means no overrides; an
    /// unreadable one is logged and ignored.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("config.json");
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config");
                Self::default()
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config");
                Self::default()
            }
        }
    }

    /// Fields set in `other` win
    pub fn merge(&mut self, other: PersistedConfig) {
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.max_tokens.is_some() {
            self.max_tokens = other.max_tokens;
        }
        if other.synthesis_max_tokens.is_some() {
            self.synthesis_max_tokens = other.synthesis_max_tokens;
        }
        if other.max_workers.is_some() {
            self.max_workers = other.max_workers;
        }
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.skills_file.is_some() {
            self.skills_file = other.skills_file;
        }
    }

    /// Overlay the set fields onto a coordinator configuration
    pub fn apply(&self, config: &mut CoordinatorConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(max_tokens) = self.synthesis_max_tokens {
            config.synthesis_max_tokens = max_tokens;
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(temperature) = self.temperature {
            config.worker_temperature = temperature;
        }
        if let Some(url) = &self.base_url {
            config.base_url = Some(url.clone());
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PersistedConfig::load(dir.path()), PersistedConfig::default());
    }

    #[test]
    fn test_load_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model": "claude-3-5-haiku-latest", "max_workers": 8, "skills_file": "skills.json"}"#,
        )
        .unwrap();

        let persisted = PersistedConfig::load(dir.path());
        let mut config = CoordinatorConfig::default();
        persisted.apply(&mut config);

        assert_eq!(config.model, "claude-3-5-haiku-latest");
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.synthesis_max_tokens, 8192);
        assert_eq!(persisted.skills_file, Some(PathBuf::from("skills.json")));
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        assert_eq!(PersistedConfig::load(dir.path()), PersistedConfig::default());
    }

    #[test]
    fn test_merge_prefers_set_fields() {
        let mut file = PersistedConfig {
            model: Some("from-file".into()),
            max_tokens: Some(1000),
            ..Default::default()
        };
        file.merge(PersistedConfig {
            model: Some("from-flag".into()),
            max_workers: Some(2),
            ..Default::default()
        });

        assert_eq!(file.model.as_deref(), Some("from-flag"));
        assert_eq!(file.max_tokens, Some(1000));
        assert_eq!(file.max_workers, Some(2));
    }
}
