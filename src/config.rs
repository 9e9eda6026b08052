//! Experiment configuration file.
//!
//! A JSON document naming the inputs, the output directories and the model
//! settings for a run. Relative paths are resolved against the directory
//! containing the config file. Provider credentials never live here; they
//! come from the environment (see [`crate::gateway::openrouter`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::judge::JudgeConfig;
use crate::prompts::Language;
use crate::runner::{RunMode, RunnerConfig};
use crate::validate::ProblemPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_baseline_dir() -> PathBuf {
    PathBuf::from("baseline")
}
fn default_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_max_tokens() -> Option<u32> {
    Some(512)
}
fn default_workers() -> usize {
    4
}
fn default_concurrency() -> usize {
    8
}
fn default_call_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// JSON-lines persona file.
    pub personas: PathBuf,
    /// Scenario definition file.
    pub scenarios: PathBuf,
    /// Result store for persona runs.
    pub output_dir: PathBuf,
    /// Result store for no-persona baseline runs.
    #[serde(default = "default_baseline_dir")]
    pub baseline_dir: PathBuf,
    #[serde(default)]
    pub language: Language,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
    /// Personas processed at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// In-flight requests per persona.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub cooldown_secs: Option<f64>,
    #[serde(default)]
    pub max_personas: Option<usize>,
    #[serde(default)]
    pub problems: ProblemPolicy,
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for p in [
            &mut self.personas,
            &mut self.scenarios,
            &mut self.output_dir,
            &mut self.baseline_dir,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if self.workers == 0 || self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "workers and concurrency must be at least 1".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("call_timeout_secs must be > 0".into()));
        }
        if self.cooldown_secs.is_some_and(|s| !s.is_finite() || s < 0.0) {
            return Err(ConfigError::Invalid(
                "cooldown_secs must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown_secs
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn judge_config(&self) -> JudgeConfig {
        JudgeConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            concurrency: self.concurrency,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn runner_config(&self, mode: RunMode, skip_existing: bool) -> RunnerConfig {
        RunnerConfig {
            workers: self.workers,
            mode,
            cooldown: self.cooldown(),
            skip_existing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        std::fs::write(
            &path,
            r#"{"personas": "data/personas.jsonl", "scenarios": "/abs/scenarios.json", "output_dir": "results/en", "language": "kr"}"#,
        )
        .unwrap();

        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.personas, dir.path().join("data/personas.jsonl"));
        assert_eq!(config.scenarios, PathBuf::from("/abs/scenarios.json"));
        assert_eq!(config.baseline_dir, dir.path().join("baseline"));
        assert_eq!(config.language, Language::Kr);
        assert_eq!(config.workers, 4);
        assert_eq!(config.problems, ProblemPolicy::default());
        assert_eq!(config.cooldown(), None);
        assert_eq!(config.judge_config().call_timeout, Duration::from_secs(120));
    }

    #[test]
    fn rejects_zero_workers_and_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"personas": "p", "scenarios": "s", "output_dir": "o", "workers": 0}"#,
        )
        .unwrap();
        assert!(matches!(
            ExperimentConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(
            &path,
            r#"{"personas": "p", "scenarios": "s", "output_dir": "o", "wrokers": 2}"#,
        )
        .unwrap();
        assert!(matches!(
            ExperimentConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn problem_policy_overrides_are_partial() {
        let config: ExperimentConfig = serde_json::from_str(
            r#"{"personas": "p", "scenarios": "s", "output_dir": "o",
                "problems": {"min_thought_chars": 20}, "cooldown_secs": 1.5}"#,
        )
        .unwrap();
        assert_eq!(config.problems.min_thought_chars, 20);
        assert_eq!(config.problems.min_answer_chars, 2);
        assert_eq!(config.cooldown(), Some(Duration::from_millis(1500)));
    }
}
