//! Batch orchestrator: personas in, result documents out.
//!
//! Two levels of parallelism compose here: `workers` personas are processed
//! at once, and each persona's batch fans out inside the inference gateway.
//! A persona is written only after all of its units have an outcome, and
//! each persona key is owned by exactly one in-flight task.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{Persona, ScenarioCatalog};
use crate::judge::{InferenceGateway, JudgeError, Judgment};
use crate::payload::{build_payloads, RequestUnit};
use crate::prompts::PromptTemplate;
use crate::store::{
    OrderedMap, PersonaKey, PersonaResult, RecordOptions, ResultStore, ScenarioEntry,
    ScenarioRecord, SidePayoff, StoreError,
};
use crate::summary::join_keys;

pub const SUMMARY_FILE: &str = "_summary.json";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write run summary {path}: {message}")]
    Summary { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One gateway batch per persona.
    #[default]
    Bulk,
    /// One gateway call at a time per persona.
    Serial,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workers: usize,
    pub mode: RunMode,
    /// Pause after each persona, for provider quota limits.
    pub cooldown: Option<Duration>,
    /// Skip personas whose document already exists at run start.
    pub skip_existing: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            mode: RunMode::Bulk,
            cooldown: None,
            skip_existing: true,
        }
    }
}

/// Something to run: a key plus the persona text rendered into prompts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTarget {
    pub key: PersonaKey,
    pub description: String,
}

impl From<&Persona> for RunTarget {
    fn from(p: &Persona) -> Self {
        Self {
            key: PersonaKey::Persona(p.idx),
            description: p.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaFailure {
    pub persona: PersonaKey,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scenario_digest: String,
    /// Targets left alone because a document already existed.
    pub skipped: Vec<PersonaKey>,
    pub attempted: Vec<PersonaKey>,
    pub completed: usize,
    pub failed: Vec<PersonaFailure>,
    /// Slots persisted as `{error}` entries across completed personas.
    pub slot_errors: usize,
    pub cost_nanodollars: i64,
}

impl RunSummary {
    pub fn cost_dollars(&self) -> f64 {
        self.cost_nanodollars as f64 / 1_000_000_000.0
    }

    /// Write as pretty JSON to `<dir>/_summary.json`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, RunError> {
        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|e| RunError::Summary {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| RunError::Summary {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(path)
    }
}

struct PersonaOutcome {
    key: PersonaKey,
    result: Result<usize, String>,
}

pub struct Runner {
    gateway: Arc<dyn InferenceGateway>,
    scenarios: Arc<ScenarioCatalog>,
    template: PromptTemplate,
    store: ResultStore,
    config: RunnerConfig,
    run_id: Uuid,
}

impl Runner {
    pub fn new(
        gateway: Arc<dyn InferenceGateway>,
        scenarios: Arc<ScenarioCatalog>,
        template: PromptTemplate,
        store: ResultStore,
        config: RunnerConfig,
    ) -> Self {
        Self {
            gateway,
            scenarios,
            template,
            store,
            config,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub async fn run(&self, personas: &[Persona]) -> Result<RunSummary, RunError> {
        self.run_targets(personas.iter().map(RunTarget::from).collect())
            .await
    }

    /// The no-persona condition, `repeats` times, under
    /// `NOPERSONA_0001..=NOPERSONA_<repeats>`.
    pub async fn run_baseline(&self, repeats: u32) -> Result<RunSummary, RunError> {
        let targets = (1..=repeats)
            .map(|k| RunTarget {
                key: PersonaKey::Baseline(k),
                description: String::new(),
            })
            .collect();
        self.run_targets(targets).await
    }

    pub async fn run_targets(&self, targets: Vec<RunTarget>) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let spent_before = self.gateway.spent_nanodollars();

        let existing: BTreeSet<PersonaKey> = if self.config.skip_existing {
            self.store.keys()?
        } else {
            BTreeSet::new()
        };

        let total = targets.len();
        let (skipped_targets, pending): (Vec<RunTarget>, Vec<RunTarget>) = targets
            .into_iter()
            .partition(|t| existing.contains(&t.key));
        let skipped: Vec<PersonaKey> = skipped_targets.iter().map(|t| t.key).collect();
        let attempted: Vec<PersonaKey> = pending.iter().map(|t| t.key).collect();
        let to_run = attempted.len();

        info!(
            "[runner] run {}: {} personas ({} skipped, {} to run, {} units each, {:?} mode, {} workers)",
            self.run_id,
            total,
            skipped.len(),
            to_run,
            self.scenarios.option_count(),
            self.config.mode,
            self.config.workers.max(1)
        );
        if !skipped.is_empty() {
            info!("[runner] skipped (already complete): {}", join_keys(&skipped));
        }
        if !attempted.is_empty() {
            info!("[runner] attempting: {}", join_keys(&attempted));
        }

        let outcomes: Vec<PersonaOutcome> = stream::iter(pending.into_iter().enumerate())
            .map(|(i, target)| async move {
                let key = target.key;
                let result = self.run_one(target).await;
                match &result {
                    Ok(slot_errors) => info!(
                        "[runner] [{}/{}] done: {} ({} slot errors)",
                        i + 1,
                        to_run,
                        key,
                        slot_errors
                    ),
                    Err(e) => warn!("[runner] [{}/{}] FAILED: {}: {}", i + 1, to_run, key, e),
                }
                if let Some(pause) = self.config.cooldown {
                    tokio::time::sleep(pause).await;
                }
                PersonaOutcome { key, result }
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut completed = 0;
        let mut slot_errors = 0;
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(errors) => {
                    completed += 1;
                    slot_errors += errors;
                }
                Err(error) => failed.push(PersonaFailure {
                    persona: outcome.key,
                    error,
                }),
            }
        }
        failed.sort_by_key(|f| f.persona);

        let summary = RunSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            scenario_digest: self.scenarios.digest().to_string(),
            skipped,
            attempted,
            completed,
            failed,
            slot_errors,
            cost_nanodollars: self.gateway.spent_nanodollars() - spent_before,
        };
        info!(
            "[runner] complete: {} written, {} failed, {} skipped, {} slot errors, cost ${:.4}",
            summary.completed,
            summary.failed.len(),
            summary.skipped.len(),
            summary.slot_errors,
            summary.cost_dollars()
        );
        Ok(summary)
    }

    /// Build, dispatch, assemble and persist one persona. Returns the number
    /// of slots stored as errors.
    async fn run_one(&self, target: RunTarget) -> Result<usize, String> {
        let payloads = build_payloads(
            target.key,
            &target.description,
            &self.scenarios,
            self.template,
        );

        let results = match self.config.mode {
            RunMode::Bulk => self
                .gateway
                .batch(&payloads.prompts)
                .await
                .map_err(|e| e.to_string())?,
            RunMode::Serial => {
                let mut results = Vec::with_capacity(payloads.len());
                for prompt in &payloads.prompts {
                    results.push(self.gateway.invoke(prompt).await);
                }
                results
            }
        };

        if results.len() != payloads.len() {
            return Err(format!(
                "gateway returned {} results for {} units",
                results.len(),
                payloads.len()
            ));
        }

        let (doc, slot_errors) = assemble(&target, &payloads.units, results);
        self.store
            .write(target.key, &doc)
            .map_err(|e| e.to_string())?;
        Ok(slot_errors)
    }
}

fn assemble(
    target: &RunTarget,
    units: &[RequestUnit],
    results: Vec<Result<Judgment, JudgeError>>,
) -> (PersonaResult, usize) {
    let mut doc = PersonaResult::new();
    let mut slot_errors = 0;

    for (unit, result) in units.iter().zip(results) {
        let entry = match result {
            Ok(judgment) => ScenarioEntry::Answered(ScenarioRecord {
                persona_id: Some(target.key),
                persona_desc: target.description.clone(),
                difficulty: unit.difficulty.clone(),
                metric: unit.metric.clone(),
                options: RecordOptions {
                    left: SidePayoff {
                        a: unit.left.to_other().clone(),
                        b: unit.left.to_self().clone(),
                    },
                    right: SidePayoff {
                        a: unit.right.to_other().clone(),
                        b: unit.right.to_self().clone(),
                    },
                },
                thought: judgment.reasoning,
                answer: judgment.choice.as_str().to_string(),
            }),
            Err(e) => {
                slot_errors += 1;
                ScenarioEntry::failed(e.to_string())
            }
        };
        doc.get_or_insert_with(&unit.difficulty, OrderedMap::new)
            .insert(unit.label(), entry);
    }

    (doc, slot_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Payoff;
    use crate::gateway::ProviderError;
    use crate::judge::Choice;

    fn unit(difficulty: &str, option_index: usize) -> RequestUnit {
        RequestUnit {
            persona: PersonaKey::Persona(1),
            difficulty: difficulty.into(),
            option_index,
            metric: "Fairness".into(),
            left: Payoff::new(0, 600),
            right: Payoff::new(400, 400),
        }
    }

    #[test]
    fn assemble_keeps_errors_per_slot() {
        let target = RunTarget {
            key: PersonaKey::Persona(1),
            description: "A retired judge".into(),
        };
        let units = vec![unit("easy", 0), unit("easy", 1), unit("hard", 0)];
        let results = vec![
            Ok(Judgment {
                reasoning: "equal split is fair".into(),
                choice: Choice::Right,
            }),
            Err(JudgeError::Provider(ProviderError::Timeout(
                Duration::from_secs(1),
                None,
            ))),
            Ok(Judgment {
                reasoning: "x".into(),
                choice: Choice::Other("Both".into()),
            }),
        ];

        let (doc, errors) = assemble(&target, &units, results);
        assert_eq!(errors, 1);

        let easy = doc.get("easy").unwrap();
        let rec = easy.get("scenario_1").unwrap().as_record().unwrap();
        assert_eq!(rec.answer, "Right");
        assert_eq!(rec.options.left.b.to_string(), "600");
        assert_eq!(rec.persona_id, Some(PersonaKey::Persona(1)));
        assert!(easy.get("scenario_2").unwrap().is_failed());
        let hard = doc.get("hard").unwrap();
        assert_eq!(
            hard.get("scenario_1").unwrap().as_record().unwrap().answer,
            "Both"
        );
    }
}
