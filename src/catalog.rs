//! Persona and scenario catalogs.
//!
//! Both are read once at startup and never mutated. Anything wrong with the
//! scenario file is fatal; individual unreadable persona lines are skipped
//! with a warning, matching how the source datasets were consumed.

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid scenario file {path}: {message}")]
    Scenario { path: PathBuf, message: String },
    #[error("duplicate persona idx {idx} in {path}")]
    DuplicateId { path: PathBuf, idx: u64 },
}

// =============================================================================
// Personas
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub idx: u64,
    pub description: String,
    /// Remaining fields of the source record (domain labels etc.).
    pub attributes: Map<String, Value>,
}

impl Persona {
    pub fn new(idx: u64, description: impl Into<String>) -> Self {
        Self {
            idx,
            description: description.into(),
            attributes: Map::new(),
        }
    }

    /// String value of a source-record attribute, trimmed.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Ordered, read-only persona collection.
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: Vec<Persona>,
}

impl PersonaCatalog {
    pub fn new(personas: Vec<Persona>) -> Self {
        Self { personas }
    }

    /// Load a JSON-lines persona file. Each record needs `persona` (text) and
    /// `idx` (integer or integer string). Stops after `limit` personas.
    pub fn load_jsonl(path: &Path, limit: Option<usize>) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut personas = Vec::new();
        let mut seen = HashSet::new();
        let mut skipped = 0usize;

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            if limit.is_some_and(|max| personas.len() >= max) {
                break;
            }
            let line = line.map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_persona_line(&line) {
                Some(persona) => {
                    if !seen.insert(persona.idx) {
                        return Err(CatalogError::DuplicateId {
                            path: path.to_path_buf(),
                            idx: persona.idx,
                        });
                    }
                    personas.push(persona);
                }
                None => {
                    skipped += 1;
                    warn!(line = line_no + 1, "[catalog] skipping unreadable persona record");
                }
            }
        }

        info!(
            "[catalog] loaded {} personas from {} ({} skipped)",
            personas.len(),
            path.display(),
            skipped
        );
        Ok(Self { personas })
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.personas.iter().map(|p| p.idx).collect()
    }

    pub fn get(&self, idx: u64) -> Option<&Persona> {
        self.personas.iter().find(|p| p.idx == idx)
    }

    /// Personas whose idx is in `ids`, in catalog order.
    pub fn select(&self, ids: &[u64]) -> Vec<Persona> {
        let wanted: HashSet<u64> = ids.iter().copied().collect();
        self.personas
            .iter()
            .filter(|p| wanted.contains(&p.idx))
            .cloned()
            .collect()
    }

    /// Ids with no persona in this catalog, in the order given.
    pub fn unknown(&self, ids: &[u64]) -> Vec<u64> {
        ids.iter()
            .copied()
            .filter(|id| self.get(*id).is_none())
            .collect()
    }
}

fn parse_persona_line(line: &str) -> Option<Persona> {
    let mut record: Map<String, Value> = serde_json::from_str(line).ok()?;
    let description = match record.remove("persona")? {
        Value::String(s) => s,
        _ => return None,
    };
    let idx = match record.remove("idx")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some(Persona {
        idx,
        description,
        attributes: record,
    })
}

// =============================================================================
// Scenarios
// =============================================================================

/// One side of a binary choice: `[to_other, to_self]` on the wire, i.e.
/// (Person A, Person B) where the model plays Person B.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payoff(pub Number, pub Number);

impl Payoff {
    pub fn new(to_other: i64, to_self: i64) -> Self {
        Self(Number::from(to_other), Number::from(to_self))
    }

    pub fn to_other(&self) -> &Number {
        &self.0
    }

    pub fn to_self(&self) -> &Number {
        &self.1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionPair {
    pub left: Payoff,
    pub right: Payoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    /// Tier label ("easy", "medium", "hard", ...). Declaration order is tier order.
    pub difficulty: String,
    pub options: Vec<OptionPair>,
    /// One metric label per option, positionally.
    pub metrics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    experiments: Vec<ScenarioDefinition>,
}

/// Ordered, validated scenario definitions.
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    experiments: Vec<ScenarioDefinition>,
    digest: String,
}

impl ScenarioCatalog {
    pub fn new(experiments: Vec<ScenarioDefinition>) -> Result<Self, String> {
        validate_experiments(&experiments)?;
        let canonical = serde_json::to_vec(&experiments).map_err(|e| e.to_string())?;
        Ok(Self {
            experiments,
            digest: blake3::hash(&canonical).to_hex().to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ScenarioFile =
            serde_json::from_str(&raw).map_err(|e| CatalogError::Scenario {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let catalog = Self::new(file.experiments).map_err(|message| CatalogError::Scenario {
            path: path.to_path_buf(),
            message,
        })?;
        info!(
            "[catalog] loaded {} scenario tiers ({} options) from {}",
            catalog.experiments.len(),
            catalog.option_count(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn experiments(&self) -> &[ScenarioDefinition] {
        &self.experiments
    }

    /// Total request units per persona.
    pub fn option_count(&self) -> usize {
        self.experiments.iter().map(|e| e.options.len()).sum()
    }

    /// blake3 of the canonical scenario JSON; stamped into run summaries so
    /// result sets from different scenario files are not mixed by accident.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Every (difficulty, scenario label) slot a complete result must contain.
    pub fn expected_slots(&self) -> Vec<(String, String)> {
        self.experiments
            .iter()
            .flat_map(|exp| {
                (0..exp.options.len())
                    .map(move |i| (exp.difficulty.clone(), scenario_label(i)))
            })
            .collect()
    }
}

/// `scenario_<n>` with 1-based numbering within a difficulty tier.
pub fn scenario_label(option_index: usize) -> String {
    format!("scenario_{}", option_index + 1)
}

fn validate_experiments(experiments: &[ScenarioDefinition]) -> Result<(), String> {
    if experiments.is_empty() {
        return Err("no experiments defined".into());
    }
    let mut tiers = HashSet::new();
    for exp in experiments {
        if exp.difficulty.trim().is_empty() {
            return Err("experiment with empty difficulty".into());
        }
        if !tiers.insert(exp.difficulty.as_str()) {
            return Err(format!("duplicate difficulty '{}'", exp.difficulty));
        }
        if exp.options.len() != exp.metrics.len() {
            return Err(format!(
                "difficulty '{}' has {} options but {} metrics",
                exp.difficulty,
                exp.options.len(),
                exp.metrics.len()
            ));
        }
    }
    Ok(())
}
