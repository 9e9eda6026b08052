//! Validator / resumer: decide which personas need another run.
//!
//! Two independent questions: which known personas have no document at all
//! ([`missing_keys`]), and which documents exist but are unusable
//! ([`check_problems`]). Both only read the store.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{slots, PersonaKey, ResultStore, ScenarioEntry, StoreError};

/// Known keys with no document in the store, sorted.
pub fn missing_keys(
    known: impl IntoIterator<Item = PersonaKey>,
    store: &ResultStore,
) -> Result<Vec<PersonaKey>, StoreError> {
    let present = store.keys()?;
    let known: BTreeSet<PersonaKey> = known.into_iter().collect();
    Ok(known.difference(&present).copied().collect())
}

/// Content thresholds for a usable slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemPolicy {
    pub min_thought_chars: usize,
    pub min_answer_chars: usize,
    /// Answers other than exactly `Left` / `Right` are problems.
    pub require_known_choice: bool,
}

impl Default for ProblemPolicy {
    fn default() -> Self {
        Self {
            min_thought_chars: 5,
            min_answer_chars: 2,
            require_known_choice: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The slot holds an `{error}` entry.
    ErrorEntry,
    ShortThought,
    MissingAnswer,
    InvalidAnswer,
    /// An expected (difficulty, scenario) slot is absent.
    MissingSlot,
    /// The document could not be read or parsed.
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub persona_id: PersonaKey,
    pub file: String,
    /// `difficulty/scenario_n`, absent for whole-document issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    pub kind: IssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub scanned: usize,
    /// Sorted, deduplicated.
    pub flagged: Vec<PersonaKey>,
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.flagged.is_empty()
    }
}

/// Scan every document in the store.
///
/// `expected` lists the (difficulty, scenario label) slots a complete
/// document has; pass `None` to skip the completeness check.
pub fn check_problems(
    store: &ResultStore,
    policy: &ProblemPolicy,
    expected: Option<&[(String, String)]>,
) -> Result<ValidationReport, StoreError> {
    let keys = store.keys()?;
    let mut report = ValidationReport {
        scanned: keys.len(),
        ..Default::default()
    };

    for key in keys {
        let issues = check_document(store, key, policy, expected);
        if !issues.is_empty() {
            debug!("[validate] {}: {} issues", key, issues.len());
            report.flagged.push(key);
            report.issues.extend(issues);
        }
    }

    info!(
        "[validate] scanned {} documents in {}: {} flagged",
        report.scanned,
        store.dir().display(),
        report.flagged.len()
    );
    Ok(report)
}

fn check_document(
    store: &ResultStore,
    key: PersonaKey,
    policy: &ProblemPolicy,
    expected: Option<&[(String, String)]>,
) -> Vec<Issue> {
    let file = key.file_name();
    let issue = |slot: Option<String>, kind: IssueKind, detail: String| Issue {
        persona_id: key,
        file: file.clone(),
        slot,
        kind,
        detail,
    };

    let doc = match store.read(key) {
        Ok(doc) => doc,
        Err(e) => return vec![issue(None, IssueKind::Unreadable, e.to_string())],
    };

    let mut issues = Vec::new();
    for (difficulty, label, entry) in slots(&doc) {
        let slot = || Some(format!("{difficulty}/{label}"));
        let record = match entry {
            ScenarioEntry::Failed(failed) => {
                issues.push(issue(slot(), IssueKind::ErrorEntry, failed.error.clone()));
                continue;
            }
            ScenarioEntry::Answered(record) => record,
        };

        let thought_len = record.thought.trim().chars().count();
        if thought_len < policy.min_thought_chars {
            issues.push(issue(
                slot(),
                IssueKind::ShortThought,
                format!("thought has {thought_len} chars"),
            ));
        }

        let answer = record.answer.trim();
        if answer.chars().count() < policy.min_answer_chars {
            issues.push(issue(
                slot(),
                IssueKind::MissingAnswer,
                format!("answer {answer:?}"),
            ));
        } else if policy.require_known_choice && answer != "Left" && answer != "Right" {
            issues.push(issue(
                slot(),
                IssueKind::InvalidAnswer,
                format!("answer {answer:?}"),
            ));
        }
    }

    if let Some(expected) = expected {
        for (difficulty, label) in expected {
            let present = doc
                .get(difficulty)
                .is_some_and(|scenarios| scenarios.get(label).is_some());
            if !present {
                issues.push(issue(
                    Some(format!("{difficulty}/{label}")),
                    IssueKind::MissingSlot,
                    "slot absent".into(),
                ));
            }
        }
    }

    issues
}

/// Write issues as JSON lines.
pub fn write_issue_report(path: &Path, issues: &[Issue]) -> std::io::Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for issue in issues {
        serde_json::to_writer(&mut out, issue)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}
