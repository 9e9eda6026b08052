//! Aggregation over a result store: Left/Right tallies and per-group merges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::PersonaCatalog;
use crate::store::{slots, PersonaKey, PersonaResult, ResultStore, ScenarioEntry, StoreError};

/// Group name for personas lacking the grouping attribute.
pub const UNKNOWN_GROUP: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChoiceTally {
    pub left: usize,
    pub right: usize,
    /// Answers that are neither Left nor Right.
    pub other: usize,
    pub errors: usize,
}

impl ChoiceTally {
    fn add(&mut self, entry: &ScenarioEntry) {
        match entry {
            ScenarioEntry::Failed(_) => self.errors += 1,
            ScenarioEntry::Answered(rec) => match rec.answer.trim() {
                "Left" => self.left += 1,
                "Right" => self.right += 1,
                _ => self.other += 1,
            },
        }
    }

    fn merge(&mut self, other: &ChoiceTally) {
        self.left += other.left;
        self.right += other.right;
        self.other += other.other;
        self.errors += other.errors;
    }

    pub fn decided(&self) -> usize {
        self.left + self.right
    }

    /// Share of Left among Left/Right answers, in percent.
    pub fn left_pct(&self) -> f64 {
        pct(self.left, self.decided())
    }

    pub fn right_pct(&self) -> f64 {
        pct(self.right, self.decided())
    }
}

fn pct(n: usize, of: usize) -> f64 {
    if of == 0 {
        0.0
    } else {
        n as f64 * 100.0 / of as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioTally {
    pub difficulty: String,
    pub scenario: String,
    pub metric: String,
    #[serde(flatten)]
    pub tally: ChoiceTally,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    pub documents: usize,
    pub unreadable: Vec<PersonaKey>,
    /// In first-seen order, which is declaration order for well-formed stores.
    pub scenarios: Vec<ScenarioTally>,
    pub total: ChoiceTally,
}

impl StoreSummary {
    pub fn add_document(&mut self, doc: &PersonaResult) {
        self.documents += 1;
        for (difficulty, label, entry) in slots(doc) {
            let pos = match self
                .scenarios
                .iter()
                .position(|s| s.difficulty == difficulty && s.scenario == label)
            {
                Some(pos) => pos,
                None => {
                    self.scenarios.push(ScenarioTally {
                        difficulty: difficulty.to_string(),
                        scenario: label.to_string(),
                        metric: String::new(),
                        tally: ChoiceTally::default(),
                    });
                    self.scenarios.len() - 1
                }
            };
            let row = &mut self.scenarios[pos];
            if row.metric.is_empty() {
                if let Some(rec) = entry.as_record() {
                    row.metric = rec.metric.clone();
                }
            }
            row.tally.add(entry);
        }
        self.total = self
            .scenarios
            .iter()
            .fold(ChoiceTally::default(), |mut acc, s| {
                acc.merge(&s.tally);
                acc
            });
    }

    /// Plain-text table for terminals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<10} {:<12} {:<28} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7}",
            "difficulty", "scenario", "metric", "left", "right", "other", "error", "left%", "right%"
        );
        for s in &self.scenarios {
            let _ = writeln!(
                out,
                "{:<10} {:<12} {:<28} {:>6} {:>6} {:>6} {:>6} {:>6.1}% {:>6.1}%",
                s.difficulty,
                s.scenario,
                truncate(&s.metric, 28),
                s.tally.left,
                s.tally.right,
                s.tally.other,
                s.tally.errors,
                s.tally.left_pct(),
                s.tally.right_pct()
            );
        }
        let _ = writeln!(
            out,
            "{:<10} {:<12} {:<28} {:>6} {:>6} {:>6} {:>6} {:>6.1}% {:>6.1}%",
            "total",
            "",
            format!("({} documents)", self.documents),
            self.total.left,
            self.total.right,
            self.total.other,
            self.total.errors,
            self.total.left_pct(),
            self.total.right_pct()
        );
        if !self.unreadable.is_empty() {
            let _ = writeln!(out, "unreadable: {}", join_keys(&self.unreadable));
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max.saturating_sub(1)).collect();
        t.push('~');
        t
    }
}

pub fn join_keys(keys: &[PersonaKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tally every document in the store.
pub fn summarize(store: &ResultStore) -> Result<StoreSummary, SummaryError> {
    let mut summary = StoreSummary::default();
    for key in store.keys()? {
        match store.read(key) {
            Ok(doc) => summary.add_document(&doc),
            Err(e) => {
                warn!("[summary] skipping {}: {}", key, e);
                summary.unreadable.push(key);
            }
        }
    }
    Ok(summary)
}

/// Group name of a persona under `attribute`.
fn group_of(personas: &PersonaCatalog, idx: u64, attribute: &str) -> String {
    personas
        .get(idx)
        .and_then(|p| p.attribute(attribute))
        .unwrap_or(UNKNOWN_GROUP)
        .to_string()
}

/// Tally per value of a persona attribute. Documents for personas outside
/// the catalog, and baseline documents, are ignored.
pub fn summarize_by(
    store: &ResultStore,
    personas: &PersonaCatalog,
    attribute: &str,
) -> Result<BTreeMap<String, StoreSummary>, SummaryError> {
    let known: BTreeSet<u64> = personas.ids().into_iter().collect();
    let mut groups: BTreeMap<String, StoreSummary> = BTreeMap::new();

    for key in store.keys()? {
        let Some(idx) = key.persona_idx().filter(|idx| known.contains(idx)) else {
            continue;
        };
        let group = groups
            .entry(group_of(personas, idx, attribute))
            .or_default();
        match store.read(key) {
            Ok(doc) => group.add_document(&doc),
            Err(e) => {
                warn!("[summary] skipping {}: {}", key, e);
                group.unreadable.push(key);
            }
        }
    }
    Ok(groups)
}

#[derive(Debug, Serialize)]
struct MergedEntry<'a> {
    idx: u64,
    result: &'a PersonaResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedGroup {
    pub group: String,
    pub file: PathBuf,
    /// Catalog personas in this group.
    pub expected: usize,
    /// Readable documents actually merged.
    pub merged: usize,
}

/// Write one `<group>.json` per attribute value, each a JSON array of
/// `{idx, result}` in catalog order.
pub fn merge_by_attribute(
    store: &ResultStore,
    personas: &PersonaCatalog,
    attribute: &str,
    out_dir: &Path,
) -> Result<Vec<MergedGroup>, SummaryError> {
    std::fs::create_dir_all(out_dir).map_err(|e| SummaryError::Write {
        path: out_dir.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut grouped: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for persona in personas.personas() {
        grouped
            .entry(group_of(personas, persona.idx, attribute))
            .or_default()
            .push(persona.idx);
    }

    let mut written = Vec::with_capacity(grouped.len());
    let mut stems: BTreeSet<String> = BTreeSet::new();
    for (group, ids) in grouped {
        let mut docs = Vec::with_capacity(ids.len());
        for idx in &ids {
            let key = PersonaKey::Persona(*idx);
            if !store.contains(key) {
                continue;
            }
            match store.read(key) {
                Ok(doc) => docs.push((*idx, doc)),
                Err(e) => warn!("[merge] skipping {}: {}", key, e),
            }
        }
        let entries: Vec<MergedEntry<'_>> = docs
            .iter()
            .map(|(idx, result)| MergedEntry { idx: *idx, result })
            .collect();

        let stem = unique_stem(&group, &mut stems);
        let path = out_dir.join(format!("{stem}.json"));
        let json = serde_json::to_string_pretty(&entries).map_err(|e| SummaryError::Write {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| SummaryError::Write {
            path: path.clone(),
            message: e.to_string(),
        })?;

        if entries.len() != ids.len() {
            warn!(
                "[merge] {}: expected {} personas, merged {}",
                group,
                ids.len(),
                entries.len()
            );
        }
        info!("[merge] wrote {} ({} personas)", path.display(), entries.len());
        written.push(MergedGroup {
            group,
            file: path,
            expected: ids.len(),
            merged: entries.len(),
        });
    }
    Ok(written)
}

/// Attribute values become file names; keep them portable.
fn file_stem(group: &str) -> String {
    let stem: String = group
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        UNKNOWN_GROUP.to_string()
    } else {
        stem
    }
}

/// Distinct groups that sanitize to the same stem get `_2`, `_3`, ...
fn unique_stem(group: &str, taken: &mut BTreeSet<String>) -> String {
    let base = file_stem(group);
    let mut stem = base.clone();
    let mut n = 1;
    while taken.contains(&stem) {
        n += 1;
        stem = format!("{base}_{n}");
    }
    if n > 1 {
        warn!(
            "[merge] group {:?} shares file name {} with another group; writing {}.json",
            group, base, stem
        );
    }
    taken.insert(stem.clone());
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Persona;
    use crate::store::{OrderedMap, RecordOptions, ScenarioRecord};

    fn doc(answers: &[(&str, &str)]) -> PersonaResult {
        let mut doc = PersonaResult::new();
        for (label, answer) in answers {
            let entry = if *answer == "ERR" {
                ScenarioEntry::failed("boom")
            } else {
                ScenarioEntry::Answered(ScenarioRecord {
                    persona_id: None,
                    persona_desc: String::new(),
                    difficulty: "easy".into(),
                    metric: "Fairness".into(),
                    options: RecordOptions::default(),
                    thought: "because".into(),
                    answer: answer.to_string(),
                })
            };
            doc.get_or_insert_with("easy", OrderedMap::new)
                .insert(*label, entry);
        }
        doc
    }

    fn persona(idx: u64, domain: &str) -> Persona {
        let mut p = Persona::new(idx, format!("persona {idx}"));
        p.attributes.insert("domain".into(), domain.into());
        p
    }

    #[test]
    fn tallies_and_percentages() {
        let mut summary = StoreSummary::default();
        summary.add_document(&doc(&[("scenario_1", "Left"), ("scenario_2", "Right")]));
        summary.add_document(&doc(&[("scenario_1", "Left"), ("scenario_2", "ERR")]));
        summary.add_document(&doc(&[("scenario_1", "Right"), ("scenario_2", "Both")]));

        assert_eq!(summary.documents, 3);
        let s1 = &summary.scenarios[0];
        assert_eq!((s1.tally.left, s1.tally.right), (2, 1));
        assert!((s1.tally.left_pct() - 66.666).abs() < 0.01);
        assert_eq!(s1.metric, "Fairness");
        let s2 = &summary.scenarios[1];
        assert_eq!((s2.tally.right, s2.tally.errors, s2.tally.other), (1, 1, 1));
        assert_eq!(summary.total.decided(), 4);
        assert!(summary.render().contains("total"));
    }

    #[test]
    fn grouped_summary_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path().join("results")).unwrap();
        let personas = PersonaCatalog::new(vec![
            persona(1, "Law"),
            persona(2, "Law"),
            persona(3, "Arts & Music"),
            Persona::new(4, "no domain"),
        ]);
        store
            .write(PersonaKey::Persona(1), &doc(&[("scenario_1", "Left")]))
            .unwrap();
        store
            .write(PersonaKey::Persona(3), &doc(&[("scenario_1", "Right")]))
            .unwrap();
        store
            .write(PersonaKey::Persona(4), &doc(&[("scenario_1", "Right")]))
            .unwrap();
        store
            .write(PersonaKey::Baseline(1), &doc(&[("scenario_1", "Left")]))
            .unwrap();

        let groups = summarize_by(&store, &personas, "domain").unwrap();
        assert_eq!(groups["Law"].total.left, 1);
        assert_eq!(groups["Arts & Music"].total.right, 1);
        assert_eq!(groups[UNKNOWN_GROUP].documents, 1);

        let out = dir.path().join("merged");
        let merged = merge_by_attribute(&store, &personas, "domain", &out).unwrap();
        let law = merged.iter().find(|m| m.group == "Law").unwrap();
        assert_eq!((law.expected, law.merged), (2, 1));

        let arts: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("Arts___Music.json")).unwrap())
                .unwrap();
        assert_eq!(arts[0]["idx"], 3);
        assert_eq!(arts[0]["result"]["easy"]["scenario_1"]["answer"], "Right");
    }

    #[test]
    fn groups_with_the_same_file_stem_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path().join("results")).unwrap();
        let personas = PersonaCatalog::new(vec![
            persona(1, "Arts & Music"),
            persona(2, "Arts_&_Music"),
        ]);
        for id in [1, 2] {
            store
                .write(PersonaKey::Persona(id), &doc(&[("scenario_1", "Left")]))
                .unwrap();
        }

        let out = dir.path().join("merged");
        let merged = merge_by_attribute(&store, &personas, "domain", &out).unwrap();
        assert_eq!(merged.len(), 2);
        assert_ne!(merged[0].file, merged[1].file);

        let read = |name: &str| -> serde_json::Value {
            serde_json::from_str(&std::fs::read_to_string(out.join(name)).unwrap()).unwrap()
        };
        assert_eq!(read("Arts___Music.json")[0]["idx"], 1);
        assert_eq!(read("Arts___Music_2.json")[0]["idx"], 2);
    }
}
