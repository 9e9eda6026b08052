//! Result store: one JSON document per persona in a flat directory.
//!
//! A document's presence marks its persona as done; whether its content is
//! any good is the validator's business. Documents are always replaced
//! whole (write to a temp file, then rename), never patched.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed result document {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("result store {0} is locked by another run")]
    Locked(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Identity of a result document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PersonaKey {
    /// A catalog persona, by its stable idx.
    Persona(u64),
    /// The k-th repetition of the no-persona baseline (1-based).
    Baseline(u32),
}

impl PersonaKey {
    pub fn file_name(&self) -> String {
        format!("Person_{self}.json")
    }

    pub fn persona_idx(&self) -> Option<u64> {
        match self {
            PersonaKey::Persona(idx) => Some(*idx),
            PersonaKey::Baseline(_) => None,
        }
    }

    /// Inverse of [`PersonaKey::file_name`]; `None` for anything else in the
    /// directory (summaries, temp files, lock file).
    pub fn from_file_name(name: &str) -> Option<Self> {
        static FILE_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^Person_(?:(0|[1-9]\d*)|NOPERSONA_(\d{4}|[1-9]\d{4,}))\.json$")
                .expect("valid regex")
        });
        let caps = FILE_RE.captures(name)?;
        if let Some(idx) = caps.get(1) {
            return idx.as_str().parse().ok().map(PersonaKey::Persona);
        }
        caps.get(2)
            .and_then(|k| k.as_str().parse().ok())
            .map(PersonaKey::Baseline)
    }
}

impl fmt::Display for PersonaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersonaKey::Persona(idx) => write!(f, "{idx}"),
            PersonaKey::Baseline(k) => write!(f, "NOPERSONA_{k:04}"),
        }
    }
}

impl Serialize for PersonaKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PersonaKey::Persona(idx) => serializer.serialize_u64(*idx),
            PersonaKey::Baseline(_) => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for PersonaKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = PersonaKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a persona idx or NOPERSONA_<n>")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PersonaKey, E> {
                Ok(PersonaKey::Persona(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PersonaKey, E> {
                u64::try_from(v)
                    .map(PersonaKey::Persona)
                    .map_err(|_| E::custom(format!("negative persona idx {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PersonaKey, E> {
                if let Some(k) = v.strip_prefix("NOPERSONA_") {
                    return k
                        .parse()
                        .map(PersonaKey::Baseline)
                        .map_err(|_| E::custom(format!("bad baseline key {v}")));
                }
                v.parse()
                    .map(PersonaKey::Persona)
                    .map_err(|_| E::custom(format!("bad persona key {v}")))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

// =============================================================================
// Documents
// =============================================================================

/// String-keyed map that keeps insertion order through serde.
///
/// Result documents list difficulties and scenarios in declaration order;
/// `scenario_10` must not sort before `scenario_2`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> V) -> &mut V {
        let pos = match self.entries.iter().position(|(k, _)| k == key) {
            Some(pos) => pos,
            None => {
                self.entries.push((key.to_string(), make()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos].1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for MapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = OrderedMap::new();
                while let Some((k, v)) = access.next_entry::<String, V>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

/// Payoffs of one side as persisted: `{"A": other, "B": self}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidePayoff {
    #[serde(rename = "A")]
    pub a: Number,
    #[serde(rename = "B")]
    pub b: Number,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOptions {
    pub left: SidePayoff,
    pub right: SidePayoff,
}

impl Default for RecordOptions {
    fn default() -> Self {
        let zero = || SidePayoff {
            a: Number::from(0),
            b: Number::from(0),
        };
        Self {
            left: zero(),
            right: zero(),
        }
    }
}

/// One answered scenario slot.
///
/// Fields default when absent so that damaged documents still load and can
/// be reported slot by slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    #[serde(default)]
    pub persona_id: Option<PersonaKey>,
    #[serde(default)]
    pub persona_desc: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub options: RecordOptions,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub answer: String,
}

/// A failed slot: the provider or parser error for that one request unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSlot {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioEntry {
    Failed(FailedSlot),
    Answered(ScenarioRecord),
}

impl ScenarioEntry {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed(FailedSlot {
            error: error.into(),
        })
    }

    pub fn as_record(&self) -> Option<&ScenarioRecord> {
        match self {
            ScenarioEntry::Answered(r) => Some(r),
            ScenarioEntry::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ScenarioEntry::Failed(_))
    }
}

/// difficulty -> scenario label -> entry.
pub type PersonaResult = OrderedMap<OrderedMap<ScenarioEntry>>;

/// Every (difficulty, scenario, entry) of a document, in document order.
pub fn slots(result: &PersonaResult) -> impl Iterator<Item = (&str, &str, &ScenarioEntry)> {
    result
        .iter()
        .flat_map(|(diff, scenarios)| scenarios.iter().map(move |(label, e)| (diff, label, e)))
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Open (creating if needed) a store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: PersonaKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn contains(&self, key: PersonaKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Keys of every result document currently present.
    pub fn keys(&self) -> Result<BTreeSet<PersonaKey>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut keys = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(key) = entry.file_name().to_str().and_then(PersonaKey::from_file_name) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// Replace the document for `key`.
    pub fn write(&self, key: PersonaKey, result: &PersonaResult) -> Result<PathBuf, StoreError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.tmp", key.file_name()));
        let json = serde_json::to_string_pretty(result).map_err(|e| StoreError::Malformed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    pub fn read(&self, key: PersonaKey) -> Result<PersonaResult, StoreError> {
        let path = self.path_for(key);
        let raw = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Malformed {
            path,
            message: e.to_string(),
        })
    }

    /// Take an exclusive advisory lock on the store for the life of the guard.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.dir)
    }
}

pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    fn new(dir: &Path) -> Result<Self, StoreError> {
        let lock_path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(dir.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}
