use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::host::EntityId;

/// Persistence namespace a store is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Scope {
    #[default]
    World,
    Entity(EntityId),
}

impl Scope {
    /// Stable name used by backends to address this scope.
    pub fn storage_name(&self) -> String {
        match self {
            Scope::World => "world".to_string(),
            Scope::Entity(id) => format!("entity.{id}"),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_name())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend rejected key '{key}' in scope {scope}: {reason}")]
    Rejected { scope: Scope, key: String, reason: String },
    #[error("i/o error for scope {scope}: {source}")]
    Io {
        scope: Scope,
        #[source]
        source: io::Error,
    },
    #[error("malformed data for scope {scope}: {source}")]
    Malformed {
        scope: Scope,
        #[source]
        source: serde_json::Error,
    },
}

/// Narrow persistence contract the stores depend on.
pub trait StoreBackend {
    fn read_all(&mut self, scope: Scope) -> Result<Map<String, Value>, StoreError>;

    /// Writes every entry, returning one result per entry in input order. A failure for one key must not stop
    /// the backend from attempting the rest.
    fn write_many(&mut self, scope: Scope, entries: &[(String, Value)]) -> Vec<Result<(), StoreError>>;
}

#[derive(Debug, Clone)]
struct StoreEntry {
    value: Value,
    revision: u64,
    dirty: bool,
}

/// Dirty entries captured at flush start. Hand it back to [`KeyedStore::complete_flush`] with the write results.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    scope: Scope,
    entries: Vec<(String, Value)>,
    revisions: Vec<u64>,
}

impl FlushBatch {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    /// Keys whose write failed; they stay dirty for the next flush.
    pub failed: Vec<String>,
    /// Keys written successfully but rewritten after the snapshot; they stay dirty.
    pub rewritten: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rewritten.is_empty()
    }

    pub fn merge(&mut self, other: FlushReport) {
        self.written += other.written;
        self.failed.extend(other.failed);
        self.rewritten.extend(other.rewritten);
    }
}

/// In-memory mirror of one persistence scope with dirty tracking.
///
/// Reads never touch the backend. Writes mark the key dirty and land in the backend on the next flush. Each
/// write bumps a revision so a flush only clears keys that were not rewritten after its snapshot.
#[derive(Debug, Clone, Default)]
pub struct KeyedStore {
    scope: Scope,
    entries: HashMap<String, StoreEntry>,
    next_revision: u64,
    loaded: bool,
}

impl KeyedStore {
    pub fn new(scope: Scope) -> Self {
        Self { scope, entries: HashMap::new(), next_revision: 1, loaded: false }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Pulls every persisted key for this scope into memory as clean entries.
    ///
    /// Keys that are dirty locally keep their in-memory value. A backend read failure leaves the store usable
    /// with whatever it already holds.
    pub fn load(&mut self, backend: &mut dyn StoreBackend) {
        match backend.read_all(self.scope) {
            Ok(persisted) => {
                for (key, value) in persisted {
                    if self.entries.get(&key).is_some_and(|entry| entry.dirty) {
                        continue;
                    }
                    let revision = self.bump();
                    self.entries.insert(key, StoreEntry { value, revision, dirty: false });
                }
            }
            Err(err) => log::warn!("[store] loading {} failed, starting empty: {err}", self.scope),
        }
        self.loaded = true;
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Deserializes the stored value; `None` when absent or when the stored shape does not match `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                log::debug!("[store] {}/{key} does not match the requested type: {err}", self.scope);
                None
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let revision = self.bump();
        self.entries.insert(key.into(), StoreEntry { value: value.into(), revision, dirty: true });
    }

    pub fn set_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.dirty).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Snapshots the dirty entries, sorted by key so backends see a stable order.
    pub fn begin_flush(&self) -> FlushBatch {
        let mut dirty: Vec<(&String, &StoreEntry)> = self.entries.iter().filter(|(_, entry)| entry.dirty).collect();
        dirty.sort_by(|a, b| a.0.cmp(b.0));
        let mut batch = FlushBatch { scope: self.scope, ..FlushBatch::default() };
        for (key, entry) in dirty {
            batch.entries.push((key.clone(), entry.value.clone()));
            batch.revisions.push(entry.revision);
        }
        batch
    }

    /// Applies backend results for a batch taken by [`KeyedStore::begin_flush`].
    pub fn complete_flush(&mut self, batch: FlushBatch, results: Vec<Result<(), StoreError>>) -> FlushReport {
        let mut report = FlushReport::default();
        let mut first_error = None;
        let mut results = results.into_iter();
        for ((key, _), revision) in batch.entries.into_iter().zip(batch.revisions) {
            match results.next() {
                Some(Ok(())) => {
                    report.written += 1;
                    match self.entries.get_mut(&key) {
                        Some(entry) if entry.revision == revision => entry.dirty = false,
                        _ => report.rewritten.push(key),
                    }
                }
                Some(Err(err)) => {
                    first_error.get_or_insert_with(|| err.to_string());
                    report.failed.push(key);
                }
                None => {
                    first_error.get_or_insert_with(|| "backend returned no result".to_string());
                    report.failed.push(key);
                }
            }
        }
        if let Some(err) = first_error {
            log::warn!(
                "[store] {} of {} keys in {} failed to write, will retry: {err}",
                report.failed.len(),
                report.failed.len() + report.written,
                self.scope
            );
        }
        report
    }

    /// Writes every dirty key. A store with nothing dirty issues no backend call at all.
    pub fn flush(&mut self, backend: &mut dyn StoreBackend) -> FlushReport {
        let batch = self.begin_flush();
        if batch.is_empty() {
            return FlushReport::default();
        }
        let results = backend.write_many(self.scope, batch.entries());
        self.complete_flush(batch, results)
    }

    fn bump(&mut self) -> u64 {
        let revision = self.next_revision.max(1);
        self.next_revision = revision + 1;
        revision
    }
}

/// Backend kept entirely in memory. Counts writes and can be told to reject keys, which makes it the test
/// double for flush behaviour.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    scopes: HashMap<Scope, Map<String, Value>>,
    failing_keys: Vec<String>,
    fail_reads: bool,
    writes: usize,
    write_calls: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: Scope, values: Map<String, Value>) -> Self {
        self.scopes.insert(scope, values);
        self
    }

    pub fn fail_key(&mut self, key: impl Into<String>) {
        self.failing_keys.push(key.into());
    }

    pub fn heal_key(&mut self, key: &str) {
        self.failing_keys.retain(|failing| failing != key);
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Total entries written successfully.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    pub fn stored(&self, scope: Scope, key: &str) -> Option<&Value> {
        self.scopes.get(&scope).and_then(|values| values.get(key))
    }
}

impl StoreBackend for MemoryBackend {
    fn read_all(&mut self, scope: Scope) -> Result<Map<String, Value>, StoreError> {
        if self.fail_reads {
            return Err(StoreError::Io { scope, source: io::Error::new(io::ErrorKind::Other, "read disabled") });
        }
        Ok(self.scopes.get(&scope).cloned().unwrap_or_default())
    }

    fn write_many(&mut self, scope: Scope, entries: &[(String, Value)]) -> Vec<Result<(), StoreError>> {
        self.write_calls += 1;
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if self.failing_keys.iter().any(|failing| failing == key) {
                results.push(Err(StoreError::Rejected {
                    scope,
                    key: key.clone(),
                    reason: "injected failure".to_string(),
                }));
                continue;
            }
            self.scopes.entry(scope).or_default().insert(key.clone(), value.clone());
            self.writes += 1;
            results.push(Ok(()));
        }
        results
    }
}

/// One JSON object file per scope under a data directory.
///
/// Writes merge into the existing file and replace it through a temp file and rename, so a crash mid-write
/// leaves the previous contents intact.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    root: PathBuf,
}

impl JsonFileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, scope: Scope) -> PathBuf {
        self.root.join(format!("{}.json", scope.storage_name()))
    }

    fn write_file(&self, scope: Scope, values: &Map<String, Value>) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io { scope, source })?;
        let path = self.path_for(scope);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(values).map_err(|source| StoreError::Malformed { scope, source })?;
        fs::write(&tmp, bytes).map_err(|source| StoreError::Io { scope, source })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { scope, source })
    }
}

impl StoreBackend for JsonFileBackend {
    fn read_all(&mut self, scope: Scope) -> Result<Map<String, Value>, StoreError> {
        let path = self.path_for(scope);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => return Err(StoreError::Io { scope, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed { scope, source })
    }

    fn write_many(&mut self, scope: Scope, entries: &[(String, Value)]) -> Vec<Result<(), StoreError>> {
        let mut values = match self.read_all(scope) {
            Ok(values) => values,
            Err(StoreError::Malformed { .. }) => {
                log::warn!("[store] {} is unreadable, rewriting it from memory", self.path_for(scope).display());
                Map::new()
            }
            Err(err) => return fail_all(entries, &err),
        };
        for (key, value) in entries {
            values.insert(key.clone(), value.clone());
        }
        match self.write_file(scope, &values) {
            Ok(()) => entries.iter().map(|_| Ok(())).collect(),
            Err(err) => fail_all(entries, &err),
        }
    }
}

fn fail_all(entries: &[(String, Value)], err: &StoreError) -> Vec<Result<(), StoreError>> {
    let scope = match err {
        StoreError::Rejected { scope, .. } | StoreError::Io { scope, .. } | StoreError::Malformed { scope, .. } => {
            *scope
        }
    };
    entries
        .iter()
        .map(|(key, _)| Err(StoreError::Rejected { scope, key: key.clone(), reason: err.to_string() }))
        .collect()
}
