//! Collection-oriented record store with whole-file JSON persistence.
//!
//! A store maps collection names to ordered sequences of records. Every
//! mutating call rewrites the backing file in full before returning, so a
//! successful return means the change is on disk. The file layout is:
//!
//! ```json
//! {
//!   "users": [
//!     {
//!       "id": 1,
//!       "name": "Ada"
//!     }
//!   ]
//! }
//! ```
//!
//! Queries are linear scans with equality matching; there are no indexes.

use lander_common::{LanderError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A single stored document.
pub type Record = Map<String, Value>;

const ID_FIELD: &str = "id";

#[derive(Debug)]
struct StoreState {
    collections: BTreeMap<String, Vec<Record>>,
    next_id: u64,
}

/// In-process document database shared by all runtime generations.
///
/// All operations take the same mutex, so queries and mutations never
/// interleave.
#[derive(Debug)]
pub struct DocumentStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl DocumentStore {
    /// Creates a store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState {
                collections: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Opens the store backed by `path`.
    ///
    /// An empty path yields an in-memory store. A missing or empty file is an
    /// empty store; the file is created on the first mutation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Ok(Self::in_memory());
        }

        let payload = match fs::read(path) {
            Ok(payload) => payload,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(LanderError::Store(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let collections: BTreeMap<String, Vec<Record>> =
            if payload.iter().all(u8::is_ascii_whitespace) {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&payload).map_err(|e| {
                    LanderError::Store(format!("failed to parse {}: {}", path.display(), e))
                })?
            };

        let next_id = max_id(&collections) + 1;
        tracing::debug!(
            "Opened document store {} ({} collections, next id {})",
            path.display(),
            collections.len(),
            next_id
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(StoreState { collections, next_id }),
        })
    }

    /// Backing file, if the store is persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns copies of every record in `collection` matching `criteria`.
    ///
    /// Unknown collections yield an empty vector.
    pub fn query(&self, collection: &str, criteria: &Record) -> Result<Vec<Record>> {
        require_collection(collection)?;
        let state = self.lock();
        Ok(state
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| matches(record, criteria))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Appends `record`, assigning an `id` if it has none, and returns the
    /// stored copy.
    pub fn insert(&self, collection: &str, mut record: Record) -> Result<Record> {
        require_collection(collection)?;
        let mut state = self.lock();

        let has_id = record.contains_key(ID_FIELD);
        let explicit = record.get(ID_FIELD).and_then(numeric_id);
        match explicit {
            Some(id) if id >= state.next_id => state.next_id = id + 1,
            Some(_) => {}
            None if has_id => {}
            None => {
                record.insert(ID_FIELD.to_string(), Value::from(state.next_id));
                state.next_id += 1;
            }
        }

        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        self.persist(&state)?;
        Ok(record)
    }

    /// Merges `patch` into every record matching `criteria` and returns how
    /// many records changed.
    pub fn update(&self, collection: &str, criteria: &Record, patch: &Record) -> Result<usize> {
        require_collection(collection)?;
        let mut state = self.lock();

        let mut updated = 0;
        if let Some(records) = state.collections.get_mut(collection) {
            for record in records.iter_mut().filter(|record| matches(record, criteria)) {
                for (key, value) in patch {
                    record.insert(key.clone(), value.clone());
                }
                updated += 1;
            }
        }

        self.persist(&state)?;
        Ok(updated)
    }

    /// Removes every record matching `criteria` and returns how many were
    /// removed.
    pub fn delete(&self, collection: &str, criteria: &Record) -> Result<usize> {
        require_collection(collection)?;
        let mut state = self.lock();

        let mut deleted = 0;
        if let Some(records) = state.collections.get_mut(collection) {
            let before = records.len();
            records.retain(|record| !matches(record, criteria));
            deleted = before - records.len();
        }

        self.persist(&state)?;
        Ok(deleted)
    }

    /// Names of all collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rewrites the whole store file. Called with the state lock held.
    fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| {
            LanderError::Store(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let payload = serde_json::to_vec_pretty(&state.collections)?;

        let write_err =
            |e: std::io::Error| LanderError::Store(format!("failed to write {}: {}", path.display(), e));
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        file.write_all(&payload).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        file.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

fn require_collection(collection: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(LanderError::InvalidArgument("collection is required".into()));
    }
    Ok(())
}

/// Returns true when every criterion is present in `record` with an equal
/// value. Empty criteria match everything.
pub fn matches(record: &Record, criteria: &Record) -> bool {
    criteria.iter().all(|(key, expected)| {
        record
            .get(key)
            .is_some_and(|actual| values_equal(actual, expected))
    })
}

/// Numbers compare by numeric value regardless of integer/float form;
/// everything else compares structurally.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

/// Largest id the counter tracks. Scripts see every number as an f64, so
/// ids beyond this cannot be represented exactly and are kept as opaque
/// values that never advance `next_id`.
pub const MAX_TRACKED_ID: u64 = (1 << 53) - 1;

fn numeric_id(value: &Value) -> Option<u64> {
    let id = match value.as_u64() {
        Some(id) => id,
        None => value
            .as_f64()
            .filter(|id| id.is_finite() && *id >= 0.0 && *id <= MAX_TRACKED_ID as f64)
            .map(|id| id.floor() as u64)?,
    };
    (id <= MAX_TRACKED_ID).then_some(id)
}

fn max_id(collections: &BTreeMap<String, Vec<Record>>) -> u64 {
    collections
        .values()
        .flatten()
        .filter_map(|record| record.get(ID_FIELD).and_then(numeric_id))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {}", other),
        }
    }

    fn empty() -> Record {
        Record::new()
    }

    #[test]
    fn test_insert_then_query_by_field() {
        let store = DocumentStore::in_memory();
        store
            .insert("users", record(json!({"name": "Ada", "role": "pilot"})))
            .unwrap();

        let found = store.query("users", &record(json!({"role": "pilot"}))).unwrap();
        assert_eq!(found, vec![record(json!({"id": 1, "name": "Ada", "role": "pilot"}))]);
    }

    #[test]
    fn test_update_merges_patch_and_keeps_id() {
        let store = DocumentStore::in_memory();
        store
            .insert("users", record(json!({"name": "Ada", "role": "pilot"})))
            .unwrap();

        let updated = store
            .update(
                "users",
                &record(json!({"name": "Ada"})),
                &record(json!({"role": "commander"})),
            )
            .unwrap();
        assert_eq!(updated, 1);

        let found = store.query("users", &record(json!({"role": "commander"}))).unwrap();
        assert_eq!(found, vec![record(json!({"id": 1, "name": "Ada", "role": "commander"}))]);
        assert!(store.query("users", &record(json!({"role": "pilot"}))).unwrap().is_empty());
    }

    #[test]
    fn test_empty_criteria_returns_everything() {
        let store = DocumentStore::in_memory();
        for name in ["a", "b", "c"] {
            store.insert("items", record(json!({"name": name}))).unwrap();
        }
        let all = store.query("items", &empty()).unwrap();
        let names: Vec<_> = all.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_query_unknown_collection_is_empty() {
        let store = DocumentStore::in_memory();
        assert!(store.query("ghosts", &empty()).unwrap().is_empty());
    }

    #[test]
    fn test_query_returns_copies() {
        let store = DocumentStore::in_memory();
        store.insert("items", record(json!({"n": 1}))).unwrap();
        let mut found = store.query("items", &empty()).unwrap();
        found[0].insert("n".into(), json!(99));
        assert_eq!(store.query("items", &empty()).unwrap()[0]["n"], json!(1));
    }

    #[test]
    fn test_empty_collection_name_is_rejected() {
        let store = DocumentStore::in_memory();
        assert!(matches!(store.query("", &empty()), Err(LanderError::InvalidArgument(_))));
        assert!(matches!(store.insert("", empty()), Err(LanderError::InvalidArgument(_))));
        assert!(matches!(store.update("", &empty(), &empty()), Err(LanderError::InvalidArgument(_))));
        assert!(matches!(store.delete("", &empty()), Err(LanderError::InvalidArgument(_))));
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let store = DocumentStore::in_memory();
        let stored = store.insert("users", record(json!({"id": "ada", "name": "Ada"}))).unwrap();
        assert_eq!(stored["id"], json!("ada"));

        let auto = store.insert("users", record(json!({"name": "Grace"}))).unwrap();
        assert_eq!(auto["id"], json!(1));
    }

    #[test]
    fn test_explicit_numeric_id_advances_counter() {
        let store = DocumentStore::in_memory();
        store.insert("users", record(json!({"id": 10}))).unwrap();
        let next = store.insert("users", record(json!({"name": "x"}))).unwrap();
        assert_eq!(next["id"], json!(11));
    }

    #[test]
    fn test_huge_explicit_id_does_not_advance_counter() {
        let store = DocumentStore::in_memory();
        store.insert("users", record(json!({"id": u64::MAX}))).unwrap();
        store.insert("users", record(json!({"id": 1e30}))).unwrap();
        store
            .insert("users", record(json!({"id": MAX_TRACKED_ID})))
            .unwrap();

        let stored = store.insert("users", record(json!({"name": "Ada"}))).unwrap();
        assert_eq!(stored["id"], json!(MAX_TRACKED_ID + 1));
        assert_eq!(store.query("users", &record(json!({"id": u64::MAX}))).unwrap().len(), 1);
    }

    #[test]
    fn test_auto_ids_strictly_increase_and_survive_deletes() {
        let store = DocumentStore::in_memory();
        let first = store.insert("a", record(json!({}))).unwrap();
        let second = store.insert("b", record(json!({}))).unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));

        let removed = store.delete("b", &record(json!({"id": 2}))).unwrap();
        assert_eq!(removed, 1);
        let third = store.insert("b", record(json!({}))).unwrap();
        assert_eq!(third["id"], json!(3));
    }

    #[test]
    fn test_delete_with_criteria() {
        let store = DocumentStore::in_memory();
        for role in ["pilot", "engineer", "pilot"] {
            store.insert("crew", record(json!({"role": role}))).unwrap();
        }
        assert_eq!(store.delete("crew", &record(json!({"role": "pilot"}))).unwrap(), 2);
        assert_eq!(store.query("crew", &empty()).unwrap().len(), 1);
        assert_eq!(store.delete("crew", &record(json!({"role": "pilot"}))).unwrap(), 0);
        assert_eq!(store.delete("nobody", &empty()).unwrap(), 0);
    }

    #[test]
    fn test_numeric_criteria_ignore_representation() {
        let store = DocumentStore::in_memory();
        store.insert("scores", record(json!({"value": 3}))).unwrap();
        store.insert("scores", record(json!({"value": 3.5}))).unwrap();

        assert_eq!(store.query("scores", &record(json!({"value": 3.0}))).unwrap().len(), 1);
        assert_eq!(store.query("scores", &record(json!({"value": 3.5}))).unwrap().len(), 1);
        assert_eq!(store.query("scores", &record(json!({"value": "3"}))).unwrap().len(), 0);
    }

    #[test]
    fn test_values_equal_structural() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"a": [1, 2]})));
        assert!(!values_equal(&json!({"a": [1, 2]}), &json!({"a": [2, 1]})));
        assert!(!values_equal(&json!(null), &json!(0)));
        assert!(!values_equal(&json!(true), &json!(1)));
    }

    #[test]
    fn test_matches_requires_every_key() {
        let rec = record(json!({"a": 1, "b": "x"}));
        assert!(matches(&rec, &empty()));
        assert!(matches(&rec, &record(json!({"a": 1.0, "b": "x"}))));
        assert!(!matches(&rec, &record(json!({"a": 1, "c": null}))));
    }

    #[test]
    fn test_in_memory_has_no_path() {
        let store = DocumentStore::open("").unwrap();
        assert!(store.path().is_none());
        store.insert("users", record(json!({"name": "Ada"}))).unwrap();
        assert_eq!(store.collections(), vec!["users"]);
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = DocumentStore::open(&path).unwrap();
        assert!(store.collections().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "").unwrap();
        let store = DocumentStore::open(&path).unwrap();
        assert!(store.collections().is_empty());
        let first = store.insert("users", record(json!({}))).unwrap();
        assert_eq!(first["id"], json!(1));
    }

    #[test]
    fn test_invalid_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(DocumentStore::open(&path), Err(LanderError::Store(_))));
    }

    #[test]
    fn test_persisted_file_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = DocumentStore::open(&path).unwrap();
        store.insert("users", record(json!({"name": "Ada"}))).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n  \"users\": [\n    {\n"));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"users": [{"id": 1, "name": "Ada"}]}));
    }

    #[test]
    fn test_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("store.json");
        let store = DocumentStore::open(&path).unwrap();
        store.insert("users", record(json!({}))).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_never_reuses_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = DocumentStore::open(&path).unwrap();
            store.insert("users", record(json!({"name": "Ada"}))).unwrap();
            store.insert("users", record(json!({"name": "Grace"}))).unwrap();
            store.insert("ships", record(json!({"name": "Eagle"}))).unwrap();
            store.delete("ships", &empty()).unwrap();
        }

        let reopened = DocumentStore::open(&path).unwrap();
        assert_eq!(reopened.query("users", &empty()).unwrap().len(), 2);
        let next = reopened.insert("users", record(json!({"name": "Hedy"}))).unwrap();
        assert_eq!(next["id"], json!(3));
    }

    #[test]
    fn test_reopen_with_huge_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(
            &path,
            r#"{"users": [{"id": 1e30}, {"id": 18446744073709551615}, {"id": 7}]}"#,
        )
        .unwrap();

        let store = DocumentStore::open(&path).unwrap();
        let stored = store.insert("users", record(json!({"name": "Ada"}))).unwrap();
        assert_eq!(stored["id"], json!(8));
    }

    #[test]
    fn test_mutations_persist_even_without_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = DocumentStore::open(&path).unwrap();
        assert_eq!(store.update("users", &empty(), &empty()).unwrap(), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_persist_failure_is_reported_and_memory_stays_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let path = sub.join("store.json");
        let store = DocumentStore::open(&path).unwrap();
        store.insert("users", record(json!({"name": "Ada"}))).unwrap();

        fs::remove_dir_all(&sub).unwrap();
        fs::write(&sub, "not a directory").unwrap();

        let result = store.insert("users", record(json!({"name": "Grace"})));
        assert!(matches!(result, Err(LanderError::Store(_))));
        assert_eq!(store.query("users", &empty()).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_inserts_get_distinct_ids() {
        let store = Arc::new(DocumentStore::in_memory());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| store.insert("items", Record::new()).unwrap()["id"].as_u64().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&100));
    }
}
