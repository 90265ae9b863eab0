//! Bounded, persisted, newest-first log of classification results.

use std::{
    collections::{HashMap, VecDeque},
    fs, io,
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClassLabel, MonitorError, PredictionResult, Result};

/// Key the ledger is stored under.
pub const HISTORY_KEY: &str = "detectionHistory";
/// Default and largest number of entries kept.
pub const MAX_CAPACITY: usize = 20;

/// Projection of a [`PredictionResult`] kept in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub class_label: ClassLabel,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl From<&PredictionResult> for HistoryEntry {
    fn from(result: &PredictionResult) -> Self {
        Self {
            class_label: result.class_label(),
            confidence: result.confidence(),
            timestamp: result.timestamp(),
        }
    }
}

/// Simple key/value persistence used by the ledger.
pub trait HistoryStore: Send {
    fn put(&mut self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// Non-durable store, used when no history directory is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryStore {
    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Stores each key as `<directory>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }
}

impl HistoryStore for FileStore {
    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.directory).map_err(persistence)?;
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value).map_err(persistence)?;
        fs::rename(&staging, &path).map_err(persistence)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(persistence(err)),
        }
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persistence(err)),
        }
    }
}

fn persistence(err: io::Error) -> MonitorError {
    MonitorError::PersistenceFailed(err.to_string())
}

/// The ledger itself. In-memory state is authoritative; storage failures
/// are reported but never roll back the in-memory change.
pub struct HistoryLedger {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    store: Box<dyn HistoryStore>,
}

impl HistoryLedger {
    pub fn new(store: Box<dyn HistoryStore>) -> Self {
        Self::with_capacity(store, MAX_CAPACITY)
    }

    /// Ledger holding at most `capacity` entries, clamped to
    /// `1..=MAX_CAPACITY`.
    pub fn with_capacity(store: Box<dyn HistoryStore>, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            store,
        }
    }

    /// An empty ledger backed by a [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, newest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Reads persisted history, replacing the in-memory copy. Absent,
    /// unreadable or corrupt data yields an empty ledger.
    pub fn load(&mut self) -> Vec<HistoryEntry> {
        let loaded = match self.store.get(HISTORY_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(error = %err, "discarding corrupt history");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "history unavailable, starting empty");
                Vec::new()
            }
        };

        self.entries = loaded.into_iter().take(self.capacity).collect();
        tracing::debug!(entries = self.entries.len(), "history loaded");
        self.entries()
    }

    /// Prepends `entry`, evicts beyond capacity and persists.
    pub fn append(&mut self, entry: HistoryEntry) -> Result<()> {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
        self.persist()
    }

    /// Empties the ledger and removes the persisted copy.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.store.delete(HISTORY_KEY)
    }

    fn persist(&mut self) -> Result<()> {
        let serialized = serde_json::to_string(&self.entries)?;
        self.store.put(HISTORY_KEY, &serialized)
    }
}

impl std::fmt::Debug for HistoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLedger")
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;

    fn entry(n: i64) -> HistoryEntry {
        HistoryEntry {
            class_label: ClassLabel::Pedestrian,
            confidence: 0.5,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(n),
        }
    }

    /// Store sharing its map with the test so persisted bytes can be checked.
    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<HashMap<String, String>>>);

    impl HistoryStore for SharedStore {
        fn put(&mut self, key: &str, value: &str) -> Result<()> {
            self.0.lock().unwrap().insert(key.into(), value.into());
            Ok(())
        }
        fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
        fn delete(&mut self, key: &str) -> Result<()> {
            self.0.lock().unwrap().remove(key);
            Ok(())
        }
    }

    struct BrokenStore;

    impl HistoryStore for BrokenStore {
        fn put(&mut self, _: &str, _: &str) -> Result<()> {
            Err(MonitorError::PersistenceFailed("quota exceeded".into()))
        }
        fn get(&self, _: &str) -> Result<Option<String>> {
            Err(MonitorError::PersistenceFailed("unreadable".into()))
        }
        fn delete(&mut self, _: &str) -> Result<()> {
            Err(MonitorError::PersistenceFailed("read only".into()))
        }
    }

    #[test]
    fn keeps_twenty_most_recent_newest_first() {
        let mut ledger = HistoryLedger::in_memory();
        for n in 0..25 {
            ledger.append(entry(n)).unwrap();
        }

        let entries = ledger.entries();
        assert_eq!(entries.len(), 20);
        assert_eq!(entries[0], entry(24));
        assert_eq!(entries[19], entry(5));
        assert!(entries
            .windows(2)
            .all(|pair| pair[0].timestamp > pair[1].timestamp));
    }

    #[test]
    fn capacity_never_exceeds_twenty() {
        let mut ledger = HistoryLedger::with_capacity(Box::new(MemoryStore::new()), 50);
        assert_eq!(ledger.capacity(), MAX_CAPACITY);
        for n in 0..30 {
            ledger.append(entry(n)).unwrap();
        }
        assert_eq!(ledger.len(), 20);
    }

    #[test]
    fn clear_then_load_is_empty() {
        let store = SharedStore::default();
        let mut ledger = HistoryLedger::new(Box::new(store.clone()));
        ledger.append(entry(1)).unwrap();
        assert!(store.0.lock().unwrap().contains_key(HISTORY_KEY));

        ledger.clear().unwrap();
        assert!(ledger.load().is_empty());
        assert!(!store.0.lock().unwrap().contains_key(HISTORY_KEY));
    }

    #[test]
    fn load_restores_persisted_entries() {
        let store = SharedStore::default();
        let mut first = HistoryLedger::new(Box::new(store.clone()));
        first.append(entry(1)).unwrap();
        first.append(entry(2)).unwrap();

        let mut second = HistoryLedger::new(Box::new(store));
        assert_eq!(second.load(), vec![entry(2), entry(1)]);
    }

    #[test]
    fn corrupt_data_loads_as_empty() {
        let store = SharedStore::default();
        store
            .0
            .lock()
            .unwrap()
            .insert(HISTORY_KEY.into(), "{not json".into());

        let mut ledger = HistoryLedger::new(Box::new(store));
        assert!(ledger.load().is_empty());
    }

    #[test]
    fn storage_failures_keep_memory_state() {
        let mut ledger = HistoryLedger::new(Box::new(BrokenStore));
        assert!(ledger.load().is_empty());

        let err = ledger.append(entry(1)).unwrap_err();
        assert!(matches!(err, MonitorError::PersistenceFailed(_)));
        assert_eq!(ledger.len(), 1);

        assert!(ledger.clear().is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn entry_keeps_label_confidence_and_timestamp_of_result() {
        let at = Utc.timestamp_opt(1_700_000_500, 0).unwrap();
        let result = PredictionResult::new(
            ClassLabel::LightVehicle,
            0.82,
            std::collections::BTreeMap::from([(ClassLabel::LightVehicle, 0.82)]),
            at,
            "0.51s",
            "3.0s",
        )
        .unwrap();

        let entry = HistoryEntry::from(&result);
        assert_eq!(entry.class_label, ClassLabel::LightVehicle);
        assert_eq!(entry.confidence, 0.82);
        assert_eq!(entry.timestamp, at);
    }

    #[test]
    fn serialized_entries_use_wire_field_names() {
        let json = serde_json::to_value(entry(0)).unwrap();
        assert_eq!(json["type"], "pedestrian");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn file_store_round_trips_and_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("history"));
        assert_eq!(store.get(HISTORY_KEY).unwrap(), None);
        store.delete(HISTORY_KEY).unwrap();

        let mut ledger = HistoryLedger::new(Box::new(store.clone()));
        ledger.append(entry(7)).unwrap();
        assert!(store.get(HISTORY_KEY).unwrap().is_some());

        let mut reloaded = HistoryLedger::new(Box::new(store.clone()));
        assert_eq!(reloaded.load(), vec![entry(7)]);

        reloaded.clear().unwrap();
        assert_eq!(store.get(HISTORY_KEY).unwrap(), None);
    }
}
