//! Bounded sample history
//!
//! Keeps the most recent samples (2000 by default, roughly 16 hours at the
//! band's 30-second cadence) plus a "latest" slot. Every append is written
//! through to the durable store before returning so the consuming application
//! can read history while it is not running alongside the link.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::interpreter::{Clock, SystemClock};
use crate::storage::{keys, KeyValueStore};
use crate::types::HealthSample;

/// Default number of samples retained
pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

/// A sample with its arrival position
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    /// Monotonic position, counted from the first record loaded or appended
    pub sequence: u64,
    pub sample: HealthSample,
}

/// Append-only bounded log with overwrite-oldest eviction
pub struct HistoryStore {
    records: VecDeque<HistoryRecord>,
    latest: Option<HealthSample>,
    capacity: usize,
    next_sequence: u64,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl HistoryStore {
    /// Load history from `store`, starting empty if nothing usable is saved
    pub fn open(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self::open_with_clock(store, capacity, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        store: Arc<dyn KeyValueStore>,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut samples = load_samples(store.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "stored history unreadable, starting empty");
            Vec::new()
        });
        if samples.len() > capacity {
            samples.drain(..samples.len() - capacity);
        }

        let latest = load_latest(store.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "stored latest sample unreadable");
            None
        });

        let records: VecDeque<HistoryRecord> = samples
            .into_iter()
            .enumerate()
            .map(|(i, sample)| HistoryRecord {
                sequence: i as u64,
                sample,
            })
            .collect();
        let next_sequence = records.len() as u64;

        Self {
            records,
            latest,
            capacity,
            next_sequence,
            store,
            clock,
        }
    }

    /// Append a sample and write it through to the durable store.
    ///
    /// Persistence failures are logged; the in-memory history still advances
    /// and the next append retries the full write.
    pub fn append(&mut self, sample: HealthSample) {
        self.records.push_back(HistoryRecord {
            sequence: self.next_sequence,
            sample: sample.clone(),
        });
        self.next_sequence += 1;
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
        self.latest = Some(sample);

        match self.persist() {
            Ok(()) => debug!(
                len = self.records.len(),
                heart_rate = self.latest.as_ref().map(|s| s.heart_rate),
                "sample saved"
            ),
            Err(e) => warn!(error = %e, "failed to persist health history"),
        }
    }

    pub fn latest(&self) -> Option<&HealthSample> {
        self.latest.as_ref()
    }

    /// All retained samples, oldest first
    pub fn all(&self) -> Vec<HealthSample> {
        self.records.iter().map(|r| r.sample.clone()).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn persist(&self) -> Result<(), StoreError> {
        let samples: Vec<&HealthSample> = self.records.iter().map(|r| &r.sample).collect();
        let latest = match &self.latest {
            Some(sample) => serde_json::to_value(sample)?,
            None => Value::Null,
        };
        self.store.put_batch(vec![
            (keys::LAST_HEALTH_DATA, latest),
            (keys::LAST_UPDATE, Value::from(self.clock.now_millis())),
            (keys::HEALTH_DATA_HISTORY, serde_json::to_value(samples)?),
        ])
    }
}

fn load_samples(store: &dyn KeyValueStore) -> Result<Vec<HealthSample>, StoreError> {
    match store.get(keys::HEALTH_DATA_HISTORY)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

fn load_latest(store: &dyn KeyValueStore) -> Result<Option<HealthSample>, StoreError> {
    match store.get(keys::LAST_HEALTH_DATA)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

/// Serialized history as handed to the consuming application
pub fn history_json(store: &dyn KeyValueStore) -> Result<String, StoreError> {
    match store.get(keys::HEALTH_DATA_HISTORY)? {
        None | Some(Value::Null) => Ok("[]".to_string()),
        Some(value) => Ok(serde_json::to_string(&value)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{FixedClock, RecordInterpreter};
    use crate::storage::{FileStore, MemoryStore};
    use crate::types::{Frame, Record, UnimplementedMetrics};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample(heart_rate: i64) -> HealthSample {
        HealthSample {
            heart_rate,
            steps: 0,
            spo2: 98,
            calories: 0,
            sleep_hours: 7.0,
            stress: 30,
            body_temperature: 36.5,
            breathing_rate: 16,
            timestamp_millis: 1_705_312_800_000 + heart_rate,
            pending: false,
            unimplemented: UnimplementedMetrics::PLACEHOLDER,
        }
    }

    fn open(store: Arc<dyn KeyValueStore>, capacity: usize) -> HistoryStore {
        HistoryStore::open_with_clock(store, capacity, Arc::new(FixedClock(42)))
    }

    #[test]
    fn test_append_updates_latest_and_history() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut history = open(store.clone(), DEFAULT_HISTORY_CAPACITY);
        assert!(history.latest().is_none());

        history.append(sample(70));
        history.append(sample(71));

        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(|s| s.heart_rate), Some(71));
        assert_eq!(
            history.all().iter().map(|s| s.heart_rate).collect::<Vec<_>>(),
            vec![70, 71]
        );
        assert_eq!(store.get_i64(keys::LAST_UPDATE).unwrap(), Some(42));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut history = open(store.clone(), DEFAULT_HISTORY_CAPACITY);

        for i in 1..=2001 {
            history.append(sample(i));
        }

        assert_eq!(history.len(), 2000);
        let all = history.all();
        assert_eq!(all.first().map(|s| s.heart_rate), Some(2));
        assert_eq!(all.last().map(|s| s.heart_rate), Some(2001));
        assert_eq!(history.latest().map(|s| s.heart_rate), Some(2001));
        assert_eq!(history.records().next().map(|r| r.sequence), Some(1));

        let persisted: Vec<HealthSample> =
            serde_json::from_str(&history_json(store.as_ref()).unwrap()).unwrap();
        assert_eq!(persisted.len(), 2000);
        assert_eq!(persisted[0].heart_rate, 2);
    }

    #[test]
    fn test_duplicate_samples_are_kept() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut history = open(store, 10);
        history.append(sample(80));
        history.append(sample(80));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_reload_from_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health_data.json");
        {
            let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
            let mut history = open(store, 3);
            for i in 60..65 {
                history.append(sample(i));
            }
        }

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&path).unwrap());
        let history = open(store, 3);
        assert_eq!(
            history.all().iter().map(|s| s.heart_rate).collect::<Vec<_>>(),
            vec![62, 63, 64]
        );
        assert_eq!(history.latest().map(|s| s.heart_rate), Some(64));
    }

    #[test]
    fn test_reload_trims_to_smaller_capacity() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let mut history = open(store.clone(), 10);
            for i in 0..10 {
                history.append(sample(i));
            }
        }
        let history = open(store, 4);
        assert_eq!(
            history.all().iter().map(|s| s.heart_rate).collect::<Vec<_>>(),
            vec![6, 7, 8, 9]
        );
    }

    #[test]
    fn test_corrupt_history_starts_empty() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .put(keys::HEALTH_DATA_HISTORY, serde_json::json!("garbage"))
            .unwrap();
        let mut history = open(store, 10);
        assert!(history.is_empty());
        history.append(sample(70));
        assert_eq!(history.len(), 1);
    }

    /// Store whose next `put_batch` fails while `fail_next` is set
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_next: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(key)
        }

        fn put_batch(&self, entries: Vec<(&str, Value)>) -> Result<(), StoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.put_batch(entries)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_failed_write_is_retried_by_next_append() {
        let store = Arc::new(FlakyStore::default());
        let mut history = open(store.clone(), 10);
        history.append(sample(70));

        store.fail_next.store(true, Ordering::SeqCst);
        history.append(sample(71));
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().map(|s| s.heart_rate), Some(71));
        let persisted: Vec<HealthSample> =
            serde_json::from_str(&history_json(store.as_ref()).unwrap()).unwrap();
        assert_eq!(persisted.len(), 1);

        history.append(sample(72));
        let persisted: Vec<HealthSample> =
            serde_json::from_str(&history_json(store.as_ref()).unwrap()).unwrap();
        assert_eq!(
            persisted.iter().map(|s| s.heart_rate).collect::<Vec<_>>(),
            vec![70, 71, 72]
        );

        let reopened = open(store, 10);
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.latest().map(|s| s.heart_rate), Some(72));
    }

    #[test]
    fn test_non_finite_readings_survive_reload() {
        let interpreter = RecordInterpreter::new(Arc::new(FixedClock(42)));
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut history = open(store.clone(), 10);
        for text in [
            r#"{"heartRate":60}"#,
            r#"{"heartRate":61,"bodyTemperature":"inf"}"#,
            r#"{"heartRate":62,"sleep":"NaN"}"#,
        ] {
            match interpreter.interpret(&Frame::new(text.to_string())) {
                Some(Record::Sample(s)) => history.append(s),
                other => panic!("expected sample, got {:?}", other),
            }
        }

        let reopened = open(store, 10);
        assert_eq!(
            reopened.all().iter().map(|s| s.heart_rate).collect::<Vec<_>>(),
            vec![60, 61, 62]
        );
        assert_eq!(reopened.latest().map(|s| s.sleep_hours), Some(7.0));
    }

    #[test]
    fn test_history_json_defaults_to_empty_array() {
        let store = MemoryStore::new();
        assert_eq!(history_json(&store).unwrap(), "[]");
    }
}
