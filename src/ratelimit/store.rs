//! Client record storage.
//!
//! The enforcer talks to storage through [`ClientStore`]. Every operation
//! reports a [`StoreOutcome`], which keeps "absent" and "someone else got
//! there first" apart from real failures.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use super::record::ClientRecord;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result of a storage operation.
#[derive(Debug)]
pub enum StoreOutcome<T> {
    /// The operation succeeded
    Ok(T),
    /// The addressed record does not exist
    NotFound,
    /// A conditional update lost against a concurrent writer
    Conflict,
    /// The backend failed
    Failure(StoreError),
}

impl<T> StoreOutcome<T> {
    /// Whether the outcome is `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, StoreOutcome::Ok(_))
    }

    /// Convert into a `Result`, treating `NotFound` and `Conflict` as `None`.
    pub fn into_result(self) -> Result<Option<T>, StoreError> {
        match self {
            StoreOutcome::Ok(value) => Ok(Some(value)),
            StoreOutcome::NotFound | StoreOutcome::Conflict => Ok(None),
            StoreOutcome::Failure(e) => Err(e),
        }
    }
}

/// Storage for client records, with an index over `expiry`.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Look up the record for a client identifier.
    async fn get(&self, id: &str) -> StoreOutcome<ClientRecord>;

    /// Insert or replace a record.
    async fn put(&self, record: ClientRecord) -> StoreOutcome<()>;

    /// Record an admitted request on `path`, but only if the stored last
    /// request time for that path still equals `expected`.
    ///
    /// On success the stored record has `last_request[path] = admitted_at`
    /// and its expiry raised to at least `admitted_at + window`; other paths
    /// are left as stored. Returns the updated record, or `Conflict`.
    async fn compare_and_record(
        &self,
        id: &str,
        path: &str,
        expected: Option<DateTime<Utc>>,
        admitted_at: DateTime<Utc>,
        window: Duration,
    ) -> StoreOutcome<ClientRecord>;

    /// Record an admitted request on `path` without comparing first.
    ///
    /// Used when the stored state could not be read. Other paths and a
    /// later expiry are kept, as with [`ClientStore::compare_and_record`].
    async fn record_admission(
        &self,
        id: &str,
        path: &str,
        admitted_at: DateTime<Utc>,
        window: Duration,
    ) -> StoreOutcome<ClientRecord>;

    /// Delete every record whose expiry is at or before `cutoff`.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreOutcome<usize>;

    /// Number of stored records.
    async fn len(&self) -> usize;
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, ClientRecord>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl Inner {
    fn upsert(&mut self, record: ClientRecord) {
        if let Some(previous) = self.records.get(&record.id) {
            self.by_expiry.remove(&(previous.expiry, previous.id.clone()));
        }
        self.by_expiry.insert((record.expiry, record.id.clone()));
        self.records.insert(record.id.clone(), record);
    }
}

/// In-process client store.
///
/// Records live in a hash map keyed by client identifier; an ordered
/// `(expiry, id)` set serves the range delete, so a sweep only touches the
/// records it removes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a JSON snapshot. A missing file yields an empty store.
    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let store = Self::new();

        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No rate limit snapshot found, starting empty");
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        let records: Vec<ClientRecord> = serde_json::from_slice(&contents)?;
        {
            let mut inner = store.inner.write();
            for record in records {
                inner.upsert(record);
            }
            info!(
                path = %path.display(),
                records = inner.records.len(),
                "Loaded rate limit snapshot"
            );
        }
        Ok(store)
    }

    /// Write all records to a JSON snapshot, replacing the file atomically.
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<usize, StoreError> {
        let path = path.as_ref();
        let records: Vec<ClientRecord> = self.inner.read().records.values().cloned().collect();
        let encoded = serde_json::to_vec(&records)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), records = records.len(), "Saved rate limit snapshot");
        Ok(records.len())
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn get(&self, id: &str) -> StoreOutcome<ClientRecord> {
        match self.inner.read().records.get(id) {
            Some(record) => StoreOutcome::Ok(record.clone()),
            None => StoreOutcome::NotFound,
        }
    }

    async fn put(&self, record: ClientRecord) -> StoreOutcome<()> {
        self.inner.write().upsert(record);
        StoreOutcome::Ok(())
    }

    async fn compare_and_record(
        &self,
        id: &str,
        path: &str,
        expected: Option<DateTime<Utc>>,
        admitted_at: DateTime<Utc>,
        window: Duration,
    ) -> StoreOutcome<ClientRecord> {
        let mut inner = self.inner.write();

        let mut record = inner
            .records
            .get(id)
            .cloned()
            .unwrap_or_else(|| ClientRecord::new(id));

        if record.last_request(path) != expected {
            return StoreOutcome::Conflict;
        }

        record.record_admission(path, admitted_at, window);
        inner.upsert(record.clone());
        StoreOutcome::Ok(record)
    }

    async fn record_admission(
        &self,
        id: &str,
        path: &str,
        admitted_at: DateTime<Utc>,
        window: Duration,
    ) -> StoreOutcome<ClientRecord> {
        let mut inner = self.inner.write();

        let mut record = inner
            .records
            .get(id)
            .cloned()
            .unwrap_or_else(|| ClientRecord::new(id));
        record.record_admission(path, admitted_at, window);
        inner.upsert(record.clone());
        StoreOutcome::Ok(record)
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreOutcome<usize> {
        let mut inner = self.inner.write();

        let expired: Vec<(DateTime<Utc>, String)> = inner
            .by_expiry
            .iter()
            .take_while(|(expiry, _)| *expiry <= cutoff)
            .cloned()
            .collect();

        for entry in &expired {
            inner.by_expiry.remove(entry);
            inner.records.remove(&entry.1);
        }

        StoreOutcome::Ok(expired.len())
    }

    async fn len(&self) -> usize {
        self.inner.read().records.len()
    }
}
