//! Per-client rate limit state.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The persisted state for one client identifier.
///
/// `expiry` is the time after which nothing in the record can influence an
/// admission decision any more, so the record may be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client identifier (primary key)
    pub id: String,
    /// Reclaim deadline; never moves backwards
    pub expiry: DateTime<Utc>,
    /// Time of the last admitted request, per path
    #[serde(default)]
    pub last_request: HashMap<String, DateTime<Utc>>,
}

impl ClientRecord {
    /// Create an empty record for a client that has not been seen yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expiry: DateTime::<Utc>::UNIX_EPOCH,
            last_request: HashMap::new(),
        }
    }

    /// Whether the record holds no request history.
    pub fn is_empty(&self) -> bool {
        self.last_request.is_empty()
    }

    /// Time of the last admitted request on `path`, if any.
    pub fn last_request(&self, path: &str) -> Option<DateTime<Utc>> {
        self.last_request.get(path).copied()
    }

    /// Record an admitted request on `path` at `now` for a window of `window`.
    pub fn record_admission(&mut self, path: &str, now: DateTime<Utc>, window: Duration) {
        self.last_request.insert(path.to_string(), now);
        let expiry = now + window;
        if expiry > self.expiry {
            self.expiry = expiry;
        }
    }

    /// Whether the record may be reclaimed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}
