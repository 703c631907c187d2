//! Admission decisions for rate limited requests.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::record::ClientRecord;
use super::store::{ClientStore, StoreOutcome};
use super::token::TokenSigner;

/// Default window when no specific window is configured.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Windows are capped at roughly a century.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 86_400;

/// How often a decision is re-evaluated after losing a concurrent update.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Log target for rejections that look like forgery or token reuse.
const SUSPICIOUS: &str = "formgate::suspicious";

/// Minimum interval between two admitted requests from one client on one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window(u64);

impl Window {
    /// A window of `secs` whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Length in seconds.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Length as a chrono duration.
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.0.min(MAX_WINDOW_SECS) as i64)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self(DEFAULT_WINDOW_SECS)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// What the HTTP layer knows about a request to a protected route.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// Client identifier of the requester
    pub client_id: String,
    /// Path being requested
    pub path: String,
    /// Submitted token, if any
    pub token: Option<String>,
}

impl AdmissionRequest {
    pub fn new(client_id: impl Into<String>, path: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            path: path.into(),
            token,
        }
    }
}

/// Proof of an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub client_id: String,
    pub path: String,
    pub at: DateTime<Utc>,
    /// False when the admission could not be persisted
    pub persisted: bool,
}

/// Why a request looks forged or replayed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Suspicion {
    #[error("rate limit token missing")]
    MissingToken,
    #[error("rate limit token unreadable")]
    UnreadableToken,
    #[error("token issued to {token}, presented by {actual}")]
    AddressMismatch { token: String, actual: String },
    #[error("token issued for {token}, presented on {actual}")]
    PathMismatch { token: String, actual: String },
    #[error("token from {issued_at} predates request at {previous}")]
    TokenReuse {
        issued_at: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
}

/// A denied request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Missing, forged, mismatched or reused token
    #[error("invalid request: {0}")]
    InvalidRequest(Suspicion),
    /// The client is inside the cooldown window
    #[error("too many requests, wait {window}")]
    TooManyRequests { window: Window },
}

/// Decides whether a request may pass, and records it when it does.
pub struct WindowEnforcer {
    signer: Arc<TokenSigner>,
    store: Arc<dyn ClientStore>,
    default_window: Window,
}

impl fmt::Debug for WindowEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowEnforcer")
            .field("default_window", &self.default_window)
            .finish_non_exhaustive()
    }
}

impl WindowEnforcer {
    pub fn new(signer: Arc<TokenSigner>, store: Arc<dyn ClientStore>, default_window: Window) -> Self {
        Self {
            signer,
            store,
            default_window,
        }
    }

    pub fn signer(&self) -> &Arc<TokenSigner> {
        &self.signer
    }

    pub fn store(&self) -> &Arc<dyn ClientStore> {
        &self.store
    }

    /// Window applied to routes without an override.
    pub fn default_window(&self) -> Window {
        self.default_window
    }

    /// Issue a token for a form rendered while serving `request_path`.
    pub fn issue_token(&self, client_id: &str, request_path: &str, target_path: Option<&str>) -> String {
        self.signer
            .issue_for_request(client_id, request_path, target_path, Utc::now())
    }

    /// Decide on a request now, with `window` or the default window.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        window: Option<Window>,
    ) -> Result<Admitted, Rejection> {
        self.admit_at(request, window.unwrap_or(self.default_window), Utc::now())
            .await
    }

    /// Decide on a request at time `now`.
    pub async fn admit_at(
        &self,
        request: &AdmissionRequest,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Admitted, Rejection> {
        let client = request.client_id.as_str();
        let path = request.path.as_str();

        let Some(raw) = request.token.as_deref().filter(|t| !t.is_empty()) else {
            return Err(suspicious(client, path, Suspicion::MissingToken));
        };

        let token = match self.signer.verify(raw) {
            Ok(token) => token,
            Err(e) => {
                debug!(client = %client, path = %path, error = %e, "Token verification failed");
                return Err(suspicious(client, path, Suspicion::UnreadableToken));
            }
        };

        if token.client_id != client {
            return Err(suspicious(
                client,
                path,
                Suspicion::AddressMismatch {
                    token: token.client_id,
                    actual: client.to_string(),
                },
            ));
        }

        if token.path != path {
            return Err(suspicious(
                client,
                path,
                Suspicion::PathMismatch {
                    token: token.path,
                    actual: path.to_string(),
                },
            ));
        }

        let cooldown_start = now - window.duration();

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            // Without a readable record there is nothing to compare against.
            let Some(record) = self.load(client).await else {
                return Ok(self.record_unconditionally(client, path, now, window).await);
            };
            let previous = record.last_request(path);

            if let Some(previous) = previous {
                if previous > token.issued_at {
                    return Err(suspicious(
                        client,
                        path,
                        Suspicion::TokenReuse {
                            issued_at: token.issued_at,
                            previous,
                        },
                    ));
                }
                if previous > cooldown_start {
                    debug!(
                        client = %client,
                        path = %path,
                        window = %window,
                        previous = %previous,
                        "Request inside rate limit window"
                    );
                    return Err(Rejection::TooManyRequests { window });
                }
            }

            match self
                .store
                .compare_and_record(client, path, previous, now, window.duration())
                .await
            {
                StoreOutcome::Ok(_) => {
                    trace!(client = %client, path = %path, window = %window, "Request admitted");
                    return Ok(admitted(client, path, now, true));
                }
                StoreOutcome::Conflict | StoreOutcome::NotFound => {
                    debug!(
                        client = %client,
                        path = %path,
                        attempt,
                        "Concurrent rate limit update, re-evaluating"
                    );
                }
                StoreOutcome::Failure(e) => {
                    warn!(
                        client = %client,
                        path = %path,
                        error = %e,
                        "Failed to update rate limit record"
                    );
                    return Ok(admitted(client, path, now, false));
                }
            }
        }

        debug!(
            client = %client,
            path = %path,
            "Rate limit record kept changing, denying request"
        );
        Err(Rejection::TooManyRequests { window })
    }

    /// Fetch the record for `client`, or a fresh one if absent.
    ///
    /// Returns `None` when the store could not be read.
    async fn load(&self, client: &str) -> Option<ClientRecord> {
        match self.store.get(client).await {
            StoreOutcome::Ok(record) => Some(record),
            StoreOutcome::NotFound | StoreOutcome::Conflict => Some(ClientRecord::new(client)),
            StoreOutcome::Failure(e) => {
                warn!(client = %client, error = %e, "Error reading rate limit record");
                None
            }
        }
    }

    /// Admit after a failed read, persisting the request if the store allows.
    async fn record_unconditionally(
        &self,
        client: &str,
        path: &str,
        now: DateTime<Utc>,
        window: Window,
    ) -> Admitted {
        match self
            .store
            .record_admission(client, path, now, window.duration())
            .await
        {
            StoreOutcome::Ok(_) => {
                trace!(client = %client, path = %path, window = %window, "Request admitted without prior state");
                admitted(client, path, now, true)
            }
            StoreOutcome::NotFound | StoreOutcome::Conflict => admitted(client, path, now, false),
            StoreOutcome::Failure(e) => {
                warn!(
                    client = %client,
                    path = %path,
                    error = %e,
                    "Failed to update rate limit record"
                );
                admitted(client, path, now, false)
            }
        }
    }
}

fn admitted(client: &str, path: &str, at: DateTime<Utc>, persisted: bool) -> Admitted {
    Admitted {
        client_id: client.to_string(),
        path: path.to_string(),
        at,
        persisted,
    }
}

fn suspicious(client: &str, path: &str, reason: Suspicion) -> Rejection {
    warn!(target: SUSPICIOUS, client = %client, path = %path, reason = %reason, "Suspicious rate limited request");
    Rejection::InvalidRequest(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use chrono::TimeZone;

    const CLIENT: &str = "203.0.113.9";
    const PATH: &str = "/p";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    fn setup() -> (WindowEnforcer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let signer = Arc::new(TokenSigner::new(b"enforcer-secret".to_vec()));
        let enforcer = WindowEnforcer::new(signer, store.clone(), Window::default());
        (enforcer, store)
    }

    fn request(enforcer: &WindowEnforcer, issued_at: DateTime<Utc>) -> AdmissionRequest {
        let token = enforcer.signer().issue(CLIENT, PATH, issued_at);
        AdmissionRequest::new(CLIENT, PATH, Some(token))
    }

    async fn stored(store: &MemoryStore) -> Option<ClientRecord> {
        match store.get(CLIENT).await {
            StoreOutcome::Ok(record) => Some(record),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (enforcer, store) = setup();
        for token in [None, Some(String::new())] {
            let req = AdmissionRequest::new(CLIENT, PATH, token);
            let result = enforcer.admit_at(&req, Window::default(), t0()).await;
            assert_eq!(result, Err(Rejection::InvalidRequest(Suspicion::MissingToken)));
        }
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_unreadable_token_rejected() {
        let (enforcer, _) = setup();
        let req = AdmissionRequest::new(CLIENT, PATH, Some("garbage.token".to_string()));
        let result = enforcer.admit_at(&req, Window::default(), t0()).await;
        assert_eq!(result, Err(Rejection::InvalidRequest(Suspicion::UnreadableToken)));
    }

    #[tokio::test]
    async fn test_token_from_other_signer_rejected() {
        let (enforcer, _) = setup();
        let foreign = TokenSigner::new(b"someone-else".to_vec()).issue(CLIENT, PATH, t0());
        let req = AdmissionRequest::new(CLIENT, PATH, Some(foreign));
        let result = enforcer.admit_at(&req, Window::default(), t0() + secs(1)).await;
        assert_eq!(result, Err(Rejection::InvalidRequest(Suspicion::UnreadableToken)));
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected() {
        let (enforcer, store) = setup();
        let token = enforcer.signer().issue("198.51.100.1", PATH, t0());

        // Timing is irrelevant: a day later it is still someone else's token.
        for offset in [1, 3600, 86_400] {
            let req = AdmissionRequest::new(CLIENT, PATH, Some(token.clone()));
            let result = enforcer.admit_at(&req, Window::default(), t0() + secs(offset)).await;
            assert!(matches!(
                result,
                Err(Rejection::InvalidRequest(Suspicion::AddressMismatch { .. }))
            ));
        }
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_path_mismatch_rejected() {
        let (enforcer, _) = setup();
        let token = enforcer.signer().issue(CLIENT, "/x", t0());
        let req = AdmissionRequest::new(CLIENT, "/y", Some(token));
        let result = enforcer.admit_at(&req, Window::default(), t0() + secs(1)).await;
        assert_eq!(
            result,
            Err(Rejection::InvalidRequest(Suspicion::PathMismatch {
                token: "/x".to_string(),
                actual: "/y".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_window_enforcement() {
        let (enforcer, store) = setup();
        let window = Window::from_secs(60);

        // First request is admitted and recorded.
        let first = enforcer.admit_at(&request(&enforcer, t0()), window, t0() + secs(1)).await;
        assert!(first.unwrap().persisted);
        let record = stored(&store).await.unwrap();
        assert_eq!(record.last_request(PATH), Some(t0() + secs(1)));
        assert_eq!(record.expiry, t0() + secs(61));

        // A fresh token inside the window is turned away without touching state.
        let at = t0() + secs(30);
        let second = enforcer.admit_at(&request(&enforcer, at), window, at).await;
        assert_eq!(second, Err(Rejection::TooManyRequests { window }));
        assert_eq!(stored(&store).await.unwrap(), record);

        // Once the window has elapsed the next request passes.
        let at = t0() + secs(61);
        let third = enforcer.admit_at(&request(&enforcer, at), window, at).await;
        assert!(third.is_ok());
        let record = stored(&store).await.unwrap();
        assert_eq!(record.last_request(PATH), Some(at));
        assert_eq!(record.expiry, at + secs(60));
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let (enforcer, _) = setup();
        let window = Window::from_secs(60);
        let stale = request(&enforcer, t0());

        assert!(enforcer
            .admit_at(&request(&enforcer, t0() + secs(1)), window, t0() + secs(1))
            .await
            .is_ok());

        let result = enforcer.admit_at(&stale, window, t0() + secs(5)).await;
        assert!(matches!(
            result,
            Err(Rejection::InvalidRequest(Suspicion::TokenReuse { .. }))
        ));
    }

    #[tokio::test]
    async fn test_reused_token_after_window_is_replay() {
        let (enforcer, _) = setup();
        let window = Window::from_secs(60);
        let req = request(&enforcer, t0());

        assert!(enforcer.admit_at(&req, window, t0() + secs(1)).await.is_ok());
        // Even after the window, the same token predates the recorded request.
        let result = enforcer.admit_at(&req, window, t0() + secs(120)).await;
        assert!(matches!(
            result,
            Err(Rejection::InvalidRequest(Suspicion::TokenReuse { .. }))
        ));
    }

    #[tokio::test]
    async fn test_paths_are_independent() {
        let (enforcer, _) = setup();
        let window = Window::from_secs(60);

        let token_a = enforcer.signer().issue(CLIENT, "/a", t0());
        let token_b = enforcer.signer().issue(CLIENT, "/b", t0());
        let a = AdmissionRequest::new(CLIENT, "/a", Some(token_a));
        let b = AdmissionRequest::new(CLIENT, "/b", Some(token_b));

        assert!(enforcer.admit_at(&a, window, t0() + secs(1)).await.is_ok());
        assert!(enforcer.admit_at(&b, window, t0() + secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_window_only_blocks_replays() {
        let (enforcer, _) = setup();
        let window = Window::from_secs(0);
        assert!(enforcer.admit_at(&request(&enforcer, t0()), window, t0()).await.is_ok());
        let at = t0() + secs(1);
        assert!(enforcer.admit_at(&request(&enforcer, at), window, at).await.is_ok());
    }

    #[tokio::test]
    async fn test_admit_uses_default_window_and_clock() {
        let (enforcer, store) = setup();
        let token = enforcer.issue_token(CLIENT, "/form", Some(PATH));
        let req = AdmissionRequest::new(CLIENT, PATH, Some(token));

        assert!(enforcer.admit(&req, None).await.is_ok());
        let record = stored(&store).await.unwrap();
        let last = record.last_request(PATH).unwrap();
        assert_eq!(record.expiry, last + secs(60));

        let token = enforcer.issue_token(CLIENT, PATH, None);
        let req = AdmissionRequest::new(CLIENT, PATH, Some(token));
        assert_eq!(
            enforcer.admit(&req, None).await,
            Err(Rejection::TooManyRequests {
                window: Window::default()
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_admit_only_one() {
        let (enforcer, _) = setup();
        let enforcer = Arc::new(enforcer);
        let window = Window::from_secs(60);
        let now = t0() + secs(1);

        let attempts = (0..16).map(|_| {
            let enforcer = enforcer.clone();
            tokio::spawn(async move {
                let req = request(&enforcer, t0());
                enforcer.admit_at(&req, window, now).await
            })
        });

        let results = futures::future::join_all(attempts).await;
        let admitted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(admitted, 1);
    }

    /// A store whose every operation fails.
    struct BrokenStore;

    #[async_trait]
    impl ClientStore for BrokenStore {
        async fn get(&self, _id: &str) -> StoreOutcome<ClientRecord> {
            StoreOutcome::Failure(StoreError::Unavailable("down".to_string()))
        }

        async fn put(&self, _record: ClientRecord) -> StoreOutcome<()> {
            StoreOutcome::Failure(StoreError::Unavailable("down".to_string()))
        }

        async fn compare_and_record(
            &self,
            _id: &str,
            _path: &str,
            _expected: Option<DateTime<Utc>>,
            _admitted_at: DateTime<Utc>,
            _window: Duration,
        ) -> StoreOutcome<ClientRecord> {
            StoreOutcome::Failure(StoreError::Unavailable("down".to_string()))
        }

        async fn record_admission(
            &self,
            _id: &str,
            _path: &str,
            _admitted_at: DateTime<Utc>,
            _window: Duration,
        ) -> StoreOutcome<ClientRecord> {
            StoreOutcome::Failure(StoreError::Unavailable("down".to_string()))
        }

        async fn delete_expired_before(&self, _cutoff: DateTime<Utc>) -> StoreOutcome<usize> {
            StoreOutcome::Failure(StoreError::Unavailable("down".to_string()))
        }

        async fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_storage_failure_favors_availability() {
        let signer = Arc::new(TokenSigner::new(b"enforcer-secret".to_vec()));
        let enforcer = WindowEnforcer::new(signer, Arc::new(BrokenStore), Window::default());

        let admitted = enforcer
            .admit_at(&request(&enforcer, t0()), Window::default(), t0() + secs(1))
            .await
            .unwrap();
        assert!(!admitted.persisted);

        // Token checks still apply when storage is down.
        let req = AdmissionRequest::new(CLIENT, PATH, None);
        assert!(enforcer.admit_at(&req, Window::default(), t0()).await.is_err());
    }

    /// A store that reports a conflict on every conditional update.
    struct ContendedStore(MemoryStore);

    #[async_trait]
    impl ClientStore for ContendedStore {
        async fn get(&self, id: &str) -> StoreOutcome<ClientRecord> {
            self.0.get(id).await
        }

        async fn put(&self, record: ClientRecord) -> StoreOutcome<()> {
            self.0.put(record).await
        }

        async fn compare_and_record(
            &self,
            _id: &str,
            _path: &str,
            _expected: Option<DateTime<Utc>>,
            _admitted_at: DateTime<Utc>,
            _window: Duration,
        ) -> StoreOutcome<ClientRecord> {
            StoreOutcome::Conflict
        }

        async fn record_admission(
            &self,
            id: &str,
            path: &str,
            admitted_at: DateTime<Utc>,
            window: Duration,
        ) -> StoreOutcome<ClientRecord> {
            self.0.record_admission(id, path, admitted_at, window).await
        }

        async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreOutcome<usize> {
            self.0.delete_expired_before(cutoff).await
        }

        async fn len(&self) -> usize {
            self.0.len().await
        }
    }

    #[tokio::test]
    async fn test_persistent_conflict_denies() {
        let signer = Arc::new(TokenSigner::new(b"enforcer-secret".to_vec()));
        let store = Arc::new(ContendedStore(MemoryStore::new()));
        let enforcer = WindowEnforcer::new(signer, store, Window::default());

        let result = enforcer
            .admit_at(&request(&enforcer, t0()), Window::default(), t0() + secs(1))
            .await;
        assert!(matches!(result, Err(Rejection::TooManyRequests { .. })));
    }

    /// A store that cannot be read but still accepts writes.
    struct UnreadableStore(MemoryStore);

    #[async_trait]
    impl ClientStore for UnreadableStore {
        async fn get(&self, _id: &str) -> StoreOutcome<ClientRecord> {
            StoreOutcome::Failure(StoreError::Unavailable("read replica down".to_string()))
        }

        async fn put(&self, record: ClientRecord) -> StoreOutcome<()> {
            self.0.put(record).await
        }

        async fn compare_and_record(
            &self,
            id: &str,
            path: &str,
            expected: Option<DateTime<Utc>>,
            admitted_at: DateTime<Utc>,
            window: Duration,
        ) -> StoreOutcome<ClientRecord> {
            self.0
                .compare_and_record(id, path, expected, admitted_at, window)
                .await
        }

        async fn record_admission(
            &self,
            id: &str,
            path: &str,
            admitted_at: DateTime<Utc>,
            window: Duration,
        ) -> StoreOutcome<ClientRecord> {
            self.0.record_admission(id, path, admitted_at, window).await
        }

        async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreOutcome<usize> {
            self.0.delete_expired_before(cutoff).await
        }

        async fn len(&self) -> usize {
            self.0.len().await
        }
    }

    #[tokio::test]
    async fn test_read_failure_treats_client_as_new() {
        let signer = Arc::new(TokenSigner::new(b"enforcer-secret".to_vec()));
        let store = Arc::new(UnreadableStore(MemoryStore::new()));
        let enforcer = WindowEnforcer::new(signer, store.clone(), Window::default());
        let window = Window::from_secs(60);

        let first = enforcer
            .admit_at(&request(&enforcer, t0()), window, t0() + secs(1))
            .await
            .unwrap();
        assert!(first.persisted);

        // Well outside the window, the stored history must not cause a denial.
        let later = t0() + secs(3600);
        let second = enforcer
            .admit_at(&request(&enforcer, later), window, later)
            .await
            .unwrap();
        assert!(second.persisted);

        let record = stored(&store.0).await.unwrap();
        assert_eq!(record.last_request(PATH), Some(later));
        assert_eq!(record.expiry, later + secs(60));
    }
}
