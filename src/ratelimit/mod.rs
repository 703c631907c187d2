//! Token-bound, windowed rate limiting and its per-client state.

mod enforcer;
mod reclaimer;
mod record;
mod store;
mod token;

pub use enforcer::{
    AdmissionRequest, Admitted, Rejection, Suspicion, Window, WindowEnforcer, DEFAULT_WINDOW_SECS,
};
pub use reclaimer::{spawn_reclaimer, sweep, ReclaimerConfig, ReclaimerHandle, DEFAULT_RECLAIM_INTERVAL};
pub use record::ClientRecord;
pub use store::{ClientStore, MemoryStore, StoreError, StoreOutcome};
pub use token::{client_id, RateLimitToken, TokenError, TokenSigner};
