//! Background reclaim of expired client records.
//!
//! Records whose expiry has passed can no longer affect a decision. A
//! background task deletes them on a fixed interval until it is cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{ClientStore, StoreOutcome};

/// Default interval between sweeps.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(3600);

/// Configuration for the reclaim task.
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Interval between sweeps (default: one hour).
    pub interval: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECLAIM_INTERVAL,
        }
    }
}

/// Handle to a running reclaim task.
#[derive(Debug)]
pub struct ReclaimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Token that stops the task when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Rate limit reclaimer task ended abnormally");
        }
    }
}

/// Start the reclaim loop on the current runtime.
///
/// The first sweep runs one interval after start.
pub fn spawn_reclaimer(store: Arc<dyn ClientStore>, config: ReclaimerConfig) -> ReclaimerHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_reclaim_loop(store, config, cancel.clone()));
    ReclaimerHandle { cancel, task }
}

async fn run_reclaim_loop(store: Arc<dyn ClientStore>, config: ReclaimerConfig, cancel: CancellationToken) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(interval_secs = config.interval.as_secs(), "Rate limit reclaimer started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Rate limit reclaimer shutting down");
                break;
            }
            _ = ticker.tick() => {
                sweep(store.as_ref(), Utc::now()).await;
            }
        }
    }
}

/// Delete every record that expired at or before `now`.
///
/// Returns the number of records deleted; a failed sweep counts as zero and
/// is retried on the next tick.
pub async fn sweep(store: &dyn ClientStore, now: DateTime<Utc>) -> usize {
    match store.delete_expired_before(now).await {
        StoreOutcome::Ok(deleted) => {
            if deleted > 0 {
                info!(deleted, "Rate limit records cleared");
            } else {
                debug!("No expired rate limit records");
            }
            deleted
        }
        StoreOutcome::NotFound | StoreOutcome::Conflict => 0,
        StoreOutcome::Failure(e) => {
            warn!(error = %e, "Rate limit clearing failed");
            0
        }
    }
}
