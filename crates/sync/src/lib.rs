//! Tollgate sync: the orchestrator that keeps every gateway on the
//! configuration built from the current object set.

#![forbid(unsafe_code)]

pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod synchronizer;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use builder::{BuildOutcome, ConfigBuilder};
pub use config::SyncConfig;
pub use diagnostics::{ConfigDump, DiagnosticsHook};
pub use error::SyncError;
pub use fetcher::{ConfigFetcher, FetchError, LastValidConfig};
pub use self::metrics::{MetricsSink, NoopSink, RecorderSink};
pub use synchronizer::{CycleStatus, GatewayState, Synchronizer};

/// Run `update` whenever the store epoch moves and on every
/// `sync_interval` tick, until `cancel` fires. Failed cycles are logged;
/// the next trigger retries.
pub fn spawn_sync_loop(sync: Arc<Synchronizer>, mut epoch_rx: watch::Receiver<u64>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync.config().sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut epoch_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                changed = epoch_rx.changed(), if epoch_open => {
                    if changed.is_err() {
                        debug!("store epoch channel closed; interval only");
                        epoch_open = false;
                        continue;
                    }
                }
            }
            match sync.update(&cancel).await {
                Ok(()) => {}
                Err(SyncError::Cancelled) => debug!("sync cycle cancelled"),
                Err(e) => warn!(error = %e, retryable = e.is_retryable(), "sync cycle failed"),
            }
        }
        info!("sync loop stopped");
    })
}
