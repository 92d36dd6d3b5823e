//! Last-known-good configuration: cached in memory, written through to an
//! optional durable store, and seeded at startup from disk or from whatever
//! the gateways already run.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tollgate_core::{ConfigHash, DeclarativeObject, SendError, TargetState};
use tollgate_gateway::GatewayClient;
use tokio_util::sync::CancellationToken;
use tollgate_persist::{maybe_compress, maybe_decompress, now_ts, LastValidRecord, LastValidStore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LastValidConfig {
    pub target: Arc<TargetState>,
    /// Objects that were applied with `target`; empty when it was read back
    /// from a gateway.
    pub configured_objects: Vec<Arc<DeclarativeObject>>,
    pub hash: ConfigHash,
}

impl LastValidConfig {
    pub fn new(target: Arc<TargetState>, configured_objects: Vec<Arc<DeclarativeObject>>) -> Result<Self, serde_json::Error> {
        let hash = target.content_hash()?;
        Ok(Self { target, configured_objects, hash })
    }
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    target: TargetState,
    configured_objects: Vec<DeclarativeObject>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetching configuration failed on all {} gateway(s)", .failures.len())]
    AllFailed { failures: Vec<(String, SendError)> },
    #[error("fetching gateway configuration cancelled")]
    Cancelled,
}

#[derive(Default)]
pub struct ConfigFetcher {
    last_valid: ArcSwapOption<LastValidConfig>,
    durable: Option<Arc<dyn LastValidStore>>,
}

impl ConfigFetcher {
    pub fn new() -> Self { Self::default() }

    pub fn with_durable_store(mut self, store: Arc<dyn LastValidStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn last_valid_config(&self) -> Option<Arc<LastValidConfig>> { self.last_valid.load_full() }

    /// Cache `config` and write it through to the durable store. Durable
    /// failures are logged; the in-memory copy is kept either way.
    pub async fn store_last_valid_config(&self, config: LastValidConfig) {
        let config = Arc::new(config);
        self.last_valid.store(Some(Arc::clone(&config)));
        let Some(durable) = self.durable.clone() else { return };

        let persisted = Persisted {
            target: (*config.target).clone(),
            configured_objects: config.configured_objects.iter().map(|o| (**o).clone()).collect(),
        };
        let body = match serde_json::to_vec(&persisted) {
            Ok(b) => maybe_compress(&b),
            Err(e) => {
                warn!(error = %e, "encoding last valid configuration failed");
                return;
            }
        };
        let record = LastValidRecord { hash: config.hash.to_string(), ts: now_ts(), body };
        match tokio::task::spawn_blocking(move || durable.put(record)).await {
            Ok(Ok(())) => debug!(hash = %config.hash, "persisted last valid configuration"),
            Ok(Err(e)) => warn!(error = %e, "persisting last valid configuration failed"),
            Err(e) => warn!(error = %e, "persist task failed"),
        }
    }

    /// Seed the cache from the durable store. Returns whether a config was loaded.
    pub async fn try_loading_persisted(&self) -> bool {
        let Some(durable) = self.durable.clone() else { return false };
        let record = match tokio::task::spawn_blocking(move || durable.latest()).await {
            Ok(Ok(Some(r))) => r,
            Ok(Ok(None)) => return false,
            Ok(Err(e)) => {
                warn!(error = %e, "reading persisted configuration failed");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "persist task failed");
                return false;
            }
        };
        let persisted: Persisted = match serde_json::from_slice(&maybe_decompress(&record.body)) {
            Ok(p) => p,
            Err(e) => {
                warn!(hash = %record.hash, error = %e, "discarding undecodable persisted configuration");
                return false;
            }
        };
        let objects = persisted.configured_objects.into_iter().map(Arc::new).collect();
        match LastValidConfig::new(Arc::new(persisted.target), objects) {
            Ok(cfg) => {
                info!(hash = %cfg.hash, ts = record.ts, "loaded last valid configuration from disk");
                self.last_valid.store(Some(Arc::new(cfg)));
                true
            }
            Err(e) => {
                warn!(error = %e, "hashing persisted configuration failed");
                false
            }
        }
    }

    /// Ask each client in order for its running config; the first non-empty
    /// one becomes the last valid config. Each call is bounded by `timeout`
    /// and abandoned when `cancel` fires. Errors only when every client failed.
    pub async fn try_fetching_valid_config_from_gateways(
        &self,
        clients: &[Arc<GatewayClient>],
        custom_entity_types: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let mut failures = Vec::new();
        for client in clients {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                res = tokio::time::timeout(timeout, client.fetch_config(custom_entity_types)) => {
                    res.unwrap_or(Err(SendError::Timeout(timeout)))
                }
            };
            match fetched {
                Ok(Some(target)) if !target.is_empty() => {
                    let cfg = match LastValidConfig::new(Arc::new(target), Vec::new()) {
                        Ok(cfg) => cfg,
                        Err(e) => {
                            failures.push((client.base_url().to_string(), SendError::Encode(e.to_string())));
                            continue;
                        }
                    };
                    info!(url = %client.base_url(), hash = %cfg.hash, "seeded last valid configuration from gateway");
                    self.last_valid.store(Some(Arc::new(cfg)));
                    return Ok(());
                }
                Ok(_) => debug!(url = %client.base_url(), "gateway has no configuration"),
                Err(e) => {
                    debug!(url = %client.base_url(), error = %e, "fetching gateway configuration failed");
                    failures.push((client.base_url().to_string(), e));
                }
            }
        }
        if !clients.is_empty() && failures.len() == clients.len() {
            return Err(FetchError::AllFailed { failures });
        }
        Ok(())
    }
}
