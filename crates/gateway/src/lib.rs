//! Tollgate gateway: admin endpoint clients, the client set, and concurrent
//! configuration dispatch with idempotent re-send skipping.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tollgate_core::{ConfigHash, DbMode, SendError, SnapshotHash, TargetState};
use tracing::{debug, info, warn};

/// Wire protocol of one gateway admin endpoint. Implementations own the
/// encoding and map rejections to [`SendError::Update`] when the body names
/// the rejected entities.
#[async_trait::async_trait]
pub trait AdminApi: Send + Sync {
    fn base_url(&self) -> &str;

    /// Push a full configuration; returns the hash the gateway now reports.
    async fn send_config(&self, target: &TargetState, content_hash: &ConfigHash, is_fallback: bool) -> Result<ConfigHash, SendError>;

    /// Read back the configuration the gateway currently runs, if any.
    async fn fetch_config(&self, custom_entity_types: &[String]) -> Result<Option<TargetState>, SendError>;
}

/// One admin endpoint plus what was last applied to it.
pub struct GatewayClient {
    api: Arc<dyn AdminApi>,
    db_mode: DbMode,
    last_applied: ArcSwapOption<ConfigHash>,
    last_snapshot: ArcSwapOption<SnapshotHash>,
}

impl GatewayClient {
    pub fn new(api: Arc<dyn AdminApi>, db_mode: DbMode) -> Self {
        Self { api, db_mode, last_applied: ArcSwapOption::empty(), last_snapshot: ArcSwapOption::empty() }
    }

    pub fn base_url(&self) -> &str { self.api.base_url() }
    pub fn db_mode(&self) -> DbMode { self.db_mode }

    pub fn last_applied_hash(&self) -> Option<ConfigHash> { self.last_applied.load_full().map(|h| (*h).clone()) }
    pub fn set_last_applied_hash(&self, hash: Option<ConfigHash>) { self.last_applied.store(hash.map(Arc::new)) }

    pub fn last_snapshot_hash(&self) -> Option<SnapshotHash> { self.last_snapshot.load_full().map(|h| (*h).clone()) }
    pub fn set_last_snapshot_hash(&self, hash: Option<SnapshotHash>) { self.last_snapshot.store(hash.map(Arc::new)) }

    /// Push `target` unless this client already holds its content hash.
    pub async fn send(&self, target: &TargetState, is_fallback: bool) -> Result<ConfigHash, SendError> {
        let hash = target.content_hash().map_err(|e| SendError::Encode(e.to_string()))?;
        if self.last_applied_hash().as_ref() == Some(&hash) {
            debug!(url = %self.base_url(), hash = %hash, "configuration unchanged; skipping send");
            counter!("gateway_push_skipped_total", 1u64);
            return Ok(hash);
        }
        let applied = self.api.send_config(target, &hash, is_fallback).await?;
        self.set_last_applied_hash(Some(applied.clone()));
        Ok(applied)
    }

    pub async fn fetch_config(&self, custom_entity_types: &[String]) -> Result<Option<TargetState>, SendError> {
        self.api.fetch_config(custom_entity_types).await
    }
}

/// Replaceable set of admin endpoints.
#[derive(Default)]
pub struct GatewayClientSet {
    clients: RwLock<Vec<Arc<GatewayClient>>>,
}

impl GatewayClientSet {
    pub fn new(clients: Vec<Arc<GatewayClient>>) -> Self { Self { clients: RwLock::new(clients) } }

    pub fn set_clients(&self, clients: Vec<Arc<GatewayClient>>) {
        *self.clients.write().unwrap_or_else(PoisonError::into_inner) = clients;
    }

    pub fn clients(&self) -> Vec<Arc<GatewayClient>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_empty(&self) -> bool { self.clients.read().unwrap_or_else(PoisonError::into_inner).is_empty() }

    /// Clients that receive writes: every dbless client, and only the first
    /// DB-backed client since those share one database.
    pub fn clients_to_configure(&self) -> Vec<Arc<GatewayClient>> {
        let mut seen_db = false;
        self.clients()
            .into_iter()
            .filter(|c| {
                if !c.db_mode().is_db_backed() {
                    return true;
                }
                !std::mem::replace(&mut seen_db, true)
            })
            .collect()
    }
}

/// Applied hashes before and after one dispatch, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub previous: Vec<ConfigHash>,
    pub current: Vec<ConfigHash>,
    /// No clients were configured, so nothing was sent.
    pub skipped: bool,
}

impl DispatchOutcome {
    pub fn changed(&self) -> bool { self.previous != self.current }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("performing update for {url} failed: {source}")]
    Gateway { url: String, #[source] source: SendError },
    #[error("dispatch cancelled")]
    Cancelled,
    #[error("dispatch task failed: {0}")]
    Task(String),
}

impl DispatchError {
    pub fn send_error(&self) -> Option<&SendError> {
        match self {
            DispatchError::Gateway { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Fans a Target State out to the configured clients and tracks applied hashes.
pub struct Dispatcher {
    request_timeout: Duration,
    applied: Vec<ConfigHash>,
}

impl Dispatcher {
    pub fn new(request_timeout: Duration) -> Self { Self { request_timeout, applied: Vec::new() } }

    pub fn applied_hashes(&self) -> &[ConfigHash] { &self.applied }

    /// Send to every configured client concurrently, one task per client, each
    /// bounded by the request timeout. All tasks are drained and the first
    /// error is returned. Cancellation stops waiting and detaches in-flight
    /// calls instead of aborting them.
    pub async fn send_out(
        &mut self,
        set: &GatewayClientSet,
        target: Arc<TargetState>,
        snapshot_hash: Option<&SnapshotHash>,
        is_fallback: bool,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let configured = set.clients_to_configure();
        if configured.is_empty() {
            warn!("no gateway clients configured; skipping send");
            return Ok(DispatchOutcome { previous: self.applied.clone(), current: self.applied.clone(), skipped: true });
        }
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        debug!(clients = configured.len(), is_fallback, "sending configuration to gateway clients");

        let fallback_label = if is_fallback { "true" } else { "false" };
        let mut tasks = JoinSet::new();
        for client in configured.iter().cloned() {
            let target = Arc::clone(&target);
            let timeout = self.request_timeout;
            tasks.spawn(async move {
                let started = Instant::now();
                let res = match tokio::time::timeout(timeout, client.send(&target, is_fallback)).await {
                    Ok(res) => res,
                    Err(_) => Err(SendError::Timeout(timeout)),
                };
                (client, res, started.elapsed())
            });
        }

        let mut hashes = Vec::with_capacity(configured.len());
        let mut first_err: Option<DispatchError> = None;
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.detach_all();
                    return Err(DispatchError::Cancelled);
                }
                next = tasks.join_next() => next,
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((client, Ok(hash), took)) => {
                    client.set_last_snapshot_hash(snapshot_hash.cloned());
                    counter!("gateway_push_total", 1u64, "outcome" => "ok", "fallback" => fallback_label);
                    histogram!("gateway_push_ms", took.as_secs_f64() * 1000.0);
                    debug!(url = %client.base_url(), hash = %hash, took_ms = %took.as_millis(), "gateway configured");
                    hashes.push(hash);
                }
                Ok((client, Err(e), took)) => {
                    counter!("gateway_push_total", 1u64, "outcome" => "err", "fallback" => fallback_label);
                    histogram!("gateway_push_ms", took.as_secs_f64() * 1000.0);
                    if matches!(e, SendError::Timeout(_)) {
                        warn!(url = %client.base_url(), timeout_ms = %self.request_timeout.as_millis(), "exceeded admin API timeout");
                    } else {
                        warn!(url = %client.base_url(), error = %e, "configuring gateway failed");
                    }
                    if first_err.is_none() {
                        first_err = Some(DispatchError::Gateway { url: client.base_url().to_string(), source: e });
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(DispatchError::Task(e.to_string()));
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        propagate_shared_database_state(set, &configured, snapshot_hash);

        hashes.sort();
        let previous = std::mem::replace(&mut self.applied, hashes);
        info!(clients = configured.len(), is_fallback, "configuration applied to gateways");
        Ok(DispatchOutcome { previous, current: self.applied.clone(), skipped: false })
    }
}

/// DB-backed clients observe the single write issued to the first of them.
fn propagate_shared_database_state(set: &GatewayClientSet, configured: &[Arc<GatewayClient>], snapshot_hash: Option<&SnapshotHash>) {
    let Some(written) = configured.iter().find(|c| c.db_mode().is_db_backed()) else { return };
    let hash = written.last_applied_hash();
    for c in set.clients() {
        if c.db_mode().is_db_backed() && !Arc::ptr_eq(&c, written) {
            c.set_last_applied_hash(hash.clone());
            c.set_last_snapshot_hash(snapshot_hash.cloned());
        }
    }
}
