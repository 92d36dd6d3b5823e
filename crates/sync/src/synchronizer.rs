//! The update cycle: snapshot the store, translate, push to every gateway,
//! and recover with a fallback or the last valid configuration when a push
//! is rejected.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tollgate_core::{
    ConfigHash, ConfigStatus, DbMode, DeclarativeObject, FallbackMeta, ObjectKey, ObjectRef, SnapshotHash, Snapshot,
    TargetState, TranslationFailure,
};
use tollgate_fallback::FallbackGenerator;
use tollgate_gateway::{DispatchError, DispatchOutcome, Dispatcher, GatewayClientSet};
use tollgate_persist::LastValidStore;
use tollgate_status::{ConfigurationStatusSet, StatusEvent, StatusQueue};
use tollgate_store::ObjectStore;
use tracing::{debug, info, warn};

use crate::builder::{BuildOutcome, ConfigBuilder};
use crate::config::SyncConfig;
use crate::diagnostics::{ConfigDump, DiagnosticsHook};
use crate::error::SyncError;
use crate::fetcher::{ConfigFetcher, FetchError, LastValidConfig};
use crate::metrics::MetricsSink;

/// Outcome of the latest cycle, for readiness checks and dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CycleStatus {
    #[default]
    Unknown,
    Ok,
    TranslationErrorOccurred,
    ApplyFailed,
    RecoveredWithFallback,
}

/// What one client last acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayState {
    pub url: String,
    pub db_mode: DbMode,
    pub last_applied: Option<ConfigHash>,
    pub last_snapshot: Option<SnapshotHash>,
}

struct CycleState {
    builder: Box<dyn ConfigBuilder>,
    dispatcher: Dispatcher,
    last_processed: Option<Snapshot>,
    last_valid_snapshot: Option<Snapshot>,
    bootstrapped: bool,
}

pub struct Synchronizer {
    config: SyncConfig,
    store: Arc<ObjectStore>,
    clients: Arc<GatewayClientSet>,
    fetcher: ConfigFetcher,
    fallback: FallbackGenerator,
    metrics: Arc<dyn MetricsSink>,
    diagnostics: Option<DiagnosticsHook>,
    state: RwLock<CycleState>,
    statuses: ArcSwap<ConfigurationStatusSet>,
    /// Ordered feed into the single publisher task; cycles never wait on it.
    status_feed: ArcSwapOption<mpsc::UnboundedSender<Vec<StatusEvent>>>,
    cycle_status: watch::Sender<CycleStatus>,
}

impl Synchronizer {
    pub fn new(
        config: SyncConfig,
        store: Arc<ObjectStore>,
        clients: Arc<GatewayClientSet>,
        builder: Box<dyn ConfigBuilder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let state = CycleState {
            builder,
            dispatcher: Dispatcher::new(config.proxy_timeout),
            last_processed: None,
            last_valid_snapshot: None,
            bootstrapped: false,
        };
        let (cycle_status, _) = watch::channel(CycleStatus::Unknown);
        Self {
            fallback: FallbackGenerator::new(config.fallback_closure),
            config,
            store,
            clients,
            fetcher: ConfigFetcher::new(),
            metrics,
            diagnostics: None,
            state: RwLock::new(state),
            statuses: ArcSwap::from_pointee(ConfigurationStatusSet::new()),
            status_feed: ArcSwapOption::empty(),
            cycle_status,
        }
    }

    pub fn with_diagnostics(mut self, hook: DiagnosticsHook) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    pub fn with_last_valid_store(mut self, store: Arc<dyn LastValidStore>) -> Self {
        self.fetcher = std::mem::take(&mut self.fetcher).with_durable_store(store);
        self
    }

    pub fn config(&self) -> &SyncConfig { &self.config }

    pub fn update_object(&self, obj: DeclarativeObject) { self.store.add(obj) }
    pub fn delete_object(&self, key: &ObjectKey) { self.store.delete(key) }
    pub fn object_exists(&self, key: &ObjectKey) -> bool { self.store.contains(key) }

    /// Start publishing status changes to `queue`. One task publishes every
    /// batch in cycle order; enabling again retires the previous task once it
    /// has drained what it was given.
    pub fn enable_status_reporting(&self, queue: Arc<StatusQueue>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<StatusEvent>>();
        tokio::spawn(async move {
            while let Some(events) = rx.recv().await {
                queue.publish_all(events).await;
            }
            debug!("status publisher stopped");
        });
        self.status_feed.store(Some(Arc::new(tx)));
    }

    pub fn object_configuration_status(&self, obj: &DeclarativeObject) -> ConfigStatus { self.statuses.load().status_of(obj) }

    pub fn object_is_configured(&self, obj: &DeclarativeObject) -> bool {
        self.object_configuration_status(obj) == ConfigStatus::Succeeded
    }

    pub fn subscribe_cycle_status(&self) -> watch::Receiver<CycleStatus> { self.cycle_status.subscribe() }

    pub fn last_valid_config(&self) -> Option<Arc<LastValidConfig>> { self.fetcher.last_valid_config() }

    /// Per-client acknowledgements; waits for a running cycle to finish.
    pub async fn gateway_states(&self) -> Vec<GatewayState> {
        let _state = self.state.read().await;
        self.clients
            .clients()
            .iter()
            .map(|c| GatewayState {
                url: c.base_url().to_string(),
                db_mode: c.db_mode(),
                last_applied: c.last_applied_hash(),
                last_snapshot: c.last_snapshot_hash(),
            })
            .collect()
    }

    /// Sorted hashes applied by the last successful dispatch.
    pub async fn applied_hashes(&self) -> Vec<ConfigHash> { self.state.read().await.dispatcher.applied_hashes().to_vec() }

    /// Run one cycle. A recovered cycle still returns the error that forced
    /// the recovery.
    pub async fn update(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let mut state = self.state.write().await;
        let started = Instant::now();
        self.check_bootstrap(&mut state, cancel).await?;

        let last_hash = state.last_processed.as_ref().map(|s| s.hash().clone());
        let fresh = self.store.take_snapshot_if_changed(last_hash.as_ref())?;
        let new_snapshot = fresh.is_some();
        let snapshot = match (fresh, state.last_processed.clone()) {
            (Some(s), _) => s,
            (None, Some(prev)) if self.clients_in_sync(prev.hash()) => {
                self.metrics.record_snapshot_cache_hit();
                debug!(hash = %prev.hash(), "no object changes and gateways in sync; skipping");
                return Ok(());
            }
            (None, Some(prev)) => {
                debug!(hash = %prev.hash(), "gateways lag behind last processed snapshot; resending");
                prev
            }
            (None, None) => return Ok(()),
        };

        let build = self.build(&mut state, &snapshot);
        state.last_processed = Some(snapshot.clone());
        let target = Arc::new(build.target);

        let push_started = Instant::now();
        let res = state.dispatcher.send_out(&self.clients, Arc::clone(&target), Some(snapshot.hash()), false, cancel).await;
        self.offer_dump(&target, false, res.as_ref().err(), None);
        let broken = res.as_ref().err().and_then(DispatchError::send_error).map(|e| e.broken_objects()).unwrap_or_default();
        if !matches!(res, Err(DispatchError::Cancelled)) {
            self.metrics.record_push(res.is_ok(), false, broken.len(), push_started.elapsed());
        }

        match res {
            Ok(outcome) => {
                if !outcome.skipped {
                    self.remember_valid(&mut state, &target, &build.configured_objects, &snapshot).await;
                    if new_snapshot || outcome.changed() {
                        let failed = resolve_failures(&snapshot, &build.translation_failures);
                        self.report_status(&build.configured_objects, &failed);
                    }
                }
                let status = if build.translation_failures.is_empty() { CycleStatus::Ok } else { CycleStatus::TranslationErrorOccurred };
                self.cycle_status.send_replace(status);
                debug!(took_ms = %started.elapsed().as_millis(), objects = snapshot.len(), "sync cycle complete");
                Ok(())
            }
            Err(DispatchError::Cancelled) => Err(SyncError::Cancelled),
            Err(original) => {
                warn!(error = %original, broken = broken.len(), "configuration push failed; recovering");
                self.cycle_status.send_replace(CycleStatus::ApplyFailed);
                self.recover(&mut state, &snapshot, original, &broken, cancel).await
            }
        }
    }

    /// Seed the last valid config once, before the first push. A cancelled
    /// seed is retried on the next cycle.
    async fn check_bootstrap(&self, state: &mut CycleState, cancel: &CancellationToken) -> Result<(), SyncError> {
        if state.bootstrapped {
            return Ok(());
        }
        if self.config.db_mode.is_db_backed() || self.fetcher.last_valid_config().is_some() {
            state.bootstrapped = true;
            return Ok(());
        }
        if self.fetcher.try_loading_persisted().await {
            state.bootstrapped = true;
            return Ok(());
        }
        let clients = self.clients.clients();
        let fetched = self
            .fetcher
            .try_fetching_valid_config_from_gateways(&clients, &self.config.custom_entity_types, self.config.proxy_timeout, cancel)
            .await;
        match fetched {
            Ok(()) => {}
            Err(FetchError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => warn!(error = %e, "could not seed last valid configuration from gateways"),
        }
        state.bootstrapped = true;
        Ok(())
    }

    fn clients_in_sync(&self, hash: &SnapshotHash) -> bool {
        self.clients.clients().iter().all(|c| c.last_snapshot_hash().as_ref() == Some(hash))
    }

    fn build(&self, state: &mut CycleState, snapshot: &Snapshot) -> BuildOutcome {
        let started = Instant::now();
        state.builder.update_snapshot(snapshot.clone());
        let out = state.builder.build_target_state();
        self.metrics.record_translation(out.translation_failures.len(), started.elapsed());
        for f in &out.translation_failures {
            let objects: Vec<String> = f.causing_objects().iter().map(ToString::to_string).collect();
            warn!(reason = %f.reason(), objects = ?objects, "translation failed");
        }
        out
    }

    async fn remember_valid(
        &self,
        state: &mut CycleState,
        target: &Arc<TargetState>,
        configured: &[Arc<DeclarativeObject>],
        snapshot: &Snapshot,
    ) {
        match LastValidConfig::new(Arc::clone(target), configured.to_vec()) {
            Ok(cfg) => self.fetcher.store_last_valid_config(cfg).await,
            Err(e) => warn!(error = %e, "hashing last valid configuration failed"),
        }
        state.last_valid_snapshot = Some(snapshot.clone());
    }

    async fn recover(
        &self,
        state: &mut CycleState,
        snapshot: &Snapshot,
        original: DispatchError,
        broken: &BTreeSet<ObjectRef>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut recovery_err = None;
        if self.config.fallback_enabled && !broken.is_empty() {
            match self.send_fallback(state, snapshot, broken, cancel).await {
                Ok(()) => {
                    self.cycle_status.send_replace(CycleStatus::RecoveredWithFallback);
                    return Err(SyncError::Dispatch(original));
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "fallback configuration failed; trying last valid configuration");
                    recovery_err = Some(e);
                }
            }
        }

        let Some(last) = self.fetcher.last_valid_config() else {
            return match recovery_err {
                Some(e) => Err(SyncError::RecoveryFailed { original, recovery: Box::new(e) }),
                None => Err(SyncError::Dispatch(original)),
            };
        };
        let started = Instant::now();
        let res = state.dispatcher.send_out(&self.clients, Arc::clone(&last.target), Some(snapshot.hash()), true, cancel).await;
        self.offer_dump(&last.target, true, res.as_ref().err(), None);
        match res {
            Ok(outcome) => {
                self.metrics.record_push(true, true, 0, started.elapsed());
                info!(hash = %last.hash, "restored last valid configuration");
                if !outcome.skipped {
                    self.report_status(&last.configured_objects, &resolve_refs(snapshot, broken));
                }
                self.cycle_status.send_replace(CycleStatus::RecoveredWithFallback);
                Err(SyncError::Dispatch(original))
            }
            Err(DispatchError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                self.metrics.record_push(false, true, 0, started.elapsed());
                warn!(error = %e, "restoring last valid configuration failed");
                Err(SyncError::RecoveryFailed { original, recovery: Box::new(SyncError::Dispatch(e)) })
            }
        }
    }

    async fn send_fallback(
        &self,
        state: &mut CycleState,
        snapshot: &Snapshot,
        broken: &BTreeSet<ObjectRef>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let started = Instant::now();
        let (fallback_snapshot, meta) =
            self.fallback.generate(self.config.fallback_policy, snapshot, state.last_valid_snapshot.as_ref(), broken)?;
        self.metrics.record_fallback_generated(&meta, started.elapsed());
        info!(excluded = meta.excluded.len(), backfilled = meta.backfilled.len(), "generated fallback configuration");

        let build = self.build(state, &fallback_snapshot);
        let target = Arc::new(build.target);
        let push_started = Instant::now();
        let res = state.dispatcher.send_out(&self.clients, Arc::clone(&target), Some(snapshot.hash()), true, cancel).await;
        self.offer_dump(&target, true, res.as_ref().err(), Some(meta.clone()));
        let outcome: DispatchOutcome = res.map_err(SyncError::from_dispatch)?;
        self.metrics.record_push(true, true, 0, push_started.elapsed());

        if !outcome.skipped {
            self.remember_valid(state, &target, &build.configured_objects, &fallback_snapshot).await;
            let mut failed = resolve_refs(snapshot, broken);
            failed.extend(meta.excluded.iter().filter_map(|a| snapshot.find(&a.object).cloned()));
            failed.extend(resolve_failures(&fallback_snapshot, &build.translation_failures));
            self.report_status(&build.configured_objects, &failed);
        }
        Ok(())
    }

    /// Swap in a fresh status set and publish what changed.
    fn report_status(&self, configured: &[Arc<DeclarativeObject>], failed: &[Arc<DeclarativeObject>]) {
        let next = Arc::new(ConfigurationStatusSet::from_objects(
            configured.iter().map(|o| o.as_ref()),
            failed.iter().map(|o| o.as_ref()),
        ));
        let previous = self.statuses.swap(Arc::clone(&next));
        let Some(feed) = self.status_feed.load_full() else { return };
        let events = next.changes_since(&previous);
        if events.is_empty() {
            return;
        }
        debug!(events = events.len(), "publishing status changes");
        if feed.send(events).is_err() {
            warn!("status publisher gone; changes not published");
        }
    }

    fn offer_dump(&self, target: &Arc<TargetState>, is_fallback: bool, err: Option<&DispatchError>, fallback_meta: Option<FallbackMeta>) {
        let Some(hook) = &self.diagnostics else { return };
        hook.offer(ConfigDump {
            target: Arc::clone(target),
            is_fallback,
            failed: err.is_some(),
            error: err.map(ToString::to_string),
            raw_error_body: err.and_then(DispatchError::send_error).and_then(|e| e.raw_body()).map(<[u8]>::to_vec),
            fallback_meta,
            at: chrono::Utc::now(),
        });
    }
}

fn resolve_refs<'a>(snapshot: &Snapshot, refs: impl IntoIterator<Item = &'a ObjectRef>) -> Vec<Arc<DeclarativeObject>> {
    refs.into_iter().filter_map(|r| snapshot.find(r).cloned()).collect()
}

fn resolve_failures(snapshot: &Snapshot, failures: &[TranslationFailure]) -> Vec<Arc<DeclarativeObject>> {
    resolve_refs(snapshot, failures.iter().flat_map(|f| f.causing_objects()))
}
