#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tollgate_core::{
    ConfigHash, ConfigStatus, DbMode, DeclarativeObject, Entity, EntityFailure, FallbackMeta, ObjectKey, ResponseParsingError,
    SendError, Snapshot, TargetState, TranslationFailure, UpdateError,
};
use tollgate_gateway::{AdminApi, GatewayClient, GatewayClientSet};
use tollgate_persist::SqliteStore;
use tollgate_status::StatusQueue;
use tollgate_store::ObjectStore;
use tollgate_sync::{
    spawn_sync_loop, BuildOutcome, ConfigBuilder, CycleStatus, DiagnosticsHook, MetricsSink, SyncConfig, SyncError, Synchronizer,
};

// ---- gateway double ----

#[derive(Default)]
struct MockGateway {
    sends: Mutex<Vec<TargetState>>,
    fail: AtomicBool,
    /// `fetch_config` never resolves.
    hang_fetch: AtomicBool,
    running: Mutex<Option<TargetState>>,
}

impl MockGateway {
    fn sent(&self) -> Vec<TargetState> { self.sends.lock().unwrap().clone() }
    fn last_sent(&self) -> TargetState { self.sent().last().cloned().unwrap() }
}

#[async_trait::async_trait]
impl AdminApi for MockGateway {
    fn base_url(&self) -> &str { "http://gw-0:8001" }

    async fn send_config(&self, target: &TargetState, content_hash: &ConfigHash, _is_fallback: bool) -> Result<ConfigHash, SendError> {
        self.sends.lock().unwrap().push(target.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::Transport("connection reset".into()));
        }
        let failures: Vec<EntityFailure> = target
            .entities()
            .into_iter()
            .filter(|e| e.config.get("reject") == Some(&serde_json::json!(true)))
            .map(|e| EntityFailure { entity: e.entity_ref(), causing_objects: e.sources.clone(), problems: vec!["invalid upstream".into()] })
            .collect();
        if !failures.is_empty() {
            return Err(UpdateError { failures, raw_body: br#"{"code":400}"#.to_vec() }.into());
        }
        if target.entities().iter().any(|e| e.config.get("reject") == Some(&serde_json::json!("parse"))) {
            return Err(ResponseParsingError { reason: "unexpected body".into(), raw_body: b"<html>".to_vec() }.into());
        }
        *self.running.lock().unwrap() = Some(target.clone());
        Ok(content_hash.clone())
    }

    async fn fetch_config(&self, _types: &[String]) -> Result<Option<TargetState>, SendError> {
        if self.hang_fetch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.running.lock().unwrap().clone())
    }
}

// ---- builder double: one node per object, `"invalid": true` fails translation ----

struct NodeBuilder {
    snapshot: Snapshot,
    builds: Arc<AtomicUsize>,
}

impl ConfigBuilder for NodeBuilder {
    fn update_snapshot(&mut self, snapshot: Snapshot) { self.snapshot = snapshot; }

    fn build_target_state(&mut self) -> BuildOutcome {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let mut out = BuildOutcome::default();
        for obj in self.snapshot.iter() {
            if obj.content.get("invalid") == Some(&serde_json::json!(true)) {
                out.translation_failures.extend(TranslationFailure::new([obj.object_ref()], "missing backend"));
                continue;
            }
            let entity = Entity::new(obj.key.kind.to_lowercase(), obj.key.name.clone())
                .with_config(obj.content.clone())
                .with_source(obj.object_ref());
            out.target.nodes.push(entity);
            out.configured_objects.push(Arc::clone(obj));
        }
        out
    }
}

#[derive(Default)]
struct CountingSink {
    cache_hits: AtomicUsize,
    fallbacks: AtomicUsize,
}

impl MetricsSink for CountingSink {
    fn record_translation(&self, _: usize, _: Duration) {}
    fn record_push(&self, _: bool, _: bool, _: usize, _: Duration) {}
    fn record_snapshot_cache_hit(&self) { self.cache_hits.fetch_add(1, Ordering::SeqCst); }
    fn record_fallback_generated(&self, _: &FallbackMeta, _: Duration) { self.fallbacks.fetch_add(1, Ordering::SeqCst); }
}

struct Harness {
    sync: Synchronizer,
    api: Arc<MockGateway>,
    client: Arc<GatewayClient>,
    builds: Arc<AtomicUsize>,
    sink: Arc<CountingSink>,
}

fn harness_with(config: SyncConfig, api: Arc<MockGateway>) -> Harness {
    let builds = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(CountingSink::default());
    let client = Arc::new(GatewayClient::new(Arc::clone(&api) as Arc<dyn AdminApi>, DbMode::Dbless));
    let sync = Synchronizer::new(
        config,
        Arc::new(ObjectStore::new()),
        Arc::new(GatewayClientSet::new(vec![Arc::clone(&client)])),
        Box::new(NodeBuilder { snapshot: Snapshot::empty(), builds: Arc::clone(&builds) }),
        Arc::clone(&sink) as Arc<dyn MetricsSink>,
    );
    Harness { sync, api, client, builds, sink }
}

fn harness(fallback: bool) -> Harness {
    harness_with(SyncConfig { fallback_enabled: fallback, ..SyncConfig::default() }, Arc::new(MockGateway::default()))
}

fn obj(kind: &str, name: &str, gen: i64, content: serde_json::Value) -> DeclarativeObject {
    DeclarativeObject::new(ObjectKey::new("example.io", kind, "default", name), gen, content).with_uid(format!("uid-{}", name))
}

fn names(t: &TargetState) -> Vec<String> { t.nodes.iter().map(|e| e.id.clone()).collect() }

// ---- cycles ----

#[tokio::test]
async fn successful_cycle_pushes_and_marks_objects_configured() {
    let h = harness(false);
    let a = obj("Route", "a", 1, serde_json::json!({ "path": "/a" }));
    h.sync.update_object(a.clone());
    h.sync.update(&CancellationToken::new()).await.unwrap();

    assert_eq!(h.api.sent().len(), 1);
    assert!(h.sync.object_is_configured(&a));
    assert_eq!(*h.sync.subscribe_cycle_status().borrow(), CycleStatus::Ok);
    let last = h.sync.last_valid_config().unwrap();
    assert_eq!(names(&last.target), vec!["a"]);
    assert_eq!(h.sync.applied_hashes().await, vec![last.hash.clone()]);
}

#[tokio::test]
async fn unchanged_store_with_in_sync_gateways_skips_build() {
    let h = harness(false);
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    h.sync.update(&CancellationToken::new()).await.unwrap();
    let builds = h.builds.load(Ordering::SeqCst);

    h.sync.update(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.builds.load(Ordering::SeqCst), builds);
    assert_eq!(h.sink.cache_hits.load(Ordering::SeqCst), 1);
    assert_eq!(h.api.sent().len(), 1);
}

#[tokio::test]
async fn lagging_gateway_gets_last_snapshot_rebuilt() {
    let h = harness(false);
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    h.sync.update(&CancellationToken::new()).await.unwrap();
    let states = h.sync.gateway_states().await;
    assert_eq!(states[0].url, "http://gw-0:8001");
    let acked = states[0].last_snapshot.clone();
    assert!(acked.is_some());

    // The client lost track of the snapshot it runs.
    h.client.set_last_snapshot_hash(None);
    h.sync.update(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.builds.load(Ordering::SeqCst), 2);
    // Same content hash, so no second remote write.
    assert_eq!(h.api.sent().len(), 1);
    assert_eq!(h.client.last_snapshot_hash(), acked);
}

#[tokio::test]
async fn translation_failures_mark_objects_failed() {
    let h = harness(false);
    let good = obj("Route", "good", 1, serde_json::json!({}));
    let bad = obj("Route", "bad", 1, serde_json::json!({ "invalid": true }));
    h.sync.update_object(good.clone());
    h.sync.update_object(bad.clone());
    h.sync.update(&CancellationToken::new()).await.unwrap();

    assert_eq!(names(&h.api.last_sent()), vec!["good"]);
    assert_eq!(h.sync.object_configuration_status(&good), ConfigStatus::Succeeded);
    assert_eq!(h.sync.object_configuration_status(&bad), ConfigStatus::Failed);
    assert_eq!(*h.sync.subscribe_cycle_status().borrow(), CycleStatus::TranslationErrorOccurred);
}

#[tokio::test]
async fn rejected_objects_are_excluded_and_original_error_returned() {
    let h = harness(true);
    let a = obj("Route", "a", 1, serde_json::json!({ "reject": true }));
    let b = obj("Route", "b", 1, serde_json::json!({})).with_references([a.key.clone()]);
    let c = obj("Route", "c", 1, serde_json::json!({}));
    for o in [&a, &b, &c] {
        h.sync.update_object(o.clone());
    }

    let err = h.sync.update(&CancellationToken::new()).await.unwrap_err();
    let rejection = err.update_error().expect("original rejection is returned");
    assert_eq!(rejection.failures[0].entity.id, "a");
    assert!(!err.is_retryable());

    assert_eq!(h.api.sent().len(), 2);
    assert_eq!(names(&h.api.last_sent()), vec!["c"]);
    assert_eq!(h.sink.fallbacks.load(Ordering::SeqCst), 1);
    assert_eq!(h.sync.object_configuration_status(&a), ConfigStatus::Failed);
    assert_eq!(h.sync.object_configuration_status(&b), ConfigStatus::Failed);
    assert_eq!(h.sync.object_configuration_status(&c), ConfigStatus::Succeeded);
    assert_eq!(*h.sync.subscribe_cycle_status().borrow(), CycleStatus::RecoveredWithFallback);
    assert_eq!(names(&h.sync.last_valid_config().unwrap().target), vec!["c"]);
}

#[tokio::test]
async fn backfill_restores_previous_generation() {
    let h = harness_with(
        SyncConfig { fallback_enabled: true, fallback_policy: "backfill".parse().unwrap(), ..SyncConfig::default() },
        Arc::new(MockGateway::default()),
    );
    let a1 = obj("Route", "a", 1, serde_json::json!({ "path": "/v1" }));
    h.sync.update_object(a1.clone());
    h.sync.update_object(obj("Route", "c", 1, serde_json::json!({})));
    h.sync.update(&CancellationToken::new()).await.unwrap();

    let a2 = obj("Route", "a", 2, serde_json::json!({ "reject": true }));
    h.sync.update_object(a2.clone());
    let err = h.sync.update(&CancellationToken::new()).await.unwrap_err();
    assert!(err.update_error().is_some());

    // Backfilled config equals the first one, so the gateway is not written again.
    assert_eq!(h.api.sent().len(), 2);
    assert_eq!(h.api.last_sent().nodes[0].config["reject"], serde_json::json!(true));
    assert_eq!(h.sync.object_configuration_status(&a1), ConfigStatus::Succeeded);
    assert_eq!(h.sync.object_configuration_status(&a2), ConfigStatus::Failed);
}

#[tokio::test]
async fn last_valid_configuration_is_restored_without_fallback() {
    let h = harness(false);
    let a1 = obj("Route", "a", 1, serde_json::json!({ "path": "/a" }));
    h.sync.update_object(a1.clone());
    h.sync.update(&CancellationToken::new()).await.unwrap();
    let good_hashes = h.sync.applied_hashes().await;

    let a2 = obj("Route", "a", 2, serde_json::json!({ "reject": true }));
    h.sync.update_object(a2.clone());
    let err = h.sync.update(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Dispatch(_)));
    assert!(err.update_error().is_some());

    assert_eq!(h.sync.applied_hashes().await, good_hashes);
    assert_eq!(h.sync.object_configuration_status(&a1), ConfigStatus::Succeeded);
    assert_eq!(h.sync.object_configuration_status(&a2), ConfigStatus::Failed);
    assert_eq!(*h.sync.subscribe_cycle_status().borrow(), CycleStatus::RecoveredWithFallback);

    // Recovery acknowledged the snapshot, so an unchanged store does not retry.
    h.sync.update(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.sink.cache_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_recovery_reports_both_errors() {
    let h = harness(true);
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({ "reject": true })));
    h.sync.update_object(obj("Route", "c", 1, serde_json::json!({ "reject": "parse" })));

    let err = h.sync.update(&CancellationToken::new()).await.unwrap_err();
    match &err {
        SyncError::RecoveryFailed { recovery, .. } => assert!(matches!(**recovery, SyncError::Dispatch(_))),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.update_error().is_some());
    assert!(h.sync.last_valid_config().is_none());
    assert_eq!(*h.sync.subscribe_cycle_status().borrow(), CycleStatus::ApplyFailed);
}

#[tokio::test]
async fn unstructured_failure_without_last_valid_returns_original() {
    let h = harness(true);
    h.api.fail.store(true, Ordering::SeqCst);
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    let err = h.sync.update(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Dispatch(_)));
    assert!(err.is_retryable());
    assert_eq!(h.sink.fallbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelled_update_does_nothing() {
    let h = harness(false);
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(h.sync.update(&cancel).await, Err(SyncError::Cancelled)));
    assert_eq!(h.builds.load(Ordering::SeqCst), 0);
    assert!(h.api.sent().is_empty());
}

#[tokio::test]
async fn status_changes_are_published_per_kind() {
    let h = harness(false);
    let queue = Arc::new(StatusQueue::new(8));
    let mut routes = queue.subscribe("Route.example.io");
    h.sync.enable_status_reporting(Arc::clone(&queue));

    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    h.sync.update(&CancellationToken::new()).await.unwrap();

    let ev = tokio::time::timeout(Duration::from_secs(1), routes.recv()).await.unwrap().unwrap();
    assert_eq!(ev.object.key.name, "a");
    assert_eq!(ev.generation, 1);
    assert_eq!(ev.status, ConfigStatus::Succeeded);
}

#[tokio::test]
async fn bootstrap_seeds_last_valid_from_gateway() {
    let api = Arc::new(MockGateway::default());
    let mut running = TargetState::default();
    running.nodes.push(Entity::new("route", "seeded").with_config(serde_json::json!({ "path": "/" })));
    *api.running.lock().unwrap() = Some(running.clone());
    let h = harness_with(SyncConfig::default(), api);

    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({ "reject": true })));
    let err = h.sync.update(&CancellationToken::new()).await.unwrap_err();
    assert!(err.update_error().is_some());
    assert_eq!(h.api.last_sent(), running);
}

fn hanging_gateway() -> Arc<MockGateway> {
    let api = Arc::new(MockGateway::default());
    api.hang_fetch.store(true, Ordering::SeqCst);
    api
}

#[tokio::test]
async fn hung_bootstrap_fetch_times_out_and_cycle_proceeds() {
    let h = harness_with(SyncConfig { proxy_timeout: Duration::from_millis(50), ..SyncConfig::default() }, hanging_gateway());
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));

    let res = tokio::time::timeout(Duration::from_secs(2), h.sync.update(&CancellationToken::new())).await;
    res.expect("cycle finished").unwrap();
    assert_eq!(names(&h.api.last_sent()), vec!["a"]);
}

#[tokio::test]
async fn cancellation_aborts_hung_bootstrap_fetch() {
    let h = harness_with(SyncConfig { proxy_timeout: Duration::from_secs(3600), ..SyncConfig::default() }, hanging_gateway());
    h.sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let res = tokio::time::timeout(Duration::from_secs(2), h.sync.update(&cancel)).await.expect("cycle returned");
    assert!(matches!(res, Err(SyncError::Cancelled)));
    assert!(h.api.sent().is_empty());
    assert_eq!(h.builds.load(Ordering::SeqCst), 0);

    // The lock was released and the seed is retried on the next cycle.
    h.api.hang_fetch.store(false, Ordering::SeqCst);
    h.sync.update(&CancellationToken::new()).await.unwrap();
    assert_eq!(h.api.sent().len(), 1);
}

#[tokio::test]
async fn status_events_follow_cycle_order_under_backpressure() {
    let h = harness(true);
    let queue = Arc::new(StatusQueue::new(1));
    let mut routes = queue.subscribe("Route.example.io");
    h.sync.enable_status_reporting(Arc::clone(&queue));

    let y1 = obj("Route", "y", 1, serde_json::json!({}));
    let x = obj("Route", "x", 1, serde_json::json!({})).with_references([y1.key.clone()]);
    for o in [obj("Route", "a", 1, serde_json::json!({})), obj("Route", "b", 1, serde_json::json!({})), x.clone(), y1] {
        h.sync.update_object(o);
    }
    h.sync.update(&CancellationToken::new()).await.unwrap();

    // Nobody reads while the second cycle rejects y@2 and excludes x.
    h.sync.update_object(obj("Route", "y", 2, serde_json::json!({ "reject": true })));
    assert!(h.sync.update(&CancellationToken::new()).await.is_err());
    assert_eq!(h.sync.object_configuration_status(&x), ConfigStatus::Failed);

    let mut seen = Vec::new();
    while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(300), routes.recv()).await {
        seen.push(format!("{}@{}={:?}", ev.object.key.name, ev.generation, ev.status));
    }
    assert_eq!(
        seen,
        vec![
            "a@1=Succeeded",
            "b@1=Succeeded",
            "x@1=Succeeded",
            "y@1=Succeeded",
            "x@1=Failed",
            "y@2=Failed",
        ]
    );
}

#[tokio::test]
async fn status_queue_from_config_receives_events() {
    let h = harness_with(SyncConfig { status_queue_cap: 2, ..SyncConfig::default() }, Arc::new(MockGateway::default()));
    let queue = Arc::new(h.sync.config().status_queue());
    let mut routes = queue.subscribe("Route.example.io");
    h.sync.enable_status_reporting(Arc::clone(&queue));
    for name in ["a", "b", "c"] {
        h.sync.update_object(obj("Route", name, 1, serde_json::json!({})));
    }
    h.sync.update(&CancellationToken::new()).await.unwrap();

    let mut got = 0;
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(300), routes.recv()).await {
        got += 1;
    }
    assert_eq!(got, 3);
}

#[tokio::test]
async fn persisted_configuration_survives_restart() {
    let path = std::env::temp_dir().join(format!(
        "tollgate-sync-{}.db",
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    ));
    let path = path.to_string_lossy().to_string();

    let first = harness(false);
    let first_sync = first.sync.with_last_valid_store(Arc::new(SqliteStore::open(&path).unwrap()));
    first_sync.update_object(obj("Route", "a", 1, serde_json::json!({ "path": "/a" })));
    first_sync.update(&CancellationToken::new()).await.unwrap();
    let good = first_sync.last_valid_config().unwrap();

    let second = harness(false);
    let second_sync = second.sync.with_last_valid_store(Arc::new(SqliteStore::open(&path).unwrap()));
    second_sync.update_object(obj("Route", "a", 2, serde_json::json!({ "reject": true })));
    let err = second_sync.update(&CancellationToken::new()).await.unwrap_err();
    assert!(err.update_error().is_some());

    let restored = second_sync.last_valid_config().unwrap();
    assert_eq!(restored.hash, good.hash);
    assert_eq!(second.api.last_sent(), *good.target);
    assert_eq!(second_sync.object_configuration_status(&obj("Route", "a", 1, serde_json::json!({}))), ConfigStatus::Succeeded);
}

#[tokio::test]
async fn diagnostics_receive_every_push() {
    let (hook, mut dumps) = DiagnosticsHook::channel(4);
    let h = harness(true);
    let sync = h.sync.with_diagnostics(hook);
    sync.update_object(obj("Route", "a", 1, serde_json::json!({ "reject": true })));
    sync.update_object(obj("Route", "c", 1, serde_json::json!({})));
    let _ = sync.update(&CancellationToken::new()).await;

    let first = dumps.recv().await.unwrap();
    assert!(!first.is_fallback && first.failed);
    assert_eq!(first.raw_error_body.as_deref(), Some(br#"{"code":400}"#.as_slice()));
    let second = dumps.recv().await.unwrap();
    assert!(second.is_fallback && !second.failed);
    assert_eq!(second.fallback_meta.unwrap().excluded.len(), 1);
}

#[tokio::test]
async fn sync_loop_runs_on_store_epochs() {
    let h = harness_with(
        SyncConfig { sync_interval: Duration::from_secs(3600), ..SyncConfig::default() },
        Arc::new(MockGateway::default()),
    );
    let sync = Arc::new(h.sync);
    let (epoch_tx, epoch_rx) = tokio::sync::watch::channel(0u64);
    let cancel = CancellationToken::new();
    let handle = spawn_sync_loop(Arc::clone(&sync), epoch_rx, cancel.clone());

    sync.update_object(obj("Route", "a", 1, serde_json::json!({})));
    epoch_tx.send(1).unwrap();
    let sent_a = || h.api.sent().last().map(|t| names(t) == vec!["a"]).unwrap_or(false);
    let mut waited = 0;
    while !sent_a() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(sent_a());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
