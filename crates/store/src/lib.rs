//! Tollgate store: the live object set, content-hashed snapshots, and the
//! delta ingest loop that feeds it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tollgate_core::{hash_objects, DeclarativeObject, HashError, ObjectKey, Snapshot, SnapshotHash};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("hashing snapshot: {0}")]
    Hash(#[from] HashError),
}

/// Live set of declarative objects. Producers mutate it concurrently with
/// readers; snapshots copy on read.
#[derive(Default)]
pub struct ObjectStore {
    objects: RwLock<FxHashMap<ObjectKey, Arc<DeclarativeObject>>>,
}

impl ObjectStore {
    pub fn new() -> Self { Self::default() }

    /// Insert or replace by key.
    pub fn add(&self, obj: DeclarativeObject) {
        let mut map = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(obj.key.clone(), Arc::new(obj));
        gauge!("store_objects", map.len() as f64);
    }

    /// Removing an absent key is a no-op.
    pub fn delete(&self, key: &ObjectKey) {
        let mut map = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if map.remove(key).is_some() {
            gauge!("store_objects", map.len() as f64);
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DeclarativeObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    pub fn len(&self) -> usize { self.objects.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Replace every object of `group`/`kind` with `objects` (watch relist).
    pub fn replace_kind(&self, group: &str, kind: &str, objects: Vec<DeclarativeObject>) {
        let mut map = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let keep: FxHashSet<ObjectKey> = objects.iter().map(|o| o.key.clone()).collect();
        map.retain(|k, _| !(k.group == group && k.kind == kind) || keep.contains(k));
        for obj in objects {
            map.insert(obj.key.clone(), Arc::new(obj));
        }
        gauge!("store_objects", map.len() as f64);
    }

    pub fn take_snapshot(&self) -> Result<Snapshot, StoreError> {
        match self.take_snapshot_if_changed(None)? {
            Some(s) => Ok(s),
            None => Ok(Snapshot::empty()),
        }
    }

    /// Hash the live set and copy it only when the hash differs from `last`.
    /// `None` means nothing changed since `last`.
    pub fn take_snapshot_if_changed(&self, last: Option<&SnapshotHash>) -> Result<Option<Snapshot>, StoreError> {
        let map = self.objects.read().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut sorted: Vec<&Arc<DeclarativeObject>> = map.values().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));
        let hash = hash_objects(sorted.iter().map(|o| o.as_ref()))?;
        if last == Some(&hash) {
            return Ok(None);
        }
        let copy: BTreeMap<ObjectKey, Arc<DeclarativeObject>> =
            sorted.into_iter().map(|o| (o.key.clone(), Arc::clone(o))).collect();
        Ok(Some(Snapshot::from_parts(copy, hash)))
    }
}

/// Change to the object set produced by a watcher.
#[derive(Debug, Clone)]
pub enum Delta {
    Applied(DeclarativeObject),
    Deleted(ObjectKey),
    /// Full relist of one group/kind; anything of that kind not listed is dropped.
    Replaced { group: String, kind: String, objects: Vec<DeclarativeObject> },
}

impl Delta {
    fn key(&self) -> Option<&ObjectKey> {
        match self {
            Delta::Applied(o) => Some(&o.key),
            Delta::Deleted(k) => Some(k),
            Delta::Replaced { .. } => None,
        }
    }
}

/// Pending deltas in first-seen order, at most one per object. Nothing is
/// ever discarded: when a new key would exceed the capacity, or a relist
/// arrives, `push` hands back the batch that must be applied first.
pub struct Coalescer {
    slots: Vec<Delta>,
    index: FxHashMap<ObjectKey, usize>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { slots: Vec::with_capacity(cap), index: FxHashMap::default(), cap }
    }

    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    /// A later delta for a pending key replaces it in place. A relist is a
    /// barrier: it is returned after everything pending so order holds.
    pub fn push(&mut self, d: Delta) -> Option<Vec<Delta>> {
        let Some(key) = d.key().cloned() else {
            let mut batch = self.drain_ready();
            batch.push(d);
            return Some(batch);
        };
        if let Some(&i) = self.index.get(&key) {
            self.slots[i] = d;
            return None;
        }
        let flushed = if self.slots.len() >= self.cap {
            counter!("store_forced_flush_total", 1u64);
            Some(self.drain_ready())
        } else {
            None
        };
        self.index.insert(key, self.slots.len());
        self.slots.push(d);
        flushed
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        self.index.clear();
        std::mem::take(&mut self.slots)
    }
}

/// Apply a batch of deltas to the store.
pub fn apply_batch(store: &ObjectStore, batch: Vec<Delta>) {
    let n = batch.len();
    for d in batch {
        match d {
            Delta::Applied(obj) => store.add(obj),
            Delta::Deleted(key) => store.delete(&key),
            Delta::Replaced { group, kind, objects } => store.replace_kind(&group, &kind, objects),
        }
    }
    counter!("store_deltas_applied_total", n as u64);
}

/// Read side of the ingest loop: bumps its epoch after each applied batch.
pub struct IngestHandle {
    epoch_rx: watch::Receiver<u64>,
}

impl IngestHandle {
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// Spawn an ingest loop that coalesces deltas and applies them to `store` on a short tick.
pub fn spawn_ingest(store: Arc<ObjectStore>, cap: usize) -> (mpsc::Sender<Delta>, IngestHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap.max(1));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut epoch = 0u64;
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        let mut apply = |batch: Vec<Delta>| {
            if batch.is_empty() {
                return;
            }
            apply_batch(&store, batch);
            epoch = epoch.saturating_add(1);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => {
                            if let Some(batch) = coalescer.push(d) {
                                apply(batch);
                            }
                        }
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            apply(coalescer.drain_ready());
                            break;
                        }
                    }
                }
                _ = ticker.tick() => apply(coalescer.drain_ready()),
            }
        }
        info!("ingest loop stopped");
    });

    (tx, IngestHandle { epoch_rx })
}
