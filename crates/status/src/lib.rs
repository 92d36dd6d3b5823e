//! Tollgate status: which object generations made it into the applied
//! configuration, and per-kind queues that carry status changes to consumers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tollgate_core::{ConfigStatus, DeclarativeObject, ObjectKey, ObjectRef};
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAP: usize = 1024;

/// Identity a status is recorded against. A new generation is a new identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusKey {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub generation: i64,
}

impl StatusKey {
    pub fn of(obj: &DeclarativeObject) -> Self { Self { key: obj.key.clone(), uid: obj.uid.clone(), generation: obj.generation } }
}

/// Immutable once built; the orchestrator swaps whole sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationStatusSet {
    entries: BTreeMap<StatusKey, ConfigStatus>,
}

impl ConfigurationStatusSet {
    pub fn new() -> Self { Self::default() }

    /// Failed wins when an object appears in both lists.
    pub fn from_objects<'a>(
        succeeded: impl IntoIterator<Item = &'a DeclarativeObject>,
        failed: impl IntoIterator<Item = &'a DeclarativeObject>,
    ) -> Self {
        let mut set = Self::new();
        for obj in succeeded {
            set.entries.insert(StatusKey::of(obj), ConfigStatus::Succeeded);
        }
        for obj in failed {
            set.entries.insert(StatusKey::of(obj), ConfigStatus::Failed);
        }
        set
    }

    /// Unknown unless this exact generation was recorded.
    pub fn get(&self, key: &ObjectKey, uid: Option<&str>, generation: i64) -> ConfigStatus {
        let k = StatusKey { key: key.clone(), uid: uid.map(str::to_string), generation };
        self.entries.get(&k).copied().unwrap_or_default()
    }

    pub fn status_of(&self, obj: &DeclarativeObject) -> ConfigStatus { self.get(&obj.key, obj.uid.as_deref(), obj.generation) }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&StatusKey, &ConfigStatus)> { self.entries.iter() }

    /// Events for every identity whose status differs from `previous`.
    pub fn changes_since(&self, previous: &ConfigurationStatusSet) -> Vec<StatusEvent> {
        self.entries
            .iter()
            .filter(|(k, st)| previous.entries.get(k) != Some(st))
            .map(|(k, st)| StatusEvent::new(k, *st))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub object: ObjectRef,
    pub generation: i64,
    pub status: ConfigStatus,
}

impl StatusEvent {
    fn new(k: &StatusKey, status: ConfigStatus) -> Self {
        let mut object = ObjectRef::new(k.key.clone());
        object.uid = k.uid.clone();
        Self { object, generation: k.generation, status }
    }

    pub fn group_kind(&self) -> String { self.object.key.group_kind() }
}

struct Channel {
    tx: mpsc::Sender<StatusEvent>,
    /// Held while nobody subscribed so events buffer until the buffer fills.
    parked: Option<mpsc::Receiver<StatusEvent>>,
}

impl Channel {
    fn subscribed(&self) -> bool { self.parked.is_none() }
}

/// Per-kind bounded status queues. Subscribed kinds apply backpressure to
/// the publisher; unsubscribed kinds drop events once their buffer is full.
pub struct StatusQueue {
    cap: usize,
    channels: Mutex<FxHashMap<String, Channel>>,
}

impl Default for StatusQueue {
    fn default() -> Self { Self::new(DEFAULT_QUEUE_CAP) }
}

impl StatusQueue {
    pub fn new(cap: usize) -> Self { Self { cap: cap.max(1), channels: Mutex::new(FxHashMap::default()) } }

    /// Per-kind buffer size.
    pub fn capacity(&self) -> usize { self.cap }

    /// Receiver for `group_kind` ("Kind.group"). Events buffered before the
    /// first subscription are handed over; subscribing again replaces the
    /// previous receiver.
    pub fn subscribe(&self, group_kind: &str) -> mpsc::Receiver<StatusEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parked) = channels.get_mut(group_kind).and_then(|c| c.parked.take()) {
            return parked;
        }
        let (tx, rx) = mpsc::channel(self.cap);
        channels.insert(group_kind.to_string(), Channel { tx, parked: None });
        rx
    }

    fn sender_for(&self, group_kind: &str) -> (mpsc::Sender<StatusEvent>, bool) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let ch = channels.entry(group_kind.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.cap);
            Channel { tx, parked: Some(rx) }
        });
        (ch.tx.clone(), ch.subscribed())
    }

    pub async fn publish(&self, event: StatusEvent) {
        let gk = event.group_kind();
        let (tx, subscribed) = self.sender_for(&gk);
        if subscribed {
            if tx.send(event).await.is_err() {
                debug!(kind = %gk, "status subscriber gone; event discarded");
                counter!("status_events_dropped_total", 1u64, "kind" => gk);
            } else {
                counter!("status_events_published_total", 1u64);
            }
            return;
        }
        match tx.try_send(event) {
            Ok(()) => {
                counter!("status_events_published_total", 1u64);
            }
            Err(_) => {
                warn!(kind = %gk, "status queue full without subscriber; dropping event");
                counter!("status_events_dropped_total", 1u64, "kind" => gk);
            }
        }
    }

    pub async fn publish_all(&self, events: Vec<StatusEvent>) {
        for ev in events {
            self.publish(ev).await;
        }
    }
}
