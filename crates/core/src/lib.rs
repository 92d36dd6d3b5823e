//! Tollgate core types: object identity, snapshots, target state and the
//! gateway error taxonomy shared by every other crate.

#![forbid(unsafe_code)]

pub mod error;
pub mod target;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

pub use error::{EntityFailure, ResponseParsingError, SendError, UpdateError};
pub use target::{ConfigHash, Entity, EntityRef, TargetState, TargetStateError};

/// Strong identity of a declarative object. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    /// `Kind.group` (or bare `Kind` for the core group); status queues are keyed by it.
    pub fn group_kind(&self) -> String {
        if self.group.is_empty() { self.kind.clone() } else { format!("{}.{}", self.kind, self.group) }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.group_kind(), self.name)
        } else {
            write!(f, "{} {}/{}", self.group_kind(), self.namespace, self.name)
        }
    }
}

/// Weak reference naming an object without owning it (the "object hash").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(flatten)]
    pub key: ObjectKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectRef {
    pub fn new(key: ObjectKey) -> Self { Self { key, uid: None } }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Same key, and the same UID whenever both sides carry one.
    pub fn matches(&self, other: &ObjectRef) -> bool {
        if self.key != other.key {
            return false;
        }
        match (&self.uid, &other.uid) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl From<ObjectKey> for ObjectRef {
    fn from(key: ObjectKey) -> Self { Self::new(key) }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{} ({})", self.key, uid),
            None => write!(f, "{}", self.key),
        }
    }
}

/// One unit of desired state held in the object cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarativeObject {
    pub key: ObjectKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub generation: i64,
    /// Objects whose translation this object depends on.
    #[serde(default)]
    pub references: Vec<ObjectKey>,
    pub content: serde_json::Value,
}

impl DeclarativeObject {
    pub fn new(key: ObjectKey, generation: i64, content: serde_json::Value) -> Self {
        Self { key, uid: None, generation, references: Vec::new(), content }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_references(mut self, refs: impl IntoIterator<Item = ObjectKey>) -> Self {
        self.references = refs.into_iter().collect();
        self
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef { key: self.key.clone(), uid: self.uid.clone() }
    }
}

/// Content digest of a snapshot (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotHash(String);

impl SnapshotHash {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("encoding {key} for hashing: {source}")]
    Encode { key: ObjectKey, source: serde_json::Error },
}

/// Hash objects in the order given. Callers pass them sorted by key so the
/// digest does not depend on insertion order.
pub fn hash_objects<'a>(objects: impl IntoIterator<Item = &'a DeclarativeObject>) -> Result<SnapshotHash, HashError> {
    let mut hasher = Sha256::new();
    for obj in objects {
        serde_json::to_writer(&mut hasher, obj).map_err(|source| HashError::Encode { key: obj.key.clone(), source })?;
        hasher.update(b"\n");
    }
    Ok(SnapshotHash(hex::encode(hasher.finalize())))
}

/// Immutable point-in-time copy of the object set. Clones share storage.
#[derive(Debug, Clone)]
pub struct Snapshot {
    objects: Arc<BTreeMap<ObjectKey, Arc<DeclarativeObject>>>,
    hash: SnapshotHash,
}

impl Snapshot {
    /// Build a snapshot and compute its hash.
    pub fn build(objects: impl IntoIterator<Item = Arc<DeclarativeObject>>) -> Result<Self, HashError> {
        let map: BTreeMap<ObjectKey, Arc<DeclarativeObject>> =
            objects.into_iter().map(|o| (o.key.clone(), o)).collect();
        let hash = hash_objects(map.values().map(|o| o.as_ref()))?;
        Ok(Self { objects: Arc::new(map), hash })
    }

    /// Assemble from an already-hashed map; `hash` must come from [`hash_objects`] over `objects`.
    pub fn from_parts(objects: BTreeMap<ObjectKey, Arc<DeclarativeObject>>, hash: SnapshotHash) -> Self {
        Self { objects: Arc::new(objects), hash }
    }

    pub fn empty() -> Self {
        Self::from_parts(BTreeMap::new(), SnapshotHash(hex::encode(Sha256::new().finalize())))
    }

    pub fn hash(&self) -> &SnapshotHash { &self.hash }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<DeclarativeObject>> { self.objects.get(key) }

    /// Lookup honoring the UID of the reference when both sides carry one.
    pub fn find(&self, r: &ObjectRef) -> Option<&Arc<DeclarativeObject>> {
        self.objects.get(&r.key).filter(|o| r.matches(&o.object_ref()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeclarativeObject>> { self.objects.values() }
}

/// Per-object apply status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigStatus {
    #[default]
    Unknown,
    Succeeded,
    Failed,
}

pub type Causes = SmallVec<[ObjectRef; 2]>;

/// Objects the config builder could not translate. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationFailure {
    causing_objects: Causes,
    reason: String,
}

impl TranslationFailure {
    /// Returns `None` when no causing object is given.
    pub fn new(causing: impl IntoIterator<Item = ObjectRef>, reason: impl Into<String>) -> Option<Self> {
        let causing_objects: Causes = causing.into_iter().collect();
        if causing_objects.is_empty() {
            return None;
        }
        Some(Self { causing_objects, reason: reason.into() })
    }

    pub fn causing_objects(&self) -> &[ObjectRef] { &self.causing_objects }
    pub fn reason(&self) -> &str { &self.reason }
}

/// An object left out of or backfilled into a fallback snapshot, with the broken objects that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedObject {
    pub object: ObjectRef,
    pub causing: Vec<ObjectRef>,
}

/// Descriptive record of what a fallback snapshot changed. Not used for control flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackMeta {
    pub excluded: Vec<AffectedObject>,
    pub backfilled: Vec<AffectedObject>,
}

impl FallbackMeta {
    pub fn is_empty(&self) -> bool { self.excluded.is_empty() && self.backfilled.is_empty() }
}

/// Whether a gateway persists configuration in a shared database or only in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbMode {
    #[default]
    Dbless,
    Postgres,
}

impl DbMode {
    pub fn is_db_backed(&self) -> bool { matches!(self, DbMode::Postgres) }
}

impl FromStr for DbMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "dbless" => Ok(DbMode::Dbless),
            "postgres" => Ok(DbMode::Postgres),
            other => Err(format!("unknown db mode: {} (expect off or postgres)", other)),
        }
    }
}
