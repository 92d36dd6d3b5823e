//! Tollgate fallback: derive a reduced snapshot that leaves out (or restores
//! from the last valid snapshot) every object a gateway rejection traced back
//! to, together with the objects depending on them.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tollgate_core::{AffectedObject, DeclarativeObject, FallbackMeta, HashError, ObjectKey, ObjectRef, Snapshot};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("hashing fallback snapshot: {0}")]
    Hash(#[from] HashError),
}

/// How far exclusion spreads from a broken object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Broken objects and the objects referencing them.
    Direct,
    /// Dependents of dependents, up to `max_depth` hops (unbounded if `None`).
    Transitive { max_depth: Option<usize> },
    /// Everything reachable in either direction.
    Connected,
}

impl Default for Closure {
    fn default() -> Self { Closure::Transitive { max_depth: None } }
}

impl FromStr for Closure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Closure::Direct),
            "transitive" => Ok(Closure::Transitive { max_depth: None }),
            "connected" => Ok(Closure::Connected),
            other => match other.strip_prefix("transitive:") {
                Some(n) => n
                    .parse::<usize>()
                    .map(|d| Closure::Transitive { max_depth: Some(d) })
                    .map_err(|_| format!("invalid transitive depth: {}", n)),
                None => Err(format!("unknown fallback closure: {}", s)),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    #[default]
    Exclude,
    Backfill,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclude" | "" => Ok(FallbackPolicy::Exclude),
            "backfill" => Ok(FallbackPolicy::Backfill),
            other => Err(format!("unknown fallback policy: {}", other)),
        }
    }
}

/// Reference edges between the objects of one snapshot. References to objects
/// outside the snapshot are dropped.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    dependents: FxHashMap<ObjectKey, Vec<ObjectKey>>,
    dependencies: FxHashMap<ObjectKey, Vec<ObjectKey>>,
}

impl DependencyGraph {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut g = Self::default();
        for obj in snapshot.iter() {
            for dep in &obj.references {
                if dep == &obj.key || snapshot.get(dep).is_none() {
                    continue;
                }
                g.dependents.entry(dep.clone()).or_default().push(obj.key.clone());
                g.dependencies.entry(obj.key.clone()).or_default().push(dep.clone());
            }
        }
        g
    }

    pub fn dependents(&self, key: &ObjectKey) -> &[ObjectKey] { self.dependents.get(key).map(Vec::as_slice).unwrap_or(&[]) }
    pub fn dependencies(&self, key: &ObjectKey) -> &[ObjectKey] { self.dependencies.get(key).map(Vec::as_slice).unwrap_or(&[]) }

    /// Keys reached from `root` under `closure`, `root` included.
    pub fn closure_of(&self, root: &ObjectKey, closure: Closure) -> Vec<ObjectKey> {
        let max_depth = match closure {
            Closure::Direct => Some(1),
            Closure::Transitive { max_depth } => max_depth,
            Closure::Connected => None,
        };
        let mut seen: FxHashSet<&ObjectKey> = FxHashSet::default();
        let mut out = vec![root.clone()];
        let mut queue = VecDeque::from([(root, 0usize)]);
        seen.insert(root);
        while let Some((key, depth)) = queue.pop_front() {
            if max_depth.is_some_and(|m| depth >= m) {
                continue;
            }
            let back: &[ObjectKey] = match closure {
                Closure::Connected => self.dependencies(key),
                _ => &[],
            };
            for n in self.dependents(key).iter().chain(back) {
                if seen.insert(n) {
                    out.push(n.clone());
                    queue.push_back((n, depth + 1));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackGenerator {
    closure: Closure,
}

impl FallbackGenerator {
    pub fn new(closure: Closure) -> Self { Self { closure } }
    pub fn closure(&self) -> Closure { self.closure }

    /// Affected object key → broken objects that pulled it in.
    fn affected(&self, current: &Snapshot, broken: &BTreeSet<ObjectRef>) -> BTreeMap<ObjectKey, BTreeSet<ObjectRef>> {
        let graph = DependencyGraph::from_snapshot(current);
        let mut out: BTreeMap<ObjectKey, BTreeSet<ObjectRef>> = BTreeMap::new();
        for r in broken {
            let Some(root) = current.find(r) else {
                debug!(object = %r, "broken object not in snapshot; ignoring");
                continue;
            };
            let cause = root.object_ref();
            for key in graph.closure_of(&root.key, self.closure) {
                out.entry(key).or_default().insert(cause.clone());
            }
        }
        out
    }

    /// Drop every broken object and its closure from `current`.
    pub fn generate_excluding(&self, current: &Snapshot, broken: &BTreeSet<ObjectRef>) -> Result<(Snapshot, FallbackMeta), FallbackError> {
        let affected = self.affected(current, broken);
        let mut meta = FallbackMeta::default();
        let mut kept: Vec<Arc<DeclarativeObject>> = Vec::with_capacity(current.len());
        for obj in current.iter() {
            match affected.get(&obj.key) {
                Some(causes) => meta.excluded.push(affected_object(obj, causes)),
                None => kept.push(Arc::clone(obj)),
            }
        }
        debug!(excluded = meta.excluded.len(), kept = kept.len(), "generated excluding fallback");
        Ok((Snapshot::build(kept)?, meta))
    }

    /// Like [`Self::generate_excluding`], but affected objects present in
    /// `last_valid` are restored to that version instead of dropped.
    pub fn generate_backfilling(
        &self,
        current: &Snapshot,
        last_valid: &Snapshot,
        broken: &BTreeSet<ObjectRef>,
    ) -> Result<(Snapshot, FallbackMeta), FallbackError> {
        let affected = self.affected(current, broken);
        let mut meta = FallbackMeta::default();
        let mut kept: Vec<Arc<DeclarativeObject>> = Vec::with_capacity(current.len());
        for obj in current.iter() {
            let Some(causes) = affected.get(&obj.key) else {
                kept.push(Arc::clone(obj));
                continue;
            };
            match last_valid.get(&obj.key) {
                Some(prev) => {
                    meta.backfilled.push(affected_object(prev, causes));
                    kept.push(Arc::clone(prev));
                }
                None => meta.excluded.push(affected_object(obj, causes)),
            }
        }
        debug!(
            excluded = meta.excluded.len(),
            backfilled = meta.backfilled.len(),
            kept = kept.len(),
            "generated backfilling fallback"
        );
        Ok((Snapshot::build(kept)?, meta))
    }

    /// Pick by policy. Backfill without a last valid snapshot degrades to exclude.
    pub fn generate(
        &self,
        policy: FallbackPolicy,
        current: &Snapshot,
        last_valid: Option<&Snapshot>,
        broken: &BTreeSet<ObjectRef>,
    ) -> Result<(Snapshot, FallbackMeta), FallbackError> {
        match (policy, last_valid) {
            (FallbackPolicy::Backfill, Some(prev)) => self.generate_backfilling(current, prev, broken),
            (FallbackPolicy::Backfill, None) => {
                debug!("no last valid snapshot; backfill falls back to exclusion");
                self.generate_excluding(current, broken)
            }
            (FallbackPolicy::Exclude, _) => self.generate_excluding(current, broken),
        }
    }
}

fn affected_object(obj: &DeclarativeObject, causes: &BTreeSet<ObjectRef>) -> AffectedObject {
    AffectedObject { object: obj.object_ref(), causing: causes.iter().cloned().collect() }
}
