//! Target State: the normalized gateway configuration built from a snapshot.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ObjectRef;

/// Content hash of a serialized Target State as applied to one gateway.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigHash(String);

impl ConfigHash {
    pub fn new(hex: impl Into<String>) -> Self { Self(hex.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// `(kind, id)` address of an entity inside a Target State.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.kind, self.id) }
}

/// A gateway entity. Nested children are owned by exactly this entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Declarative objects this entity was translated from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Entity>,
}

impl Entity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into(), config: serde_json::Value::Null, sources: Vec::new(), children: Vec::new() }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_source(mut self, source: ObjectRef) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_child(mut self, child: Entity) -> Self {
        self.children.push(child);
        self
    }

    pub fn entity_ref(&self) -> EntityRef { EntityRef::new(&self.kind, &self.id) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetStateError {
    #[error("entity {0} appears more than once")]
    Duplicate(EntityRef),
}

/// Top-level entities with their nested children, plus custom entity collections keyed by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    #[serde(default)]
    pub nodes: Vec<Entity>,
    #[serde(default)]
    pub custom: BTreeMap<String, Vec<Entity>>,
}

impl TargetState {
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() && self.custom.values().all(|v| v.is_empty()) }

    /// Every entity in the graph, depth first, top-level nodes before custom collections.
    pub fn entities(&self) -> Vec<&Entity> {
        let mut out = Vec::new();
        let mut stack: Vec<&Entity> = self.custom.values().flatten().rev().collect();
        stack.extend(self.nodes.iter().rev());
        while let Some(e) = stack.pop() {
            out.push(e);
            stack.extend(e.children.iter().rev());
        }
        out
    }

    pub fn find(&self, r: &EntityRef) -> Option<&Entity> {
        self.entities().into_iter().find(|e| e.kind == r.kind && e.id == r.id)
    }

    /// Ownership is structural; this checks that no `(kind, id)` appears twice.
    pub fn validate(&self) -> Result<(), TargetStateError> {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for e in self.entities() {
            if !seen.insert((e.kind.as_str(), e.id.as_str())) {
                return Err(TargetStateError::Duplicate(e.entity_ref()));
            }
        }
        Ok(())
    }

    /// Declarative objects referenced by any entity.
    pub fn source_objects(&self) -> BTreeSet<ObjectRef> {
        self.entities().into_iter().flat_map(|e| e.sources.iter().cloned()).collect()
    }

    /// Hex SHA-256 over the canonical JSON encoding (object keys are sorted by serde_json).
    pub fn content_hash(&self) -> Result<ConfigHash, serde_json::Error> {
        let mut hasher = Sha256::new();
        serde_json::to_writer(&mut hasher, self)?;
        Ok(ConfigHash(hex::encode(hasher.finalize())))
    }
}
