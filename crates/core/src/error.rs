//! Errors a gateway admin endpoint can return for a configuration push.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EntityRef, ObjectRef};

/// One entity the gateway rejected, with the declarative objects it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity: EntityRef,
    pub causing_objects: Vec<ObjectRef>,
    pub problems: Vec<String>,
}

/// Structured rejection of part of a configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("gateway rejected configuration: {} entity failure(s)", .failures.len())]
pub struct UpdateError {
    pub failures: Vec<EntityFailure>,
    pub raw_body: Vec<u8>,
}

impl UpdateError {
    /// Objects named as causes by any rejected entity.
    pub fn broken_objects(&self) -> BTreeSet<ObjectRef> {
        self.failures.iter().flat_map(|f| f.causing_objects.iter().cloned()).collect()
    }
}

/// Rejection whose body could not be decoded into per-entity failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not decode gateway rejection: {reason}")]
pub struct ResponseParsingError {
    pub reason: String,
    pub raw_body: Vec<u8>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    ResponseParsing(#[from] ResponseParsingError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("encoding configuration: {0}")]
    Encode(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl SendError {
    pub fn as_update(&self) -> Option<&UpdateError> {
        match self {
            SendError::Update(e) => Some(e),
            _ => None,
        }
    }

    pub fn raw_body(&self) -> Option<&[u8]> {
        match self {
            SendError::Update(e) => Some(&e.raw_body),
            SendError::ResponseParsing(e) => Some(&e.raw_body),
            _ => None,
        }
    }

    /// Broken objects for a structured rejection; empty for every other kind.
    pub fn broken_objects(&self) -> BTreeSet<ObjectRef> {
        self.as_update().map(UpdateError::broken_objects).unwrap_or_default()
    }

    /// Timeouts and transport failures may succeed unchanged on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Timeout(_) | SendError::Transport(_))
    }
}
