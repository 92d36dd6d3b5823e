//! Contract for the translator that turns a snapshot into a Target State.

use std::sync::Arc;

use tollgate_core::{DeclarativeObject, Snapshot, TargetState, TranslationFailure};

/// Result of one translation pass. Objects that could not be translated are
/// reported in `translation_failures` and left out of `target`.
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    pub target: TargetState,
    pub translation_failures: Vec<TranslationFailure>,
    /// Objects whose translation made it into `target`.
    pub configured_objects: Vec<Arc<DeclarativeObject>>,
}

/// `update_snapshot` is always called before `build_target_state` in a cycle.
pub trait ConfigBuilder: Send + Sync {
    fn update_snapshot(&mut self, snapshot: Snapshot);
    fn build_target_state(&mut self) -> BuildOutcome;
}
