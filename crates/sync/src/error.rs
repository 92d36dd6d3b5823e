use tollgate_core::UpdateError;
use tollgate_fallback::FallbackError;
use tollgate_gateway::DispatchError;
use tollgate_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("taking snapshot: {0}")]
    Snapshot(#[from] StoreError),
    #[error("sending configuration: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("generating fallback configuration: {0}")]
    Fallback(#[from] FallbackError),
    #[error("update cancelled")]
    Cancelled,
    #[error("sending configuration: {original}; recovery failed: {recovery}")]
    RecoveryFailed {
        original: DispatchError,
        #[source]
        recovery: Box<SyncError>,
    },
}

impl SyncError {
    pub(crate) fn from_dispatch(e: DispatchError) -> Self {
        match e {
            DispatchError::Cancelled => SyncError::Cancelled,
            other => SyncError::Dispatch(other),
        }
    }

    fn dispatch_error(&self) -> Option<&DispatchError> {
        match self {
            SyncError::Dispatch(e) | SyncError::RecoveryFailed { original: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Whether running the same cycle again may succeed without any object
    /// changing. Gateway rejections need the objects fixed first.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Snapshot(_) | SyncError::Cancelled => true,
            SyncError::Fallback(_) => false,
            SyncError::Dispatch(_) | SyncError::RecoveryFailed { .. } => {
                self.dispatch_error().and_then(DispatchError::send_error).map_or(true, |e| e.is_transient())
            }
        }
    }

    /// The structured gateway rejection behind this error, if any.
    pub fn update_error(&self) -> Option<&UpdateError> {
        self.dispatch_error()?.send_error()?.as_update()
    }
}
