//! Optional feed of every configuration the orchestrator pushed, for
//! debugging endpoints. Never slows a cycle down: full buffers drop dumps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::mpsc;
use tollgate_core::{FallbackMeta, TargetState};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ConfigDump {
    pub target: Arc<TargetState>,
    pub is_fallback: bool,
    pub failed: bool,
    pub error: Option<String>,
    pub raw_error_body: Option<Vec<u8>>,
    pub fallback_meta: Option<FallbackMeta>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsHook {
    tx: mpsc::Sender<ConfigDump>,
}

impl DiagnosticsHook {
    pub fn new(tx: mpsc::Sender<ConfigDump>) -> Self { Self { tx } }

    pub fn channel(cap: usize) -> (Self, mpsc::Receiver<ConfigDump>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self { tx }, rx)
    }

    pub fn offer(&self, dump: ConfigDump) {
        if self.tx.try_send(dump).is_err() {
            debug!("diagnostics consumer busy; dropping config dump");
            counter!("sync_diagnostics_dropped_total", 1u64);
        }
    }
}
