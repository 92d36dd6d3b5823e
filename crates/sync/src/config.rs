use std::str::FromStr;
use std::time::Duration;

use tollgate_core::DbMode;
use tollgate_fallback::{Closure, FallbackPolicy};
use tollgate_status::StatusQueue;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub db_mode: DbMode,
    /// Regenerate a configuration without broken objects when a push is rejected.
    pub fallback_enabled: bool,
    pub fallback_policy: FallbackPolicy,
    pub fallback_closure: Closure,
    /// Per-call admin API timeout.
    pub proxy_timeout: Duration,
    pub status_queue_cap: usize,
    /// Extra entity collections to read back when fetching gateway config.
    pub custom_entity_types: Vec<String>,
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_mode: DbMode::Dbless,
            fallback_enabled: false,
            fallback_policy: FallbackPolicy::Exclude,
            fallback_closure: Closure::default(),
            proxy_timeout: Duration::from_secs(30),
            status_queue_cap: tollgate_status::DEFAULT_QUEUE_CAP,
            custom_entity_types: Vec::new(),
            sync_interval: Duration::from_secs(3),
        }
    }
}

impl SyncConfig {
    /// Status queue sized by `status_queue_cap`.
    pub fn status_queue(&self) -> StatusQueue { StatusQueue::new(self.status_queue_cap) }

    /// Read `TOLLGATE_*` overrides; unset or invalid values keep defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_mode: env_parse("TOLLGATE_DB_MODE").unwrap_or(d.db_mode),
            fallback_enabled: env_bool("TOLLGATE_FALLBACK").unwrap_or(d.fallback_enabled),
            fallback_policy: env_parse("TOLLGATE_FALLBACK_POLICY").unwrap_or(d.fallback_policy),
            fallback_closure: env_parse("TOLLGATE_FALLBACK_CLOSURE").unwrap_or(d.fallback_closure),
            proxy_timeout: env_parse::<u64>("TOLLGATE_PROXY_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.proxy_timeout),
            status_queue_cap: env_parse("TOLLGATE_STATUS_QUEUE_CAP").unwrap_or(d.status_queue_cap),
            custom_entity_types: std::env::var("TOLLGATE_CUSTOM_ENTITY_TYPES").ok().map(|s| split_list(&s)).unwrap_or_default(),
            sync_interval: env_parse::<u64>("TOLLGATE_SYNC_INTERVAL_SECS").map(Duration::from_secs).unwrap_or(d.sync_interval),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(var = %name, value = %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(var = %name, value = %raw, "ignoring invalid boolean setting");
            None
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}
