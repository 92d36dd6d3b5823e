//! Observation points of a sync cycle. The orchestrator only talks to a
//! [`MetricsSink`]; [`RecorderSink`] forwards to the `metrics` facade.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tollgate_core::FallbackMeta;

pub trait MetricsSink: Send + Sync {
    fn record_translation(&self, failures: usize, took: Duration);
    fn record_push(&self, success: bool, is_fallback: bool, broken_objects: usize, took: Duration);
    fn record_snapshot_cache_hit(&self);
    fn record_fallback_generated(&self, meta: &FallbackMeta, took: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

fn label(b: bool) -> &'static str { if b { "true" } else { "false" } }

impl MetricsSink for RecorderSink {
    fn record_translation(&self, failures: usize, took: Duration) {
        counter!("sync_translation_total", 1u64, "success" => label(failures == 0));
        gauge!("sync_translation_broken_objects", failures as f64);
        histogram!("sync_translation_ms", took.as_secs_f64() * 1000.0);
    }

    fn record_push(&self, success: bool, is_fallback: bool, broken_objects: usize, took: Duration) {
        counter!("sync_push_total", 1u64, "success" => label(success), "fallback" => label(is_fallback));
        gauge!("sync_push_broken_objects", broken_objects as f64);
        histogram!("sync_push_ms", took.as_secs_f64() * 1000.0, "fallback" => label(is_fallback));
    }

    fn record_snapshot_cache_hit(&self) {
        counter!("sync_snapshot_cache_hits_total", 1u64);
    }

    fn record_fallback_generated(&self, meta: &FallbackMeta, took: Duration) {
        counter!("sync_fallback_generated_total", 1u64);
        gauge!("sync_fallback_excluded_objects", meta.excluded.len() as f64);
        gauge!("sync_fallback_backfilled_objects", meta.backfilled.len() as f64);
        histogram!("sync_fallback_ms", took.as_secs_f64() * 1000.0);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_translation(&self, _: usize, _: Duration) {}
    fn record_push(&self, _: bool, _: bool, _: usize, _: Duration) {}
    fn record_snapshot_cache_hit(&self) {}
    fn record_fallback_generated(&self, _: &FallbackMeta, _: Duration) {}
}
