// src/core/metrics.rs

//! Defines and registers Prometheus metrics for scheduler and catalog
//! monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle. The core itself only
//! calls through the `Metrics` trait; `PrometheusMetrics` is the production
//! sink.

use crate::core::events::CatalogKindId;
use crate::core::traits::Metrics;
use crate::core::types::StartCause;
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, GaugeVec, HistogramVec, TextEncoder, register_counter_vec, register_gauge_vec,
    register_histogram_vec,
};
use std::time::Duration;

lazy_static! {
    // --- Scheduler gauges ---
    /// The number of live instances per server pool.
    pub static ref POOL_SIZE: GaugeVec =
        register_gauge_vec!("procmux_pool_size", "Number of live instances per server pool.", &["server"]).unwrap();

    // --- Scheduler counters ---
    /// Total instance starts, labeled by server and start cause.
    pub static ref INSTANCES_STARTED_TOTAL: CounterVec =
        register_counter_vec!("procmux_instances_started_total", "Total instance starts.", &["server", "cause"]).unwrap();
    /// Total instance stops, labeled by server and stop reason.
    pub static ref INSTANCES_STOPPED_TOTAL: CounterVec =
        register_counter_vec!("procmux_instances_stopped_total", "Total instance stops.", &["server", "reason"]).unwrap();
    /// Total start failures, labeled by server.
    pub static ref START_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("procmux_start_failures_total", "Total instance start failures.", &["server"]).unwrap();
    /// Total successful acquires, labeled by server.
    pub static ref ACQUIRES_TOTAL: CounterVec =
        register_counter_vec!("procmux_acquires_total", "Total successful instance acquisitions.", &["server"]).unwrap();
    /// Total releases, labeled by server.
    pub static ref RELEASES_TOTAL: CounterVec =
        register_counter_vec!("procmux_releases_total", "Total instance releases.", &["server"]).unwrap();

    // --- Catalog counters and histograms ---
    /// Refresh passes per catalog kind, labeled by whether the snapshot changed.
    pub static ref REFRESH_TOTAL: CounterVec =
        register_counter_vec!("procmux_refresh_total", "Total catalog refresh passes.", &["kind", "changed"]).unwrap();
    /// Per-server refresh fetch failures per catalog kind.
    pub static ref REFRESH_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("procmux_refresh_errors_total", "Total per-server refresh fetch failures.", &["kind", "server"]).unwrap();
    /// Entries in the most recently published snapshot per kind.
    pub static ref SNAPSHOT_ENTRIES: GaugeVec =
        register_gauge_vec!("procmux_snapshot_entries", "Entries in the current catalog snapshot.", &["kind"]).unwrap();
    /// Latency of full refresh passes per kind.
    pub static ref REFRESH_DURATION_SECONDS: HistogramVec =
        register_histogram_vec!("procmux_refresh_duration_seconds", "Latency of catalog refresh passes in seconds.", &["kind"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Production `Metrics` sink backed by the registered Prometheus series.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl Metrics for PrometheusMetrics {
    fn on_instance_started(&self, server: &str, cause: StartCause) {
        INSTANCES_STARTED_TOTAL
            .with_label_values(&[server, &cause.to_string()])
            .inc();
    }

    fn on_instance_stopped(&self, server: &str, reason: &str) {
        INSTANCES_STOPPED_TOTAL
            .with_label_values(&[server, reason])
            .inc();
    }

    fn on_start_failure(&self, server: &str) {
        START_FAILURES_TOTAL.with_label_values(&[server]).inc();
    }

    fn on_acquire(&self, server: &str) {
        ACQUIRES_TOTAL.with_label_values(&[server]).inc();
    }

    fn on_release(&self, server: &str) {
        RELEASES_TOTAL.with_label_values(&[server]).inc();
    }

    fn set_pool_size(&self, server: &str, size: usize) {
        POOL_SIZE.with_label_values(&[server]).set(size as f64);
    }

    fn on_refresh(&self, kind: CatalogKindId, duration: Duration, changed: bool) {
        let kind = kind.to_string();
        REFRESH_TOTAL
            .with_label_values(&[&kind, &(if changed { "true" } else { "false" }).to_string()])
            .inc();
        REFRESH_DURATION_SECONDS
            .with_label_values(&[&kind])
            .observe(duration.as_secs_f64());
    }

    fn on_refresh_error(&self, kind: CatalogKindId, server: &str) {
        REFRESH_ERRORS_TOTAL
            .with_label_values(&[&kind.to_string(), server])
            .inc();
    }

    fn on_snapshot_published(&self, kind: CatalogKindId, entries: usize) {
        SNAPSHOT_ENTRIES
            .with_label_values(&[&kind.to_string()])
            .set(entries as f64);
    }
}
