//! Prometheus metrics for the crawl and monitor pipelines
//!
//! Call [`init_metrics`] once at startup to register everything. Metric
//! updates are fire-and-forget: if registration never happened or failed,
//! every recording call is a no-op. Nothing in here may block or fail the
//! crawl.

use prometheus::{register_gauge, register_int_counter, Gauge, IntCounter};
use std::sync::OnceLock;

struct Metrics {
    crawl_queue_depth: Gauge,
    persist_queue_depth: Gauge,
    connect_count: IntCounter,
    connect_errors: IntCounter,
    neighbors_fetched: IntCounter,
    visited_peers: IntCounter,
    dial_count: IntCounter,
    dial_errors: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Registers all metrics with the default prometheus registry
///
/// Safe to call more than once; only the first call registers. On
/// registration failure the error is returned and all metric recording
/// stays a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = Metrics {
        crawl_queue_depth: register_gauge!(
            "kadmap_crawl_queue_depth",
            "Number of peers waiting in the crawl queue"
        )?,
        persist_queue_depth: register_gauge!(
            "kadmap_persist_queue_depth",
            "Number of visit results waiting to be persisted"
        )?,
        connect_count: register_int_counter!(
            "kadmap_connects_total",
            "Connection attempts made by crawlers"
        )?,
        connect_errors: register_int_counter!(
            "kadmap_connect_errors_total",
            "Connection attempts that failed"
        )?,
        neighbors_fetched: register_int_counter!(
            "kadmap_neighbors_fetched_total",
            "Neighbor records returned by routing table queries"
        )?,
        visited_peers: register_int_counter!(
            "kadmap_visited_peers_total",
            "Peers fully visited during crawls"
        )?,
        dial_count: register_int_counter!(
            "kadmap_dials_total",
            "Liveness dials made by the monitor"
        )?,
        dial_errors: register_int_counter!(
            "kadmap_dial_errors_total",
            "Liveness dials that failed"
        )?,
    };

    let _ = METRICS.set(metrics);
    Ok(())
}

pub fn set_crawl_queue_depth(depth: usize) {
    if let Some(m) = METRICS.get() {
        m.crawl_queue_depth.set(depth as f64);
    }
}

pub fn set_persist_queue_depth(depth: usize) {
    if let Some(m) = METRICS.get() {
        m.persist_queue_depth.set(depth as f64);
    }
}

pub fn record_connect() {
    if let Some(m) = METRICS.get() {
        m.connect_count.inc();
    }
}

pub fn record_connect_error() {
    if let Some(m) = METRICS.get() {
        m.connect_errors.inc();
    }
}

pub fn add_neighbors_fetched(count: u64) {
    if let Some(m) = METRICS.get() {
        m.neighbors_fetched.inc_by(count);
    }
}

pub fn record_visited_peer() {
    if let Some(m) = METRICS.get() {
        m.visited_peers.inc();
    }
}

pub fn record_dial() {
    if let Some(m) = METRICS.get() {
        m.dial_count.inc();
    }
}

pub fn record_dial_error() {
    if let Some(m) = METRICS.get() {
        m.dial_errors.inc();
    }
}
