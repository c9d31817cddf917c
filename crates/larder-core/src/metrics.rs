//! Prometheus metrics helpers for the larder cache.
//!
//! # Usage
//!
//! ```rust,ignore
//! use larder_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("cache_events_written_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: subsystem (`cache_`, `coalescer_`, `timeline_`, `relay_`, `profile_`)
//! - Suffix: unit or type (`_total`, `_rows`)
//! - Labels: only small closed sets (`outcome`, `result`, `tier`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:{port}` and serves `/metrics` from a background task.
///
/// # Arguments
///
/// * `port` - TCP port to listen on (e.g., 9091)
/// * `handle` - Prometheus handle from [`init_metrics`]
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // =========================================================================
    // Durable store
    // =========================================================================

    describe_counter!(
        "cache_events_written_total",
        "Events written to the durable store (label: protected)"
    );
    describe_counter!(
        "cache_events_evicted_total",
        "Rows removed by capacity eviction (label: table)"
    );
    describe_counter!(
        "cache_ttl_expired_total",
        "Rows deleted on read because their TTL elapsed (label: table)"
    );
    describe_counter!(
        "cache_store_errors_total",
        "Storage failures absorbed by the durable store"
    );
    describe_gauge!("cache_events_rows", "Rows in the events table");

    // =========================================================================
    // Write coalescers
    // =========================================================================

    describe_counter!(
        "coalescer_flushes_total",
        "Batches flushed by a coalescer (label: coalescer)"
    );
    describe_counter!(
        "coalescer_flush_failures_total",
        "Batches dropped because the flush failed (label: coalescer)"
    );

    // =========================================================================
    // Timeline loads
    // =========================================================================

    describe_counter!(
        "timeline_loads_total",
        "Finished timeline load sessions (label: outcome)"
    );
    describe_counter!(
        "timeline_events_rendered_total",
        "Events rendered to a timeline view"
    );
    describe_counter!(
        "timeline_sync_new_events_total",
        "New events discovered by background sync"
    );

    // =========================================================================
    // Relays and profiles
    // =========================================================================

    describe_counter!(
        "relay_subscriptions_total",
        "Relay subscriptions by result (label: result)"
    );
    describe_counter!(
        "profile_lookups_total",
        "Profile lookups by the tier that answered (label: tier)"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter by `count`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
