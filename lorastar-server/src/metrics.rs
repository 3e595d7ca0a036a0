// Lorastar Server - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for Lorastar monitoring.
//!
//! Engine counters are mirrored from [`NetworkStats`] snapshots when
//! `/metrics` is scraped. Ingestion counters are incremented as datagrams
//! arrive.

use lazy_static::lazy_static;
use lorastar::NetworkStats;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge, GaugeVec,
    TextEncoder,
};

lazy_static! {
    // ============================================================
    // Deduplication (from NetworkStats)
    // ============================================================

    /// Gateway reports by outcome.
    pub static ref REPORTS_TOTAL: GaugeVec = register_gauge_vec!(
        "lorastar_reports_total",
        "Gateway reports by outcome",
        &["outcome"]
    ).unwrap();

    /// Deduplication window transitions (opened, superseded, folded).
    pub static ref WINDOW_EVENTS_TOTAL: GaugeVec = register_gauge_vec!(
        "lorastar_window_events_total",
        "Deduplication window events",
        &["event"]
    ).unwrap();

    /// De-duplicated uplinks delivered to listeners.
    pub static ref UPLINKS_DELIVERED_TOTAL: Gauge = register_gauge!(
        "lorastar_uplinks_delivered_total",
        "De-duplicated uplinks delivered"
    ).unwrap();

    /// Pending uplinks dropped without delivery.
    pub static ref UPLINKS_DISCARDED_TOTAL: Gauge = register_gauge!(
        "lorastar_uplinks_discarded_total",
        "Pending uplinks dropped without delivery"
    ).unwrap();

    /// Pending uplinks waiting for their window to close.
    pub static ref PENDING_UPLINKS: Gauge = register_gauge!(
        "lorastar_pending_uplinks",
        "Uplinks inside an open deduplication window"
    ).unwrap();

    /// Average number of gateways that heard a delivered uplink.
    pub static ref GATEWAYS_PER_UPLINK: Gauge = register_gauge!(
        "lorastar_gateways_per_uplink",
        "Average gateways per delivered uplink"
    ).unwrap();

    /// Share of reports dropped as duplicates (0-1).
    pub static ref DUPLICATE_RATIO: Gauge = register_gauge!(
        "lorastar_duplicate_ratio",
        "Share of gateway reports dropped as duplicates (0-1)"
    ).unwrap();

    /// Devices in the network.
    pub static ref DEVICES: Gauge = register_gauge!(
        "lorastar_devices",
        "Member devices"
    ).unwrap();

    // ============================================================
    // Downlinks
    // ============================================================

    /// Downlinks scheduled, labeled by receive window.
    pub static ref DOWNLINKS_TOTAL: GaugeVec = register_gauge_vec!(
        "lorastar_downlinks_total",
        "Downlinks scheduled by receive window",
        &["window"]
    ).unwrap();

    /// Uplinks finalized without a downlink, labeled by reason.
    pub static ref DOWNLINKS_SKIPPED_TOTAL: GaugeVec = register_gauge_vec!(
        "lorastar_downlinks_skipped_total",
        "Downlinks skipped by reason",
        &["reason"]
    ).unwrap();

    /// Downlinks the transmission path refused.
    pub static ref DISPATCH_FAILURES_TOTAL: Gauge = register_gauge!(
        "lorastar_dispatch_failures_total",
        "Downlinks the transmission path refused"
    ).unwrap();

    /// Uplinks whose piggybacked command block failed to decode.
    pub static ref MALFORMED_COMMANDS_TOTAL: Gauge = register_gauge!(
        "lorastar_malformed_commands_total",
        "Uplinks with an undecodable command block"
    ).unwrap();

    // ============================================================
    // Server Metrics
    // ============================================================

    /// Datagrams received, labeled by decode result.
    pub static ref DATAGRAMS_TOTAL: CounterVec = register_counter_vec!(
        "lorastar_server_datagrams_total",
        "UDP datagrams received",
        &["direction", "result"]
    ).unwrap();

    /// Gateways with a learned return address.
    pub static ref GATEWAYS_KNOWN: Gauge = register_gauge!(
        "lorastar_server_gateways",
        "Gateways with a known return address"
    ).unwrap();

    /// Current replay position (report index).
    pub static ref REPLAY_POSITION: Gauge = register_gauge!(
        "lorastar_server_replay_position",
        "Current replay position (report index)"
    ).unwrap();

    /// Total reports in the replay dataset.
    pub static ref REPLAY_TOTAL_REPORTS: Gauge = register_gauge!(
        "lorastar_server_replay_total_reports",
        "Total reports in the replay dataset"
    ).unwrap();

    /// Replay speed multiplier.
    pub static ref REPLAY_SPEED: Gauge = register_gauge!(
        "lorastar_server_replay_speed",
        "Replay speed multiplier"
    ).unwrap();
}

/// Mirror an engine statistics snapshot into the exported gauges.
pub fn update_network_metrics(stats: &NetworkStats, dispatch_failures: u64) {
    REPORTS_TOTAL
        .with_label_values(&["accepted"])
        .set(stats.accepted as f64);
    REPORTS_TOTAL
        .with_label_values(&["duplicate"])
        .set(stats.duplicates as f64);
    REPORTS_TOTAL
        .with_label_values(&["unknown_device"])
        .set(stats.unknown_device as f64);

    WINDOW_EVENTS_TOTAL
        .with_label_values(&["opened"])
        .set(stats.windows_opened as f64);
    WINDOW_EVENTS_TOTAL
        .with_label_values(&["superseded"])
        .set(stats.superseded as f64);
    WINDOW_EVENTS_TOTAL
        .with_label_values(&["folded"])
        .set(stats.folded as f64);

    UPLINKS_DELIVERED_TOTAL.set(stats.finalized as f64);
    UPLINKS_DISCARDED_TOTAL.set(stats.discarded as f64);
    PENDING_UPLINKS.set(stats.pending as f64);
    GATEWAYS_PER_UPLINK.set(stats.average_gateways_per_uplink());
    DUPLICATE_RATIO.set(stats.duplicate_ratio());
    DEVICES.set(stats.devices as f64);

    DOWNLINKS_TOTAL
        .with_label_values(&["rx1"])
        .set(stats.downlinks_rx1 as f64);
    DOWNLINKS_TOTAL
        .with_label_values(&["rx2"])
        .set(stats.downlinks_rx2 as f64);
    DOWNLINKS_SKIPPED_TOTAL
        .with_label_values(&["missing_settings"])
        .set(stats.skipped_missing_settings as f64);
    DOWNLINKS_SKIPPED_TOTAL
        .with_label_values(&["window_missed"])
        .set(stats.skipped_window_missed as f64);

    DISPATCH_FAILURES_TOTAL.set(dispatch_failures as f64);
    MALFORMED_COMMANDS_TOTAL.set(stats.malformed_commands as f64);
}

/// Count one datagram, e.g. `("uplink", "ok")` or `("downlink", "no_route")`.
pub fn record_datagram(direction: &str, result: &str) {
    DATAGRAMS_TOTAL.with_label_values(&[direction, result]).inc();
}

pub fn update_gateway_count(count: usize) {
    GATEWAYS_KNOWN.set(count as f64);
}

/// Update replay position metrics.
pub fn update_replay_metrics(position: usize, total: usize, speed: f64) {
    REPLAY_POSITION.set(position as f64);
    REPLAY_TOTAL_REPORTS.set(total as f64);
    REPLAY_SPEED.set(speed);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
