// Lorastar Server - Gateway ingestion server and Prometheus exporter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Lorastar Server
//!
//! Receives gateway reports over UDP, de-duplicates them through a
//! [`NetworkController`], returns acknowledgments to the best gateway and
//! exports engine statistics to Prometheus.
//!
//! ## Usage
//!
//! ```bash
//! # Serve two devices, gateways sending to port 1700
//! lorastar-server --device 26011f2e --device 26011f2f
//!
//! # Replay a recorded capture at 10x, registering devices as they appear
//! lorastar-server --csv capture.csv --speed 10.0 --auto-register
//! ```

mod ingest;
mod metrics;
mod replay;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use ingest::{run_downlink_writer, run_ingest, GatewayRoutes, UdpDownlinkSink};
use lorastar::{DevAddr, UplinkDelivery};
use lorastar_controller::{ControllerConfig, NetworkController};
use metrics::{encode_metrics, update_gateway_count, update_network_metrics};
use replay::{DatasetInfo, ReplayConfig, ReplayEngine, ReplayState};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Queued downlink datagrams before the sink reports `Full`
const DOWNLINK_QUEUE: usize = 1024;

/// Lorastar gateway server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP port for metrics and status
    #[arg(short, long, default_value = "9100")]
    port: u16,

    /// UDP port gateways send reports to
    #[arg(short, long, default_value = "1700")]
    udp_port: u16,

    /// Deduplication window in milliseconds
    #[arg(long, default_value = "1000")]
    dedup_window_ms: u64,

    /// Finalize as soon as this many gateways reported an uplink
    #[arg(long)]
    early_finalize: Option<u32>,

    /// Device address (hex) to register at startup; repeatable
    #[arg(short, long = "device", value_name = "DEVADDR")]
    devices: Vec<String>,

    /// CSV file of recorded gateway reports to replay
    #[arg(short, long)]
    csv: Option<String>,

    /// Replay speed multiplier (1.0 = real-time)
    #[arg(short, long, default_value = "1.0")]
    speed: f64,

    /// Loop the replay when it reaches the end
    #[arg(short, long)]
    loop_replay: bool,

    /// Register unknown devices when their reports arrive
    #[arg(long)]
    auto_register: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Application state shared across handlers.
struct AppState {
    controller: NetworkController,
    routes: Arc<GatewayRoutes>,
    replay_state: Option<Arc<ReplayState>>,
    dataset_info: Option<DatasetInfo>,
    start_time: std::time::Instant,
    started_at: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Lorastar Server v{}", env!("CARGO_PKG_VERSION"));

    // Build the controller
    let config = ControllerConfig {
        dedup_window: Duration::from_millis(args.dedup_window_ms),
        early_finalize_at: args.early_finalize,
        ..Default::default()
    };
    let controller = NetworkController::new(config)?;

    for device in &args.devices {
        let device: DevAddr = device.parse()?;
        controller.add_device(device);
    }
    info!("{} devices registered", controller.network().device_count());

    controller.on_uplink(|delivery: &UplinkDelivery| {
        debug!(
            device = %delivery.device,
            sequence = delivery.sequence,
            gateway = %delivery.gateway,
            gateways = delivery.gateway_count,
            bytes = delivery.payload.len(),
            "uplink delivered"
        );
    });

    // Gateway transport
    let udp_addr = SocketAddr::from(([0, 0, 0, 0], args.udp_port));
    let socket = Arc::new(UdpSocket::bind(udp_addr).await?);
    info!("Listening for gateway reports on udp://{}", udp_addr);

    let routes = Arc::new(GatewayRoutes::new());
    let (sink, downlinks) = UdpDownlinkSink::new(Arc::clone(&routes), DOWNLINK_QUEUE);
    controller.set_downlink_sink(sink);

    tokio::spawn(run_downlink_writer(Arc::clone(&socket), downlinks));
    {
        let controller = controller.clone();
        let routes = Arc::clone(&routes);
        let auto_register = args.auto_register;
        tokio::spawn(async move {
            if let Err(e) = run_ingest(socket, controller, routes, auto_register).await {
                tracing::error!("Gateway ingestion stopped: {}", e);
            }
        });
    }

    // Initialize replay engine if CSV provided
    let (replay_state, dataset_info) = if let Some(csv_path) = args.csv.clone() {
        let config = ReplayConfig {
            csv_path,
            speed: args.speed,
            loop_replay: args.loop_replay,
            auto_register: args.auto_register,
        };

        match ReplayEngine::from_csv(config, controller.clone()) {
            Ok(engine) => {
                let state = engine.state();
                let info = engine.dataset_info();

                info!(
                    "Dataset loaded: {} devices, {} gateways, {} reports",
                    info.device_count, info.gateway_count, info.report_count
                );

                tokio::spawn(async move {
                    engine.run().await;
                });

                (Some(state), Some(info))
            }
            Err(e) => {
                tracing::error!("Failed to load dataset: {}", e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let state = Arc::new(AppState {
        controller: controller.clone(),
        routes,
        replay_state,
        dataset_info,
        start_time: std::time::Instant::now(),
        started_at: Utc::now(),
    });

    // Build router
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let flushed = controller.flush();
    controller.shutdown();
    info!("Flushed {} pending uplinks", flushed);
    info!("\n{}", controller.stats().report());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Lorastar Server</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        a:hover { text-decoration: underline; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Lorastar Server</h1>
    <p>Multi-gateway uplink deduplication and acknowledgment control.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Health check</div>
        <div class="endpoint"><a href="/ready">/ready</a> - Readiness check</div>
        <div class="endpoint"><a href="/status">/status</a> - Status information (JSON)</div>
    </div>

    <h2>Metrics</h2>
    <ul>
        <li><code>lorastar_reports_total</code> - Gateway reports by outcome</li>
        <li><code>lorastar_uplinks_delivered_total</code> - De-duplicated uplinks</li>
        <li><code>lorastar_pending_uplinks</code> - Open deduplication windows</li>
        <li><code>lorastar_gateways_per_uplink</code> - Average gateways per uplink</li>
        <li><code>lorastar_downlinks_total</code> - Downlinks by receive window</li>
        <li><code>lorastar_downlinks_skipped_total</code> - Skipped downlinks by reason</li>
        <li><code>lorastar_dispatch_failures_total</code> - Refused downlinks</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_network_metrics(
        &state.controller.stats(),
        state.controller.dispatch_failures(),
    );
    update_gateway_count(state.routes.len());

    let metrics = encode_metrics();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.controller.is_shut_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down");
    }
    (StatusCode::OK, "Ready")
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    started_at: DateTime<Utc>,
    uptime_secs: u64,
    gateways: usize,
    armed_timers: usize,
    engine: EngineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    replay: Option<ReplayStatus>,
}

/// Engine statistics.
#[derive(Serialize)]
struct EngineStatus {
    devices: usize,
    pending: usize,
    reports: u64,
    accepted: u64,
    duplicates: u64,
    unknown_device: u64,
    delivered: u64,
    downlinks_rx1: u64,
    downlinks_rx2: u64,
    skipped_missing_settings: u64,
    skipped_window_missed: u64,
    discarded: u64,
    dispatch_failures: u64,
    duplicate_ratio: f64,
    gateways_per_uplink: f64,
}

/// Replay status information.
#[derive(Serialize)]
struct ReplayStatus {
    running: bool,
    paused: bool,
    position: usize,
    total_reports: usize,
    progress_percent: f64,
    device_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let stats = state.controller.stats();
    let engine = EngineStatus {
        devices: stats.devices,
        pending: stats.pending,
        reports: stats.reports,
        accepted: stats.accepted,
        duplicates: stats.duplicates,
        unknown_device: stats.unknown_device,
        delivered: stats.finalized,
        downlinks_rx1: stats.downlinks_rx1,
        downlinks_rx2: stats.downlinks_rx2,
        skipped_missing_settings: stats.skipped_missing_settings,
        skipped_window_missed: stats.skipped_window_missed,
        discarded: stats.discarded,
        dispatch_failures: state.controller.dispatch_failures(),
        duplicate_ratio: stats.duplicate_ratio(),
        gateways_per_uplink: stats.average_gateways_per_uplink(),
    };

    let replay = state.replay_state.as_ref().map(|replay_state| {
        let position = replay_state.position.load(Ordering::SeqCst);
        let total = replay_state.total_reports.load(Ordering::SeqCst);
        let progress = if total > 0 {
            (position as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        ReplayStatus {
            running: replay_state.running.load(Ordering::SeqCst),
            paused: replay_state.paused.load(Ordering::SeqCst),
            position,
            total_reports: total,
            progress_percent: progress,
            device_count: state
                .dataset_info
                .as_ref()
                .map(|i| i.device_count)
                .unwrap_or(0),
            duration_ms: state.dataset_info.as_ref().map(|i| i.duration_ms),
        }
    });

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at,
        uptime_secs: state.start_time.elapsed().as_secs(),
        gateways: state.routes.len(),
        armed_timers: state.controller.armed_timers(),
        engine,
        replay,
    })
}
