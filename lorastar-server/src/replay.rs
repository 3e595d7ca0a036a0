// Lorastar Server - Gateway report replay engine
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Replay of recorded gateway reports from CSV.
//!
//! Each row is one gateway's report of one uplink:
//!
//! ```text
//! timestamp_ms,dev_addr,fcnt,gateway,snr,frequency,data_rate,fopts,payload
//! 1000,26011f2e,1,b827ebfffe610001,-7.5,868100000,5,02,68656c6c6f
//! ```
//!
//! `dev_addr` and `gateway` are hex identifiers, `fopts` and `payload` are
//! hex byte strings (possibly empty). Rows are submitted to the controller
//! with their recorded spacing divided by the speed multiplier.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lorastar::{DevAddr, GatewayId, GatewayReport, UplinkRadio};
use lorastar_controller::{ControllerError, NetworkController};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics::update_replay_metrics;

/// Configuration for report replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to CSV dataset file.
    pub csv_path: String,
    /// Replay speed multiplier (1.0 = real-time, 10.0 = 10x faster).
    pub speed: f64,
    /// Whether to loop the dataset.
    pub loop_replay: bool,
    /// Register devices the network does not know yet.
    pub auto_register: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            csv_path: String::new(),
            speed: 1.0,
            loop_replay: false,
            auto_register: false,
        }
    }
}

/// State of the replay engine.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// Current position in the dataset (report index).
    pub position: AtomicUsize,
    /// Total reports in the dataset.
    pub total_reports: AtomicUsize,
    /// Whether replay is running.
    pub running: AtomicBool,
    /// Whether replay is paused.
    pub paused: AtomicBool,
}

/// CSV row as recorded.
#[derive(Debug, Deserialize)]
struct ReportRow {
    timestamp_ms: u64,
    dev_addr: String,
    fcnt: u32,
    gateway: String,
    snr: f64,
    frequency: u32,
    data_rate: u8,
    #[serde(default)]
    fopts: String,
    #[serde(default)]
    payload: String,
}

/// A report and its recorded arrival time.
#[derive(Debug, Clone)]
struct TimedReport {
    timestamp_ms: u64,
    report: GatewayReport,
}

/// Replay engine that feeds recorded reports through a controller.
pub struct ReplayEngine {
    config: ReplayConfig,
    state: Arc<ReplayState>,
    controller: NetworkController,
    reports: Vec<TimedReport>,
}

impl ReplayEngine {
    /// Create a new replay engine from a CSV file.
    pub fn from_csv(
        config: ReplayConfig,
        controller: NetworkController,
    ) -> Result<Self, ReplayError> {
        let path = Path::new(&config.csv_path);
        if !path.exists() {
            return Err(ReplayError::FileNotFound(config.csv_path.clone()));
        }
        if config.speed.is_nan() || config.speed <= 0.0 {
            return Err(ReplayError::InvalidFormat(format!(
                "speed must be positive, got {}",
                config.speed
            )));
        }

        let reports = Self::parse_csv(path)?;
        if reports.is_empty() {
            return Err(ReplayError::EmptyDataset);
        }

        let state = Arc::new(ReplayState::default());
        state.total_reports.store(reports.len(), Ordering::SeqCst);

        Ok(Self {
            config,
            state,
            controller,
            reports,
        })
    }

    /// Parse a CSV file into timed reports.
    fn parse_csv(path: &Path) -> Result<Vec<TimedReport>, ReplayError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let mut reports = Vec::new();
        for (index, result) in reader.deserialize::<ReportRow>().enumerate() {
            let row = result?;
            // header is line 1
            let line = index + 2;

            let device: DevAddr = row
                .dev_addr
                .parse()
                .map_err(|e| ReplayError::InvalidFormat(format!("line {}: {}", line, e)))?;
            let gateway: GatewayId = row
                .gateway
                .parse()
                .map_err(|e| ReplayError::InvalidFormat(format!("line {}: {}", line, e)))?;
            let fopts = hex::decode(&row.fopts)
                .map_err(|e| ReplayError::InvalidFormat(format!("line {}: fopts: {}", line, e)))?;
            let payload = hex::decode(&row.payload).map_err(|e| {
                ReplayError::InvalidFormat(format!("line {}: payload: {}", line, e))
            })?;

            let report = GatewayReport::new(device, row.fcnt, gateway, row.snr, payload)
                .with_radio(UplinkRadio {
                    frequency: row.frequency,
                    data_rate: row.data_rate,
                })
                .with_fopts(fopts);

            reports.push(TimedReport {
                timestamp_ms: row.timestamp_ms,
                report,
            });
        }

        // recordings from several gateways may interleave out of order
        reports.sort_by_key(|r| r.timestamp_ms);
        Ok(reports)
    }

    /// Get the replay state.
    pub fn state(&self) -> Arc<ReplayState> {
        Arc::clone(&self.state)
    }

    /// Start the replay loop (runs until the dataset ends or the controller
    /// shuts down).
    pub async fn run(&self) {
        self.state.running.store(true, Ordering::SeqCst);
        info!(
            "Starting replay: speed={}, loop={}",
            self.config.speed, self.config.loop_replay
        );

        loop {
            if !self.state.running.load(Ordering::SeqCst) {
                break;
            }

            if self.state.paused.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(100)).await;
                continue;
            }

            let position = self.state.position.load(Ordering::SeqCst);

            if position >= self.reports.len() {
                if self.config.loop_replay {
                    info!("Dataset complete, looping...");
                    // let the last uplink's window close before forgetting it
                    sleep(self.controller.config().dedup_window).await;
                    self.state.position.store(0, Ordering::SeqCst);
                    self.reset_devices();
                    continue;
                } else {
                    info!("Dataset complete, stopping");
                    self.state.running.store(false, Ordering::SeqCst);
                    break;
                }
            }

            let timed = &self.reports[position];
            if !self.submit(timed) {
                self.state.running.store(false, Ordering::SeqCst);
                break;
            }

            self.state.position.fetch_add(1, Ordering::SeqCst);
            update_replay_metrics(position + 1, self.reports.len(), self.config.speed);

            let gap_ms = self
                .reports
                .get(position + 1)
                .map(|next| next.timestamp_ms - timed.timestamp_ms)
                .unwrap_or(0);
            let sleep_ms = (gap_ms as f64 / self.config.speed) as u64;
            if sleep_ms > 0 {
                sleep(Duration::from_millis(sleep_ms)).await;
            }
        }
    }

    /// Submit one report; returns false once the controller is shut down.
    fn submit(&self, timed: &TimedReport) -> bool {
        let report = timed.report.clone();
        if self.config.auto_register && self.controller.add_device(report.device) {
            info!(device = %report.device, "device auto-registered");
        }

        let (device, sequence) = (report.device, report.sequence);
        match self.controller.submit(report) {
            Ok(outcome) => {
                debug!(
                    %device,
                    sequence,
                    timestamp_ms = timed.timestamp_ms,
                    outcome = outcome.as_str(),
                    "replayed report"
                );
                true
            }
            Err(ControllerError::ShutDown) => {
                info!("Controller shut down, stopping replay");
                false
            }
            Err(e) => {
                warn!(%device, sequence, error = %e, "replayed report rejected");
                true
            }
        }
    }

    /// Forget frame counters so a looped dataset is not dropped as duplicates.
    fn reset_devices(&self) {
        for device in self.devices() {
            if self.controller.network().is_member(device) {
                self.controller.remove_device(device);
                self.controller.add_device(device);
            }
        }
    }

    fn devices(&self) -> HashSet<DevAddr> {
        self.reports.iter().map(|r| r.report.device).collect()
    }

    /// Get dataset info.
    pub fn dataset_info(&self) -> DatasetInfo {
        let duration_ms = match (self.reports.first(), self.reports.last()) {
            (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
            _ => 0,
        };
        let gateways: HashSet<GatewayId> = self.reports.iter().map(|r| r.report.gateway).collect();

        DatasetInfo {
            device_count: self.devices().len(),
            gateway_count: gateways.len(),
            report_count: self.reports.len(),
            duration_ms,
        }
    }
}

/// Dataset information.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub device_count: usize,
    pub gateway_count: usize,
    pub report_count: usize,
    pub duration_ms: u64,
}

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Empty dataset")]
    EmptyDataset,
}
