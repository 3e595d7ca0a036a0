//! Network statistics
//!
//! Lock-free counters updated on every report and finalization, plus a
//! point-in-time [`NetworkStats`] snapshot with derived ratios.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dedup::{ReportOutcome, WindowEvent};
use crate::error::DownlinkSkip;
use crate::protocol::RxWindow;

/// Live counters of a network engine
#[derive(Debug, Default)]
pub struct NetworkMetrics {
    reports: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    unknown_device: AtomicU64,
    windows_opened: AtomicU64,
    superseded: AtomicU64,
    folded: AtomicU64,
    finalized: AtomicU64,
    gateways_finalized: AtomicU64,
    downlinks_rx1: AtomicU64,
    downlinks_rx2: AtomicU64,
    skipped_missing_settings: AtomicU64,
    skipped_window_missed: AtomicU64,
    discarded: AtomicU64,
    malformed_commands: AtomicU64,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a submitted report
    pub fn record_report(&self, outcome: &ReportOutcome) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        match outcome {
            ReportOutcome::Accepted { window, .. } => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                let counter = match window {
                    WindowEvent::Opened => &self.windows_opened,
                    WindowEvent::Superseded(_) => {
                        self.windows_opened.fetch_add(1, Ordering::Relaxed);
                        &self.superseded
                    }
                    WindowEvent::Folded => &self.folded,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            ReportOutcome::DuplicateSequence { .. } => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            ReportOutcome::UnknownDevice => {
                self.unknown_device.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a finalized uplink heard by `gateway_count` gateways
    pub fn record_finalized(&self, gateway_count: u32) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
        self.gateways_finalized
            .fetch_add(u64::from(gateway_count), Ordering::Relaxed);
    }

    pub fn record_downlink(&self, window: RxWindow) {
        let counter = match window {
            RxWindow::Rx1 => &self.downlinks_rx1,
            RxWindow::Rx2 => &self.downlinks_rx2,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, skip: &DownlinkSkip) {
        let counter = match skip {
            DownlinkSkip::MissingSettings(_) => &self.skipped_missing_settings,
            DownlinkSkip::WindowMissed { .. } => &self.skipped_window_missed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pending uplinks dropped without delivery
    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_malformed_commands(&self) {
        self.malformed_commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy of all counters
    pub fn snapshot(&self) -> NetworkStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        NetworkStats {
            reports: load(&self.reports),
            accepted: load(&self.accepted),
            duplicates: load(&self.duplicates),
            unknown_device: load(&self.unknown_device),
            windows_opened: load(&self.windows_opened),
            superseded: load(&self.superseded),
            folded: load(&self.folded),
            finalized: load(&self.finalized),
            gateways_finalized: load(&self.gateways_finalized),
            downlinks_rx1: load(&self.downlinks_rx1),
            downlinks_rx2: load(&self.downlinks_rx2),
            skipped_missing_settings: load(&self.skipped_missing_settings),
            skipped_window_missed: load(&self.skipped_window_missed),
            discarded: load(&self.discarded),
            malformed_commands: load(&self.malformed_commands),
            devices: 0,
            pending: 0,
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.reports,
            &self.accepted,
            &self.duplicates,
            &self.unknown_device,
            &self.windows_opened,
            &self.superseded,
            &self.folded,
            &self.finalized,
            &self.gateways_finalized,
            &self.downlinks_rx1,
            &self.downlinks_rx2,
            &self.skipped_missing_settings,
            &self.skipped_window_missed,
            &self.discarded,
            &self.malformed_commands,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of network statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Gateway reports submitted
    pub reports: u64,
    /// Reports folded into a pending uplink
    pub accepted: u64,
    /// Reports dropped as duplicates or stale
    pub duplicates: u64,
    /// Reports from devices outside the network
    pub unknown_device: u64,
    /// Deduplication windows opened
    pub windows_opened: u64,
    /// Pending uplinks replaced by a newer sequence
    pub superseded: u64,
    /// Additional reports of a pending uplink
    pub folded: u64,
    /// Uplinks delivered
    pub finalized: u64,
    /// Sum of gateway counts over delivered uplinks
    pub gateways_finalized: u64,
    pub downlinks_rx1: u64,
    pub downlinks_rx2: u64,
    pub skipped_missing_settings: u64,
    pub skipped_window_missed: u64,
    /// Pending uplinks dropped by device removal or reset
    pub discarded: u64,
    /// Uplinks whose control command block failed to decode
    pub malformed_commands: u64,
    /// Member devices at snapshot time
    pub devices: usize,
    /// Pending uplinks at snapshot time
    pub pending: usize,
}

impl NetworkStats {
    /// Share of reports dropped as duplicates (0.0 - 1.0)
    pub fn duplicate_ratio(&self) -> f64 {
        if self.reports == 0 {
            return 0.0;
        }
        self.duplicates as f64 / self.reports as f64
    }

    /// Mean number of gateways per delivered uplink
    pub fn average_gateways_per_uplink(&self) -> f64 {
        if self.finalized == 0 {
            return 0.0;
        }
        self.gateways_finalized as f64 / self.finalized as f64
    }

    pub fn downlinks(&self) -> u64 {
        self.downlinks_rx1 + self.downlinks_rx2
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_missing_settings + self.skipped_window_missed
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Lorastar Network Statistics ===\n\n");

        report.push_str(&format!("Devices: {}\n", self.devices));
        report.push_str(&format!("Pending uplinks: {}\n\n", self.pending));

        report.push_str(&format!("Reports received: {}\n", self.reports));
        report.push_str(&format!("  accepted: {}\n", self.accepted));
        report.push_str(&format!(
            "  duplicates: {} ({:.1}%)\n",
            self.duplicates,
            self.duplicate_ratio() * 100.0
        ));
        report.push_str(&format!("  unknown device: {}\n\n", self.unknown_device));

        report.push_str(&format!(
            "Windows opened: {} (superseded {}, folded reports {})\n",
            self.windows_opened, self.superseded, self.folded
        ));
        report.push_str(&format!("Uplinks delivered: {}\n", self.finalized));
        report.push_str(&format!(
            "Average gateways per uplink: {:.2}\n\n",
            self.average_gateways_per_uplink()
        ));

        report.push_str(&format!(
            "Downlinks: {} (rx1 {}, rx2 {})\n",
            self.downlinks(),
            self.downlinks_rx1,
            self.downlinks_rx2
        ));
        report.push_str(&format!(
            "Skipped: {} (missing settings {}, window missed {})\n",
            self.skipped(),
            self.skipped_missing_settings,
            self.skipped_window_missed
        ));

        if self.discarded > 0 {
            report.push_str(&format!("Discarded pending: {}\n", self.discarded));
        }
        if self.malformed_commands > 0 {
            report.push_str(&format!(
                "Malformed command blocks: {}\n",
                self.malformed_commands
            ));
        }

        report
    }
}
