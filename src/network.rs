//! Network engine
//!
//! [`Network`] ties the registry, the deduplicator and the arbiter together
//! behind a `Send + Sync` API. It has no notion of time beyond the
//! [`Instant`]s callers pass in: deciding *when* to finalize an uplink is the
//! job of whoever drives it (the async controller, a replay, or a test).
//!
//! The uplink path never takes the registry lock: membership, watermark and
//! pending record are checked per device in the [`Deduplicator`]. Finalize
//! takes one registry write section for settings, the queued payload and
//! command execution.

use std::sync::RwLock;
use std::time::Instant;

use crate::arbiter::{Arbiter, ArbiterConfig, Finalized};
use crate::command::CommandContext;
use crate::dedup::{Deduplicator, PendingUplink, ReportOutcome, DEFAULT_SHARD_COUNT};
use crate::error::Result;
use crate::metrics::{NetworkMetrics, NetworkStats};
use crate::protocol::{
    DevAddr, FrameCounter, GatewayReport, LinkQuality, RxWindowSettings,
};
use crate::registry::{self, DeviceRegistry, DeviceState};

/// Deduplication and acknowledgment engine for one network
#[derive(Debug)]
pub struct Network {
    registry: RwLock<DeviceRegistry>,
    dedup: Deduplicator,
    arbiter: Arbiter,
    metrics: NetworkMetrics,
}

impl Network {
    /// Create an engine with default shard count and scheduling margin
    pub fn new() -> Self {
        Self::with_config(DEFAULT_SHARD_COUNT, ArbiterConfig::default())
    }

    pub fn with_config(shard_count: usize, arbiter: ArbiterConfig) -> Self {
        Self {
            registry: RwLock::new(DeviceRegistry::new()),
            dedup: Deduplicator::with_shards(shard_count),
            arbiter: Arbiter::new(arbiter),
            metrics: NetworkMetrics::new(),
        }
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Place a device under network control
    ///
    /// Registry state is created before the device becomes visible to the
    /// uplink path.
    pub fn add_device(&self, device: DevAddr) -> bool {
        let added = registry::write(&self.registry).add_device(device);
        self.dedup.track(device);
        if added {
            log::info!("device {} added", device);
        }
        added
    }

    /// Remove a device; its pending uplink is dropped without delivery
    ///
    /// The device leaves the uplink path first, so no report can open a new
    /// window once its registry state is gone.
    pub fn remove_device(&self, device: DevAddr) -> Option<PendingUplink> {
        let pending = self.dedup.untrack(device).and_then(|track| track.pending);
        let state = registry::write(&self.registry).remove_device(device);
        if let Some(p) = &pending {
            self.metrics.record_discarded(1);
            log::debug!(
                "device {}: pending uplink {} discarded on removal",
                device,
                p.sequence
            );
        }
        if state.is_some() {
            log::info!("device {} removed", device);
        }
        pending
    }

    pub fn is_member(&self, device: DevAddr) -> bool {
        self.dedup.is_tracked(device)
    }

    /// Replace all receive-window settings of a device
    pub fn set_rx_window(&self, device: DevAddr, settings: RxWindowSettings) -> Result<()> {
        registry::write(&self.registry).set_rx_window(device, settings)?;
        Ok(())
    }

    /// Update first-window offset and second-window parameters
    pub fn set_rx_settings(
        &self,
        device: DevAddr,
        rx1_dr_offset: u8,
        rx2_data_rate: u8,
        rx2_frequency: u32,
    ) {
        registry::write(&self.registry).set_rx_settings(
            device,
            rx1_dr_offset,
            rx2_data_rate,
            rx2_frequency,
        );
    }

    pub fn set_response_delay(&self, device: DevAddr, delay: u8) -> Result<()> {
        registry::write(&self.registry).set_response_delay(device, delay)?;
        Ok(())
    }

    pub fn clear_rx_window(&self, device: DevAddr) -> Result<()> {
        registry::write(&self.registry).clear_rx_window(device)?;
        Ok(())
    }

    pub fn rx_window(&self, device: DevAddr) -> Result<RxWindowSettings> {
        Ok(registry::read(&self.registry).rx_window(device)?)
    }

    /// Highest finalized frame counter, `None` before the first uplink
    pub fn last_sequence(&self, device: DevAddr) -> Result<Option<FrameCounter>> {
        Ok(self.dedup.last_sequence(device)?)
    }

    /// Advance a device's sequence watermark out of band
    ///
    /// A pending uplink the new watermark covers is dropped without
    /// delivery.
    pub fn record_sequence(&self, device: DevAddr, sequence: FrameCounter) -> Result<()> {
        if let Some(stale) = self.dedup.record_sequence(device, sequence)? {
            self.metrics.record_discarded(1);
            log::debug!(
                "device {}: pending uplink {} covered by watermark {}",
                device,
                stale.sequence,
                sequence
            );
        }
        Ok(())
    }

    /// Number of uplinks finalized for a device
    pub fn uplink_count(&self, device: DevAddr) -> Result<u64> {
        Ok(self.dedup.uplink_count(device)?)
    }

    /// Last link-quality report sent to a device
    pub fn link_quality(&self, device: DevAddr) -> Result<Option<LinkQuality>> {
        Ok(registry::read(&self.registry).link_quality(device)?)
    }

    pub fn margin(&self, device: DevAddr) -> Result<Option<u8>> {
        Ok(registry::read(&self.registry).margin(device)?)
    }

    pub fn gateway_count(&self, device: DevAddr) -> Result<Option<u8>> {
        Ok(registry::read(&self.registry).gateway_count(device)?)
    }

    /// Queue an application payload for the next acknowledgment of a device
    pub fn queue_downlink(&self, device: DevAddr, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(registry::write(&self.registry).queue_downlink(device, payload)?)
    }

    /// Copy of a device's control state
    pub fn device(&self, device: DevAddr) -> Option<DeviceState> {
        registry::read(&self.registry).device(device).cloned()
    }

    pub fn members(&self) -> Vec<DevAddr> {
        registry::read(&self.registry).members()
    }

    pub fn device_count(&self) -> usize {
        registry::read(&self.registry).count()
    }

    // ------------------------------------------------------------------
    // Uplink path
    // ------------------------------------------------------------------

    /// Fold one gateway's report into the pending uplinks
    pub fn submit_report(&self, report: GatewayReport, now: Instant) -> ReportOutcome {
        let device = report.device;
        let sequence = report.sequence;
        let gateway = report.gateway;

        let outcome = self.dedup.submit(report, now);
        self.metrics.record_report(&outcome);

        log::debug!(
            "report {}/{} from gateway {}: {:?}",
            device,
            sequence,
            gateway,
            outcome
        );
        outcome
    }

    /// Finalize the pending uplink `(device, sequence)`
    ///
    /// Returns `None` if it is not pending, which makes repeated calls (a
    /// timer racing an early finalize) harmless.
    pub fn finalize(
        &self,
        device: DevAddr,
        sequence: FrameCounter,
        now: Instant,
    ) -> Option<Finalized> {
        let pending = self.dedup.finalize(device, sequence)?;
        let elapsed = now.saturating_duration_since(pending.first_seen);

        let finalized = {
            let mut registry = registry::write(&self.registry);
            let settings = registry.rx_window(device);
            let schedulable = self
                .arbiter
                .plan(settings.clone(), &pending.best_radio, elapsed)
                .is_ok();
            let queued = if schedulable {
                registry.take_queued_downlink(device)
            } else {
                None
            };

            let finalized = self.arbiter.decide(pending, settings, elapsed, queued);
            if let Some(state) = registry.device_mut(device) {
                apply_commands(state, &finalized);
            }
            finalized
        };

        self.record(&finalized);
        Some(finalized)
    }

    fn record(&self, finalized: &Finalized) {
        let delivery = &finalized.delivery;
        self.metrics.record_finalized(delivery.gateway_count);

        if let Some(err) = &finalized.uplink_commands.malformed {
            self.metrics.record_malformed_commands();
            log::warn!(
                "device {}: malformed command block in uplink {}: {}",
                delivery.device,
                delivery.sequence,
                err
            );
        }

        match &finalized.downlink {
            Ok(downlink) => {
                self.metrics.record_downlink(downlink.window);
                log::debug!(
                    "device {}: uplink {} finalized, {} via gateway {} ({} gateways)",
                    delivery.device,
                    delivery.sequence,
                    downlink.window.as_str(),
                    downlink.gateway,
                    delivery.gateway_count
                );
            }
            Err(skip) => {
                self.metrics.record_skip(skip);
                log::warn!(
                    "device {}: uplink {} delivered without downlink: {}",
                    delivery.device,
                    delivery.sequence,
                    skip
                );
            }
        }
    }

    /// Copy of a device's pending uplink
    pub fn pending(&self, device: DevAddr) -> Option<PendingUplink> {
        self.dedup.pending(device)
    }

    pub fn pending_count(&self) -> usize {
        self.dedup.pending_count()
    }

    /// `(device, sequence)` of every pending uplink
    pub fn pending_uplinks(&self) -> Vec<(DevAddr, FrameCounter)> {
        self.dedup.pending_uplinks()
    }

    /// Drop every pending uplink without delivery
    pub fn clear_pending(&self) -> usize {
        let dropped = self.dedup.clear();
        self.metrics.record_discarded(dropped as u64);
        dropped
    }

    pub fn arbiter_config(&self) -> &ArbiterConfig {
        self.arbiter.config()
    }

    pub fn shard_count(&self) -> usize {
        self.dedup.shard_count()
    }

    /// Snapshot of counters and current sizes
    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.metrics.snapshot();
        stats.devices = self.device_count();
        stats.pending = self.pending_count();
        stats
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the uplink's commands, and the answers that are actually sent,
/// against the device state
fn apply_commands(state: &mut dyn CommandContext, finalized: &Finalized) {
    for command in finalized.uplink_commands.iter() {
        command.execute(state);
    }
    if finalized.has_downlink() {
        for answer in &finalized.answers {
            answer.execute(state);
        }
    }
}
