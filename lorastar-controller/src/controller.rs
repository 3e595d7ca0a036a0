// Lorastar Controller - Async deduplication and acknowledgment control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! High-level controller API
//!
//! [`NetworkController`] drives a [`Network`] in time: every new uplink
//! arms a deduplication-window timer, and when the window closes (or enough
//! gateways reported it) the uplink is finalized, listeners are notified
//! and the downlink is handed to the sink.
//!
//! # Example
//!
//! ```rust
//! use lorastar::{DevAddr, GatewayId, GatewayReport};
//! use lorastar_controller::{ChannelSink, ControllerConfig, NetworkController};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = NetworkController::new(ControllerConfig::with_early_finalize(1))?;
//! let (sink, mut downlinks) = ChannelSink::new(64);
//! controller.set_downlink_sink(sink);
//!
//! let device = DevAddr(0x2601_0001);
//! controller.add_device(device);
//! controller.submit(GatewayReport::new(device, 1, GatewayId(7), 4.5, vec![0x01]))?;
//!
//! let downlink = downlinks.recv().await.unwrap();
//! assert_eq!(downlink.gateway, GatewayId(7));
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use lorastar::{
    DevAddr, Finalized, FrameCounter, GatewayReport, Network, NetworkStats, PendingUplink,
    ReportOutcome, WindowEvent,
};
use tokio::time::Instant;

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::listener::{DownlinkSink, ReportListener, UplinkListener};
use crate::timer::WindowTimers;

struct Inner {
    network: Network,
    config: ControllerConfig,
    timers: WindowTimers,
    uplink_listeners: RwLock<Vec<Arc<dyn UplinkListener>>>,
    report_listeners: RwLock<Vec<Arc<dyn ReportListener>>>,
    sink: RwLock<Option<Arc<dyn DownlinkSink>>>,
    dispatch_failures: AtomicU64,
    shut_down: AtomicBool,
}

/// Timer-driven deduplication and acknowledgment controller
///
/// Cloning is cheap; clones share the same network.
#[derive(Clone)]
pub struct NetworkController {
    inner: Arc<Inner>,
}

impl NetworkController {
    /// Create a controller; the configuration is validated first
    pub fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let network = Network::with_config(config.shard_count, config.arbiter_config());
        Ok(Self {
            inner: Arc::new(Inner {
                network,
                config,
                timers: WindowTimers::new(),
                uplink_listeners: RwLock::new(Vec::new()),
                report_listeners: RwLock::new(Vec::new()),
                sink: RwLock::new(None),
                dispatch_failures: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Underlying engine, for administration and queries
    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a listener for de-duplicated uplinks
    pub fn on_uplink(&self, listener: impl UplinkListener + 'static) {
        self.inner
            .uplink_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Register a listener for every gateway report
    pub fn on_report(&self, listener: impl ReportListener + 'static) {
        self.inner
            .report_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Set the transmission path for downlinks, replacing any previous one
    pub fn set_downlink_sink(&self, sink: impl DownlinkSink + 'static) {
        let sink: Arc<dyn DownlinkSink> = Arc::new(sink);
        *self.inner.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub fn add_device(&self, device: DevAddr) -> bool {
        self.inner.network.add_device(device)
    }

    /// Remove a device, silently dropping its pending uplink and timer
    pub fn remove_device(&self, device: DevAddr) -> Option<PendingUplink> {
        let pending = self.inner.network.remove_device(device);
        self.inner.timers.cancel(device);
        pending
    }

    // ------------------------------------------------------------------
    // Uplink path
    // ------------------------------------------------------------------

    /// Submit one gateway's report
    ///
    /// Must be called from within a tokio runtime: a new uplink spawns its
    /// window timer.
    pub fn submit(&self, report: GatewayReport) -> Result<ReportOutcome> {
        if self.is_shut_down() {
            return Err(ControllerError::ShutDown);
        }

        let listeners = self.report_listeners();
        let observed = (!listeners.is_empty()).then(|| report.clone());

        let device = report.device;
        let sequence = report.sequence;
        let outcome = self
            .inner
            .network
            .submit_report(report, Instant::now().into_std());

        if let ReportOutcome::Accepted {
            window,
            gateway_count,
        } = outcome
        {
            if let WindowEvent::Superseded(old) = window {
                tracing::debug!(%device, old, sequence, "pending uplink superseded");
            }
            if matches!(window, WindowEvent::Opened | WindowEvent::Superseded(_)) {
                self.arm(device, sequence);
            }
            if let Some(threshold) = self.inner.config.early_finalize_at {
                if gateway_count >= threshold {
                    self.finalize(device, sequence);
                }
            }
        }

        if let Some(report) = observed {
            for listener in &listeners {
                listener.on_report(&report, &outcome);
            }
        }

        Ok(outcome)
    }

    /// Finalize `(device, sequence)` now instead of waiting for its timer
    ///
    /// Returns `None` if the uplink is not pending; a second call for the
    /// same uplink is a no-op.
    pub fn finalize(&self, device: DevAddr, sequence: FrameCounter) -> Option<Finalized> {
        self.inner.timers.cancel_sequence(device, sequence);
        self.inner.finalize(device, sequence)
    }

    fn arm(&self, device: DevAddr, sequence: FrameCounter) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let window = self.inner.config.dedup_window;

        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.timers.complete(device, sequence);
            inner.finalize(device, sequence);
        });
        if !self.inner.timers.arm(device, sequence, task.abort_handle()) {
            tracing::trace!(%device, sequence, "newer uplink already armed, timer dropped");
        }
    }

    /// Finalize every pending uplink immediately
    ///
    /// Covers every uplink the engine holds, armed or not. Returns the
    /// number of uplinks delivered.
    pub fn flush(&self) -> usize {
        self.inner.timers.cancel_all();
        self.inner
            .network
            .pending_uplinks()
            .into_iter()
            .filter_map(|(device, sequence)| self.inner.finalize(device, sequence))
            .count()
    }

    /// Stop accepting reports and drop all pending uplinks without delivery
    pub fn shutdown(&self) -> usize {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let cancelled = self.inner.timers.cancel_all().len();
        let dropped = self.inner.network.clear_pending();
        tracing::info!(cancelled, dropped, "controller shut down");
        dropped
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> NetworkStats {
        self.inner.network.stats()
    }

    /// Downlinks the sink refused
    pub fn dispatch_failures(&self) -> u64 {
        self.inner.dispatch_failures.load(Ordering::Relaxed)
    }

    pub fn armed_timers(&self) -> usize {
        self.inner.timers.len()
    }

    fn report_listeners(&self) -> Vec<Arc<dyn ReportListener>> {
        self.inner
            .report_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Inner {
    /// Finalize in the engine, then notify and dispatch
    fn finalize(&self, device: DevAddr, sequence: FrameCounter) -> Option<Finalized> {
        let finalized = self
            .network
            .finalize(device, sequence, Instant::now().into_std())?;

        let listeners = self
            .uplink_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.on_uplink(&finalized.delivery);
        }

        if let Ok(instruction) = &finalized.downlink {
            let sink = self
                .sink
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match sink {
                Some(sink) => {
                    if let Err(err) = sink.dispatch(instruction.clone()) {
                        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            %device,
                            sequence,
                            gateway = %instruction.gateway,
                            error = %err,
                            "downlink dispatch failed"
                        );
                    }
                }
                None => {
                    tracing::debug!(%device, sequence, "no downlink sink, instruction dropped");
                }
            }
        }

        Some(finalized)
    }
}

impl std::fmt::Debug for NetworkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkController")
            .field("config", &self.inner.config)
            .field("armed_timers", &self.inner.timers.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorastar::GatewayId;
    use std::time::Duration;

    const DEV: DevAddr = DevAddr(0x2601_0100);

    fn report(sequence: FrameCounter, gateway: u64) -> GatewayReport {
        GatewayReport::new(DEV, sequence, GatewayId(gateway), 1.0, vec![])
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = NetworkController::new(ControllerConfig::with_dedup_window(Duration::ZERO));
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_armed_per_device() {
        let controller = NetworkController::new(ControllerConfig::default()).unwrap();
        controller.add_device(DEV);

        controller.submit(report(1, 1)).unwrap();
        controller.submit(report(1, 2)).unwrap();
        assert_eq!(controller.armed_timers(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(controller.armed_timers(), 0);
        assert_eq!(controller.stats().finalized, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_reports() {
        let controller = NetworkController::new(ControllerConfig::default()).unwrap();
        controller.add_device(DEV);
        controller.submit(report(1, 1)).unwrap();

        assert_eq!(controller.shutdown(), 1);
        assert_eq!(controller.shutdown(), 0);
        assert!(matches!(
            controller.submit(report(2, 1)),
            Err(ControllerError::ShutDown)
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.stats().finalized, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_finalizes_pending() {
        let controller = NetworkController::new(ControllerConfig::default()).unwrap();
        controller.add_device(DEV);
        controller.add_device(DevAddr(1));
        controller.submit(report(1, 1)).unwrap();
        controller
            .submit(GatewayReport::new(DevAddr(1), 4, GatewayId(1), 0.0, vec![]))
            .unwrap();

        assert_eq!(controller.flush(), 2);
        assert_eq!(controller.armed_timers(), 0);
        assert_eq!(controller.network().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_covers_uplinks_without_timer() {
        let controller = NetworkController::new(ControllerConfig::default()).unwrap();
        controller.add_device(DEV);

        // Opened behind the controller's back, so no timer guards it
        controller
            .network()
            .submit_report(report(3, 1), Instant::now().into_std());
        assert_eq!(controller.armed_timers(), 0);

        assert_eq!(controller.flush(), 1);
        assert_eq!(controller.network().pending_count(), 0);
        assert_eq!(controller.network().last_sequence(DEV).unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_arming_finalizes_newest() {
        let controller = NetworkController::new(ControllerConfig::default()).unwrap();
        controller.add_device(DEV);

        // Sequence 2 supersedes 1 in the engine, but the timer of 1 is
        // armed last, as when two threads race on one device.
        let now = Instant::now().into_std();
        controller.network().submit_report(report(1, 1), now);
        controller.network().submit_report(report(2, 2), now);
        controller.arm(DEV, 2);
        controller.arm(DEV, 1);
        assert_eq!(controller.inner.timers.armed_sequence(DEV), Some(2));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(controller.network().pending_count(), 0);
        assert_eq!(controller.stats().finalized, 1);
        assert_eq!(controller.network().last_sequence(DEV).unwrap(), Some(2));
    }
}
