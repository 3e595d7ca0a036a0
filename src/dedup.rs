//! Uplink deduplication
//!
//! Every gateway that hears an uplink reports it independently. The
//! [`Deduplicator`] folds those reports into one [`PendingUplink`] per device
//! until the uplink is finalized, tracking how many gateways heard it and
//! which one heard it best.
//!
//! Each tracked device owns one [`UplinkTrack`] entry in a [`DashMap`]. The
//! entry holds the device's sequence watermark next to its pending uplink,
//! and every transition (open, fold, supersede, finalize) runs under that
//! entry's guard. Reports for different devices only meet on a shard lock,
//! and no global lock is taken on the uplink path.

use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::RegistryError;
use crate::protocol::{DevAddr, FrameCounter, GatewayId, GatewayReport, UplinkRadio};

/// Default number of map shards
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// An uplink heard by one or more gateways, not finalized yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUplink {
    /// Transmitting device
    pub device: DevAddr,
    /// Frame counter of the uplink
    pub sequence: FrameCounter,
    /// Gateway with the strictly highest signal so far
    pub best_gateway: GatewayId,
    /// Signal at the best gateway, in dB
    pub best_signal: f64,
    /// Radio parameters at the best gateway
    pub best_radio: UplinkRadio,
    /// Number of reports folded in (at least 1)
    pub gateway_count: u32,
    /// Piggybacked control command block
    pub fopts: Vec<u8>,
    /// Application payload
    pub payload: Vec<u8>,
    /// Arrival of the first report
    pub first_seen: Instant,
}

impl PendingUplink {
    /// Open a record from the first report of an uplink
    pub fn open(report: GatewayReport, now: Instant) -> Self {
        Self {
            device: report.device,
            sequence: report.sequence,
            best_gateway: report.gateway,
            best_signal: report.signal,
            best_radio: report.radio,
            gateway_count: 1,
            fopts: report.fopts,
            payload: report.payload,
            first_seen: now,
        }
    }

    /// Fold another gateway's report in
    ///
    /// Returns `true` if the report became the new best. Ties keep the
    /// first-seen gateway.
    pub fn fold(&mut self, report: &GatewayReport) -> bool {
        self.gateway_count = self.gateway_count.saturating_add(1);
        if report.signal > self.best_signal {
            self.best_gateway = report.gateway;
            self.best_signal = report.signal;
            self.best_radio = report.radio;
            return true;
        }
        false
    }
}

/// What an accepted report did to the pending table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowEvent {
    /// First report of a new uplink
    Opened,
    /// First report of a new uplink; the older pending one was dropped
    Superseded(FrameCounter),
    /// Additional report of the pending uplink
    Folded,
}

/// Result of submitting a gateway report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportOutcome {
    /// Report folded into a pending uplink
    Accepted {
        window: WindowEvent,
        gateway_count: u32,
    },
    /// Uplink already finalized, superseded, or older than the pending one
    DuplicateSequence { watermark: FrameCounter },
    /// Device is not under network control
    UnknownDevice,
}

impl ReportOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReportOutcome::Accepted { .. })
    }

    /// Whether this report started a new deduplication window
    pub fn opened_window(&self) -> bool {
        matches!(
            self,
            ReportOutcome::Accepted {
                window: WindowEvent::Opened | WindowEvent::Superseded(_),
                ..
            }
        )
    }

    /// Short label for counters and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Accepted { .. } => "accepted",
            ReportOutcome::DuplicateSequence { .. } => "duplicate",
            ReportOutcome::UnknownDevice => "unknown_device",
        }
    }
}

/// Sequence state of one tracked device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UplinkTrack {
    /// Highest finalized frame counter
    pub last_sequence: Option<FrameCounter>,
    /// Number of finalized uplinks
    pub uplink_count: u64,
    /// Uplink inside its deduplication window, if any
    pub pending: Option<PendingUplink>,
}

impl UplinkTrack {
    /// Advance the watermark; it never moves backwards
    fn advance(&mut self, sequence: FrameCounter) {
        self.last_sequence = Some(match self.last_sequence {
            Some(last) => last.max(sequence),
            None => sequence,
        });
        self.uplink_count += 1;
    }
}

/// Per-device table of sequence watermarks and pending uplinks
#[derive(Debug)]
pub struct Deduplicator {
    devices: DashMap<DevAddr, UplinkTrack>,
    shard_count: usize,
}

impl Deduplicator {
    /// Create a deduplicator with the default shard count
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT)
    }

    /// Create a deduplicator with `count` shards, rounded up to a power of
    /// two no smaller than 2
    pub fn with_shards(count: usize) -> Self {
        let count = count.max(2).next_power_of_two();
        Self {
            devices: DashMap::with_shard_amount(count),
            shard_count: count,
        }
    }

    /// Number of map shards
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Start tracking a device; returns `false` if it was already tracked
    pub fn track(&self, device: DevAddr) -> bool {
        match self.devices.entry(device) {
            Entry::Vacant(slot) => {
                slot.insert(UplinkTrack::default());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Stop tracking a device, returning its state with any pending uplink
    ///
    /// The entry is removed under its shard lock, so a report racing with
    /// the removal either lands before it (and is returned here) or sees
    /// an unknown device.
    pub fn untrack(&self, device: DevAddr) -> Option<UplinkTrack> {
        self.devices.remove(&device).map(|(_, track)| track)
    }

    pub fn is_tracked(&self, device: DevAddr) -> bool {
        self.devices.contains_key(&device)
    }

    pub fn tracked_count(&self) -> usize {
        self.devices.len()
    }

    /// Fold a gateway report into the device's pending uplink
    ///
    /// Membership, the watermark and the pending record are read and
    /// updated under one entry guard, so a report racing with
    /// [`Deduplicator::finalize`] either lands in the record being
    /// finalized or sees the advanced watermark.
    pub fn submit(&self, report: GatewayReport, now: Instant) -> ReportOutcome {
        let Some(mut guard) = self.devices.get_mut(&report.device) else {
            return ReportOutcome::UnknownDevice;
        };
        let track = &mut *guard;

        if let Some(last) = track.last_sequence {
            if report.sequence <= last {
                return ReportOutcome::DuplicateSequence { watermark: last };
            }
        }

        let window = match track.pending.as_mut() {
            Some(pending) if report.sequence == pending.sequence => {
                pending.fold(&report);
                return ReportOutcome::Accepted {
                    window: WindowEvent::Folded,
                    gateway_count: pending.gateway_count,
                };
            }
            Some(pending) if report.sequence < pending.sequence => {
                return ReportOutcome::DuplicateSequence {
                    watermark: pending.sequence,
                };
            }
            Some(pending) => WindowEvent::Superseded(pending.sequence),
            None => WindowEvent::Opened,
        };

        track.pending = Some(PendingUplink::open(report, now));
        ReportOutcome::Accepted {
            window,
            gateway_count: 1,
        }
    }

    /// Remove the pending uplink `(device, sequence)` and advance the
    /// device's sequence watermark
    ///
    /// Returns `None` if no such uplink is pending (already finalized,
    /// superseded or discarded); calling it twice is harmless.
    pub fn finalize(&self, device: DevAddr, sequence: FrameCounter) -> Option<PendingUplink> {
        let mut guard = self.devices.get_mut(&device)?;
        let track = &mut *guard;
        match &track.pending {
            Some(pending) if pending.sequence == sequence => {}
            _ => return None,
        }

        let pending = track.pending.take()?;
        track.advance(sequence);
        Some(pending)
    }

    /// Record a finalized frame counter without a pending uplink
    ///
    /// The watermark only moves forward. A pending uplink at or below the
    /// new watermark is dropped and returned.
    pub fn record_sequence(
        &self,
        device: DevAddr,
        sequence: FrameCounter,
    ) -> Result<Option<PendingUplink>, RegistryError> {
        let mut guard = self
            .devices
            .get_mut(&device)
            .ok_or(RegistryError::UnknownDevice(device))?;
        let track = &mut *guard;
        track.advance(sequence);

        let stale = matches!(&track.pending, Some(p) if p.sequence <= sequence);
        Ok(if stale { track.pending.take() } else { None })
    }

    /// Highest finalized frame counter of a tracked device
    pub fn last_sequence(&self, device: DevAddr) -> Result<Option<FrameCounter>, RegistryError> {
        self.devices
            .get(&device)
            .map(|track| track.last_sequence)
            .ok_or(RegistryError::UnknownDevice(device))
    }

    /// Number of uplinks finalized for a tracked device
    pub fn uplink_count(&self, device: DevAddr) -> Result<u64, RegistryError> {
        self.devices
            .get(&device)
            .map(|track| track.uplink_count)
            .ok_or(RegistryError::UnknownDevice(device))
    }

    /// Drop a device's pending uplink without finalizing it
    pub fn discard(&self, device: DevAddr) -> Option<PendingUplink> {
        self.devices.get_mut(&device)?.pending.take()
    }

    /// Copy of a device's pending uplink
    pub fn pending(&self, device: DevAddr) -> Option<PendingUplink> {
        self.devices.get(&device)?.pending.clone()
    }

    /// `(device, sequence)` of every pending uplink
    pub fn pending_uplinks(&self) -> Vec<(DevAddr, FrameCounter)> {
        self.devices
            .iter()
            .filter_map(|entry| entry.pending.as_ref().map(|p| (*entry.key(), p.sequence)))
            .collect()
    }

    /// Number of pending uplinks across all devices
    pub fn pending_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|entry| entry.pending.is_some())
            .count()
    }

    /// Drop every pending uplink, returning how many were dropped
    pub fn clear(&self) -> usize {
        self.devices
            .iter_mut()
            .filter_map(|mut entry| entry.pending.take())
            .count()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const DEV: DevAddr = DevAddr(0x2601_0002);

    fn tracking(devices: &[DevAddr]) -> Deduplicator {
        let dedup = Deduplicator::new();
        for d in devices {
            dedup.track(*d);
        }
        dedup
    }

    fn report(sequence: FrameCounter, gateway: u64, signal: f64) -> GatewayReport {
        GatewayReport::new(DEV, sequence, GatewayId(gateway), signal, vec![0xAA])
    }

    #[test]
    fn test_shard_count_rounded() {
        assert_eq!(Deduplicator::with_shards(0).shard_count(), 2);
        assert_eq!(Deduplicator::with_shards(1).shard_count(), 2);
        assert_eq!(Deduplicator::with_shards(5).shard_count(), 8);
        assert_eq!(Deduplicator::new().shard_count(), DEFAULT_SHARD_COUNT);
    }

    #[test]
    fn test_track_is_idempotent() {
        let dedup = Deduplicator::new();
        assert!(dedup.track(DEV));
        assert!(!dedup.track(DEV));
        assert!(dedup.is_tracked(DEV));
        assert_eq!(dedup.tracked_count(), 1);
        assert_eq!(dedup.last_sequence(DEV).unwrap(), None);
    }

    #[test]
    fn test_unknown_device() {
        let dedup = tracking(&[]);
        let outcome = dedup.submit(report(1, 1, 5.0), Instant::now());
        assert_eq!(outcome, ReportOutcome::UnknownDevice);
        assert!(dedup.pending(DEV).is_none());
        assert_eq!(dedup.tracked_count(), 0);
        assert!(matches!(
            dedup.last_sequence(DEV),
            Err(RegistryError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_best_gateway_selection() {
        let dedup = tracking(&[DEV]);
        let now = Instant::now();

        let first = dedup.submit(report(1, 10, 5.0), now);
        assert!(first.opened_window());
        let second = dedup.submit(report(1, 20, 9.0), now);
        assert_eq!(
            second,
            ReportOutcome::Accepted {
                window: WindowEvent::Folded,
                gateway_count: 2
            }
        );

        let pending = dedup.pending(DEV).unwrap();
        assert_eq!(pending.best_gateway, GatewayId(20));
        assert_eq!(pending.gateway_count, 2);
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let dedup = tracking(&[DEV]);
        let now = Instant::now();

        dedup.submit(report(1, 10, 7.0), now);
        dedup.submit(report(1, 20, 7.0), now);
        dedup.submit(report(1, 30, 3.0), now);

        let pending = dedup.pending(DEV).unwrap();
        assert_eq!(pending.best_gateway, GatewayId(10));
        assert_eq!(pending.gateway_count, 3);
    }

    #[test]
    fn test_duplicate_after_finalize() {
        let dedup = tracking(&[DEV]);
        let now = Instant::now();

        dedup.submit(report(4, 10, 1.0), now);
        let finalized = dedup.finalize(DEV, 4).unwrap();
        assert_eq!(finalized.sequence, 4);
        assert_eq!(dedup.last_sequence(DEV).unwrap(), Some(4));

        for seq in [3, 4] {
            let outcome = dedup.submit(report(seq, 20, 9.0), now);
            assert_eq!(outcome, ReportOutcome::DuplicateSequence { watermark: 4 });
        }
        assert!(dedup.pending(DEV).is_none());
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dedup = tracking(&[DEV]);

        dedup.submit(report(1, 10, 1.0), Instant::now());
        assert!(dedup.finalize(DEV, 1).is_some());
        assert!(dedup.finalize(DEV, 1).is_none());
        assert_eq!(dedup.uplink_count(DEV).unwrap(), 1);
    }

    #[test]
    fn test_finalize_wrong_sequence_is_noop() {
        let dedup = tracking(&[DEV]);

        dedup.submit(report(2, 10, 1.0), Instant::now());
        assert!(dedup.finalize(DEV, 1).is_none());
        assert!(dedup.pending(DEV).is_some());
        assert_eq!(dedup.last_sequence(DEV).unwrap(), None);
    }

    #[test]
    fn test_record_sequence_is_monotonic() {
        let dedup = tracking(&[DEV]);

        assert_eq!(dedup.record_sequence(DEV, 5).unwrap(), None);
        assert_eq!(dedup.record_sequence(DEV, 3).unwrap(), None);
        assert_eq!(dedup.last_sequence(DEV).unwrap(), Some(5));
        assert!(dedup.record_sequence(DevAddr(9), 1).is_err());
    }

    #[test]
    fn test_record_sequence_drops_stale_pending() {
        let dedup = tracking(&[DEV]);
        let now = Instant::now();

        dedup.submit(report(7, 10, 1.0), now);
        assert!(dedup.record_sequence(DEV, 6).unwrap().is_none());
        assert_eq!(dedup.record_sequence(DEV, 7).unwrap().unwrap().sequence, 7);
        assert!(dedup.pending(DEV).is_none());
        assert!(dedup.finalize(DEV, 7).is_none());
    }

    #[test]
    fn test_newer_sequence_supersedes() {
        let dedup = tracking(&[DEV]);
        let now = Instant::now();

        dedup.submit(report(1, 10, 1.0), now);
        dedup.submit(report(1, 20, 2.0), now);
        let outcome = dedup.submit(report(2, 30, 0.5), now);
        assert_eq!(
            outcome,
            ReportOutcome::Accepted {
                window: WindowEvent::Superseded(1),
                gateway_count: 1
            }
        );

        let pending = dedup.pending(DEV).unwrap();
        assert_eq!(pending.sequence, 2);
        assert_eq!(pending.gateway_count, 1);
        assert_eq!(pending.best_gateway, GatewayId(30));

        // Late report of the superseded uplink is stale
        let late = dedup.submit(report(1, 40, 12.0), now);
        assert_eq!(late, ReportOutcome::DuplicateSequence { watermark: 2 });
        assert_eq!(dedup.pending(DEV).unwrap().gateway_count, 1);
    }

    #[test]
    fn test_discard_and_clear() {
        let other = DevAddr(0x2601_0003);
        let dedup = tracking(&[DEV, other]);
        let now = Instant::now();

        dedup.submit(report(1, 10, 1.0), now);
        dedup.submit(GatewayReport::new(other, 1, GatewayId(10), 1.0, vec![]), now);
        assert_eq!(dedup.pending_count(), 2);
        let mut uplinks = dedup.pending_uplinks();
        uplinks.sort();
        assert_eq!(uplinks, vec![(DEV, 1), (other, 1)]);

        assert!(dedup.discard(DEV).is_some());
        assert!(dedup.discard(DEV).is_none());
        assert_eq!(dedup.clear(), 1);
        assert_eq!(dedup.pending_count(), 0);
        assert_eq!(dedup.tracked_count(), 2);
    }

    #[test]
    fn test_untrack_drops_pending_and_membership() {
        let dedup = tracking(&[DEV]);
        let now = Instant::now();

        dedup.submit(report(1, 10, 1.0), now);
        let track = dedup.untrack(DEV).unwrap();
        assert_eq!(track.pending.unwrap().sequence, 1);

        assert_eq!(
            dedup.submit(report(2, 10, 1.0), now),
            ReportOutcome::UnknownDevice
        );
        assert!(dedup.finalize(DEV, 1).is_none());
        assert!(dedup.untrack(DEV).is_none());
    }

    #[test]
    fn test_concurrent_reports_same_uplink() {
        let dedup = Arc::new(tracking(&[DEV]));
        let now = Instant::now();

        let handles: Vec<_> = (0..8u64)
            .map(|gw| {
                let dedup = Arc::clone(&dedup);
                thread::spawn(move || {
                    dedup.submit(report(1, gw, gw as f64), now);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pending = dedup.pending(DEV).unwrap();
        assert_eq!(pending.gateway_count, 8);
        assert_eq!(pending.best_gateway, GatewayId(7));
        assert_eq!(pending.best_signal, 7.0);
    }

    #[test]
    fn test_concurrent_finalize_and_reports_lose_nothing() {
        let devices: Vec<DevAddr> = (0..64).map(|i| DevAddr(0x2602_0000 + i)).collect();
        let dedup = Arc::new(tracking(&devices));
        let now = Instant::now();

        // Each device sends 20 uplinks heard by three gateways while a
        // finalizer thread closes whatever is pending.
        let reporters: Vec<_> = devices
            .iter()
            .map(|&device| {
                let dedup = Arc::clone(&dedup);
                thread::spawn(move || {
                    for seq in 1..=20 {
                        for gw in 0..3u64 {
                            let signal = gw as f64;
                            let r = GatewayReport::new(device, seq, GatewayId(gw), signal, vec![]);
                            dedup.submit(r, now);
                        }
                    }
                })
            })
            .collect();
        let finalizer = {
            let dedup = Arc::clone(&dedup);
            thread::spawn(move || {
                let mut finalized = 0u64;
                for _ in 0..200 {
                    for (device, seq) in dedup.pending_uplinks() {
                        if dedup.finalize(device, seq).is_some() {
                            finalized += 1;
                        }
                    }
                }
                finalized
            })
        };
        for handle in reporters {
            handle.join().unwrap();
        }
        let mut finalized = finalizer.join().unwrap();
        for (device, seq) in dedup.pending_uplinks() {
            assert!(dedup.finalize(device, seq).is_some());
            finalized += 1;
        }

        let counted: u64 = devices.iter().map(|d| dedup.uplink_count(*d).unwrap()).sum();
        assert_eq!(counted, finalized);
        assert_eq!(dedup.pending_count(), 0);
        for device in &devices {
            assert_eq!(dedup.last_sequence(*device).unwrap(), Some(20));
        }
    }
}
