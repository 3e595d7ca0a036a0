// Lorastar Controller - Async deduplication and acknowledgment control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Observer and transmission seams
//!
//! Upper layers register [`UplinkListener`]s to receive one notification per
//! de-duplicated uplink. [`ReportListener`]s see every raw gateway report
//! with its outcome, duplicates included. A single [`DownlinkSink`] carries
//! downlink instructions to the gateways.
//!
//! Plain closures implement all three traits.

use lorastar::{DownlinkInstruction, GatewayReport, ReportOutcome, UplinkDelivery};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::DispatchError;

/// Receives de-duplicated uplinks, at most once per (device, sequence)
pub trait UplinkListener: Send + Sync {
    fn on_uplink(&self, delivery: &UplinkDelivery);
}

impl<F> UplinkListener for F
where
    F: Fn(&UplinkDelivery) + Send + Sync,
{
    fn on_uplink(&self, delivery: &UplinkDelivery) {
        self(delivery)
    }
}

/// Receives every gateway report, whatever its outcome
pub trait ReportListener: Send + Sync {
    fn on_report(&self, report: &GatewayReport, outcome: &ReportOutcome);
}

impl<F> ReportListener for F
where
    F: Fn(&GatewayReport, &ReportOutcome) + Send + Sync,
{
    fn on_report(&self, report: &GatewayReport, outcome: &ReportOutcome) {
        self(report, outcome)
    }
}

/// Transmission path for downlink instructions
///
/// Dispatch must not block: the controller calls it from its timer tasks.
pub trait DownlinkSink: Send + Sync {
    fn dispatch(&self, instruction: DownlinkInstruction) -> Result<(), DispatchError>;
}

impl<F> DownlinkSink for F
where
    F: Fn(DownlinkInstruction) -> Result<(), DispatchError> + Send + Sync,
{
    fn dispatch(&self, instruction: DownlinkInstruction) -> Result<(), DispatchError> {
        self(instruction)
    }
}

/// Sink forwarding downlinks into a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DownlinkInstruction>,
}

impl ChannelSink {
    /// Create a sink and the receiver a transmitter task drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DownlinkInstruction>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl DownlinkSink for ChannelSink {
    fn dispatch(&self, instruction: DownlinkInstruction) -> Result<(), DispatchError> {
        self.tx.try_send(instruction).map_err(|err| match err {
            TrySendError::Full(_) => DispatchError::Full,
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}
