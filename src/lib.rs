//! # Lorastar - multi-gateway uplink deduplication and acknowledgment
//!
//! The network-side coordination core of a star-of-stars wireless network:
//! many gateways hear the same uplink, the network delivers it upstream once
//! and answers it through exactly one gateway.
//!
//! ## Key Features
//!
//! - **Deduplication**: reports from every gateway fold into one pending uplink
//! - **Best-gateway selection**: strictly highest SNR wins, ties keep first-seen
//! - **Acknowledgment arbitration**: one downlink per uplink, in the first
//!   receive window still reachable
//! - **Control commands**: closed, fixed-layout command set with a framing codec
//!
//! ## Quick Start
//!
//! ```rust
//! use lorastar::{DevAddr, GatewayId, GatewayReport, Network, RxWindow};
//! use std::time::{Duration, Instant};
//!
//! let network = Network::new();
//! let device = DevAddr(0x2601_1f2e);
//! network.add_device(device);
//!
//! // Two gateways hear uplink 1
//! let now = Instant::now();
//! network.submit_report(GatewayReport::new(device, 1, GatewayId(1), 5.0, b"hi".to_vec()), now);
//! network.submit_report(GatewayReport::new(device, 1, GatewayId(2), 9.0, b"hi".to_vec()), now);
//!
//! // Dedup window closes
//! let finalized = network.finalize(device, 1, now + Duration::from_millis(300)).unwrap();
//! assert_eq!(finalized.delivery.gateway_count, 2);
//!
//! let downlink = finalized.downlink.unwrap();
//! assert_eq!(downlink.gateway, GatewayId(2));
//! assert_eq!(downlink.window, RxWindow::Rx1);
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Identities, reports, receive-window settings
//! - [`command`]: Control command codec
//! - [`registry`]: Per-device control state
//! - [`dedup`]: Per-device watermarks and pending uplinks
//! - [`arbiter`]: Receive-window choice and downlink construction
//! - [`network`]: Engine tying the above together
//! - [`metrics`]: Network statistics

// Modules
pub mod arbiter;
pub mod command;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod registry;

// Re-exports for convenient access
pub use arbiter::{Arbiter, ArbiterConfig, Finalized, WindowPlan};
pub use command::{
    decode_commands, encode_commands, Command, CommandBatch, CommandContext, LinkCheckAns,
    LinkCheckReq, MacCommand, MAX_FOPTS_LEN,
};
pub use dedup::{Deduplicator, PendingUplink, ReportOutcome, UplinkTrack, WindowEvent};
pub use error::{DecodeError, DownlinkSkip, LorastarError, RegistryError, Result};
pub use metrics::{NetworkMetrics, NetworkStats};
pub use network::Network;
pub use protocol::{
    DevAddr, DownlinkInstruction, FrameCounter, GatewayId, GatewayReport, LinkQuality,
    RadioParameters, RxWindow, RxWindowSettings, UplinkDelivery, UplinkRadio,
};
pub use registry::{DeviceRegistry, DeviceState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
