// Lorastar Server - UDP gateway ingestion
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! UDP transport between gateways and the controller.
//!
//! ## Uplink report datagram
//!
//! ```text
//! [version=1][dev_addr u32][fcnt u32][gateway u64][snr i16, centi-dB]
//! [frequency u32][data_rate u8][fopts_len u8][fopts][payload][xxh32 u32]
//! ```
//!
//! ## Downlink datagram
//!
//! ```text
//! [version=1][kind=0x80][dev_addr u32][fcnt u32][window u8][delay_ms u32]
//! [frequency u32][data_rate u8][fopts_len u8][fopts][payload][xxh32 u32]
//! ```
//!
//! All integers are big-endian. The checksum covers every preceding byte.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use lorastar::{
    DevAddr, DownlinkInstruction, GatewayId, GatewayReport, UplinkRadio, MAX_FOPTS_LEN,
};
use lorastar_controller::{ControllerError, DispatchError, DownlinkSink, NetworkController};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xxhash_rust::xxh32::xxh32;

use crate::metrics::{record_datagram, update_gateway_count};

/// Datagram format version
pub const PROTOCOL_VERSION: u8 = 1;

/// Kind byte of downlink datagrams
pub const DOWNLINK_KIND: u8 = 0x80;

/// Fixed header of a report datagram
const REPORT_HEADER_LEN: usize = 1 + 4 + 4 + 8 + 2 + 4 + 1 + 1;

const CHECKSUM_LEN: usize = 4;

/// Smallest well-formed report datagram
pub const MIN_REPORT_LEN: usize = REPORT_HEADER_LEN + CHECKSUM_LEN;

/// Receive buffer size
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Errors while decoding datagrams or moving them over the socket
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Datagram too short: {len} bytes, minimum {min}")]
    TooShort { len: usize, min: usize },

    #[error("Unsupported datagram version: {0}")]
    UnsupportedVersion(u8),

    #[error("Checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("Command block too long: {len} bytes exceeds maximum {max}")]
    FoptsTooLong { len: usize, max: usize },

    #[error("Datagram truncated: command block needs {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================
// Wire format
// ============================================================

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Verify the trailing checksum and return the covered body
fn checked_body(datagram: &[u8]) -> Result<&[u8], IngestError> {
    let (body, trailer) = datagram.split_at(datagram.len() - CHECKSUM_LEN);
    let expected = be_u32(trailer, 0);
    let actual = xxh32(body, 0);
    if expected != actual {
        return Err(IngestError::Checksum { expected, actual });
    }
    Ok(body)
}

/// Decode a gateway report datagram
pub fn decode_report(datagram: &[u8]) -> Result<GatewayReport, IngestError> {
    if datagram.len() < MIN_REPORT_LEN {
        return Err(IngestError::TooShort {
            len: datagram.len(),
            min: MIN_REPORT_LEN,
        });
    }
    let body = checked_body(datagram)?;
    if body[0] != PROTOCOL_VERSION {
        return Err(IngestError::UnsupportedVersion(body[0]));
    }

    let device = DevAddr(be_u32(body, 1));
    let sequence = be_u32(body, 5);
    let gateway = GatewayId(u64::from_be_bytes([
        body[9], body[10], body[11], body[12], body[13], body[14], body[15], body[16],
    ]));
    let snr = f64::from(i16::from_be_bytes([body[17], body[18]])) / 100.0;
    let frequency = be_u32(body, 19);
    let data_rate = body[23];
    let fopts_len = usize::from(body[24]);

    if fopts_len > MAX_FOPTS_LEN {
        return Err(IngestError::FoptsTooLong {
            len: fopts_len,
            max: MAX_FOPTS_LEN,
        });
    }
    let rest = &body[REPORT_HEADER_LEN..];
    if rest.len() < fopts_len {
        return Err(IngestError::Truncated {
            needed: fopts_len,
            available: rest.len(),
        });
    }
    let (fopts, payload) = rest.split_at(fopts_len);

    Ok(
        GatewayReport::new(device, sequence, gateway, snr, payload.to_vec())
            .with_radio(UplinkRadio {
                frequency,
                data_rate,
            })
            .with_fopts(fopts.to_vec()),
    )
}

/// Encode a downlink instruction for its gateway
pub fn encode_downlink(instruction: &DownlinkInstruction) -> Vec<u8> {
    let fopts = &instruction.fopts[..instruction.fopts.len().min(MAX_FOPTS_LEN)];
    let delay_ms = u32::try_from(instruction.delay.as_millis()).unwrap_or(u32::MAX);

    let mut out = Vec::with_capacity(
        2 + 4 + 4 + 1 + 4 + 4 + 1 + 1 + fopts.len() + instruction.payload.len() + CHECKSUM_LEN,
    );
    out.push(PROTOCOL_VERSION);
    out.push(DOWNLINK_KIND);
    out.extend_from_slice(&instruction.device.to_be_bytes());
    out.extend_from_slice(&instruction.sequence.to_be_bytes());
    out.push(instruction.window as u8);
    out.extend_from_slice(&delay_ms.to_be_bytes());
    out.extend_from_slice(&instruction.radio.frequency.to_be_bytes());
    out.push(instruction.radio.data_rate);
    out.push(fopts.len() as u8);
    out.extend_from_slice(fopts);
    out.extend_from_slice(&instruction.payload);

    let checksum = xxh32(&out, 0);
    out.extend_from_slice(&checksum.to_be_bytes());
    out
}

// ============================================================
// Gateway routes
// ============================================================

/// Last source address seen for each gateway
#[derive(Debug, Default)]
pub struct GatewayRoutes {
    routes: RwLock<HashMap<GatewayId, SocketAddr>>,
}

impl GatewayRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where `gateway` sends from; returns true if the address changed
    pub fn learn(&self, gateway: GatewayId, addr: SocketAddr) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.insert(gateway, addr) != Some(addr)
    }

    pub fn route(&self, gateway: GatewayId) -> Option<SocketAddr> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&gateway)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ============================================================
// Downlink path
// ============================================================

/// Downlink sink that routes instructions to the gateway's learned address
///
/// Encoded datagrams are queued for [`run_downlink_writer`].
pub struct UdpDownlinkSink {
    routes: Arc<GatewayRoutes>,
    tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
}

impl UdpDownlinkSink {
    pub fn new(
        routes: Arc<GatewayRoutes>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<(SocketAddr, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { routes, tx }, rx)
    }
}

impl DownlinkSink for UdpDownlinkSink {
    fn dispatch(&self, instruction: DownlinkInstruction) -> Result<(), DispatchError> {
        let Some(addr) = self.routes.route(instruction.gateway) else {
            record_datagram("downlink", "no_route");
            return Err(DispatchError::NoRoute(instruction.gateway));
        };
        self.tx
            .try_send((addr, encode_downlink(&instruction)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::Full,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })
    }
}

/// Send queued downlink datagrams until the sink is dropped
pub async fn run_downlink_writer(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
) {
    while let Some((addr, datagram)) = rx.recv().await {
        match socket.send_to(&datagram, addr).await {
            Ok(_) => record_datagram("downlink", "sent"),
            Err(e) => {
                record_datagram("downlink", "io_error");
                warn!(%addr, error = %e, "downlink send failed");
            }
        }
    }
    debug!("downlink writer stopped");
}

// ============================================================
// Uplink path
// ============================================================

/// Receive report datagrams and submit them until the controller shuts down
pub async fn run_ingest(
    socket: Arc<UdpSocket>,
    controller: NetworkController,
    routes: Arc<GatewayRoutes>,
    auto_register: bool,
) -> Result<(), IngestError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let report = match decode_report(&buf[..len]) {
            Ok(report) => report,
            Err(e) => {
                record_datagram("uplink", "malformed");
                warn!(%peer, len, error = %e, "malformed datagram dropped");
                continue;
            }
        };
        record_datagram("uplink", "ok");

        if routes.learn(report.gateway, peer) {
            update_gateway_count(routes.len());
            info!(gateway = %report.gateway, %peer, "gateway route learned");
        }
        if auto_register && controller.add_device(report.device) {
            info!(device = %report.device, "device auto-registered");
        }

        let (device, sequence) = (report.device, report.sequence);
        match controller.submit(report) {
            Ok(outcome) => debug!(%device, sequence, outcome = outcome.as_str(), "report"),
            Err(ControllerError::ShutDown) => {
                info!("controller shut down, ingestion stopped");
                return Ok(());
            }
            Err(e) => warn!(%device, sequence, error = %e, "report rejected"),
        }
    }
}
