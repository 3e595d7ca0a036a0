//! Protocol definitions for Lorastar
//!
//! This module defines the value types shared by every layer:
//! - Device and gateway identities
//! - Gateway reports (the ingestion tuple)
//! - Receive-window settings and radio parameters
//! - Delivery notifications and downlink instructions

use crate::error::DecodeError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Per-device uplink frame counter
pub type FrameCounter = u32;

/// Default second receive window frequency in Hz (EU868)
pub const DEFAULT_RX2_FREQUENCY: u32 = 869_525_000;

/// Default uplink frequency in Hz when a report carries none
pub const DEFAULT_UPLINK_FREQUENCY: u32 = 868_100_000;

/// Largest receive delay expressible in the protocol, in seconds
pub const MAX_RX_DELAY: u8 = 15;

/// The second receive window opens this long after the first
pub const RX2_OFFSET: Duration = Duration::from_secs(1);

/// Margin value reserved by the protocol
pub const MARGIN_RESERVED: u8 = 255;

/// Network address of an end-device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Big-endian byte representation
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Build from big-endian bytes
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex(s, 8).map(|v| Self(v as u32))
    }
}

/// EUI-64 of a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GatewayId(pub u64);

impl GatewayId {
    /// Big-endian byte representation
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Build from big-endian bytes
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for GatewayId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex(s, 16).map(Self)
    }
}

fn parse_hex(s: &str, max_digits: usize) -> Result<u64, DecodeError> {
    let digits = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.is_empty() || digits.len() > max_digits {
        return Err(DecodeError::InvalidIdentifier(s.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidIdentifier(s.to_string()))
}

/// Direction a control command travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Device to network
    Uplink = 0,
    /// Network to device
    Downlink = 1,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => write!(f, "uplink"),
            Direction::Downlink => write!(f, "downlink"),
        }
    }
}

/// Radio conditions the uplink was received with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkRadio {
    /// Center frequency in Hz
    pub frequency: u32,
    /// Regional data rate index
    pub data_rate: u8,
}

impl Default for UplinkRadio {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_UPLINK_FREQUENCY,
            data_rate: 0,
        }
    }
}

/// One gateway's report of an uplink transmission
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReport {
    /// Transmitting device
    pub device: DevAddr,
    /// Frame counter of the uplink
    pub sequence: FrameCounter,
    /// Reporting gateway
    pub gateway: GatewayId,
    /// Signal-to-noise ratio at this gateway, in dB
    pub signal: f64,
    /// Radio parameters of the reception
    pub radio: UplinkRadio,
    /// Piggybacked control command block
    pub fopts: Vec<u8>,
    /// Application payload
    pub payload: Vec<u8>,
}

impl GatewayReport {
    /// Create a report with default radio parameters and no control commands
    pub fn new(
        device: DevAddr,
        sequence: FrameCounter,
        gateway: GatewayId,
        signal: f64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            device,
            sequence,
            gateway,
            signal,
            radio: UplinkRadio::default(),
            fopts: Vec::new(),
            payload,
        }
    }

    /// Set the reception radio parameters
    pub fn with_radio(mut self, radio: UplinkRadio) -> Self {
        self.radio = radio;
        self
    }

    /// Attach an encoded control command block
    pub fn with_fopts(mut self, fopts: Vec<u8>) -> Self {
        self.fopts = fopts;
        self
    }
}

/// Receive-window configuration of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxWindowSettings {
    /// Delay between uplink end and the first receive window, in seconds
    /// (0 is interpreted as 1)
    pub delay: u8,
    /// Data rate offset applied to the uplink data rate in the first window
    pub rx1_dr_offset: u8,
    /// Data rate of the second window
    pub rx2_data_rate: u8,
    /// Frequency of the second window, in Hz
    pub rx2_frequency: u32,
}

impl Default for RxWindowSettings {
    fn default() -> Self {
        Self {
            delay: 1,
            rx1_dr_offset: 0,
            rx2_data_rate: 0,
            rx2_frequency: DEFAULT_RX2_FREQUENCY,
        }
    }
}

impl RxWindowSettings {
    /// Opening time of the first window relative to the uplink
    pub fn rx1_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay.max(1)))
    }

    /// Opening time of the second window relative to the uplink
    pub fn rx2_delay(&self) -> Duration {
        self.rx1_delay() + RX2_OFFSET
    }

    /// First window answers on the uplink channel at an offset data rate
    pub fn rx1_parameters(&self, uplink: &UplinkRadio) -> RadioParameters {
        RadioParameters {
            frequency: uplink.frequency,
            data_rate: uplink.data_rate.saturating_sub(self.rx1_dr_offset),
        }
    }

    /// Second window uses the fixed configured channel
    pub fn rx2_parameters(&self) -> RadioParameters {
        RadioParameters {
            frequency: self.rx2_frequency,
            data_rate: self.rx2_data_rate,
        }
    }
}

/// Receive window a downlink is scheduled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RxWindow {
    Rx1 = 1,
    Rx2 = 2,
}

impl RxWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            RxWindow::Rx1 => "rx1",
            RxWindow::Rx2 => "rx2",
        }
    }
}

/// Radio parameters of a downlink transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioParameters {
    /// Frequency in Hz
    pub frequency: u32,
    /// Regional data rate index
    pub data_rate: u8,
}

/// Last link-quality report sent to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkQuality {
    /// Demodulation margin in dB (0..=254)
    pub margin: u8,
    /// Number of gateways that received the uplink
    pub gateway_count: u8,
}

/// Demodulation floor in dB for an EU868 data rate
///
/// DR0..DR5 map to SF12..SF7 at 125 kHz. Higher indices use the SF7 floor.
pub fn required_snr(data_rate: u8) -> f64 {
    match data_rate {
        0 => -20.0,
        1 => -17.5,
        2 => -15.0,
        3 => -12.5,
        4 => -10.0,
        _ => -7.5,
    }
}

/// Link margin reported to a device for the given SNR and data rate
pub fn link_margin(snr: f64, data_rate: u8) -> u8 {
    let margin = (snr - required_snr(data_rate)).floor();
    if !margin.is_finite() || margin <= 0.0 {
        return 0;
    }
    margin.min(f64::from(MARGIN_RESERVED - 1)) as u8
}

/// Filtered notification of a de-duplicated uplink
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkDelivery {
    /// Transmitting device
    pub device: DevAddr,
    /// Frame counter of the uplink
    pub sequence: FrameCounter,
    /// Gateway that heard the uplink best
    pub gateway: GatewayId,
    /// Best signal-to-noise ratio, in dB
    pub signal: f64,
    /// Number of gateways that reported the uplink
    pub gateway_count: u32,
    /// Radio parameters at the best gateway
    pub radio: UplinkRadio,
    /// Application payload
    pub payload: Vec<u8>,
}

/// Instruction for one gateway to answer a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkInstruction {
    /// Transmitting gateway
    pub gateway: GatewayId,
    /// Addressed device
    pub device: DevAddr,
    /// Frame counter of the uplink being answered
    pub sequence: FrameCounter,
    /// Receive window the transmission targets
    pub window: RxWindow,
    /// Transmission time relative to uplink reception
    pub delay: Duration,
    /// Radio parameters of the transmission
    pub radio: RadioParameters,
    /// Encoded control command block
    pub fopts: Vec<u8>,
    /// Application payload
    pub payload: Vec<u8>,
}
