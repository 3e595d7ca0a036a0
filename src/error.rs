//! Error types for Lorastar
//!
//! Expected protocol outcomes (a duplicate report, a report from a device
//! that is not under network control) are not errors: they are returned as
//! [`ReportOutcome`](crate::dedup::ReportOutcome) variants. The types here
//! cover malformed input, registry lookups and skipped downlinks.

use thiserror::Error;

use crate::protocol::{DevAddr, Direction};

/// Result type alias for Lorastar operations
pub type Result<T> = std::result::Result<T, LorastarError>;

/// Main error type for Lorastar operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LorastarError {
    /// Decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Downlink could not be scheduled
    #[error("Downlink skipped: {0}")]
    Downlink(#[from] DownlinkSkip),
}

/// Errors while decoding control commands or identifiers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes remain than the command's fixed size
    #[error("Truncated {command}: need {needed} bytes, have {available}")]
    TruncatedInput {
        command: &'static str,
        needed: usize,
        available: usize,
    },

    /// Discriminator does not name a known command for this direction
    #[error("Unknown {direction} command identifier: 0x{cid:02x}")]
    UnknownCommand { cid: u8, direction: Direction },

    /// Encoded command block exceeds the piggyback limit
    #[error("Command block too long: {size} bytes exceeds maximum {max}")]
    CommandBlockTooLong { size: usize, max: usize },

    /// Identifier string is not valid hex of the expected width
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Errors from device registry lookups and configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Device has never been registered or configured
    #[error("Unknown device: {0}")]
    UnknownDevice(DevAddr),

    /// Device is known but has no receive-window settings
    #[error("No receive-window settings for device {0}")]
    MissingSettings(DevAddr),

    /// Configuration value outside the protocol range
    #[error("Invalid {field} for device {device}: {value}")]
    InvalidSetting {
        device: DevAddr,
        field: &'static str,
        value: u32,
    },
}

/// Reasons a finalized uplink is delivered without a downlink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownlinkSkip {
    /// Device has no receive-window settings
    #[error("No receive-window settings for device {0}")]
    MissingSettings(DevAddr),

    /// Both receive windows closed before the uplink was finalized
    #[error("Receive windows missed: finalized after {elapsed_ms}ms, last window at {deadline_ms}ms")]
    WindowMissed { elapsed_ms: u64, deadline_ms: u64 },
}

impl DownlinkSkip {
    /// Short label for counters and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DownlinkSkip::MissingSettings(_) => "missing_settings",
            DownlinkSkip::WindowMissed { .. } => "window_missed",
        }
    }
}
