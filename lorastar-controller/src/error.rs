// Lorastar Controller - Async deduplication and acknowledgment control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Lorastar Controller

use thiserror::Error;

/// Main error type for Controller operations
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error from the network engine
    #[error("Network error: {0}")]
    Network(#[from] lorastar::LorastarError),

    /// Controller was shut down
    #[error("Controller is shut down")]
    ShutDown,
}

/// Failure to hand a downlink to the transmission path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Receiving side is gone
    #[error("Downlink channel closed")]
    Closed,

    /// Transmission queue is full
    #[error("Downlink queue full")]
    Full,

    /// No known route to the gateway
    #[error("No route to gateway {0}")]
    NoRoute(lorastar::GatewayId),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for Controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;
