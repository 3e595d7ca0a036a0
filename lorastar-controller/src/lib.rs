// Lorastar Controller - Async deduplication and acknowledgment control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Lorastar Controller - Async deduplication and acknowledgment control
//!
//! This crate drives the synchronous [`lorastar`] engine with tokio timers.
//!
//! ## Overview
//!
//! Gateways report every uplink they hear. The controller opens a
//! deduplication window on the first report, folds the others in, and when
//! the window closes delivers the uplink once and sends one acknowledgment
//! through the best gateway.
//!
//! ## Features
//!
//! - **Window timers**: one cancellable timer per device, replaced when a
//!   newer uplink supersedes the pending one
//! - **Early finalize**: close the window once enough gateways reported
//! - **Observers**: filtered uplink listeners, promiscuous report listeners
//! - **Downlink sinks**: any closure, or a bounded [`ChannelSink`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Network Controller                                         │
//! │                                                             │
//! │  gateway reports ──► submit ──► Network (dedup + registry)  │
//! │                         │                                   │
//! │                         ▼                                   │
//! │                  ┌─────────────┐                            │
//! │                  │ WindowTimers│  one per device            │
//! │                  └──────┬──────┘                            │
//! │                         ▼                                   │
//! │                     finalize ──► UplinkListener (once)      │
//! │                         │                                   │
//! │                         └──────► DownlinkSink (at most once)│
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod controller;
mod error;
mod listener;
mod timer;

// Public API
pub use config::{ControllerConfig, DEFAULT_DEDUP_WINDOW};
pub use controller::NetworkController;
pub use error::{ControllerError, DispatchError, Result};
pub use listener::{ChannelSink, DownlinkSink, ReportListener, UplinkListener};
pub use timer::WindowTimers;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
