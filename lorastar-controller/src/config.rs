// Lorastar Controller - Async deduplication and acknowledgment control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for Lorastar Controller

use std::time::Duration;

use lorastar::arbiter::{ArbiterConfig, DEFAULT_SCHEDULING_MARGIN};
use lorastar::dedup::DEFAULT_SHARD_COUNT;
use lorastar::protocol::{MAX_RX_DELAY, RX2_OFFSET};

use crate::error::{ControllerError, Result};

/// Default deduplication window
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(1);

/// Controller-level configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Time reports for one uplink are collected before it is finalized
    /// (default: 1 s)
    pub dedup_window: Duration,

    /// Finalize as soon as this many gateways reported the uplink
    pub early_finalize_at: Option<u32>,

    /// Number of device-map shards, rounded up to a power of two
    pub shard_count: usize,

    /// Time reserved for a gateway to queue a transmission
    pub scheduling_margin: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            early_finalize_at: None,
            shard_count: DEFAULT_SHARD_COUNT,
            scheduling_margin: DEFAULT_SCHEDULING_MARGIN,
        }
    }
}

impl ControllerConfig {
    /// Create a configuration with a custom deduplication window
    pub fn with_dedup_window(dedup_window: Duration) -> Self {
        Self {
            dedup_window,
            ..Default::default()
        }
    }

    /// Create a configuration that finalizes after `count` gateway reports
    pub fn with_early_finalize(count: u32) -> Self {
        Self {
            early_finalize_at: Some(count),
            ..Default::default()
        }
    }

    /// Arbiter settings derived from this configuration
    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig::default().with_scheduling_margin(self.scheduling_margin)
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.dedup_window.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "dedup window must be greater than zero".to_string(),
            ));
        }

        // Past the latest possible second window nothing could be answered
        let latest_rx2 = Duration::from_secs(u64::from(MAX_RX_DELAY)) + RX2_OFFSET;
        if self.dedup_window + self.scheduling_margin >= latest_rx2 {
            return Err(ControllerError::InvalidConfig(format!(
                "dedup window {:?} leaves no receive window (latest opens at {:?})",
                self.dedup_window, latest_rx2
            )));
        }

        if self.early_finalize_at == Some(0) {
            return Err(ControllerError::InvalidConfig(
                "early finalize count must be at least 1".to_string(),
            ));
        }

        if self.shard_count == 0 {
            return Err(ControllerError::InvalidConfig(
                "shard count must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
