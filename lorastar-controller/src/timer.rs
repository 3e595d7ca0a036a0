// Lorastar Controller - Async deduplication and acknowledgment control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-device deduplication window timers
//!
//! Each device has at most one armed timer, tagged with the sequence of the
//! pending uplink it will finalize. The armed sequence only moves forward:
//! arming a newer sequence aborts the old timer, and a timer for an older
//! sequence that registers late is aborted itself.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lorastar::{DevAddr, FrameCounter};
use tokio::task::AbortHandle;

#[derive(Debug)]
struct ArmedTimer {
    sequence: FrameCounter,
    handle: AbortHandle,
}

/// Cancellable timers keyed by device
#[derive(Debug, Default)]
pub struct WindowTimers {
    armed: Mutex<HashMap<DevAddr, ArmedTimer>>,
}

impl WindowTimers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DevAddr, ArmedTimer>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the timer task of `(device, sequence)`
    ///
    /// Reports for the same device may arm from different threads in any
    /// order. The timer of the highest sequence wins and every other one is
    /// aborted. Returns `false` if `handle` lost and was aborted.
    pub fn arm(&self, device: DevAddr, sequence: FrameCounter, handle: AbortHandle) -> bool {
        let mut armed = self.lock();
        if let Some(current) = armed.get(&device) {
            if current.sequence >= sequence {
                handle.abort();
                return false;
            }
        }
        if let Some(old) = armed.insert(device, ArmedTimer { sequence, handle }) {
            old.handle.abort();
        }
        true
    }

    /// Unregister a timer that fired, without aborting it
    pub fn complete(&self, device: DevAddr, sequence: FrameCounter) -> bool {
        let mut armed = self.lock();
        match armed.get(&device) {
            Some(timer) if timer.sequence == sequence => {
                armed.remove(&device);
                true
            }
            _ => false,
        }
    }

    /// Abort the timer of `(device, sequence)` if it is the armed one
    pub fn cancel_sequence(&self, device: DevAddr, sequence: FrameCounter) -> bool {
        let mut armed = self.lock();
        match armed.get(&device) {
            Some(timer) if timer.sequence == sequence => {
                if let Some(timer) = armed.remove(&device) {
                    timer.handle.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Abort whatever timer the device has
    pub fn cancel(&self, device: DevAddr) -> Option<FrameCounter> {
        let timer = self.lock().remove(&device)?;
        timer.handle.abort();
        Some(timer.sequence)
    }

    /// Abort all timers, returning the `(device, sequence)` pairs they guarded
    pub fn cancel_all(&self) -> Vec<(DevAddr, FrameCounter)> {
        let drained: Vec<_> = self.lock().drain().collect();
        drained
            .into_iter()
            .map(|(device, timer)| {
                timer.handle.abort();
                (device, timer.sequence)
            })
            .collect()
    }

    /// Sequence the device's armed timer guards
    pub fn armed_sequence(&self, device: DevAddr) -> Option<FrameCounter> {
        self.lock().get(&device).map(|t| t.sequence)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
