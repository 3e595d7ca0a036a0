//! Device registry
//!
//! Holds the per-device control state of the network: membership,
//! receive-window settings, the last link-quality report and a queued
//! application downlink. All operations are plain map lookups and
//! mutations; callers provide exclusive access. Sequence watermarks live
//! with the pending uplinks in [`crate::dedup`], off this lock.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::command::CommandContext;
use crate::error::RegistryError;
use crate::protocol::{DevAddr, LinkQuality, RxWindowSettings, MAX_RX_DELAY};

/// Control state of a single device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Receive-window settings, if configured
    pub rx_window: Option<RxWindowSettings>,
    /// Last link-quality report sent to the device
    pub link_quality: Option<LinkQuality>,
    /// Device asked for a link check that has not been answered yet
    pub link_check_pending: bool,
    /// Application payload to send with the next acknowledgment
    pub queued_downlink: Option<Vec<u8>>,
}

impl DeviceState {
    /// State for a newly registered device
    pub fn registered() -> Self {
        Self {
            rx_window: Some(RxWindowSettings::default()),
            ..Default::default()
        }
    }
}

impl CommandContext for DeviceState {
    fn record_link_quality(&mut self, quality: LinkQuality) {
        self.link_quality = Some(quality);
        self.link_check_pending = false;
    }

    fn request_link_check(&mut self) {
        self.link_check_pending = true;
    }
}

/// Per-device control state of the network
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    members: HashSet<DevAddr>,
    devices: HashMap<DevAddr, DeviceState>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a device under network control
    ///
    /// Creates default receive-window settings if the device has none.
    /// Returns `true` if the device was not already a member.
    pub fn add_device(&mut self, device: DevAddr) -> bool {
        let state = self
            .devices
            .entry(device)
            .or_insert_with(DeviceState::registered);
        if state.rx_window.is_none() {
            state.rx_window = Some(RxWindowSettings::default());
        }
        self.members.insert(device)
    }

    /// Remove a device and all of its state
    pub fn remove_device(&mut self, device: DevAddr) -> Option<DeviceState> {
        self.members.remove(&device);
        self.devices.remove(&device)
    }

    /// Whether the device is under network control
    pub fn is_member(&self, device: DevAddr) -> bool {
        self.members.contains(&device)
    }

    /// Replace the receive-window settings of a device
    ///
    /// Creates the device entry if needed; does not grant membership.
    pub fn set_rx_window(
        &mut self,
        device: DevAddr,
        settings: RxWindowSettings,
    ) -> Result<(), RegistryError> {
        validate_delay(device, settings.delay)?;
        self.devices.entry(device).or_default().rx_window = Some(settings);
        Ok(())
    }

    /// Update the second-window parameters and first-window data rate offset,
    /// keeping the configured response delay
    pub fn set_rx_settings(
        &mut self,
        device: DevAddr,
        rx1_dr_offset: u8,
        rx2_data_rate: u8,
        rx2_frequency: u32,
    ) {
        let settings = self
            .devices
            .entry(device)
            .or_default()
            .rx_window
            .get_or_insert_with(RxWindowSettings::default);
        settings.rx1_dr_offset = rx1_dr_offset;
        settings.rx2_data_rate = rx2_data_rate;
        settings.rx2_frequency = rx2_frequency;
    }

    /// Update the response delay, keeping the other settings
    pub fn set_response_delay(&mut self, device: DevAddr, delay: u8) -> Result<(), RegistryError> {
        validate_delay(device, delay)?;
        self.devices
            .entry(device)
            .or_default()
            .rx_window
            .get_or_insert_with(RxWindowSettings::default)
            .delay = delay;
        Ok(())
    }

    /// Drop the receive-window settings of a device
    pub fn clear_rx_window(&mut self, device: DevAddr) -> Result<(), RegistryError> {
        self.state_mut(device)?.rx_window = None;
        Ok(())
    }

    /// Receive-window settings of a device
    pub fn rx_window(&self, device: DevAddr) -> Result<RxWindowSettings, RegistryError> {
        self.state(device)?
            .rx_window
            .ok_or(RegistryError::MissingSettings(device))
    }

    /// Last link-quality report sent to a device
    pub fn link_quality(&self, device: DevAddr) -> Result<Option<LinkQuality>, RegistryError> {
        Ok(self.state(device)?.link_quality)
    }

    /// Last reported margin, in dB
    pub fn margin(&self, device: DevAddr) -> Result<Option<u8>, RegistryError> {
        Ok(self.link_quality(device)?.map(|q| q.margin))
    }

    /// Last reported gateway count
    pub fn gateway_count(&self, device: DevAddr) -> Result<Option<u8>, RegistryError> {
        Ok(self.link_quality(device)?.map(|q| q.gateway_count))
    }

    /// Queue an application payload for the next acknowledgment
    ///
    /// Returns the payload it replaced, if any.
    pub fn queue_downlink(
        &mut self,
        device: DevAddr,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, RegistryError> {
        Ok(self.state_mut(device)?.queued_downlink.replace(payload))
    }

    /// Take the queued application payload of a device
    pub fn take_queued_downlink(&mut self, device: DevAddr) -> Option<Vec<u8>> {
        self.devices
            .get_mut(&device)
            .and_then(|state| state.queued_downlink.take())
    }

    /// Get the state of a device
    pub fn device(&self, device: DevAddr) -> Option<&DeviceState> {
        self.devices.get(&device)
    }

    /// Get mutable state of a device
    pub fn device_mut(&mut self, device: DevAddr) -> Option<&mut DeviceState> {
        self.devices.get_mut(&device)
    }

    /// Number of member devices
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Member devices, in address order
    pub fn members(&self) -> Vec<DevAddr> {
        let mut members: Vec<_> = self.members.iter().copied().collect();
        members.sort();
        members
    }

    fn state(&self, device: DevAddr) -> Result<&DeviceState, RegistryError> {
        self.devices
            .get(&device)
            .ok_or(RegistryError::UnknownDevice(device))
    }

    fn state_mut(&mut self, device: DevAddr) -> Result<&mut DeviceState, RegistryError> {
        self.devices
            .get_mut(&device)
            .ok_or(RegistryError::UnknownDevice(device))
    }
}

/// Shared read access; a panicked writer leaves the maps consistent
pub(crate) fn read(registry: &RwLock<DeviceRegistry>) -> RwLockReadGuard<'_, DeviceRegistry> {
    registry.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write(registry: &RwLock<DeviceRegistry>) -> RwLockWriteGuard<'_, DeviceRegistry> {
    registry.write().unwrap_or_else(PoisonError::into_inner)
}

fn validate_delay(device: DevAddr, delay: u8) -> Result<(), RegistryError> {
    if delay > MAX_RX_DELAY {
        return Err(RegistryError::InvalidSetting {
            device,
            field: "response delay",
            value: u32::from(delay),
        });
    }
    Ok(())
}
