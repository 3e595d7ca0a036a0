//! Acknowledgment arbitration
//!
//! Turns a finalized [`PendingUplink`] into exactly one delivery
//! notification and at most one downlink instruction. The arbiter is a pure
//! decision step: it reads the device's receive-window settings and the time
//! already spent deduplicating, and picks the receive window the answer can
//! still make. Registry side effects are applied by the caller.

use std::time::Duration;

use crate::command::{
    decode_commands, encode_commands, CommandBatch, LinkCheckAns, MacCommand,
};
use crate::dedup::PendingUplink;
use crate::error::{DownlinkSkip, RegistryError};
use crate::protocol::{
    link_margin, Direction, DownlinkInstruction, RadioParameters, RxWindow, RxWindowSettings,
    UplinkDelivery, UplinkRadio,
};

/// Default time reserved for a gateway to queue a transmission
pub const DEFAULT_SCHEDULING_MARGIN: Duration = Duration::from_millis(50);

/// Arbiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// A window is only targeted if it opens at least this long after
    /// the decision
    pub scheduling_margin: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            scheduling_margin: DEFAULT_SCHEDULING_MARGIN,
        }
    }
}

impl ArbiterConfig {
    pub fn with_scheduling_margin(mut self, margin: Duration) -> Self {
        self.scheduling_margin = margin;
        self
    }
}

/// Receive window chosen for an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub window: RxWindow,
    /// Transmission time relative to uplink reception
    pub delay: Duration,
    pub radio: RadioParameters,
}

/// Outcome of finalizing one uplink
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    /// Notification for upstream listeners
    pub delivery: UplinkDelivery,
    /// Downlink for the best gateway, or why none is sent
    pub downlink: Result<DownlinkInstruction, DownlinkSkip>,
    /// Control commands the device piggybacked on the uplink
    pub uplink_commands: CommandBatch,
    /// Control commands placed in the downlink
    pub answers: Vec<MacCommand>,
    /// Time between the first report and the decision
    pub elapsed: Duration,
}

impl Finalized {
    /// Whether a downlink was scheduled
    pub fn has_downlink(&self) -> bool {
        self.downlink.is_ok()
    }
}

/// Decides how a finalized uplink is answered
#[derive(Debug, Clone, Default)]
pub struct Arbiter {
    config: ArbiterConfig,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Pick the earliest receive window that can still be met
    ///
    /// RX1 answers on the uplink channel at the offset data rate, RX2 on the
    /// configured fixed channel one second later.
    pub fn plan(
        &self,
        settings: Result<RxWindowSettings, RegistryError>,
        uplink: &UplinkRadio,
        elapsed: Duration,
    ) -> Result<WindowPlan, DownlinkSkip> {
        let settings = settings.map_err(|err| match err {
            RegistryError::UnknownDevice(device) | RegistryError::MissingSettings(device) => {
                DownlinkSkip::MissingSettings(device)
            }
            RegistryError::InvalidSetting { device, .. } => DownlinkSkip::MissingSettings(device),
        })?;

        let ready = elapsed + self.config.scheduling_margin;
        if ready < settings.rx1_delay() {
            return Ok(WindowPlan {
                window: RxWindow::Rx1,
                delay: settings.rx1_delay(),
                radio: settings.rx1_parameters(uplink),
            });
        }
        if ready < settings.rx2_delay() {
            return Ok(WindowPlan {
                window: RxWindow::Rx2,
                delay: settings.rx2_delay(),
                radio: settings.rx2_parameters(),
            });
        }

        Err(DownlinkSkip::WindowMissed {
            elapsed_ms: elapsed.as_millis() as u64,
            deadline_ms: settings.rx2_delay().as_millis() as u64,
        })
    }

    /// Build the delivery and the answer for a finalized uplink
    ///
    /// `queued` is an application payload to carry in the downlink; it is
    /// dropped if no downlink can be scheduled, so callers should only take
    /// it from the registry after a successful [`Arbiter::plan`].
    pub fn decide(
        &self,
        pending: PendingUplink,
        settings: Result<RxWindowSettings, RegistryError>,
        elapsed: Duration,
        queued: Option<Vec<u8>>,
    ) -> Finalized {
        let uplink_commands = decode_commands(Direction::Uplink, &pending.fopts);
        let answers = answer_commands(&pending, &uplink_commands);
        let plan = self.plan(settings, &pending.best_radio, elapsed);

        let downlink = plan.map(|plan| {
            let fopts = encode_commands(&answers).unwrap_or_else(|err| {
                log::warn!(
                    "device {}: dropping downlink commands: {}",
                    pending.device,
                    err
                );
                Vec::new()
            });
            DownlinkInstruction {
                gateway: pending.best_gateway,
                device: pending.device,
                sequence: pending.sequence,
                window: plan.window,
                delay: plan.delay,
                radio: plan.radio,
                fopts,
                payload: queued.unwrap_or_default(),
            }
        });

        let delivery = UplinkDelivery {
            device: pending.device,
            sequence: pending.sequence,
            gateway: pending.best_gateway,
            signal: pending.best_signal,
            gateway_count: pending.gateway_count,
            radio: pending.best_radio,
            payload: pending.payload,
        };

        Finalized {
            delivery,
            downlink,
            uplink_commands,
            answers,
            elapsed,
        }
    }
}

/// Answers owed for the uplink's control commands
///
/// Repeated link-check requests in one uplink share a single answer.
fn answer_commands(pending: &PendingUplink, uplink: &CommandBatch) -> Vec<MacCommand> {
    let wants_link_check = uplink
        .iter()
        .any(|c| matches!(c, MacCommand::LinkCheckReq(_)));
    if !wants_link_check {
        return Vec::new();
    }

    let answer = LinkCheckAns::new(
        link_margin(pending.best_signal, pending.best_radio.data_rate),
        pending.gateway_count.min(u32::from(u8::MAX)) as u8,
    );
    vec![answer.into()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{LinkCheckReq, Command};
    use crate::protocol::{DevAddr, GatewayId, GatewayReport};
    use std::time::Instant;

    const DEV: DevAddr = DevAddr(0x2601_0009);

    fn pending(fopts: Vec<u8>) -> PendingUplink {
        let report = GatewayReport::new(DEV, 7, GatewayId(0xAB), 5.5, b"temp=21".to_vec())
            .with_radio(UplinkRadio {
                frequency: 868_300_000,
                data_rate: 5,
            })
            .with_fopts(fopts);
        let mut pending = PendingUplink::open(report, Instant::now());
        pending.gateway_count = 3;
        pending
    }

    fn settings() -> Result<RxWindowSettings, RegistryError> {
        Ok(RxWindowSettings {
            delay: 1,
            rx1_dr_offset: 2,
            rx2_data_rate: 0,
            rx2_frequency: 869_525_000,
        })
    }

    #[test]
    fn test_rx1_when_in_time() {
        let arbiter = Arbiter::default();
        let result = arbiter.decide(pending(vec![]), settings(), Duration::from_millis(200), None);

        let downlink = result.downlink.unwrap();
        assert_eq!(downlink.window, RxWindow::Rx1);
        assert_eq!(downlink.gateway, GatewayId(0xAB));
        assert_eq!(downlink.delay, Duration::from_secs(1));
        assert_eq!(downlink.radio.frequency, 868_300_000);
        assert_eq!(downlink.radio.data_rate, 3);
        assert!(downlink.fopts.is_empty());
        assert!(downlink.payload.is_empty());

        assert_eq!(result.delivery.sequence, 7);
        assert_eq!(result.delivery.gateway_count, 3);
        assert_eq!(result.delivery.payload, b"temp=21");
    }

    #[test]
    fn test_rx2_after_rx1_deadline() {
        let arbiter = Arbiter::default();
        let result = arbiter.decide(pending(vec![]), settings(), Duration::from_millis(960), None);

        let downlink = result.downlink.unwrap();
        assert_eq!(downlink.window, RxWindow::Rx2);
        assert_eq!(downlink.delay, Duration::from_secs(2));
        assert_eq!(downlink.radio.frequency, 869_525_000);
        assert_eq!(downlink.radio.data_rate, 0);
    }

    #[test]
    fn test_window_missed() {
        let arbiter = Arbiter::default();
        let result = arbiter.decide(pending(vec![]), settings(), Duration::from_millis(1990), None);

        assert_eq!(
            result.downlink,
            Err(DownlinkSkip::WindowMissed {
                elapsed_ms: 1990,
                deadline_ms: 2000
            })
        );
        // Delivery is emitted regardless
        assert_eq!(result.delivery.device, DEV);
    }

    #[test]
    fn test_missing_settings() {
        let arbiter = Arbiter::default();
        let result = arbiter.decide(
            pending(vec![]),
            Err(RegistryError::MissingSettings(DEV)),
            Duration::ZERO,
            Some(vec![1, 2]),
        );
        assert_eq!(result.downlink, Err(DownlinkSkip::MissingSettings(DEV)));
        assert!(!result.has_downlink());
    }

    #[test]
    fn test_scheduling_margin_configurable() {
        let arbiter = Arbiter::new(ArbiterConfig::default().with_scheduling_margin(Duration::ZERO));
        let plan = arbiter
            .plan(settings(), &UplinkRadio::default(), Duration::from_millis(990))
            .unwrap();
        assert_eq!(plan.window, RxWindow::Rx1);
    }

    #[test]
    fn test_link_check_answered() {
        let arbiter = Arbiter::default();
        let fopts = vec![LinkCheckReq::CID, LinkCheckReq::CID];
        let result = arbiter.decide(pending(fopts), settings(), Duration::ZERO, Some(vec![9]));

        assert!(result.uplink_commands.is_clean());
        assert_eq!(result.uplink_commands.len(), 2);
        assert_eq!(result.answers, vec![MacCommand::from(LinkCheckAns::new(13, 3))]);

        let downlink = result.downlink.unwrap();
        assert_eq!(downlink.fopts, vec![LinkCheckAns::CID, 13, 3]);
        assert_eq!(downlink.payload, vec![9]);
    }

    #[test]
    fn test_malformed_uplink_commands() {
        let arbiter = Arbiter::default();
        let fopts = vec![LinkCheckReq::CID, 0x7F, 0x01];
        let result = arbiter.decide(pending(fopts), settings(), Duration::ZERO, None);

        assert!(!result.uplink_commands.is_clean());
        assert_eq!(result.answers.len(), 1);
        assert!(result.has_downlink());
    }
}
