// Lorastar Controller - Integration Tests
//
// Timer-driven behavior is tested on a paused tokio clock. The tests are
// organized into categories:
// 1. Delivery guarantees
// 2. Window timers
// 3. Receive-window arbitration
// 4. Observers and sinks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lorastar::{
    Command, DevAddr, DownlinkInstruction, DownlinkSkip, GatewayId, GatewayReport, LinkCheckAns,
    LinkCheckReq, ReportOutcome, RxWindow, RxWindowSettings, UplinkDelivery, UplinkRadio,
    WindowEvent,
};
use lorastar_controller::{ChannelSink, ControllerConfig, DispatchError, NetworkController};
use tokio::sync::mpsc;

const DEV: DevAddr = DevAddr(0x2601_0a01);

struct Harness {
    controller: NetworkController,
    deliveries: mpsc::UnboundedReceiver<UplinkDelivery>,
    downlinks: mpsc::Receiver<DownlinkInstruction>,
}

impl Harness {
    fn new(config: ControllerConfig) -> Self {
        let controller = NetworkController::new(config).unwrap();

        let (tx, deliveries) = mpsc::unbounded_channel();
        controller.on_uplink(move |d: &UplinkDelivery| {
            let _ = tx.send(d.clone());
        });

        let (sink, downlinks) = ChannelSink::new(256);
        controller.set_downlink_sink(sink);

        controller.add_device(DEV);
        Self {
            controller,
            deliveries,
            downlinks,
        }
    }

    fn submit(&self, sequence: u32, gateway: u64, snr: f64) -> ReportOutcome {
        let report = GatewayReport::new(DEV, sequence, GatewayId(gateway), snr, vec![0xCA, 0xFE]);
        self.controller.submit(report).unwrap()
    }

    fn deliveries(&mut self) -> Vec<UplinkDelivery> {
        let mut out = Vec::new();
        while let Ok(d) = self.deliveries.try_recv() {
            out.push(d);
        }
        out
    }

    fn downlinks(&mut self) -> Vec<DownlinkInstruction> {
        let mut out = Vec::new();
        while let Ok(d) = self.downlinks.try_recv() {
            out.push(d);
        }
        out
    }
}

async fn close_window() {
    tokio::time::sleep(Duration::from_millis(1100)).await;
}

// ============================================================================
// Delivery Guarantees
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_delivery_per_uplink_for_any_gateway_count() {
    let mut h = Harness::new(ControllerConfig::default());

    for (sequence, gateways) in (1..=5u32).map(|n| (n, u64::from(n))) {
        for gw in 0..gateways {
            assert!(h.submit(sequence, gw, gw as f64).is_accepted());
        }
        close_window().await;
    }

    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), 5);
    for (i, d) in deliveries.iter().enumerate() {
        assert_eq!(d.sequence, i as u32 + 1);
        assert_eq!(d.gateway_count, i as u32 + 1);
        assert_eq!(d.payload, vec![0xCA, 0xFE]);
    }
    assert_eq!(h.downlinks().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_best_gateway_wins() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 0xA, 5.0);
    h.submit(1, 0xB, 9.0);
    close_window().await;

    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].gateway, GatewayId(0xB));
    assert_eq!(deliveries[0].gateway_count, 2);
    approx::assert_relative_eq!(deliveries[0].signal, 9.0);

    let downlinks = h.downlinks();
    assert_eq!(downlinks.len(), 1);
    assert_eq!(downlinks[0].gateway, GatewayId(0xB));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_after_finalize_is_dropped() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(7, 1, 1.0);
    close_window().await;
    assert_eq!(h.deliveries().len(), 1);

    for seq in [6, 7] {
        assert_eq!(
            h.submit(seq, 2, 10.0),
            ReportOutcome::DuplicateSequence { watermark: 7 }
        );
    }
    assert!(h.controller.network().pending(DEV).is_none());
    assert_eq!(h.controller.armed_timers(), 0);

    close_window().await;
    assert!(h.deliveries().is_empty());
    assert_eq!(h.downlinks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_member_rejected_until_added() {
    let mut h = Harness::new(ControllerConfig::default());
    let stranger = DevAddr(0x0bad_0001);

    let report = GatewayReport::new(stranger, 1, GatewayId(1), 0.0, vec![]);
    assert_eq!(
        h.controller.submit(report.clone()).unwrap(),
        ReportOutcome::UnknownDevice
    );
    assert!(!h.controller.network().is_member(stranger));
    assert_eq!(h.controller.armed_timers(), 0);

    h.controller.add_device(stranger);
    assert_eq!(
        h.controller.submit(report).unwrap(),
        ReportOutcome::Accepted {
            window: WindowEvent::Opened,
            gateway_count: 1
        }
    );
    close_window().await;
    assert_eq!(h.deliveries()[0].device, stranger);
}

#[tokio::test(start_paused = true)]
async fn test_removal_mid_window_is_silent() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 1, 1.0);
    h.submit(1, 2, 2.0);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let dropped = h.controller.remove_device(DEV).unwrap();
    assert_eq!(dropped.gateway_count, 2);
    assert_eq!(h.controller.armed_timers(), 0);

    close_window().await;
    assert!(h.deliveries().is_empty());
    assert!(h.downlinks().is_empty());
    assert_eq!(h.submit(2, 1, 1.0), ReportOutcome::UnknownDevice);
}

// ============================================================================
// Window Timers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_explicit_finalize_then_timer() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 1, 1.0);
    assert!(h.controller.finalize(DEV, 1).is_some());
    assert!(h.controller.finalize(DEV, 1).is_none());

    close_window().await;
    assert_eq!(h.deliveries().len(), 1);
    assert_eq!(h.downlinks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_then_explicit_finalize() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 1, 1.0);
    close_window().await;
    assert!(h.controller.finalize(DEV, 1).is_none());

    assert_eq!(h.deliveries().len(), 1);
    assert_eq!(h.downlinks().len(), 1);
    assert_eq!(h.controller.stats().finalized, 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_stays_open_until_timer() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 1, 1.0);
    tokio::time::sleep(Duration::from_millis(900)).await;
    h.submit(1, 2, 3.0);
    assert!(h.deliveries().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].gateway_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_early_finalize_at_gateway_count() {
    let mut h = Harness::new(ControllerConfig::with_early_finalize(3));

    h.submit(1, 1, 1.0);
    h.submit(1, 2, 1.0);
    assert!(h.deliveries().is_empty());

    h.submit(1, 3, 1.0);
    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].gateway_count, 3);
    assert_eq!(h.controller.armed_timers(), 0);

    // Finalized early, so the first window is still reachable
    let downlinks = h.downlinks();
    assert_eq!(downlinks[0].window, RxWindow::Rx1);

    // A fourth gateway is late
    assert_eq!(
        h.submit(1, 4, 1.0),
        ReportOutcome::DuplicateSequence { watermark: 1 }
    );
    close_window().await;
    assert!(h.deliveries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_newer_uplink_supersedes_pending() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 1, 1.0);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        h.submit(2, 1, 1.0),
        ReportOutcome::Accepted {
            window: WindowEvent::Superseded(1),
            gateway_count: 1
        }
    );

    // Old window would have closed here
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.deliveries().is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].sequence, 2);
    assert_eq!(h.controller.network().last_sequence(DEV).unwrap(), Some(2));
}

// ============================================================================
// Receive-Window Arbitration
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_default_window_answers_in_rx2() {
    let mut h = Harness::new(ControllerConfig::default());

    h.submit(1, 1, 1.0);
    close_window().await;

    let downlink = h.downlinks().pop().unwrap();
    assert_eq!(downlink.window, RxWindow::Rx2);
    assert_eq!(downlink.delay, Duration::from_secs(2));
    assert_eq!(downlink.radio.frequency, 869_525_000);
    assert_eq!(downlink.radio.data_rate, 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_window_answers_in_rx1() {
    let mut h = Harness::new(ControllerConfig::with_dedup_window(Duration::from_millis(200)));
    h.controller.network().set_rx_settings(DEV, 2, 3, 869_100_000);

    let report = GatewayReport::new(DEV, 1, GatewayId(9), 2.0, vec![]).with_radio(UplinkRadio {
        frequency: 867_300_000,
        data_rate: 5,
    });
    h.controller.submit(report).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let downlink = h.downlinks().pop().unwrap();
    assert_eq!(downlink.window, RxWindow::Rx1);
    assert_eq!(downlink.delay, Duration::from_secs(1));
    assert_eq!(downlink.radio.frequency, 867_300_000);
    assert_eq!(downlink.radio.data_rate, 3);
}

#[tokio::test(start_paused = true)]
async fn test_long_response_delay_keeps_rx1() {
    let mut h = Harness::new(ControllerConfig::default());
    h.controller
        .network()
        .set_rx_window(
            DEV,
            RxWindowSettings {
                delay: 5,
                ..Default::default()
            },
        )
        .unwrap();

    h.submit(1, 1, 1.0);
    close_window().await;

    let downlink = h.downlinks().pop().unwrap();
    assert_eq!(downlink.window, RxWindow::Rx1);
    assert_eq!(downlink.delay, Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_missing_settings_delivers_without_downlink() {
    let mut h = Harness::new(ControllerConfig::default());
    h.controller.network().clear_rx_window(DEV).unwrap();

    h.submit(1, 1, 1.0);
    let finalized = h.controller.finalize(DEV, 1).unwrap();
    assert_eq!(finalized.downlink, Err(DownlinkSkip::MissingSettings(DEV)));

    assert_eq!(h.deliveries().len(), 1);
    assert!(h.downlinks().is_empty());
    assert_eq!(h.controller.stats().skipped_missing_settings, 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_check_answered_in_downlink() {
    let mut h = Harness::new(ControllerConfig::default());

    for (gw, snr) in [(1, -4.0), (2, 2.0), (3, -11.0)] {
        let report = GatewayReport::new(DEV, 1, GatewayId(gw), snr, vec![])
            .with_fopts(vec![LinkCheckReq::CID]);
        h.controller.submit(report).unwrap();
    }
    close_window().await;

    // Best SNR 2.0 dB at DR0 is 22 dB above the floor
    let downlink = h.downlinks().pop().unwrap();
    assert_eq!(downlink.fopts, vec![LinkCheckAns::CID, 22, 3]);
    assert_eq!(h.controller.network().margin(DEV).unwrap(), Some(22));
    assert_eq!(h.controller.network().gateway_count(DEV).unwrap(), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_queued_downlink_rides_acknowledgment() {
    let mut h = Harness::new(ControllerConfig::default());
    h.controller
        .network()
        .queue_downlink(DEV, b"cfg".to_vec())
        .unwrap();

    h.submit(1, 1, 1.0);
    close_window().await;
    h.submit(2, 1, 1.0);
    close_window().await;

    let downlinks = h.downlinks();
    assert_eq!(downlinks.len(), 2);
    assert_eq!(downlinks[0].payload, b"cfg".to_vec());
    assert!(downlinks[1].payload.is_empty());
}

// ============================================================================
// Observers and Sinks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_report_listener_sees_every_report() {
    let h = Harness::new(ControllerConfig::default());
    let seen = Arc::new(AtomicUsize::new(0));
    let duplicates = Arc::new(AtomicUsize::new(0));

    let (s, d) = (Arc::clone(&seen), Arc::clone(&duplicates));
    h.controller
        .on_report(move |_: &GatewayReport, outcome: &ReportOutcome| {
            s.fetch_add(1, Ordering::SeqCst);
            if matches!(outcome, ReportOutcome::DuplicateSequence { .. }) {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

    h.submit(1, 1, 1.0);
    h.submit(1, 2, 1.0);
    close_window().await;
    h.submit(1, 3, 1.0);

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(duplicates.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_several_uplink_listeners() {
    let h = Harness::new(ControllerConfig::default());
    let extra = Arc::new(AtomicUsize::new(0));
    let e = Arc::clone(&extra);
    h.controller.on_uplink(move |_: &UplinkDelivery| {
        e.fetch_add(1, Ordering::SeqCst);
    });

    h.submit(1, 1, 1.0);
    close_window().await;
    assert_eq!(extra.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_failure_is_counted_not_retried() {
    let mut h = Harness::new(ControllerConfig::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&attempts);
    h.controller
        .set_downlink_sink(move |instruction: DownlinkInstruction| -> Result<(), DispatchError> {
            a.fetch_add(1, Ordering::SeqCst);
            Err(DispatchError::NoRoute(instruction.gateway))
        });

    h.submit(1, 1, 1.0);
    close_window().await;

    assert_eq!(h.deliveries().len(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.dispatch_failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_devices_independent_windows() {
    let mut h = Harness::new(ControllerConfig::default());
    let devices: Vec<DevAddr> = (1..=20).map(DevAddr).collect();
    for d in &devices {
        h.controller.add_device(*d);
    }

    for (i, d) in devices.iter().enumerate() {
        for gw in 0..3 {
            let report = GatewayReport::new(*d, 1, GatewayId(gw), i as f64, vec![]);
            h.controller.submit(report).unwrap();
        }
    }
    assert_eq!(h.controller.armed_timers(), devices.len());

    close_window().await;
    let deliveries = h.deliveries();
    assert_eq!(deliveries.len(), devices.len());
    assert!(deliveries.iter().all(|d| d.gateway_count == 3));
    assert_eq!(h.downlinks().len(), devices.len());

    let stats = h.controller.stats();
    approx::assert_relative_eq!(stats.average_gateways_per_uplink(), 3.0);
}
