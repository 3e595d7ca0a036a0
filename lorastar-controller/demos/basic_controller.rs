// Lorastar Controller - Basic Example
//
// Three gateways hear the same uplinks from two devices. The controller
// delivers each uplink once and answers it through the best gateway.

use std::time::Duration;

use lorastar::{Command, DevAddr, GatewayId, GatewayReport, LinkCheckReq, UplinkDelivery};
use lorastar_controller::{ChannelSink, ControllerConfig, NetworkController};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Lorastar Controller Basic Example ===\n");

    let config = ControllerConfig::with_dedup_window(Duration::from_millis(200));
    let controller = NetworkController::new(config)?;

    controller.on_uplink(|d: &UplinkDelivery| {
        println!(
            "uplink  {} #{}: {} bytes, best gateway {} ({:.1} dB), heard by {}",
            d.device,
            d.sequence,
            d.payload.len(),
            d.gateway,
            d.signal,
            d.gateway_count
        );
    });

    let (sink, mut downlinks) = ChannelSink::new(64);
    controller.set_downlink_sink(sink);

    let devices = [DevAddr(0x2601_0001), DevAddr(0x2601_0002)];
    for device in devices {
        controller.add_device(device);
    }
    controller.network().queue_downlink(devices[1], b"setpoint=21".to_vec())?;

    let gateways = [
        (GatewayId(0xb827_ebff_fe00_0001), -3.0),
        (GatewayId(0xb827_ebff_fe00_0002), 6.5),
        (GatewayId(0xb827_ebff_fe00_0003), -12.25),
    ];

    for sequence in 1..=3 {
        for (i, device) in devices.iter().enumerate() {
            for (gateway, snr) in gateways {
                let mut report = GatewayReport::new(
                    *device,
                    sequence,
                    gateway,
                    snr - i as f64,
                    format!("reading {}", sequence).into_bytes(),
                );
                if sequence == 2 {
                    report = report.with_fopts(vec![LinkCheckReq::CID]);
                }
                controller.submit(report)?;
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        while let Ok(downlink) = downlinks.try_recv() {
            println!(
                "downlink {} #{} via {} in {} after {:?} ({} command bytes, {} payload bytes)",
                downlink.device,
                downlink.sequence,
                downlink.gateway,
                downlink.window.as_str(),
                downlink.delay,
                downlink.fopts.len(),
                downlink.payload.len()
            );
        }
    }

    for device in devices {
        if let Some(quality) = controller.network().link_quality(device)? {
            println!(
                "\n{}: margin {} dB, {} gateways",
                device, quality.margin, quality.gateway_count
            );
        }
    }

    println!("\n{}", controller.stats().report());
    Ok(())
}
