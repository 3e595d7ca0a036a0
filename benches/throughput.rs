//! Benchmarks for Lorastar command codec and report ingestion

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lorastar::protocol::Direction;
use lorastar::{
    decode_commands, encode_commands, Command, DevAddr, GatewayId, GatewayReport, LinkCheckAns,
    LinkCheckReq, MacCommand, Network,
};
use std::time::Instant;

fn generate_reports(devices: u32, gateways: u64, sequence: u32) -> Vec<GatewayReport> {
    (0..devices)
        .flat_map(|d| {
            (0..gateways).map(move |gw| {
                let snr = ((d as u64 * 7 + gw * 3) % 30) as f64 - 20.0;
                GatewayReport::new(DevAddr(d), sequence, GatewayId(gw), snr, vec![0u8; 12])
            })
        })
        .collect()
}

fn bench_command_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_codec");

    let answers: Vec<MacCommand> = (0..5)
        .map(|i| LinkCheckAns::new(10 + i, 3).into())
        .collect();
    let encoded = encode_commands(&answers).unwrap();

    group.throughput(Throughput::Elements(1000));

    group.bench_function("encode_1000_blocks", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(encode_commands(black_box(&answers)).ok());
            }
        })
    });

    group.bench_function("decode_1000_blocks", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(decode_commands(Direction::Downlink, black_box(&encoded)));
            }
        })
    });

    group.finish();
}

fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");

    let devices = 200;
    let gateways = 5;
    let reports = generate_reports(devices, gateways, 1);

    group.throughput(Throughput::Elements(reports.len() as u64));

    group.bench_function("submit_and_finalize_1000", |b| {
        b.iter(|| {
            let network = Network::new();
            for d in 0..devices {
                network.add_device(DevAddr(d));
            }
            let now = Instant::now();
            for report in &reports {
                black_box(network.submit_report(report.clone(), now));
            }
            for d in 0..devices {
                black_box(network.finalize(DevAddr(d), 1, now));
            }
        })
    });

    group.finish();
}

fn bench_link_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_check");

    let fopts = vec![LinkCheckReq::CID];
    group.bench_function("answer_1000", |b| {
        b.iter(|| {
            let network = Network::new();
            let device = DevAddr(1);
            network.add_device(device);
            let now = Instant::now();
            for sequence in 1..=1000 {
                let report = GatewayReport::new(device, sequence, GatewayId(1), 3.0, vec![])
                    .with_fopts(fopts.clone());
                network.submit_report(report, now);
                black_box(network.finalize(device, sequence, now));
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_command_codec, bench_submit, bench_link_check);
criterion_main!(benches);
