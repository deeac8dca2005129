//! Benchmark suite for the Continuity decoder and registry writes.
//!
//! These are the two steps every received advertisement goes through on the
//! watcher's consumer task.

use airpods_listener::registry::DeviceRegistry;
use airpods_listener::{MacAddress, RawAdvertisement, decode_continuity};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::collections::HashMap;
use std::time::SystemTime;

/// AirPods Pro 2: left 90%, right 60%, case 50%, lid open
const AIRPODS_PAYLOAD: [u8; 8] = [0x07, 0x00, 0x00, 0x14, 0x20, 0x55, 0x96, 0x05];

/// Nearby Info from a phone, not headset telemetry
const PHONE_PAYLOAD: [u8; 8] = [0x10, 0x05, 0x1B, 0x1C, 0x0A, 0x3B, 0x7E, 0x00];

fn advertisement(address: u64, payload: &[u8]) -> RawAdvertisement {
    let mut manufacturer_data = HashMap::new();
    manufacturer_data.insert(0x004C, payload.to_vec());
    RawAdvertisement {
        address: MacAddress::from_u64(address),
        rssi: -60,
        observed_at: SystemTime::UNIX_EPOCH,
        manufacturer_data,
    }
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_continuity");
    group.throughput(Throughput::Elements(1));

    group.bench_function("airpods", |b| {
        b.iter(|| black_box(decode_continuity(black_box(&AIRPODS_PAYLOAD))))
    });

    group.bench_function("not_recognized", |b| {
        b.iter(|| black_box(decode_continuity(black_box(&PHONE_PAYLOAD))))
    });

    group.bench_function("too_short", |b| {
        b.iter(|| black_box(decode_continuity(black_box(&AIRPODS_PAYLOAD[..3]))))
    });

    group.finish();
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    // Same device over and over, the common case while a headset is nearby.
    let registry = DeviceRegistry::new();
    let adv = advertisement(1, &AIRPODS_PAYLOAD);
    group.bench_function("upsert_existing", |b| {
        b.iter(|| {
            registry.upsert(
                black_box(&adv),
                &AIRPODS_PAYLOAD,
                decode_continuity(&AIRPODS_PAYLOAD).ok(),
            )
        })
    });

    // A busy room: 200 Apple devices already recorded.
    let crowded = DeviceRegistry::new();
    for address in 0..200 {
        crowded.upsert(&advertisement(address, &PHONE_PAYLOAD), &PHONE_PAYLOAD, None);
    }
    group.bench_function("contains_telemetry_miss_in_200", |b| {
        b.iter(|| black_box(crowded.contains_matching(|r| r.has_telemetry())))
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_registry);
criterion_main!(benches);
