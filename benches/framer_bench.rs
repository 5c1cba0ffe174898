/*
Measures the cost of turning one raw telemetry bundle into an observation frame
(ragged tick repair, resampling to the fixed window, gear expansion) for the cloud
and field interface shapes. Bundles come from the simulated vehicle so their
raggedness matches what the capture worker actually sees.
*/

use std::{hint::black_box, time::Duration};

use criterion::{Criterion, criterion_group, criterion_main};

use vcu_pipeline::{
    config::vehicles::VehicleRegistry,
    conn::{
        ProtocolClient, RawSignalBundle,
        sim::{FlashBackend, SimVehicle},
    },
    vehicle::framer::Framer,
};

fn sample_bundles(vid: &str, n: usize) -> (Framer, Vec<RawSignalBundle>) {
    let registry = VehicleRegistry::builtin();
    let profile = registry.by_vid(vid).expect("builtin vehicle");
    let duration = profile.interface.capture_duration();
    let mut sim = SimVehicle::new(profile.interface.geometry(), 7, FlashBackend::Loopback).unpaced();
    let bundles = (0..n)
        .map(|_| sim.get_signals(duration, duration + Duration::from_secs(1)).expect("sim bundle"))
        .collect();
    (Framer::for_profile(profile), bundles)
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");
    for vid in ["VB7", "M2"] {
        let (framer, bundles) = sample_bundles(vid, 16);
        group.bench_function(format!("frame_{vid}"), |b| {
            let mut i = 0;
            b.iter(|| {
                let frame = framer.frame(black_box(&bundles[i % bundles.len()]));
                i += 1;
                black_box(frame.map(|f| f.work_joules()).ok())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_frame);
criterion_main!(benches);
