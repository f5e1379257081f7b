use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gpib_session::sim::{MemoryLocks, SimInstrument, SimulatedBus};
use gpib_session::translate::{self, EABO, EDVR};
use gpib_session::{DeviceConfig, Gpib, Session, Status, StatusSnapshot};

fn loopback_session() -> Session<SimulatedBus, MemoryLocks> {
    let bus = Arc::new(SimulatedBus::new());
    bus.attach(0, 3, SimInstrument::loopback());
    let gpib = Gpib::new(bus, Arc::new(MemoryLocks::new()));
    gpib.open(&DeviceConfig::new(0, 3)).unwrap()
}

fn benchmark_translation(c: &mut Criterion) {
    let ok = StatusSnapshot::ok(Status::CMPL | Status::END, 64);
    let timeout = StatusSnapshot::failed(Status::TIMO, EABO, None);
    let os = StatusSnapshot::failed(Status::empty(), EDVR, Some(libc::EIO));

    c.bench_function("check_success", |b| {
        b.iter(|| translate::check("ibrd", black_box(ok)))
    });
    c.bench_function("check_catalog_error", |b| {
        b.iter(|| translate::check("ibrd", black_box(timeout)))
    });
    c.bench_function("check_os_error", |b| {
        b.iter(|| translate::check("ibrd", black_box(os)))
    });
    c.bench_function("status_display", |b| {
        b.iter(|| black_box(Status::CMPL | Status::END | Status::CIC).to_string())
    });
}

fn benchmark_round_trip(c: &mut Criterion) {
    let session = loopback_session();
    let mut group = c.benchmark_group("write_read");
    for size in [16usize, 256, 4096] {
        let payload = vec![b'x'; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                session.write(payload).unwrap();
                black_box(session.read(size).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_translation, benchmark_round_trip);
criterion_main!(benches);
