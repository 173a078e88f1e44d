//! Microbenchmarks for the write path.
//!
//! Measures framed WAL appends, rollup application, and the coupled
//! ingest path through the coordinator.
//!
//! Run with: `cargo bench -p rollwal -- append`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rollwal::cluster::ManualClock;
use rollwal::wal::batch::encode_batch;
use rollwal::wal::{CounterFramer, FsyncPolicy, SpilloverWriter, WalEvent};
use rollwal::{Collaborators, EngineConfig, RollupBackend, ShardMap, WriteContext, WriteCoordinator};
use tempfile::tempdir;

const NOW: u64 = 1_700_000_000_000;

fn event(points: usize) -> Vec<u8> {
    let event = WalEvent {
        shard: 0,
        series: "host.cpu.user".to_string(),
        timestamps: (0..points as u64).map(|i| NOW + i).collect(),
        values: (0..points).map(|i| i as f64).collect(),
    };
    encode_batch(&[event.encode().unwrap()]).unwrap()
}

fn bench_wal_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append/wal_points");

    for points in [1, 16, 256] {
        let dir = tempdir().unwrap();
        let mut writer = SpilloverWriter::open(
            dir.path(),
            CounterFramer::new(),
            64 * 1024 * 1024,
            FsyncPolicy::Manual,
        )
        .unwrap();
        let payload = event(points);

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(points), &points, |b, _| {
            b.iter(|| writer.write(black_box(&payload)).unwrap());
        });
    }

    group.finish();
}

fn bench_rollup_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("append/rollup_points");
    let ctx = WriteContext::default();

    for points in [1, 16, 256] {
        let map = ShardMap::new(Arc::new(ManualClock::new(NOW)), Duration::ZERO);
        let timestamps: Vec<u64> = (0..points as u64).map(|i| NOW + i * 1000).collect();
        let values: Vec<f64> = (0..points).map(|i| i as f64).collect();

        group.throughput(Throughput::Elements(points as u64));
        group.bench_with_input(BenchmarkId::from_parameter(points), &points, |b, _| {
            b.iter(|| {
                map.apply(0, &ctx, black_box("host.cpu.user"), &timestamps, &values)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_coordinator_ingest(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::with_root(dir.path());
    config.snapshot.debounce = Duration::from_secs(3600);
    config.rollup.admission_window = Duration::ZERO;
    let collaborators = Collaborators::local("local", 16).with_clock(Arc::new(ManualClock::new(NOW)));
    let coordinator = WriteCoordinator::open(config, collaborators).unwrap();
    let ctx = WriteContext::default();
    let mut ts = NOW;

    c.bench_function("append/coordinator_ingest", |b| {
        b.iter(|| {
            ts += 1000;
            coordinator
                .ingest(&ctx, black_box("host.cpu.user"), &[ts], &[black_box(42.5)])
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_wal_append,
    bench_rollup_apply,
    bench_coordinator_ingest,
);
criterion_main!(benches);
