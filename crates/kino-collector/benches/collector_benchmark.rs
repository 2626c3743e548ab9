//! Benchmark tests for kino-collector operations
//!
//! Run with: cargo bench -p kino-collector

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use kino_collector::manipulator::{DeviceInfo, DeviceInfoManipulator, ManipulatorPipeline};
use kino_collector::testing::{sample_with_sequence, RecordingBackend};
use kino_collector::{
    CollectorConfig, DispatchState, PlayerState, Sample, SampleDispatcher, StateMachine,
    StaticLicenseProvider, TimerService,
};

// ============================================================================
// Helpers
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn enabled_dispatcher(rt: &tokio::runtime::Runtime) -> SampleDispatcher {
    let dispatcher = SampleDispatcher::new(
        Arc::new(RecordingBackend::default()),
        Arc::new(StaticLicenseProvider::granted()),
        rt.handle().clone(),
    );
    let mut status = dispatcher.subscribe_status();
    dispatcher.enable();
    rt.block_on(async {
        status
            .wait_for(|s| *s == DispatchState::Enabled)
            .await
            .unwrap();
    });
    dispatcher
}

// ============================================================================
// State Machine Benchmarks
// ============================================================================

fn bench_transitions(c: &mut Criterion) {
    let rt = runtime();
    let machine = StateMachine::new(
        CollectorConfig::default(),
        TimerService::new(rt.handle().clone()),
    );

    let mut group = c.benchmark_group("State Machine");

    group.bench_function("pause_play_cycle", |b| {
        machine.transition(PlayerState::Playing, 0);
        b.iter(|| {
            machine.pause(black_box(1_000));
            machine.transition(PlayerState::Playing, black_box(1_000));
        });
    });

    group.bench_function("quality_change_cycle", |b| {
        machine.transition(PlayerState::Playing, 0);
        b.iter(|| {
            machine.transition(PlayerState::QualityChange, black_box(0));
            machine.transition(PlayerState::Playing, black_box(0));
        });
    });

    group.bench_function("reset", |b| {
        b.iter(|| {
            machine.reset();
            black_box(machine.impression_id())
        });
    });

    group.finish();
}

// ============================================================================
// Dispatch Benchmarks
// ============================================================================

fn bench_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("Dispatch");

    for &count in &[1, 10, 100] {
        group.bench_with_input(BenchmarkId::new("add_enabled", count), &count, |b, &count| {
            let dispatcher = enabled_dispatcher(&rt);
            b.iter(|| {
                for _ in 0..count {
                    dispatcher.add(sample_with_sequence(0));
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("queue_then_drain", count), &count, |b, &count| {
            b.iter(|| {
                let dispatcher = SampleDispatcher::new(
                    Arc::new(RecordingBackend::default()),
                    Arc::new(StaticLicenseProvider::granted()),
                    rt.handle().clone(),
                );
                for _ in 0..count {
                    dispatcher.add(sample_with_sequence(0));
                }
                let mut status = dispatcher.subscribe_status();
                dispatcher.enable();
                rt.block_on(async {
                    status
                        .wait_for(|s| *s == DispatchState::Enabled)
                        .await
                        .unwrap();
                });
            });
        });
    }

    group.finish();
}

// ============================================================================
// Sample Benchmarks
// ============================================================================

fn bench_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sample");

    let mut pipeline = ManipulatorPipeline::new();
    pipeline.register(Arc::new(DeviceInfoManipulator::new(DeviceInfo::host())));
    pipeline.register(Arc::new(|s: &mut Sample| s.video_bitrate = Some(2_500_000)));

    group.bench_function("decorate", |b| {
        b.iter(|| {
            let mut sample = sample_with_sequence(0);
            pipeline.decorate(&mut sample);
            black_box(sample)
        });
    });

    group.bench_function("serialize", |b| {
        let sample = sample_with_sequence(42);
        b.iter(|| black_box(serde_json::to_vec(&sample).unwrap()));
    });

    group.finish();
}

criterion_group!(
    state_benches,
    bench_transitions,
);

criterion_group!(
    dispatch_benches,
    bench_dispatch,
);

criterion_group!(
    sample_benches,
    bench_samples,
);

criterion_main!(
    state_benches,
    dispatch_benches,
    sample_benches,
);
