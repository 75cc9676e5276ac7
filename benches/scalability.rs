//! Scalability benchmarks for the scene stream scheduler
//!
//! Measures per-element scoring, queue churn and full ticks at growing
//! scene sizes and observer counts.
//!
//! Run with: cargo bench --bench scalability

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use scene_stream_server::config::ServerConfig;
use scene_stream_server::metrics::Metrics;
use scene_stream_server::net::packet_time_window::PacketTimeWindow;
use scene_stream_server::scheduler::{
    BudgetPolicy, Candidate, EntityId, EntityPriorityQueue, ObserverScheduler, SceneElement, StreamServer,
};
use scene_stream_server::simulation::{SceneCube, Simulation};
use scene_stream_server::util::vec3::Vec3;
use scene_stream_server::view::bounds::AACube;
use scene_stream_server::view::conical::ConicalView;
use scene_stream_server::view::frustum::ViewFrustum;
use uuid::Uuid;

/// Randomly scattered cubes around the origin
fn create_cubes(count: usize) -> Vec<Arc<SceneCube>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let corner = Vec3::new(
                rng.gen_range(-200.0..200.0),
                rng.gen_range(-200.0..200.0),
                rng.gen_range(-200.0..200.0),
            );
            let scale = rng.gen_range(0.5..8.0);
            Arc::new(SceneCube::new(AACube::new(corner, scale), rng.gen_range(64..1400)))
        })
        .collect()
}

fn create_view() -> ConicalView {
    let mut view = ConicalView::new();
    view.set(&[ViewFrustum::looking_at(Vec3::new(0.0, 0.0, -250.0), Vec3::Z)]);
    view
}

/// Benchmark view scoring over many volumes
fn bench_compute_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_priority");
    group.sample_size(50);

    let view = create_view();
    for count in [1_000, 10_000, 100_000] {
        let volumes: Vec<AACube> = create_cubes(count).iter().map(|cube| cube.bounds()).collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("conical_view", count), &count, |b, _| {
            b.iter(|| {
                let visible = volumes
                    .iter()
                    .filter(|volume| view.compute_priority(*volume) > 0.0)
                    .count();
                black_box(visible)
            });
        });
    }

    group.finish();
}

/// Benchmark queue emplace and drain
fn bench_priority_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue");
    group.sample_size(50);

    for count in [1_000, 10_000, 100_000] {
        let cubes = create_cubes(count);
        let mut rng = rand::thread_rng();
        let priorities: Vec<f32> = (0..count).map(|_| rng.gen_range(0.0..1.0)).collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("emplace_pop", count), &count, |b, _| {
            b.iter(|| {
                let mut queue = EntityPriorityQueue::with_capacity(count);
                for (i, (cube, priority)) in cubes.iter().zip(&priorities).enumerate() {
                    let _ = queue.emplace(EntityId(i as u64), Arc::downgrade(cube), *priority, false);
                }
                while let Some(entry) = queue.pop() {
                    black_box(entry.priority());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark one observer scoring a full scene traversal
fn bench_observer_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("observer_tick");
    group.sample_size(30);

    let config = ServerConfig::default();
    let policy = BudgetPolicy::from_config(&config);
    let frustum = ViewFrustum::looking_at(Vec3::new(0.0, 0.0, -250.0), Vec3::Z);

    for count in [1_000, 10_000, 50_000] {
        let cubes = create_cubes(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("full_traversal", count), &count, |b, _| {
            b.iter_batched(
                || {
                    let mut observer = ObserverScheduler::new(Uuid::new_v4(), policy, PacketTimeWindow::default());
                    observer.set_view(&[frustum]);
                    observer
                },
                |mut observer| {
                    let candidates = cubes
                        .iter()
                        .enumerate()
                        .map(|(i, cube)| Candidate::update(EntityId(i as u64), cube, cube.bounds()));
                    let mut out = Vec::new();
                    let stats = observer.tick(candidates, &mut out);
                    black_box((stats, out.len()))
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark scene-wide ticks at various observer counts
fn bench_server_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_tick");
    group.sample_size(20);

    for observers in [8, 32, 128] {
        let config = ServerConfig {
            sim_observers: observers,
            sim_scene_size: 16,
            max_observers: observers,
            arrival_buffer_capacity: 1 << 20,
            ..ServerConfig::default()
        };
        let mut simulation = Simulation::new(&config, 7);
        let mut server = StreamServer::new(config.clone(), Arc::new(Metrics::new()));
        simulation.connect_all(&mut server);
        let sender = server.arrival_sender();
        let tick_interval = config.tick_interval();

        group.throughput(Throughput::Elements(observers as u64));
        group.bench_with_input(BenchmarkId::new("simulated", observers), &observers, |b, _| {
            b.iter(|| {
                simulation.advance(tick_interval, &sender);
                let report = server.tick(|observer| simulation.candidates_for(observer.id()));
                simulation.finish_tick(&report);
                black_box(report.stats.elements_sent)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_compute_priority,
    bench_priority_queue,
    bench_observer_tick,
    bench_server_tick,
);

criterion_main!(benches);
