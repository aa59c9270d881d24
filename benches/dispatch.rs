/* Benchmarks for task dispatch and the blocking call bridge */
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

use homepost::{Dispatcher, Run, RunConfig, Target, Task, DEFAULT_TIME_SLICE};

fn bench_task_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("task/lifecycle");

    group.bench_function("new", |b| {
        b.iter(|| black_box(Task::new(|| {})));
    });

    group.bench_function("new_run", |b| {
        b.iter(|| {
            let task = Task::new(|| {});
            task.run();
            black_box(task)
        });
    });

    group.bench_function("new_cancel", |b| {
        b.iter(|| {
            let task = Task::new(|| {});
            task.cancel();
            black_box(task)
        });
    });

    group.finish();
}

fn bench_dispatcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher/offer_drain");

    for batch in [1usize, 64, 1024] {
        group.bench_function(format!("batch_{batch}"), |b| {
            let dispatcher = Arc::new(Dispatcher::new(DEFAULT_TIME_SLICE, || Ok(())));
            b.iter_batched(
                || {
                    (0..batch)
                        .map(|_| Task::new(|| {}))
                        .collect::<Vec<_>>()
                },
                |tasks| {
                    for task in tasks {
                        dispatcher.offer(task).unwrap();
                    }
                    dispatcher.drain();
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_blocking_call(c: &mut Criterion) {
    let run = Run::new(RunConfig::default());

    let mut group = c.benchmark_group("run/round_trip");

    group.bench_function("call", |b| {
        b.iter(|| black_box(run.call(|| 1).unwrap()));
    });

    group.bench_function("post_home_async", |b| {
        b.iter(|| black_box(run.post(Target::HomeAsync, || {}).unwrap()));
    });

    group.finish();

    run.dispose();
}

criterion_group!(
    benches,
    bench_task_lifecycle,
    bench_dispatcher,
    bench_blocking_call
);
criterion_main!(benches);
