//! Throughput benchmarks for the dual queue/stack.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use terazi_dual::Dual;

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop");

    for batch in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &size| {
            let dual = Dual::new();
            b.iter(|| {
                for i in 0..size {
                    dual.push(i);
                }
                for _ in 0..size {
                    black_box(dual.try_pop());
                }
            });
        });
    }

    group.finish();
}

fn bench_try_pop_empty(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_pop_empty");

    group.bench_function("miss", |b| {
        let dual = Dual::<usize>::new();
        b.iter(|| black_box(dual.try_pop()));
    });

    group.finish();
}

fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("handoff");
    group.sample_size(10);

    group.bench_function("spsc_100k", |b| {
        b.iter(|| {
            const ITEMS: usize = 100_000;
            let dual = Arc::new(Dual::new());
            let consumer = {
                let dual = dual.clone();
                thread::spawn(move || {
                    for _ in 0..ITEMS {
                        black_box(dual.pop());
                    }
                })
            };
            for i in 0..ITEMS {
                dual.push(i);
            }
            consumer.join().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_try_pop_empty, bench_handoff);
criterion_main!(benches);
