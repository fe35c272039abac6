use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use kvsql::{Context, EngineConfig, Generic, InsertStrategy};

fn open_engine(strategy: InsertStrategy) -> Generic {
    Generic::open_with_config(&EngineConfig {
        insert_strategy: Some(strategy),
        ..EngineConfig::default()
    })
    .expect("open in-memory engine")
}

/// Fills `prefix` with `keys` keys, each written `versions` times.
fn populate(engine: &Generic, prefix: &str, keys: usize, versions: usize) {
    let ctx = Context::background();
    for k in 0..keys {
        let key = format!("{}{}", prefix, k);
        let mut prev = 0;
        for v in 0..versions {
            let value = format!("value{}", v);
            prev = engine
                .insert(&ctx, &key, prev == 0, false, 0, prev, 0, value.as_bytes(), None)
                .expect("insert");
        }
    }
}

// ============================================================================
// Benchmark: Insert
// ============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    for strategy in [InsertStrategy::Returning, InsertStrategy::LastInsertId] {
        let engine = open_engine(strategy);
        let ctx = Context::background();
        let mut counter = 0u64;
        group.bench_function(BenchmarkId::new("strategy", format!("{:?}", strategy)), |b| {
            b.iter(|| {
                counter += 1;
                engine
                    .insert(
                        &ctx,
                        &format!("bench/key{}", counter),
                        true,
                        false,
                        0,
                        0,
                        0,
                        black_box(b"value"),
                        None,
                    )
                    .expect("insert")
            })
        });
    }

    for size in [10usize, 1000, 10000] {
        group.throughput(Throughput::Bytes(size as u64));
        let engine = open_engine(InsertStrategy::Returning);
        let ctx = Context::background();
        let value = "x".repeat(size);
        let mut counter = 0u64;
        group.bench_with_input(BenchmarkId::new("value_size", size), &size, |b, _| {
            b.iter(|| {
                counter += 1;
                let key = format!("bench/key{}", counter);
                engine
                    .insert(&ctx, &key, true, false, 0, 0, 0, value.as_bytes(), None)
                    .expect("insert")
            })
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: List
// ============================================================================

fn bench_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("list");
    group.sample_size(50);

    for keys in [10usize, 100, 1000] {
        let engine = open_engine(InsertStrategy::Returning);
        populate(&engine, "/registry/pods/", keys, 3);
        let ctx = Context::background();
        let rev = engine.current_revision(&ctx).expect("revision");

        group.throughput(Throughput::Elements(keys as u64));
        group.bench_with_input(BenchmarkId::new("current", keys), &keys, |b, _| {
            b.iter(|| {
                engine
                    .list_current(&ctx, black_box("/registry/pods/"), 0, false)
                    .expect("list")
            })
        });
        group.bench_with_input(BenchmarkId::new("at_revision", keys), &keys, |b, _| {
            b.iter(|| {
                engine
                    .list(&ctx, black_box("/registry/pods/"), "", 0, rev / 2, false)
                    .expect("list")
            })
        });
        group.bench_with_input(BenchmarkId::new("count", keys), &keys, |b, _| {
            b.iter(|| engine.count(&ctx, black_box("/registry/pods/")).expect("count"))
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: After
// ============================================================================

fn bench_after(c: &mut Criterion) {
    let engine = open_engine(InsertStrategy::Returning);
    populate(&engine, "/registry/events/", 200, 5);
    let ctx = Context::background();
    let rev = engine.current_revision(&ctx).expect("revision");

    c.bench_function("after_last_100", |b| {
        b.iter(|| {
            engine
                .after(&ctx, "/registry/", black_box(rev - 100), 0)
                .expect("after")
        })
    });
}

criterion_group!(benches, bench_insert, bench_list, bench_after);
criterion_main!(benches);
