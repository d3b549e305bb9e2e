//! Benchmarks for QuartzKV store operations

use criterion::{criterion_group, criterion_main, Criterion};
use quartzkv::{Config, Store};
use tempfile::TempDir;

fn store_benchmarks(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(
        Config::builder()
            .data_dir(temp_dir.path())
            .db("bench")
            .namespace("ns")
            .build(),
    )
    .unwrap();

    let value = vec![0u8; 256];
    let mut counter = 0u64;

    c.bench_function("set_buffered_256b", |b| {
        b.iter(|| {
            counter += 1;
            let key = format!("bench-set-{}", counter % 10_000);
            store.set(&key, &value, &[]).unwrap();
        })
    });

    store.set("bench-get", &value, &["hot"]).unwrap();
    store.flush().unwrap();

    c.bench_function("get_hot_256b", |b| {
        b.iter(|| store.get("bench-get").unwrap())
    });

    c.bench_function("query_by_tags_and", |b| {
        b.iter(|| store.query_by_tags(&["hot"]).unwrap())
    });
}

criterion_group!(benches, store_benchmarks);
criterion_main!(benches);
