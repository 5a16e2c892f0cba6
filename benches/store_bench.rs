use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ouroboros_cache::backend::MemoryBackend;
use ouroboros_cache::cache::{CacheEntry, CacheOptions, CacheTier, TieredCache};
use ouroboros_cache::invalidation::{resolve_template, EntityOperation, InvalidationEvent};
use ouroboros_cache::CacheSettings;
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

fn store() -> TieredCache {
    let settings = CacheSettings::builder().key_prefix("bench").build();
    TieredCache::new(Arc::new(MemoryBackend::new()), &settings)
}

fn bench_get_set(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("build runtime");
    let cache = store();
    let opts = CacheOptions::new().namespace("neo4j").tier(CacheTier::Hot);
    let value = json!({"id": "req-1", "title": "Login", "tags": ["auth", "ui"]});

    runtime.block_on(cache.set("requirement:req:1", &value, &opts));

    c.bench_function("store/set", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(cache.set("requirement:req:2", &value, &opts).await);
        });
    });

    c.bench_function("store/get_hit", |b| {
        b.to_async(&runtime).iter(|| async {
            let hit: Option<serde_json::Value> = cache.get("requirement:req:1", &opts).await;
            black_box(hit);
        });
    });

    c.bench_function("store/get_miss", |b| {
        b.to_async(&runtime).iter(|| async {
            let miss: Option<serde_json::Value> = cache.get("requirement:req:404", &opts).await;
            black_box(miss);
        });
    });
}

fn bench_entry_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry/encode");
    for size in [256usize, 4 * 1024, 64 * 1024] {
        let value = json!({ "body": "x".repeat(size) });
        group.bench_with_input(BenchmarkId::from_parameter(size), &value, |b, value| {
            b.iter(|| {
                let entry = CacheEntry::encode(value, CacheTier::Warm, None, false, 10 * 1024)
                    .expect("encode entry");
                black_box(entry.compressed);
            });
        });
    }
    group.finish();
}

fn bench_template_resolution(c: &mut Criterion) {
    let event = InvalidationEvent::new("requirement", "42", EntityOperation::Update)
        .with_data(json!({"projectId": "p1"}));

    c.bench_function("invalidation/resolve_template", |b| {
        b.iter(|| black_box(resolve_template("*project*{data.projectId}*{entityId}*", &event)));
    });
}

criterion_group!(
    benches,
    bench_get_set,
    bench_entry_encoding,
    bench_template_resolution
);
criterion_main!(benches);
