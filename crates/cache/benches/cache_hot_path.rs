use bytes::Bytes;
use cache::{Arguments, CacheKey, CacheStore, TtlCache};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;

fn bench_cache(c: &mut Criterion) {
    let cache = TtlCache::new(4096, 16, Duration::from_secs(60));
    let keys: Vec<CacheKey> = (0..1024)
        .map(|i| {
            let args = Arguments::new().with("folder", "/prod").with("page", i);
            CacheKey::new("list-hosts", &args)
        })
        .collect();
    for key in &keys {
        cache.put(key.clone(), Bytes::from_static(b"{\"value\":[]}"), Duration::from_secs(60));
    }

    c.bench_function("key_encode", |b| {
        let args = Arguments::new()
            .with("folder", "/prod/eu")
            .with("filter", serde_json::json!({"state": "down", "site": "east"}))
            .with("limit", 100);
        b.iter(|| CacheKey::new(black_box("list-hosts"), black_box(&args)))
    });

    c.bench_function("get_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(cache.get(&keys[i]))
        })
    });

    c.bench_function("put_overwrite", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            cache.put(keys[i].clone(), Bytes::from_static(b"{}"), Duration::from_secs(60));
        })
    });
}

criterion_group!(benches, bench_cache);
criterion_main!(benches);
