//! Performance benchmarks for snapshot projection and resubscription.

use authsync::{Identity, IdentityProvider, MemoryAuth, ProjectionStore, ProviderConfig, StoreClient};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone, Debug, Deserialize)]
struct Row {
    id: String,
    rank: u64,
}

fn inbox(c: &StoreClient, identity: Option<&Identity>) -> authsync::Reference {
    c.collection(format!("users/{}/rows", identity.map(|i| i.id.as_str()).unwrap_or("-")))
}

/// Benchmark a write that re-projects a collection of varying size
fn bench_collection_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_update");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("records", size), &size, |b, &size| {
            let auth = MemoryAuth::new();
            let provider = IdentityProvider::start(&auth, &ProviderConfig::default());
            auth.sign_in("bench");

            for i in 0..size {
                auth.store()
                    .set(
                        &format!("users/bench/rows/r{:05}", i),
                        json!({"rank": (i * 7919) % 1000, "label": format!("row {}", i)}),
                    )
                    .unwrap();
            }

            let rows = ProjectionStore::<Vec<Row>>::collection(inbox)
                .include_ids(true)
                .sort_by(|a: &Row, b: &Row| a.rank.cmp(&b.rank).then_with(|| a.id.cmp(&b.id)))
                .mount(&provider);

            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                auth.store()
                    .set("users/bench/rows/r00000", json!({"rank": n % 1000, "label": "hot"}))
                    .unwrap();
                black_box(rows.value().len());
            });
        });
    }

    group.finish();
}

/// Benchmark identity switches across many mounted stores
fn bench_identity_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_switch");

    for stores in [1, 10, 100] {
        group.bench_with_input(BenchmarkId::new("stores", stores), &stores, |b, &stores| {
            let auth = MemoryAuth::new();
            let provider = IdentityProvider::start(&auth, &ProviderConfig::default());
            let mounted: Vec<_> = (0..stores)
                .map(|_| ProjectionStore::<Vec<serde_json::Value>>::collection(inbox).mount(&provider))
                .collect();

            let mut flip = false;
            b.iter(|| {
                flip = !flip;
                auth.sign_in(if flip { "a" } else { "b" });
                black_box(mounted.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_collection_update, bench_identity_switch);
criterion_main!(benches);
