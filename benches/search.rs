//! Dot product and top-k search benchmarks
//!
//! Run with: cargo bench --bench search

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use embedstore::{simd, VectorStore};

fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn populated_store(rng: &mut StdRng, dim: usize, n: usize) -> VectorStore {
    let store = VectorStore::with_capacity(dim, n);
    for i in 0..n {
        let doc = json!({
            "id": format!("doc-{i}"),
            "text": "benchmark document",
            "metadata": { "embedding": random_vector(rng, dim) }
        });
        store.add_document_json(&doc.to_string()).unwrap();
    }
    store.finalize();
    store
}

fn bench_dot_product(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut group = c.benchmark_group("dot_product");

    for dim in [128, 384, 768, 1536] {
        group.throughput(Throughput::Elements(dim as u64));

        let a = random_vector(&mut rng, dim);
        let b = random_vector(&mut rng, dim);

        group.bench_function(format!("dim_{dim}"), |bencher| {
            bencher.iter(|| simd::dot_product(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let dim = 384;
    let mut group = c.benchmark_group("search_topk");

    for n in [10_000, 100_000] {
        group.throughput(Throughput::Elements(n as u64));

        let store = populated_store(&mut rng, dim, n);
        let query = simd::l2_normalized(&random_vector(&mut rng, dim));

        group.bench_function(format!("n_{n}_k_10"), |bencher| {
            bencher.iter(|| store.search(black_box(&query), 10))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dot_product, bench_search);
criterion_main!(benches);
