use criterion::{Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ragkit::embeddings::Embedding;
use ragkit::index::VectorIndex;
use std::hint::black_box;

fn random_embeddings(count: usize, dimension: usize, seed: u64) -> Vec<Embedding> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let raw = (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect();
            Embedding::from_raw(raw).expect("random vector is valid")
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let vectors = random_embeddings(2_000, 384, 1);
    let queries = random_embeddings(32, 384, 2);

    c.bench_function("index_build", |b| {
        b.iter(|| VectorIndex::build(black_box(&vectors), 10))
    });

    let index = VectorIndex::build(&vectors, 10).expect("index builds");
    c.bench_function("index_query", |b| {
        b.iter(|| {
            for query in &queries {
                black_box(index.query(black_box(query), 5).expect("query succeeds"));
            }
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
