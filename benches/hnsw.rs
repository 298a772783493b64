//! Build and search benchmarks on synthetic data.
//!
//! For reproducible comparisons use standardized datasets (SIFT, GloVe)
//! loaded through `proxima::npy`; the synthetic numbers here are only for
//! tracking regressions.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use proxima::metric::DenseL2;
use proxima::{DenseMatrix, HnswConfig, HnswIndex, PqConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_matrix(rows: usize, dim: usize, seed: u64) -> DenseMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..rows * dim).map(|_| rng.random::<f32>()).collect();
    DenseMatrix::from_vec(rows, dim, values).unwrap()
}

fn build_config() -> HnswConfig {
    HnswConfig {
        m: 16,
        ef_construction: 100,
        threads: 1,
        seed: Some(42),
        ..HnswConfig::default()
    }
}

fn bench_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("construction");
    group.sample_size(10);
    let dim = 64;

    for &n in &[1000usize, 5000] {
        group.throughput(Throughput::Elements(n as u64));
        let x = random_matrix(n, dim, 42);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| HnswIndex::<DenseL2>::train(black_box(&x), &build_config()).unwrap());
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let dim = 64;
    let x = random_matrix(10_000, dim, 42);
    let queries = random_matrix(100, dim, 123);
    let index = HnswIndex::<DenseL2>::train(&x, &build_config()).unwrap();

    for &ef in &[10usize, 50, 100, 200] {
        group.throughput(Throughput::Elements(queries.rows() as u64));
        group.bench_with_input(BenchmarkId::new("ef", ef), &ef, |bench, &ef| {
            let mut searcher = index.searcher();
            bench.iter(|| {
                for qi in 0..queries.rows() {
                    black_box(searcher.search(queries.row(qi), ef, 10).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_quantized_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantized_search");
    let dim = 64;
    let x = random_matrix(10_000, dim, 42);
    let queries = random_matrix(100, dim, 123);
    let index = HnswIndex::<DenseL2>::train_with_quantizer(
        &x,
        &build_config(),
        &PqConfig {
            num_codebooks: 8,
            seed: 42,
            ..PqConfig::default()
        },
    )
    .unwrap();

    for &ef in &[50usize, 100] {
        group.throughput(Throughput::Elements(queries.rows() as u64));
        group.bench_with_input(BenchmarkId::new("ef", ef), &ef, |bench, &ef| {
            let mut searcher = index.searcher();
            bench.iter(|| {
                for qi in 0..queries.rows() {
                    black_box(searcher.search(queries.row(qi), ef, 10).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_construction, bench_search, bench_quantized_search);
criterion_main!(benches);
