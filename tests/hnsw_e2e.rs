//! End-to-end scenarios for the graph index.

use proxima::metric::{DenseAngular, DenseL2, Distance};
use proxima::{DenseMatrix, HnswConfig, HnswIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Standard-normal vectors via Box-Muller, seeded.
fn gaussian_matrix(rows: usize, dim: usize, seed: u64) -> DenseMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(rows * dim);
    while values.len() < rows * dim {
        let u1: f64 = rng.random::<f64>().max(1e-12);
        let u2: f64 = rng.random();
        let r = (-2.0 * u1.ln()).sqrt();
        values.push((r * (2.0 * std::f64::consts::PI * u2).cos()) as f32);
        if values.len() < rows * dim {
            values.push((r * (2.0 * std::f64::consts::PI * u2).sin()) as f32);
        }
    }
    DenseMatrix::from_vec(rows, dim, values).unwrap()
}

fn normalize_matrix(x: &DenseMatrix) -> DenseMatrix {
    let rows: Vec<Vec<f32>> = (0..x.rows())
        .map(|i| proxima::simd::normalize(x.row(i)))
        .collect();
    DenseMatrix::from_rows(rows).unwrap()
}

/// Exact top-k by the same (distance, id) order the index reports.
fn brute_force_topk<D: Distance>(x: &DenseMatrix, query: &[f32], k: usize) -> Vec<u32> {
    let mut all: Vec<(f32, u32)> = (0..x.rows())
        .map(|i| (D::distance(query, x.row(i)), i as u32))
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    all.into_iter().take(k).map(|(_, id)| id).collect()
}

fn mean_recall<D: Distance>(
    index: &HnswIndex<D>,
    x: &DenseMatrix,
    queries: &DenseMatrix,
    ef_search: usize,
    k: usize,
) -> f64 {
    let mut searcher = index.searcher();
    let mut hits = 0usize;
    for qi in 0..queries.rows() {
        let query = queries.row(qi);
        let truth = brute_force_topk::<D>(x, query, k);
        let got = searcher.search(query, ef_search, k).unwrap();
        hits += got.iter().filter(|n| truth.contains(&n.id)).count();
    }
    hits as f64 / (queries.rows() * k) as f64
}

#[test]
fn tiny_l2_returns_the_three_near_points() {
    let x = DenseMatrix::from_rows([
        [0.0f32, 0.0],
        [1.0, 0.0],
        [0.0, 1.0],
        [10.0, 10.0],
    ])
    .unwrap();
    let index = HnswIndex::<DenseL2>::train(
        &x,
        &HnswConfig {
            m: 4,
            ef_construction: 8,
            threads: 1,
            seed: Some(1),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let hits = index.search(&[0.1, 0.1], 8, 3).unwrap();
    let ids: Vec<u32> = hits.iter().map(|n| n.id).collect();
    // (1,0) and (0,1) tie at 0.82; ascending id breaks it.
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(hits[0].distance < hits[1].distance);
    assert_eq!(hits[1].distance, hits[2].distance);
}

#[test]
fn duplicate_points_all_resolve_to_the_queried_vector() {
    let mut rows = Vec::new();
    for _ in 0..100 {
        rows.push(vec![1.0f32, 0.0]);
    }
    for _ in 0..100 {
        rows.push(vec![0.0f32, 1.0]);
    }
    let x = DenseMatrix::from_rows(rows).unwrap();
    let index = HnswIndex::<DenseL2>::train(
        &x,
        &HnswConfig {
            m: 8,
            ef_construction: 16,
            threads: 1,
            seed: Some(2),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let hits = index.search(&[1.0, 0.0], 16, 10).unwrap();
    assert_eq!(hits.len(), 10);
    for n in &hits {
        assert!(n.id < 100, "id {} maps to the wrong duplicate cluster", n.id);
        assert_eq!(n.distance, 0.0);
    }
}

#[test]
fn l2_recall_on_gaussian_data() {
    let x = gaussian_matrix(1000, 16, 31);
    let queries = gaussian_matrix(100, 16, 32);
    let index = HnswIndex::<DenseL2>::train(
        &x,
        &HnswConfig {
            m: 16,
            ef_construction: 100,
            threads: 1,
            seed: Some(3),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let recall = mean_recall(&index, &x, &queries, 100, 10);
    assert!(recall >= 0.95, "recall@10 was {recall}");
}

#[test]
fn angular_recall_on_normalized_gaussian_data() {
    let x = normalize_matrix(&gaussian_matrix(1000, 16, 41));
    let queries = normalize_matrix(&gaussian_matrix(100, 16, 42));
    let index = HnswIndex::<DenseAngular>::train(
        &x,
        &HnswConfig {
            m: 16,
            ef_construction: 100,
            threads: 1,
            seed: Some(4),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let recall = mean_recall(&index, &x, &queries, 100, 10);
    assert!(recall >= 0.95, "angular recall@10 was {recall}");
}

#[test]
fn recall_does_not_degrade_with_a_wider_beam() {
    let x = gaussian_matrix(800, 16, 51);
    let queries = gaussian_matrix(60, 16, 52);
    let index = HnswIndex::<DenseL2>::train(
        &x,
        &HnswConfig {
            m: 12,
            ef_construction: 80,
            threads: 1,
            seed: Some(5),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let narrow = mean_recall(&index, &x, &queries, 10, 10);
    let wide = mean_recall(&index, &x, &queries, 100, 10);
    // Monotone within statistical noise.
    assert!(
        wide + 0.02 >= narrow,
        "recall fell from {narrow} to {wide} as efS grew"
    );
}

#[test]
fn save_load_round_trip_is_bit_identical_over_a_query_batch() {
    let x = gaussian_matrix(5000, 16, 61);
    let queries = gaussian_matrix(1000, 16, 62);
    let index = HnswIndex::<DenseL2>::train(
        &x,
        &HnswConfig {
            m: 16,
            ef_construction: 60,
            threads: 1,
            seed: Some(6),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    index.save(dir.path()).unwrap();
    let loaded = HnswIndex::<DenseL2>::load(dir.path()).unwrap();

    let before = index.search_batch(&queries, 40, 10).unwrap();
    let after = loaded.search_batch(&queries, 40, 10).unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.len(), b.len());
        for (na, nb) in a.iter().zip(b.iter()) {
            assert_eq!(na.id, nb.id);
            assert_eq!(na.distance.to_bits(), nb.distance.to_bits());
        }
    }
}

#[test]
fn batch_search_matches_single_queries() {
    let x = gaussian_matrix(500, 8, 71);
    let queries = gaussian_matrix(20, 8, 72);
    let index = HnswIndex::<DenseL2>::train(
        &x,
        &HnswConfig {
            m: 8,
            ef_construction: 40,
            threads: 2,
            seed: Some(7),
            ..HnswConfig::default()
        },
    )
    .unwrap();

    let batch = index.search_batch(&queries, 30, 5).unwrap();
    let mut searcher = index.searcher();
    for (qi, batch_hits) in batch.iter().enumerate() {
        let single = searcher.search(queries.row(qi), 30, 5).unwrap();
        assert_eq!(
            batch_hits.iter().map(|n| n.id).collect::<Vec<_>>(),
            single.iter().map(|n| n.id).collect::<Vec<_>>()
        );
    }
}
