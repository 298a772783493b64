//! Property tests for graph invariants and quantizer determinism.
//!
//! These verify conditions that should hold for any input:
//! - degrees never exceed their caps, at any level
//! - no edge is a self-loop
//! - every node is reachable from the entry point over level-0 edges
//! - neighbor lists are sorted ascending by distance to their owner
//! - persisted indexes answer queries identically
//! - encoding is a pure function of the input vector

use proptest::prelude::*;
use proxima::metric::{DenseL2, Distance};
use proxima::{DenseMatrix, HnswConfig, HnswIndex, PqConfig, ProductQuantizer4Bits};
use std::collections::VecDeque;

fn arb_matrix(rows: usize, dim: usize) -> impl Strategy<Value = DenseMatrix> {
    prop::collection::vec(-10.0f32..10.0, rows * dim)
        .prop_map(move |values| DenseMatrix::from_vec(rows, dim, values).unwrap())
}

fn build(x: &DenseMatrix, m: usize, seed: u64, threads: usize) -> HnswIndex<DenseL2> {
    HnswIndex::<DenseL2>::train(
        x,
        &HnswConfig {
            m,
            ef_construction: (4 * m).max(32),
            threads,
            max_level_upper_bound: None,
            seed: Some(seed),
        },
    )
    .unwrap()
}

fn check_graph_invariants(index: &HnswIndex<DenseL2>, m: usize) {
    let n = index.num_nodes();
    for node in 0..n as u32 {
        for level in 0..=index.level_of(node) {
            let neighbors = index.neighbors_of(node, level);
            let cap = if level == 0 { 2 * m } else { m };
            assert!(
                neighbors.len() <= cap,
                "node {node} level {level} has degree {} over cap {cap}",
                neighbors.len()
            );
            for &other in &neighbors {
                assert_ne!(other, node, "self-loop at node {node} level {level}");
                assert!((other as usize) < n, "dangling edge to {other}");
            }
        }
    }
}

fn check_reachability(index: &HnswIndex<DenseL2>) {
    let n = index.num_nodes();
    let mut seen = vec![false; n];
    let mut queue = VecDeque::new();
    seen[index.entry_point() as usize] = true;
    queue.push_back(index.entry_point());
    while let Some(node) = queue.pop_front() {
        for next in index.neighbors_of(node, 0) {
            if !seen[next as usize] {
                seen[next as usize] = true;
                queue.push_back(next);
            }
        }
    }
    let reached = seen.iter().filter(|&&s| s).count();
    assert_eq!(reached, n, "only {reached}/{n} nodes reachable from the entry point");
}

fn check_sorted_lists(index: &HnswIndex<DenseL2>, x: &DenseMatrix) {
    for node in 0..index.num_nodes() as u32 {
        for level in 0..=index.level_of(node) {
            let mut prev = f32::NEG_INFINITY;
            for other in index.neighbors_of(node, level) {
                let d = DenseL2::distance(x.row(node as usize), x.row(other as usize));
                assert!(
                    d >= prev,
                    "unsorted list at node {node} level {level}"
                );
                prev = d;
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn graph_invariants_hold_after_serial_build(
        x in arb_matrix(160, 8),
        seed in 0u64..1000,
    ) {
        let index = build(&x, 8, seed, 1);
        check_graph_invariants(&index, 8);
        check_reachability(&index);
        check_sorted_lists(&index, &x);
        prop_assert_eq!(index.level_of(index.entry_point()), index.max_level());
    }

    #[test]
    fn graph_invariants_hold_after_parallel_build(
        x in arb_matrix(200, 8),
        seed in 0u64..1000,
    ) {
        let index = build(&x, 8, seed, 4);
        check_graph_invariants(&index, 8);
        check_reachability(&index);
        check_sorted_lists(&index, &x);
    }

    #[test]
    fn loaded_index_answers_identically(
        x in arb_matrix(120, 6),
        queries in prop::collection::vec(-10.0f32..10.0, 5 * 6),
        seed in 0u64..1000,
    ) {
        let index = build(&x, 6, seed, 1);
        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();
        let loaded = HnswIndex::<DenseL2>::load(dir.path()).unwrap();

        for query in queries.chunks_exact(6) {
            let a = index.search(query, 24, 5).unwrap();
            let b = loaded.search(query, 24, 5).unwrap();
            prop_assert_eq!(
                a.iter().map(|n| n.id).collect::<Vec<_>>(),
                b.iter().map(|n| n.id).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn search_is_deterministic_for_a_fixed_index(
        x in arb_matrix(150, 8),
        query in prop::collection::vec(-10.0f32..10.0, 8),
    ) {
        let index = build(&x, 8, 77, 1);
        let a = index.search(&query, 32, 10).unwrap();
        let b = index.search(&query, 32, 10).unwrap();
        prop_assert_eq!(a, b);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn encoding_is_pure_and_reconstruction_is_stable(
        vector in prop::collection::vec(-5.0f32..5.0, 24),
    ) {
        // One fixed quantizer shared across all generated vectors.
        let values: Vec<f32> = (0..400 * 24)
            .map(|i| ((i as u64).wrapping_mul(69621) % 1009) as f32 / 504.5 - 1.0)
            .collect();
        let x = DenseMatrix::from_vec(400, 24, values).unwrap();
        let pq = ProductQuantizer4Bits::train(
            &x,
            &PqConfig { num_codebooks: 6, seed: 13, ..PqConfig::default() },
        )
        .unwrap();

        let mut a = vec![0u8; 6];
        let mut b = vec![0u8; 6];
        pq.encode(&vector, &mut a);
        pq.encode(&vector, &mut b);
        prop_assert_eq!(&a, &b);
        for &code in &a {
            prop_assert!(code < 16);
        }

        // Re-encoding a reconstruction is a fixed point.
        let mut rec = vec![0.0f32; 24];
        pq.reconstruct(&a, &mut rec);
        pq.encode(&rec, &mut b);
        prop_assert_eq!(a, b);
    }
}
