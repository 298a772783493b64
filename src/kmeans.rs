//! Flat k-means clustering used for codebook training.
//!
//! Lloyd iterations over a k-means++ seeding, with the assignment step
//! parallelized in fixed-size chunks. Convergence is best-effort by
//! contract: whatever the assignments are after `max_iter` rounds is what
//! the caller gets, with no convergence signal.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::simd;

const ASSIGNMENT_CHUNK: usize = 2048;

/// Assign each of the `data.len() / dim` rows to one of `k` clusters.
///
/// Returns one assignment per row, in row order. Deterministic for a fixed
/// `(data, k, seed, max_iter)` regardless of `threads`.
pub fn cluster(
    data: &[f32],
    dim: usize,
    k: usize,
    seed: u64,
    max_iter: usize,
    threads: usize,
) -> Vec<u32> {
    assert!(dim > 0, "cluster: dim must be positive");
    assert_eq!(data.len() % dim, 0, "cluster: ragged input buffer");
    let rows = data.len() / dim;
    if rows == 0 || k == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = seed_centroids(data, rows, dim, k, &mut rng);
    let mut assignments = vec![0u32; rows];

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .expect("failed to build clustering thread pool");

    for _ in 0..max_iter.max(1) {
        pool.install(|| assign_chunked(data, dim, &centroids, &mut assignments));

        // Recompute means; re-seed empty clusters from the farthest rows so a
        // bad init cannot permanently waste centroids.
        let mut counts = vec![0u32; k];
        let mut sums = vec![0.0f32; k * dim];
        for (row, &a) in assignments.iter().enumerate() {
            let c = a as usize;
            counts[c] += 1;
            let src = &data[row * dim..(row + 1) * dim];
            let dst = &mut sums[c * dim..(c + 1) * dim];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        let mut moved = false;
        for c in 0..k {
            if counts[c] > 0 {
                let inv = 1.0 / counts[c] as f32;
                let dst = &mut centroids[c * dim..(c + 1) * dim];
                for (d, &s) in dst.iter_mut().zip(&sums[c * dim..(c + 1) * dim]) {
                    let next = s * inv;
                    if (next - *d).abs() > 1e-7 {
                        moved = true;
                    }
                    *d = next;
                }
            } else {
                let row = farthest_row(data, dim, &centroids, &assignments);
                let src = &data[row * dim..(row + 1) * dim];
                centroids[c * dim..(c + 1) * dim].copy_from_slice(src);
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    pool.install(|| assign_chunked(data, dim, &centroids, &mut assignments));
    assignments
}

/// k-means++ seeding: first centroid uniform, the rest sampled proportional
/// to squared distance from the nearest chosen centroid.
fn seed_centroids(data: &[f32], rows: usize, dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * dim);
    let first = rng.random_range(0..rows);
    centroids.extend_from_slice(&data[first * dim..(first + 1) * dim]);

    let mut best = vec![f32::INFINITY; rows];
    for _ in 1..k {
        let newest = &centroids[centroids.len() - dim..];
        for (row, slot) in best.iter_mut().enumerate() {
            let d = simd::l2_sq(&data[row * dim..(row + 1) * dim], newest);
            if d < *slot {
                *slot = d;
            }
        }
        let total: f64 = best.iter().map(|&d| d as f64).sum();
        let pick = if total <= 0.0 {
            // Remaining rows coincide with chosen centroids; any row will do.
            rng.random_range(0..rows)
        } else {
            let mut threshold = rng.random::<f64>() * total;
            let mut chosen = rows - 1;
            for (row, &d) in best.iter().enumerate() {
                threshold -= d as f64;
                if threshold <= 0.0 {
                    chosen = row;
                    break;
                }
            }
            chosen
        };
        centroids.extend_from_slice(&data[pick * dim..(pick + 1) * dim]);
    }
    centroids
}

fn assign_chunked(data: &[f32], dim: usize, centroids: &[f32], assignments: &mut [u32]) {
    let k = centroids.len() / dim;
    assignments
        .par_chunks_mut(ASSIGNMENT_CHUNK)
        .enumerate()
        .for_each(|(chunk_idx, out)| {
            let base = chunk_idx * ASSIGNMENT_CHUNK;
            for (i, slot) in out.iter_mut().enumerate() {
                let row = &data[(base + i) * dim..(base + i + 1) * dim];
                let mut best = 0u32;
                let mut best_dist = f32::INFINITY;
                for c in 0..k {
                    let d = simd::l2_sq(row, &centroids[c * dim..(c + 1) * dim]);
                    if d < best_dist {
                        best_dist = d;
                        best = c as u32;
                    }
                }
                *slot = best;
            }
        });
}

fn farthest_row(data: &[f32], dim: usize, centroids: &[f32], assignments: &[u32]) -> usize {
    let mut far = 0usize;
    let mut far_dist = -1.0f32;
    for (row, &a) in assignments.iter().enumerate() {
        let c = a as usize;
        let d = simd::l2_sq(
            &data[row * dim..(row + 1) * dim],
            &centroids[c * dim..(c + 1) * dim],
        );
        if d > far_dist {
            far_dist = d;
            far = row;
        }
    }
    far
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<f32> {
        let mut data = Vec::new();
        for i in 0..32 {
            if i % 2 == 0 {
                data.extend_from_slice(&[0.0, 0.1 * (i as f32 % 3.0)]);
            } else {
                data.extend_from_slice(&[10.0, 9.5 + 0.1 * (i as f32 % 3.0)]);
            }
        }
        data
    }

    #[test]
    fn separates_two_blobs() {
        let data = two_blobs();
        let assignments = cluster(&data, 2, 2, 7, 20, 1);
        assert_eq!(assignments.len(), 32);
        // All even rows in one cluster, all odd rows in the other.
        let even = assignments[0];
        for (i, &a) in assignments.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(a, even);
            } else {
                assert_ne!(a, even);
            }
        }
    }

    #[test]
    fn deterministic_given_seed_across_thread_counts() {
        let data = two_blobs();
        let a1 = cluster(&data, 2, 4, 42, 15, 1);
        let a2 = cluster(&data, 2, 4, 42, 15, 4);
        assert_eq!(a1, a2);
    }

    #[test]
    fn handles_k_larger_than_distinct_points() {
        let data = vec![1.0f32, 1.0, 1.0, 1.0, 1.0, 1.0];
        let assignments = cluster(&data, 1, 4, 3, 5, 1);
        assert_eq!(assignments.len(), 6);
        for &a in &assignments {
            assert!(a < 4);
        }
    }

    #[test]
    fn empty_input_yields_empty_assignments() {
        assert!(cluster(&[], 4, 16, 0, 10, 1).is_empty());
    }
}
