//! Distance capabilities over dense feature views.
//!
//! The graph core is generic over [`Distance`] and never names a concrete
//! metric; a metric is a unit type wired in at the type level, the same way
//! each index hard-wires its distance at compile time rather than branching
//! per call.
//!
//! ## Important nuance
//!
//! [`DenseAngular`] is dot-product based for speed and therefore expects
//! inputs to be **L2-normalized**. It returns `1 - dot(a, b)`, which equals
//! cosine distance only under that precondition.

use crate::simd;

/// Distance capability: a metric over borrowed feature rows, plus a cache
/// prefetch hint for upcoming rows.
pub trait Distance: Send + Sync + 'static {
    /// Short stable tag embedded in the persisted `hnsw_t` string.
    const NAME: &'static str;

    /// Distance between two equal-length views. Smaller is closer.
    fn distance(a: &[f32], b: &[f32]) -> f32;

    /// Hint that `v` will be read soon.
    #[inline(always)]
    fn prefetch(v: &[f32]) {
        simd::prefetch(v.as_ptr() as *const u8);
    }
}

/// Squared Euclidean distance over dense rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseL2;

impl Distance for DenseL2 {
    const NAME: &'static str = "dense_l2";

    #[inline(always)]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        simd::l2_sq(a, b)
    }
}

/// Angular distance `1 - cos(a, b)` for pre-normalized dense rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseAngular;

impl Distance for DenseAngular {
    const NAME: &'static str = "dense_angular";

    #[inline(always)]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        1.0 - simd::dot(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::normalize;

    #[test]
    fn l2_is_squared() {
        let a = [0.0f32, 0.0];
        let b = [3.0f32, 4.0];
        assert_eq!(DenseL2::distance(&a, &b), 25.0);
    }

    #[test]
    fn angular_zero_for_same_direction() {
        let a = normalize(&[1.0, 2.0, 3.0]);
        let b = normalize(&[2.0, 4.0, 6.0]);
        assert!(DenseAngular::distance(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn angular_orthogonal_is_one() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        assert!((DenseAngular::distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn names_are_distinct() {
        assert_ne!(DenseL2::NAME, DenseAngular::NAME);
    }
}
