//! Flat graph storage for both halves of the hierarchy.
//!
//! [`Level0Graph`] holds every node: the feature arena, a fixed-capacity
//! neighbor slab per node, and (when quantization is enabled) a per-node
//! block of the *neighbors'* packed codes so one prefetched line serves
//! both the ids and the codes they score with.
//!
//! [`UpperGraph`] holds sparse adjacency for levels >= 1: only nodes whose
//! sampled level reaches a layer have lists there.
//!
//! Neighbor slots and degrees are atomics. Writers (serialized per node by
//! the construction locks) store ids Relaxed and publish the degree with
//! Release; readers acquire the degree and see a consistent prefix, so a
//! read racing a write observes either the old or the new list and never
//! an out-of-bounds slot.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::matrix::DenseMatrix;
use crate::simd;

/// Level-0 storage: all features, all base-layer adjacency, optional codes.
#[derive(Debug)]
pub(crate) struct Level0Graph {
    pub(crate) dim: usize,
    /// Neighbor slots per node (`maxM0`, padded to 16 when codes are inlined).
    pub(crate) capacity: usize,
    /// Bytes of packed neighbor codes per node (0 when quantization is off).
    pub(crate) code_block: usize,
    pub(crate) features: Vec<f32>,
    pub(crate) degrees: Vec<AtomicU32>,
    pub(crate) neighbors: Vec<AtomicU32>,
    pub(crate) codes: Vec<u8>,
}

impl Level0Graph {
    /// Allocate storage for every row of `x`, copying features in.
    pub(crate) fn init(x: &DenseMatrix, capacity: usize, code_block: usize) -> Self {
        let n = x.rows();
        Self {
            dim: x.cols(),
            capacity,
            code_block,
            features: x.values().to_vec(),
            degrees: (0..n).map(|_| AtomicU32::new(0)).collect(),
            neighbors: (0..n * capacity).map(|_| AtomicU32::new(0)).collect(),
            codes: vec![0u8; n * code_block],
        }
    }

    pub(crate) fn from_parts(
        dim: usize,
        capacity: usize,
        code_block: usize,
        features: Vec<f32>,
        degrees: Vec<u32>,
        neighbors: Vec<u32>,
        codes: Vec<u8>,
    ) -> Self {
        Self {
            dim,
            capacity,
            code_block,
            features,
            degrees: degrees.into_iter().map(AtomicU32::new).collect(),
            neighbors: neighbors.into_iter().map(AtomicU32::new).collect(),
            codes,
        }
    }

    #[inline]
    pub(crate) fn num_node(&self) -> usize {
        self.degrees.len()
    }

    #[inline]
    pub(crate) fn node_feat(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dim;
        &self.features[start..start + self.dim]
    }

    #[inline]
    pub(crate) fn prefetch_node_feat(&self, node: u32) {
        let start = node as usize * self.dim;
        simd::prefetch(unsafe { self.features.as_ptr().add(start) } as *const u8);
    }

    #[inline]
    pub(crate) fn degree(&self, node: u32) -> usize {
        self.degrees[node as usize].load(Ordering::Acquire) as usize
    }

    #[inline]
    pub(crate) fn neighbor(&self, node: u32, slot: usize) -> u32 {
        self.neighbors[node as usize * self.capacity + slot].load(Ordering::Relaxed)
    }

    /// Write a neighbor id. Not observable until the degree is published.
    #[inline]
    pub(crate) fn write_neighbor(&self, node: u32, slot: usize, id: u32) {
        debug_assert!(slot < self.capacity);
        self.neighbors[node as usize * self.capacity + slot].store(id, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn publish_degree(&self, node: u32, degree: usize) {
        debug_assert!(degree <= self.capacity);
        self.degrees[node as usize].store(degree as u32, Ordering::Release);
    }

    #[inline]
    pub(crate) fn node_codes(&self, node: u32) -> &[u8] {
        let start = node as usize * self.code_block;
        &self.codes[start..start + self.code_block]
    }

    #[inline]
    pub(crate) fn node_codes_mut(&mut self, node: u32) -> &mut [u8] {
        let start = node as usize * self.code_block;
        &mut self.codes[start..start + self.code_block]
    }

    #[inline]
    pub(crate) fn prefetch_code_block(&self, node: u32) {
        if self.code_block > 0 {
            let start = node as usize * self.code_block;
            simd::prefetch(unsafe { self.codes.as_ptr().add(start) });
        }
    }
}

/// Adjacency for levels >= 1. A node at sampled level `l` owns `l` lists,
/// one per level in `1..=l`, each of capacity `maxM`.
#[derive(Debug)]
pub(crate) struct UpperGraph {
    /// Neighbor slots per list (`maxM`).
    pub(crate) capacity: usize,
    /// Sampled level per node; doubles as the upper-list count.
    pub(crate) levels: Vec<u32>,
    /// Per-node index of its first list; `offsets[num_node]` is the total.
    pub(crate) offsets: Vec<usize>,
    pub(crate) degrees: Vec<AtomicU32>,
    pub(crate) neighbors: Vec<AtomicU32>,
}

impl UpperGraph {
    pub(crate) fn init(levels: &[u32], capacity: usize) -> Self {
        let mut offsets = Vec::with_capacity(levels.len() + 1);
        let mut total = 0usize;
        for &l in levels {
            offsets.push(total);
            total += l as usize;
        }
        offsets.push(total);
        Self {
            capacity,
            levels: levels.to_vec(),
            offsets,
            degrees: (0..total).map(|_| AtomicU32::new(0)).collect(),
            neighbors: (0..total * capacity).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub(crate) fn from_parts(
        capacity: usize,
        levels: Vec<u32>,
        degrees: Vec<u32>,
        neighbors: Vec<u32>,
    ) -> Self {
        let mut offsets = Vec::with_capacity(levels.len() + 1);
        let mut total = 0usize;
        for &l in &levels {
            offsets.push(total);
            total += l as usize;
        }
        offsets.push(total);
        debug_assert_eq!(degrees.len(), total);
        Self {
            capacity,
            levels,
            offsets,
            degrees: degrees.into_iter().map(AtomicU32::new).collect(),
            neighbors: neighbors.into_iter().map(AtomicU32::new).collect(),
        }
    }

    /// Sampled level of `node` (0 means no upper lists).
    #[inline]
    pub(crate) fn level_of(&self, node: u32) -> usize {
        self.levels[node as usize] as usize
    }

    #[inline]
    fn list(&self, node: u32, level: usize) -> usize {
        debug_assert!(level >= 1 && level <= self.level_of(node));
        self.offsets[node as usize] + level - 1
    }

    #[inline]
    pub(crate) fn degree(&self, node: u32, level: usize) -> usize {
        self.degrees[self.list(node, level)].load(Ordering::Acquire) as usize
    }

    #[inline]
    pub(crate) fn neighbor(&self, node: u32, level: usize, slot: usize) -> u32 {
        self.neighbors[self.list(node, level) * self.capacity + slot].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn write_neighbor(&self, node: u32, level: usize, slot: usize, id: u32) {
        debug_assert!(slot < self.capacity);
        self.neighbors[self.list(node, level) * self.capacity + slot].store(id, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn publish_degree(&self, node: u32, level: usize, degree: usize) {
        debug_assert!(degree <= self.capacity);
        self.degrees[self.list(node, level)].store(degree as u32, Ordering::Release);
    }
}
