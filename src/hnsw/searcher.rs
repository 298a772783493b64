//! Per-thread search state.
//!
//! A [`Searcher`] owns everything a query touches besides the index itself:
//! the visited set, both heaps, and (when quantization is enabled) the
//! query LUT and the group-distance output buffer. One searcher per thread
//! makes the search path re-entrant without any shared mutable state.

use crate::error::Result;
use crate::hnsw::heap::{MaxHeap, MinHeap, Neighbor};
use crate::hnsw::visited::VisitedSet;
use crate::hnsw::HnswIndex;
use crate::metric::Distance;
use crate::pq::QueryLut;

/// Visited set plus the two beam-search heaps. Shared between query
/// searchers and construction workers.
pub(crate) struct SearchScratch {
    pub(crate) visited: VisitedSet,
    pub(crate) topk: MaxHeap,
    pub(crate) cand: MinHeap,
}

impl SearchScratch {
    pub(crate) fn new(num_node: usize) -> Self {
        Self {
            visited: VisitedSet::new(num_node),
            topk: MaxHeap::default(),
            cand: MinHeap::default(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.visited.reset();
        self.topk.clear();
        self.cand.clear();
    }
}

/// Query-time scratch bound to one index.
pub struct Searcher<'a, D: Distance> {
    pub(crate) index: &'a HnswIndex<D>,
    pub(crate) scratch: SearchScratch,
    pub(crate) lut: Option<QueryLut>,
    /// Group-distance outputs, sized to the padded adjacency capacity.
    pub(crate) appx: Vec<f32>,
}

impl<'a, D: Distance> Searcher<'a, D> {
    pub(crate) fn new(index: &'a HnswIndex<D>) -> Self {
        let lut = index.quantizer().map(QueryLut::new);
        let appx = vec![0.0f32; index.level0_capacity()];
        Self {
            index,
            scratch: SearchScratch::new(index.num_nodes()),
            lut,
            appx,
        }
    }

    /// Top-`k` approximate neighbors of `query`, ascending by distance.
    ///
    /// The level-0 beam width is `max(ef_search, k)`. With quantization
    /// enabled the beam runs on LUT distances and the surviving candidates
    /// are re-scored exactly before truncation.
    pub fn search(&mut self, query: &[f32], ef_search: usize, k: usize) -> Result<Vec<Neighbor>> {
        let index = self.index;
        index.predict(
            &mut self.scratch,
            self.lut.as_mut(),
            &mut self.appx,
            query,
            ef_search,
            k,
        )
    }
}
