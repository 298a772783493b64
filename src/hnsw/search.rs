//! Layered best-first search and the top-k query path.

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{IndexError, Result};
use crate::hnsw::heap::Neighbor;
use crate::hnsw::searcher::{SearchScratch, Searcher};
use crate::hnsw::HnswIndex;
use crate::matrix::DenseMatrix;
use crate::metric::Distance;
use crate::pq::QueryLut;
use crate::simd;

impl<D: Distance> HnswIndex<D> {
    /// Best-first beam search at one level, beam width `ef`.
    ///
    /// Leaves the results in `scratch.topk` (max-heap, up to `ef` entries).
    /// `locks` is only supplied during construction; queries run lock-free.
    pub(crate) fn search_level(
        &self,
        scratch: &mut SearchScratch,
        query: &[f32],
        init_node: u32,
        ef: usize,
        level: usize,
        locks: Option<&[Mutex<()>]>,
    ) {
        scratch.reset();

        let entry_dist = D::distance(query, self.graph_l0.node_feat(init_node));
        scratch.topk.push(Neighbor::new(entry_dist, init_node));
        scratch.cand.push(Neighbor::new(entry_dist, init_node));
        scratch.visited.mark_visited(init_node);
        let mut upper_bound = entry_dist;

        while let Some(&closest) = scratch.cand.peek() {
            // The closest pending candidate cannot improve the farthest
            // kept result: the beam has converged.
            if closest.distance > upper_bound {
                break;
            }
            scratch.cand.pop();

            let cand_node = closest.id;
            let _node_guard = locks.map(|l| l[cand_node as usize].lock());

            let degree = self.degree_at(cand_node, level);
            if degree == 0 {
                continue;
            }
            self.graph_l0.prefetch_node_feat(self.neighbor_at(cand_node, level, 0));
            let max_slot = degree - 1;
            for slot in 0..degree {
                self.graph_l0
                    .prefetch_node_feat(self.neighbor_at(cand_node, level, (slot + 1).min(max_slot)));
                let next = self.neighbor_at(cand_node, level, slot);
                if scratch.visited.is_visited(next) {
                    continue;
                }
                scratch.visited.mark_visited(next);
                let next_dist = D::distance(query, self.graph_l0.node_feat(next));
                if scratch.topk.len() < ef || next_dist < upper_bound {
                    scratch.cand.push(Neighbor::new(next_dist, next));
                    if let Some(top) = scratch.cand.peek() {
                        self.graph_l0.prefetch_node_feat(top.id);
                    }
                    scratch.topk.push_bounded(Neighbor::new(next_dist, next), ef);
                    if let Some(worst) = scratch.topk.peek() {
                        upper_bound = worst.distance;
                    }
                }
            }
        }
    }

    /// Level-0 beam search on quantized distances.
    ///
    /// Each popped candidate's whole neighbor block is scored with one group
    /// kernel call; the beam then consumes per-slot entries from `appx`.
    /// The entry node is seeded with its exact squared-L2 distance so every
    /// value in the beam lives on the quantizer's scale.
    fn search_level_quantized(
        &self,
        pq: &crate::pq::ProductQuantizer4Bits,
        scratch: &mut SearchScratch,
        lut: &QueryLut,
        appx: &mut [f32],
        query: &[f32],
        init_node: u32,
        ef: usize,
    ) {
        scratch.reset();

        let entry_dist = simd::l2_sq(query, self.graph_l0.node_feat(init_node));
        scratch.topk.push(Neighbor::new(entry_dist, init_node));
        scratch.cand.push(Neighbor::new(entry_dist, init_node));
        scratch.visited.mark_visited(init_node);
        let mut upper_bound = entry_dist;

        while let Some(&closest) = scratch.cand.peek() {
            if closest.distance > upper_bound {
                break;
            }
            scratch.cand.pop();

            let cand_node = closest.id;
            let degree = self.graph_l0.degree(cand_node);
            if degree == 0 {
                continue;
            }
            self.graph_l0.prefetch_code_block(cand_node);
            pq.approximate_group_distance(lut, self.graph_l0.node_codes(cand_node), degree, appx);

            for slot in 0..degree {
                let next = self.graph_l0.neighbor(cand_node, slot);
                if scratch.visited.is_visited(next) {
                    continue;
                }
                scratch.visited.mark_visited(next);
                let next_dist = appx[slot];
                if scratch.topk.len() < ef || next_dist < upper_bound {
                    scratch.cand.push(Neighbor::new(next_dist, next));
                    if let Some(top) = scratch.cand.peek() {
                        self.graph_l0.prefetch_code_block(top.id);
                    }
                    scratch.topk.push_bounded(Neighbor::new(next_dist, next), ef);
                    if let Some(worst) = scratch.topk.peek() {
                        upper_bound = worst.distance;
                    }
                }
            }
        }
    }

    /// Top-k query: beam-1 greedy descent through the upper levels, then a
    /// level-0 beam of `max(ef_search, k)`, then truncation to `k`.
    pub(crate) fn predict(
        &self,
        scratch: &mut SearchScratch,
        lut: Option<&mut QueryLut>,
        appx: &mut [f32],
        query: &[f32],
        ef_search: usize,
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension() {
            return Err(IndexError::config(format!(
                "query has {} dimensions, index has {}",
                query.len(),
                self.dimension()
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut curr_node = self.entry_point();
        let mut curr_dist = D::distance(query, self.graph_l0.node_feat(curr_node));
        for level in (1..=self.max_level()).rev() {
            let mut changed = true;
            while changed {
                changed = false;
                let degree = self.graph_upper.degree(curr_node, level);
                if degree == 0 {
                    continue;
                }
                self.graph_l0
                    .prefetch_node_feat(self.graph_upper.neighbor(curr_node, level, 0));
                let max_slot = degree - 1;
                for slot in 0..degree {
                    self.graph_l0.prefetch_node_feat(self.graph_upper.neighbor(
                        curr_node,
                        level,
                        (slot + 1).min(max_slot),
                    ));
                    let next = self.graph_upper.neighbor(curr_node, level, slot);
                    let next_dist = D::distance(query, self.graph_l0.node_feat(next));
                    if next_dist < curr_dist {
                        curr_dist = next_dist;
                        curr_node = next;
                        changed = true;
                    }
                }
            }
        }

        let beam = ef_search.max(k);
        let results = match (self.quantizer.as_ref(), lut) {
            (Some(pq), Some(lut)) => {
                pq.setup_lut(query, lut);
                self.search_level_quantized(pq, scratch, lut, appx, query, curr_node, beam);
                // Rerank the surviving beam with exact metric distances.
                let mut reranked = scratch.topk.into_sorted_vec();
                for n in &mut reranked {
                    n.distance = D::distance(query, self.graph_l0.node_feat(n.id));
                }
                reranked.sort_unstable();
                reranked
            }
            _ => {
                self.search_level(scratch, query, curr_node, beam, 0, None);
                scratch.topk.into_sorted_vec()
            }
        };

        Ok(results.into_iter().take(k).collect())
    }

    /// Batch query over the rows of `queries`, one searcher per worker.
    pub fn search_batch(
        &self,
        queries: &DenseMatrix,
        ef_search: usize,
        k: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        if queries.cols() != self.dimension() {
            return Err(IndexError::config(format!(
                "queries have {} dimensions, index has {}",
                queries.cols(),
                self.dimension()
            )));
        }
        (0..queries.rows())
            .into_par_iter()
            .map_init(
                || Searcher::new(self),
                |searcher, row| searcher.search(queries.row(row), ef_search, k),
            )
            .collect()
    }
}
