//! Graph construction: level sampling, diverse neighbor selection, mutual
//! connection, and the insertion protocol.
//!
//! Insertion is embarrassingly parallel over node ids. Two locks exist: one
//! global mutex around entry-point publication, and one mutex per node
//! around writes to that node's lists. With a single worker both are elided
//! entirely (`locks: None` throughout).

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::hnsw::heap::{MaxHeap, Neighbor};
use crate::hnsw::searcher::SearchScratch;
use crate::hnsw::HnswIndex;
use crate::metric::Distance;

/// Shared build state: the two lock families plus sampled node levels.
pub(crate) struct BuildWorkspace {
    pub(crate) entry_lock: Mutex<()>,
    pub(crate) node_locks: Vec<Mutex<()>>,
    pub(crate) levels: Vec<u32>,
}

impl BuildWorkspace {
    pub(crate) fn new(levels: Vec<u32>) -> Self {
        Self {
            entry_lock: Mutex::new(()),
            node_locks: (0..levels.len()).map(|_| Mutex::new(())).collect(),
            levels,
        }
    }
}

/// Sample one level per node from the geometric distribution with mean
/// `1 / ln(M)`, optionally clamped.
pub(crate) fn sample_levels(
    num_node: usize,
    m: usize,
    upper_bound: Option<u32>,
    seed: Option<u64>,
) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or_else(|| rand::rng().random()));
    let mult = 1.0 / (m as f64).ln();
    (0..num_node)
        .map(|_| {
            let u: f64 = rng.random::<f64>();
            let mut level = (-(u.max(f64::MIN_POSITIVE)).ln() * mult) as u32;
            if let Some(ub) = upper_bound {
                level = level.min(ub);
            }
            level
        })
        .collect()
}

impl<D: Distance> HnswIndex<D> {
    /// Diverse neighbor selection (the classic select-neighbors heuristic).
    ///
    /// Candidates are consumed in strictly ascending `(distance, id)` order;
    /// a candidate survives iff every already-kept survivor is at least as
    /// far from it as the query is. Survivors land in `out` in that same
    /// ascending order, at most `m` of them, with no backfill.
    pub(crate) fn neighbors_heuristic(
        &self,
        candidates: &mut MaxHeap,
        m: usize,
        out: &mut SmallVec<[Neighbor; 64]>,
    ) {
        out.clear();
        let mut all: Vec<Neighbor> = Vec::with_capacity(candidates.len());
        while let Some(c) = candidates.pop() {
            all.push(c);
        }
        all.sort_unstable();

        if all.len() < m {
            out.extend(all);
            return;
        }
        for c in all {
            if out.len() >= m {
                break;
            }
            let keep = out.iter().all(|kept| {
                let between = D::distance(
                    self.graph_l0.node_feat(kept.id),
                    self.graph_l0.node_feat(c.id),
                );
                between >= c.distance
            });
            if keep {
                out.push(c);
            }
        }
    }

    /// Directed edge `src -> dst` at `level`, under `src`'s lock when locks
    /// are in play. A full list is rebuilt by running the heuristic over the
    /// current neighbors plus `dst`, keeping at most `m_cur_max`.
    fn add_link(
        &self,
        src: u32,
        dst: u32,
        level: usize,
        m_cur_max: usize,
        locks: Option<&[Mutex<()>]>,
    ) {
        let _guard = locks.map(|l| l[src as usize].lock());

        let degree = self.degree_at(src, level);
        assert!(
            degree <= m_cur_max,
            "neighbor list of node {src} at level {level} overflows its capacity"
        );
        assert_ne!(src, dst, "attempted self-edge at node {src}");

        if degree < m_cur_max {
            self.write_neighbor_at(src, level, degree, dst);
            self.publish_degree_at(src, level, degree + 1);
        } else {
            let src_feat = self.graph_l0.node_feat(src);
            let mut candidates = MaxHeap::with_capacity(degree + 1);
            candidates.push(Neighbor::new(
                D::distance(src_feat, self.graph_l0.node_feat(dst)),
                dst,
            ));
            for slot in 0..degree {
                let n = self.neighbor_at(src, level, slot);
                candidates.push(Neighbor::new(
                    D::distance(src_feat, self.graph_l0.node_feat(n)),
                    n,
                ));
            }
            let mut kept: SmallVec<[Neighbor; 64]> = SmallVec::new();
            self.neighbors_heuristic(&mut candidates, m_cur_max, &mut kept);
            for (slot, n) in kept.iter().enumerate() {
                self.write_neighbor_at(src, level, slot, n.id);
            }
            self.publish_degree_at(src, level, kept.len());
        }
    }

    /// Mutual connection: select up to `M` survivors from the candidate
    /// heap, wire `src` to each both ways, and return the closest survivor
    /// as the entry point for the next lower level.
    pub(crate) fn mutually_connect(
        &self,
        src: u32,
        top_candidates: &mut MaxHeap,
        level: usize,
        locks: Option<&[Mutex<()>]>,
    ) -> u32 {
        let m_cur_max = if level == 0 { self.max_m0 } else { self.max_m };

        let mut selected: SmallVec<[Neighbor; 64]> = SmallVec::new();
        self.neighbors_heuristic(top_candidates, self.max_m, &mut selected);
        assert!(
            selected.len() <= self.max_m,
            "heuristic returned more than M survivors"
        );

        for n in &selected {
            self.add_link(src, n.id, level, m_cur_max, locks);
            self.add_link(n.id, src, level, m_cur_max, locks);
        }

        selected.first().map_or(src, |n| n.id)
    }

    /// Insert one node: refine the entry point down to the node's level,
    /// then search-and-connect every level from there to the base layer.
    pub(crate) fn add_point(
        &self,
        node: u32,
        ws: &BuildWorkspace,
        scratch: &mut SearchScratch,
        use_locks: bool,
    ) {
        let locks: Option<&[Mutex<()>]> = use_locks.then_some(ws.node_locks.as_slice());
        let query_level = ws.levels[node as usize] as usize;

        // The global lock is only taken when this node may raise the
        // hierarchy; the snapshot below is stable while it is held.
        let _entry_guard =
            (use_locks && query_level > self.max_level()).then(|| ws.entry_lock.lock());

        let max_level = self.max_level();
        let mut curr_node = self.entry_point();
        let query_feat = self.graph_l0.node_feat(node);

        if node == 0 {
            // First node: no edges yet, it only seeds the entry point. The
            // initial entry state is already (level 0, node 0), so only a
            // taller hierarchy needs publishing.
            if query_level > max_level {
                self.publish_entry(query_level, 0);
            }
            return;
        }

        if query_level < max_level {
            // Greedy descent with beam 1 through the levels this node does
            // not reach.
            let mut curr_dist = D::distance(query_feat, self.graph_l0.node_feat(curr_node));
            for level in (query_level + 1..=max_level).rev() {
                let mut changed = true;
                while changed {
                    changed = false;
                    let _node_guard = locks.map(|l| l[curr_node as usize].lock());
                    let degree = self.graph_upper.degree(curr_node, level);
                    for slot in 0..degree {
                        let next = self.graph_upper.neighbor(curr_node, level, slot);
                        let next_dist = D::distance(query_feat, self.graph_l0.node_feat(next));
                        if next_dist < curr_dist {
                            curr_dist = next_dist;
                            curr_node = next;
                            changed = true;
                        }
                    }
                }
            }
        }

        for level in (0..=query_level.min(max_level)).rev() {
            self.search_level(scratch, query_feat, curr_node, self.ef_construction, level, locks);
            curr_node = self.mutually_connect(node, &mut scratch.topk, level, locks);
        }

        if query_level > max_level {
            self.publish_entry(query_level, node);
        }
    }

    /// Post-build pass: order every neighbor list ascending by distance to
    /// its owner, so traversal visits the most promising edges first.
    pub(crate) fn sort_neighbor_lists(&self, ws: &BuildWorkspace, threads: usize) {
        let sort_one = |node: u32| {
            let src = self.graph_l0.node_feat(node);
            let mut list: Vec<Neighbor> = Vec::with_capacity(self.max_m0);
            for level in 0..=ws.levels[node as usize] as usize {
                let degree = self.degree_at(node, level);
                if degree == 0 {
                    continue;
                }
                list.clear();
                for slot in 0..degree {
                    let n = self.neighbor_at(node, level, slot);
                    list.push(Neighbor::new(
                        D::distance(src, self.graph_l0.node_feat(n)),
                        n,
                    ));
                }
                list.sort_unstable();
                for (slot, n) in list.iter().enumerate() {
                    self.write_neighbor_at(node, level, slot, n.id);
                }
            }
        };

        if threads == 1 {
            for node in 0..self.num_node as u32 {
                sort_one(node);
            }
        } else {
            (0..self.num_node as u32).into_par_iter().for_each(sort_one);
        }
    }

    /// Encode every node and pack its neighbors' codes into the inline
    /// blocks, group layout. Runs after construction and sorting, so each
    /// block reflects the final, ordered adjacency.
    pub(crate) fn pack_neighbor_code_blocks(&mut self) {
        let Some(pq) = self.quantizer.as_ref() else {
            return;
        };
        let m = pq.num_codebooks();
        let n = self.num_node;

        let mut node_codes = vec![0u8; n * m];
        {
            let features = &self.graph_l0.features;
            let dim = self.graph_l0.dim;
            node_codes
                .par_chunks_mut(m)
                .enumerate()
                .for_each(|(node, codes)| {
                    pq.encode(&features[node * dim..(node + 1) * dim], codes);
                });
        }

        let group_bytes = pq.group_bytes();
        let capacity = self.graph_l0.capacity;
        let mut block = vec![0u8; group_bytes];
        for node in 0..n as u32 {
            let degree = self.graph_l0.degree(node);
            for group in 0..capacity / crate::pq::GROUP_SIZE {
                let start = group * crate::pq::GROUP_SIZE;
                if start >= degree {
                    break;
                }
                let end = degree.min(start + crate::pq::GROUP_SIZE);
                let members: SmallVec<[&[u8]; 16]> = (start..end)
                    .map(|slot| {
                        let id = self.graph_l0.neighbor(node, slot) as usize;
                        &node_codes[id * m..(id + 1) * m]
                    })
                    .collect();
                pq.pack_neighbor_codes(&members, &mut block);
                let dst = &mut self.graph_l0.node_codes_mut(node)[group * group_bytes..][..group_bytes];
                dst.copy_from_slice(&block);
            }
        }
    }
}
