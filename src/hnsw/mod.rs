//! Hierarchical navigable small-world index.
//!
//! A multi-layer proximity graph: level 0 holds every point with dense,
//! local connections; each level above is exponentially sparser and serves
//! long-range navigation. Queries descend greedily from the top entry point
//! and finish with a best-first beam at the base layer.
//!
//! Construction is parallel over node ids with per-node write locks and a
//! single global lock around entry-point publication; a single-threaded
//! build elides every lock. An optional 4-bit product quantizer inlines
//! packed neighbor codes next to the base-layer adjacency so traversal can
//! score sixteen neighbors per lookup-table kernel call.
//!
//! # Usage
//!
//! ```no_run
//! use proxima::{DenseMatrix, HnswConfig, HnswIndex, metric::DenseL2};
//!
//! # fn main() -> proxima::Result<()> {
//! let data = DenseMatrix::from_vec(4, 2, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 10.0, 10.0])?;
//! let index = HnswIndex::<DenseL2>::train(&data, &HnswConfig::default())?;
//! let hits = index.search(&[0.1, 0.1], 8, 3)?;
//! assert_eq!(hits[0].id, 0);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! Malkov & Yashunin (2018): "Efficient and robust approximate nearest
//! neighbor search using Hierarchical Navigable Small World graphs".

pub(crate) mod construction;
pub(crate) mod graph;
pub mod heap;
mod search;
mod searcher;
mod visited;

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::matrix::DenseMatrix;
use crate::metric::Distance;
use crate::pq::{PqConfig, ProductQuantizer4Bits};

use construction::BuildWorkspace;
use graph::{Level0Graph, UpperGraph};
use searcher::SearchScratch;

pub use heap::Neighbor;
pub use searcher::Searcher;
pub use visited::VisitedSet;

/// Build hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Out-degree cap above level 0; level 0 allows `2 * m`.
    pub m: usize,
    /// Candidate list size during construction; must be at least `m`.
    pub ef_construction: usize,
    /// Worker threads for construction. `1` builds serially without locks.
    pub threads: usize,
    /// Optional cap on the hierarchy height.
    pub max_level_upper_bound: Option<u32>,
    /// Level-sampling seed; `None` draws one from entropy. A fixed seed and
    /// a single thread make construction fully deterministic.
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            threads: 1,
            max_level_upper_bound: None,
            seed: None,
        }
    }
}

/// The index: scalar parameters, the two graphs, and optional quantizer.
pub struct HnswIndex<D: Distance> {
    pub(crate) num_node: usize,
    pub(crate) max_m: usize,
    pub(crate) max_m0: usize,
    pub(crate) ef_construction: usize,
    max_level: AtomicU32,
    init_node: AtomicU32,
    pub(crate) graph_l0: Level0Graph,
    pub(crate) graph_upper: UpperGraph,
    pub(crate) quantizer: Option<ProductQuantizer4Bits>,
    _metric: PhantomData<D>,
}

impl<D: Distance> std::fmt::Debug for HnswIndex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("num_node", &self.num_node)
            .field("max_m", &self.max_m)
            .field("max_m0", &self.max_m0)
            .field("ef_construction", &self.ef_construction)
            .field("max_level", &self.max_level)
            .field("init_node", &self.init_node)
            .field("graph_l0", &self.graph_l0)
            .field("graph_upper", &self.graph_upper)
            .field("quantizer", &self.quantizer)
            .finish()
    }
}

impl<D: Distance> HnswIndex<D> {
    /// Build an index over the rows of `x`.
    pub fn train(x: &DenseMatrix, config: &HnswConfig) -> Result<Self> {
        Self::train_impl(x, config, None)
    }

    /// Build an index with the 4-bit quantization accelerator: the
    /// quantizer trains first, then the graph, then every node's neighbor
    /// codes are packed inline.
    pub fn train_with_quantizer(
        x: &DenseMatrix,
        config: &HnswConfig,
        pq_config: &PqConfig,
    ) -> Result<Self> {
        let pq = ProductQuantizer4Bits::train(x, pq_config)?;
        Self::train_impl(x, config, Some(pq))
    }

    fn train_impl(
        x: &DenseMatrix,
        config: &HnswConfig,
        quantizer: Option<ProductQuantizer4Bits>,
    ) -> Result<Self> {
        if x.rows() == 0 {
            return Err(IndexError::config("training matrix is empty"));
        }
        if config.m < 2 {
            return Err(IndexError::config(format!(
                "M must be at least 2, got {}",
                config.m
            )));
        }
        if config.ef_construction < config.m {
            return Err(IndexError::config(format!(
                "efC ({}) must be at least M ({})",
                config.ef_construction, config.m
            )));
        }
        if let Some(pq) = &quantizer {
            if pq.dimension() != x.cols() {
                return Err(IndexError::config(format!(
                    "quantizer covers {} dimensions, matrix has {}",
                    pq.dimension(),
                    x.cols()
                )));
            }
        }

        let num_node = x.rows();
        if num_node > u32::MAX as usize {
            return Err(IndexError::config("node ids are 32-bit"));
        }
        let max_m = config.m;
        let max_m0 = 2 * config.m;
        let threads = if config.threads == 0 {
            std::thread::available_parallelism().map_or(1, |p| p.get())
        } else {
            config.threads
        };

        let levels = construction::sample_levels(
            num_node,
            max_m,
            config.max_level_upper_bound,
            config.seed,
        );

        // Level-0 capacity and code width pad up for whole-group loads when
        // quantization is on.
        let (capacity, code_block) = match &quantizer {
            Some(pq) => {
                let mut capacity = max_m0;
                let mut code_dim = pq.num_codebooks();
                pq.pad_parameters(&mut capacity, &mut code_dim);
                (capacity, capacity / crate::pq::GROUP_SIZE * pq.group_bytes())
            }
            None => (max_m0, 0),
        };

        let mut index = Self {
            num_node,
            max_m,
            max_m0,
            ef_construction: config.ef_construction,
            max_level: AtomicU32::new(0),
            init_node: AtomicU32::new(0),
            graph_l0: Level0Graph::init(x, capacity, code_block),
            graph_upper: UpperGraph::init(&levels, max_m),
            quantizer,
            _metric: PhantomData,
        };

        let ws = BuildWorkspace::new(levels);
        if threads == 1 {
            let mut scratch = SearchScratch::new(num_node);
            for node in 0..num_node as u32 {
                index.add_point(node, &ws, &mut scratch, false);
            }
            index.sort_neighbor_lists(&ws, 1);
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| IndexError::Internal(format!("thread pool: {e}")))?;
            let index_ref = &index;
            let ws_ref = &ws;
            pool.install(|| {
                use rayon::prelude::*;
                (0..num_node as u32).into_par_iter().for_each_init(
                    || SearchScratch::new(num_node),
                    |scratch, node| index_ref.add_point(node, ws_ref, scratch, true),
                );
                index_ref.sort_neighbor_lists(ws_ref, threads);
            });
        }

        index.pack_neighbor_code_blocks();
        Ok(index)
    }

    /// Rebuild from persisted parts (used by load).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        num_node: usize,
        max_m: usize,
        max_m0: usize,
        ef_construction: usize,
        max_level: u32,
        init_node: u32,
        graph_l0: Level0Graph,
        graph_upper: UpperGraph,
        quantizer: Option<ProductQuantizer4Bits>,
    ) -> Self {
        Self {
            num_node,
            max_m,
            max_m0,
            ef_construction,
            max_level: AtomicU32::new(max_level),
            init_node: AtomicU32::new(init_node),
            graph_l0,
            graph_upper,
            quantizer,
            _metric: PhantomData,
        }
    }

    /// Number of indexed points.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.num_node
    }

    /// Feature dimension.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.graph_l0.dim
    }

    /// Height of the hierarchy (the entry point's level).
    #[inline]
    pub fn max_level(&self) -> usize {
        self.max_level.load(Ordering::Acquire) as usize
    }

    /// The node every query starts from.
    #[inline]
    pub fn entry_point(&self) -> u32 {
        self.init_node.load(Ordering::Acquire)
    }

    pub(crate) fn publish_entry(&self, max_level: usize, init_node: u32) {
        self.max_level.store(max_level as u32, Ordering::Release);
        self.init_node.store(init_node, Ordering::Release);
    }

    /// Sampled level of a node.
    #[inline]
    pub fn level_of(&self, node: u32) -> usize {
        self.graph_upper.level_of(node)
    }

    /// The attached quantizer, when trained with one.
    #[inline]
    pub fn quantizer(&self) -> Option<&ProductQuantizer4Bits> {
        self.quantizer.as_ref()
    }

    #[inline]
    pub(crate) fn level0_capacity(&self) -> usize {
        self.graph_l0.capacity
    }

    /// Current neighbor ids of `node` at `level` (snapshot, for inspection
    /// and tests).
    pub fn neighbors_of(&self, node: u32, level: usize) -> Vec<u32> {
        let degree = self.degree_at(node, level);
        (0..degree).map(|slot| self.neighbor_at(node, level, slot)).collect()
    }

    #[inline]
    pub(crate) fn degree_at(&self, node: u32, level: usize) -> usize {
        if level == 0 {
            self.graph_l0.degree(node)
        } else {
            self.graph_upper.degree(node, level)
        }
    }

    #[inline]
    pub(crate) fn neighbor_at(&self, node: u32, level: usize, slot: usize) -> u32 {
        if level == 0 {
            self.graph_l0.neighbor(node, slot)
        } else {
            self.graph_upper.neighbor(node, level, slot)
        }
    }

    #[inline]
    pub(crate) fn write_neighbor_at(&self, node: u32, level: usize, slot: usize, id: u32) {
        if level == 0 {
            self.graph_l0.write_neighbor(node, slot, id);
        } else {
            self.graph_upper.write_neighbor(node, level, slot, id);
        }
    }

    #[inline]
    pub(crate) fn publish_degree_at(&self, node: u32, level: usize, degree: usize) {
        if level == 0 {
            self.graph_l0.publish_degree(node, degree);
        } else {
            self.graph_upper.publish_degree(node, level, degree);
        }
    }

    /// Per-thread query scratch bound to this index.
    pub fn searcher(&self) -> Searcher<'_, D> {
        Searcher::new(self)
    }

    /// One-off query; allocates a fresh [`Searcher`]. Batch callers should
    /// hold a searcher per thread instead.
    pub fn search(&self, query: &[f32], ef_search: usize, k: usize) -> Result<Vec<Neighbor>> {
        self.searcher().search(query, ef_search, k)
    }

    /// Persist to `dir` as `config.json` + `index.bin` (+ `pq.bin`).
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        crate::persistence::save(self, dir.as_ref())
    }

    /// Load an index persisted by [`Self::save`]. The metric is checked
    /// against the recorded implementation tag.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        crate::persistence::load(dir.as_ref())
    }

    /// Implementation tag recorded in `config.json`.
    pub fn type_tag(&self) -> String {
        Self::type_tag_for(self.quantizer.is_some())
    }

    pub(crate) fn type_tag_for(quantized: bool) -> String {
        if quantized {
            format!("proxima::hnsw_pq4<{}>", D::NAME)
        } else {
            format!("proxima::hnsw<{}>", D::NAME)
        }
    }
}
