//! proxima: approximate nearest neighbor search over dense vectors.
//!
//! A hierarchical small-world graph index under squared-L2 or angular
//! geometry, with an optional 4-bit product-quantization accelerator that
//! scores sixteen neighbors per vectorized lookup-table call.
//!
//! # Which configuration should I use?
//!
//! | Situation | Recommendation |
//! |-----------|----------------|
//! | Dataset fits in RAM, best recall/speed | [`HnswIndex`] without quantization |
//! | Distance computation dominates (high `D`) | [`HnswIndex::train_with_quantizer`] |
//! | Pre-normalized embeddings | [`metric::DenseAngular`] |
//! | Raw feature vectors | [`metric::DenseL2`] |
//!
//! Quantized traversal estimates distances from nibble codes and re-scores
//! the surviving beam exactly, trading a little build time and memory for
//! much cheaper distance evaluations per hop.
//!
//! ```no_run
//! use proxima::{DenseMatrix, HnswConfig, HnswIndex, metric::DenseL2};
//!
//! # fn main() -> proxima::Result<()> {
//! let data = proxima::npy::load_matrix("X.trn.npy")?;
//! let index = HnswIndex::<DenseL2>::train(&data, &HnswConfig::default())?;
//!
//! let mut searcher = index.searcher();
//! let top10 = searcher.search(data.row(0), 100, 10)?;
//! # let _ = top10;
//! # Ok(())
//! # }
//! ```
//!
//! Indexes persist to a directory (`config.json`, `index.bin`, `pq.bin`)
//! and load back with [`HnswIndex::load`]; the recorded implementation tag
//! guards against metric or quantization mismatches.

pub mod error;
pub mod hnsw;
pub mod kmeans;
pub mod matrix;
pub mod metric;
pub mod npy;
pub mod pq;
pub mod simd;

mod persistence;

pub use error::{IndexError, Result};
pub use hnsw::{HnswConfig, HnswIndex, Neighbor, Searcher};
pub use matrix::DenseMatrix;
pub use pq::{PqConfig, ProductQuantizer4Bits};
