//! Four-bit product quantization with vectorized lookup-table scoring.
//!
//! # Asymmetric distance computation
//!
//! Each vector is split into `M` sub-vectors; each sub-vector is quantized
//! to one of 16 centroids, giving an `M`-nibble code. Per query, a lookup
//! table of quantized squared-L2 distances to every `(sub-codebook,
//! centroid)` pair is built once, after which scoring a stored code is `M`
//! byte lookups and adds:
//!
//! ```text
//! distance(query, code) ≈ (Σ_m LUT[m][code_m]) · scale + bias
//! ```
//!
//! `bias` is folded in once per neighbor rather than once per sub-codebook,
//! so reported values are rank-faithful for a fixed query but not true
//! squared distances. Graph traversal only compares them, which is all that
//! is needed.
//!
//! # Kernels
//!
//! Two implementations coexist: a portable scalar path and a 512-bit
//! byte-shuffle path (AVX-512F + AVX-512BW). The active kernel is probed
//! once per process; both consume the same padded code layout (sub-codebook
//! count padded to a multiple of 4, neighbor groups of 16), so indexes are
//! portable across hosts and the two paths agree to within LUT rounding.

mod avx512;

use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::kmeans;
use crate::matrix::DenseMatrix;
use crate::simd;

/// Centroids per sub-codebook; fixed by the 4-bit code width.
pub const NUM_LOCAL_CENTROIDS: usize = 16;

/// Neighbors scored per group by the batched kernels.
pub const GROUP_SIZE: usize = 16;

/// Hyperparameters for quantizer training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqConfig {
    /// Number of sub-codebooks `M`; must divide the vector dimension.
    pub num_codebooks: usize,
    /// Rows sampled per sub-space for clustering; 0 means every row.
    pub sub_sample: usize,
    /// Seed for sub-sampling and clustering.
    pub seed: u64,
    /// Lloyd iteration cap handed to the clustering routine.
    pub max_iter: usize,
    /// Worker threads for clustering.
    pub threads: usize,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            num_codebooks: 8,
            sub_sample: 0,
            seed: 0,
            max_iter: 10,
            threads: 1,
        }
    }
}

/// Which batched-distance implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Scalar,
    Avx512,
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

/// CPU capability probe, resolved once per process.
pub fn active_kernel() -> Kernel {
    *KERNEL.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            // The shuffle kernel needs BW on top of F for the 512-bit
            // byte-granular ops.
            if is_x86_feature_detected!("avx512f") && is_x86_feature_detected!("avx512bw") {
                return Kernel::Avx512;
            }
        }
        Kernel::Scalar
    })
}

/// Per-query quantized lookup table plus its dequantization constants.
#[derive(Debug, Clone)]
pub struct QueryLut {
    /// `padded_codebooks × 16` quantized entries; rows past `M` stay zero.
    table: Vec<u8>,
    scale: f32,
    bias: f32,
    /// Scratch for the raw `M × 16` float table.
    raw: Vec<f32>,
    /// Scratch for one centered query sub-slice.
    centered: Vec<f32>,
}

impl QueryLut {
    pub fn new(pq: &ProductQuantizer4Bits) -> Self {
        Self {
            table: vec![0u8; pq.lut_len()],
            scale: 1.0,
            bias: 0.0,
            raw: vec![0.0f32; pq.num_codebooks * NUM_LOCAL_CENTROIDS],
            centered: vec![0.0f32; pq.local_dim],
        }
    }

    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    #[inline]
    pub fn bias(&self) -> f32 {
        self.bias
    }

    #[inline]
    pub fn table(&self) -> &[u8] {
        &self.table
    }
}

/// Trained 4-bit product quantizer.
///
/// Two codebook tensors are kept: `original_local_codebooks` in
/// `[M][16][local_dim]` order drives encoding, while `local_codebooks` is
/// re-packed for whichever inference kernel is active (a plain copy for the
/// scalar path, a `[M][local_dim][16]` transpose for the 512-bit path).
#[derive(Debug)]
pub struct ProductQuantizer4Bits {
    num_codebooks: usize,
    local_dim: usize,
    global_centroid: Vec<f32>,
    original_local_codebooks: Vec<f32>,
    local_codebooks: Vec<f32>,
    kernel: Kernel,
}

impl ProductQuantizer4Bits {
    /// Train `M` sub-codebooks of 16 centroids each on `x`.
    pub fn train(x: &DenseMatrix, config: &PqConfig) -> Result<Self> {
        let dim = x.cols();
        let m = config.num_codebooks;
        if m == 0 {
            return Err(IndexError::config("quantizer needs at least one sub-codebook"));
        }
        if dim % m != 0 {
            return Err(IndexError::config(format!(
                "dimension {dim} is not divisible by {m} sub-codebooks"
            )));
        }
        if x.rows() == 0 {
            return Err(IndexError::config("cannot train quantizer on an empty matrix"));
        }

        let local_dim = dim / m;
        let n = x.rows();
        let sub = if config.sub_sample == 0 {
            n
        } else {
            config.sub_sample.min(n)
        };

        let global_centroid = x.column_mean();
        let mut original = vec![0.0f32; m * NUM_LOCAL_CENTROIDS * local_dim];
        let mut slice = vec![0.0f32; sub * local_dim];
        let mut rng = StdRng::seed_from_u64(config.seed);

        for sub_space in 0..m {
            let col0 = sub_space * local_dim;

            let mut indices: Vec<usize> = (0..n).collect();
            indices.shuffle(&mut rng);
            for (i, &row_idx) in indices[..sub].iter().enumerate() {
                let row = x.row(row_idx);
                for j in 0..local_dim {
                    slice[i * local_dim + j] = row[col0 + j] - global_centroid[col0 + j];
                }
            }

            let assignments = kmeans::cluster(
                &slice,
                local_dim,
                NUM_LOCAL_CENTROIDS,
                config.seed,
                config.max_iter,
                config.threads,
            );
            compute_centroids(
                &slice,
                local_dim,
                &assignments,
                &mut original[sub_space * NUM_LOCAL_CENTROIDS * local_dim..]
                    [..NUM_LOCAL_CENTROIDS * local_dim],
            );
        }

        let mut pq = Self {
            num_codebooks: m,
            local_dim,
            global_centroid,
            original_local_codebooks: original,
            local_codebooks: Vec::new(),
            kernel: active_kernel(),
        };
        pq.pack_codebook_for_inference();
        Ok(pq)
    }

    /// Rebuild from persisted state, re-packing for the current host.
    pub(crate) fn from_parts(
        num_codebooks: usize,
        local_dim: usize,
        global_centroid: Vec<f32>,
        original_local_codebooks: Vec<f32>,
    ) -> Self {
        let mut pq = Self {
            num_codebooks,
            local_dim,
            global_centroid,
            original_local_codebooks,
            local_codebooks: Vec::new(),
            kernel: active_kernel(),
        };
        pq.pack_codebook_for_inference();
        pq
    }

    #[inline]
    pub fn num_codebooks(&self) -> usize {
        self.num_codebooks
    }

    #[inline]
    pub fn local_dim(&self) -> usize {
        self.local_dim
    }

    /// Original vector dimension `D = M · local_dim`.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.num_codebooks * self.local_dim
    }

    /// Sub-codebook count rounded up so groups load as whole 512-bit lanes.
    #[inline]
    pub fn padded_codebooks(&self) -> usize {
        self.num_codebooks.div_ceil(4) * 4
    }

    /// Bytes of packed codes per 16-neighbor group.
    #[inline]
    pub fn group_bytes(&self) -> usize {
        // 16 neighbors x padded_M nibbles, two per byte.
        self.padded_codebooks() * 8
    }

    /// Quantized LUT length in bytes (padded rows included).
    #[inline]
    pub fn lut_len(&self) -> usize {
        self.padded_codebooks() * NUM_LOCAL_CENTROIDS
    }

    #[inline]
    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub(crate) fn global_centroid(&self) -> &[f32] {
        &self.global_centroid
    }

    pub(crate) fn original_local_codebooks(&self) -> &[f32] {
        &self.original_local_codebooks
    }

    pub(crate) fn local_codebooks(&self) -> &[f32] {
        &self.local_codebooks
    }

    /// Round adjacency capacity and code dimension up to whole-group loads.
    ///
    /// Capacity becomes a multiple of 16 so a group load never needs a
    /// bounds check; the code dimension becomes a multiple of 4 so one
    /// 512-bit LUT load covers exactly four sub-codebooks.
    pub fn pad_parameters(&self, max_degree: &mut usize, code_dimension: &mut usize) {
        *max_degree = max_degree.div_ceil(GROUP_SIZE) * GROUP_SIZE;
        *code_dimension = code_dimension.div_ceil(4) * 4;
    }

    /// Lay `original_local_codebooks` out for the active inference kernel.
    pub fn pack_codebook_for_inference(&mut self) {
        match self.kernel {
            Kernel::Scalar => {
                self.local_codebooks = self.original_local_codebooks.clone();
            }
            Kernel::Avx512 => {
                // [M][16][local_dim] -> [M][local_dim][16] so the LUT builder
                // streams all 16 centroids of one dimension at a time.
                let (m, ld) = (self.num_codebooks, self.local_dim);
                let mut packed = vec![0.0f32; self.original_local_codebooks.len()];
                for i in 0..m {
                    let base = i * NUM_LOCAL_CENTROIDS * ld;
                    for c in 0..NUM_LOCAL_CENTROIDS {
                        for j in 0..ld {
                            packed[base + j * NUM_LOCAL_CENTROIDS + c] =
                                self.original_local_codebooks[base + c * ld + j];
                        }
                    }
                }
                self.local_codebooks = packed;
            }
        }
    }

    /// Encode one vector to `M` nibble values, one per output byte.
    ///
    /// Packing nibbles two-per-byte into neighbor groups is a separate step
    /// ([`Self::pack_neighbor_codes`]); the unpacked form is what training
    /// and reconstruction work with.
    pub fn encode(&self, vector: &[f32], codes: &mut [u8]) {
        debug_assert_eq!(vector.len(), self.dimension());
        debug_assert_eq!(codes.len(), self.num_codebooks);
        let ld = self.local_dim;
        for m in 0..self.num_codebooks {
            let col0 = m * ld;
            let mut best = 0u8;
            let mut best_dist = f32::INFINITY;
            for c in 0..NUM_LOCAL_CENTROIDS {
                let centroid = &self.original_local_codebooks
                    [m * NUM_LOCAL_CENTROIDS * ld + c * ld..][..ld];
                let mut d = 0.0f32;
                for j in 0..ld {
                    let t = centroid[j] - (vector[col0 + j] - self.global_centroid[col0 + j]);
                    d += t * t;
                }
                if d < best_dist {
                    best_dist = d;
                    best = c as u8;
                }
            }
            codes[m] = best;
        }
    }

    /// Rebuild the nearest representable vector for a code.
    pub fn reconstruct(&self, codes: &[u8], out: &mut [f32]) {
        debug_assert_eq!(codes.len(), self.num_codebooks);
        debug_assert_eq!(out.len(), self.dimension());
        let ld = self.local_dim;
        for m in 0..self.num_codebooks {
            let centroid = &self.original_local_codebooks
                [m * NUM_LOCAL_CENTROIDS * ld + codes[m] as usize * ld..][..ld];
            for j in 0..ld {
                out[m * ld + j] = self.global_centroid[m * ld + j] + centroid[j];
            }
        }
    }

    /// Pack the codes of up to 16 neighbors into one group block.
    ///
    /// Layout per 4-sub-codebook chunk: 32 bytes, sub-codebook major, even
    /// neighbor in the low nibble and odd neighbor in the high nibble.
    /// Missing neighbors and padded sub-codebooks pack as zero, which the
    /// zeroed LUT rows score as zero contribution.
    pub fn pack_neighbor_codes(&self, group: &[&[u8]], out: &mut [u8]) {
        debug_assert!(group.len() <= GROUP_SIZE);
        debug_assert_eq!(out.len(), self.group_bytes());
        out.fill(0);
        let padded = self.padded_codebooks();
        for m in 0..self.num_codebooks.min(padded) {
            let base = (m / 4) * 32 + (m % 4) * 8;
            for i in 0..8 {
                let lo = group.get(2 * i).map_or(0, |codes| codes[m]);
                let hi = group.get(2 * i + 1).map_or(0, |codes| codes[m]);
                out[base + i] = (lo & 0x0f) | (hi << 4);
            }
        }
    }

    /// Build the per-query quantized lookup table.
    ///
    /// Raw entry `(m, c)` is the squared L2 distance between the centered
    /// query sub-slice and centroid `c` of sub-codebook `m`; the table is
    /// affinely quantized to u8 with `bias = min`, `scale = (max-min)/255`.
    pub fn setup_lut(&self, query: &[f32], lut: &mut QueryLut) {
        debug_assert_eq!(query.len(), self.dimension());
        let ld = self.local_dim;

        match self.kernel {
            Kernel::Scalar => {
                for m in 0..self.num_codebooks {
                    let col0 = m * ld;
                    for j in 0..ld {
                        lut.centered[j] = query[col0 + j] - self.global_centroid[col0 + j];
                    }
                    for c in 0..NUM_LOCAL_CENTROIDS {
                        let centroid =
                            &self.local_codebooks[m * NUM_LOCAL_CENTROIDS * ld + c * ld..][..ld];
                        lut.raw[m * NUM_LOCAL_CENTROIDS + c] = simd::l2_sq(&lut.centered, centroid);
                    }
                }
            }
            Kernel::Avx512 => {
                // Transposed layout: stream all 16 centroids per dimension.
                for m in 0..self.num_codebooks {
                    let col0 = m * ld;
                    let base = m * NUM_LOCAL_CENTROIDS * ld;
                    let mut acc = [0.0f32; NUM_LOCAL_CENTROIDS];
                    for j in 0..ld {
                        let q = query[col0 + j] - self.global_centroid[col0 + j];
                        let lane = &self.local_codebooks[base + j * NUM_LOCAL_CENTROIDS..]
                            [..NUM_LOCAL_CENTROIDS];
                        for c in 0..NUM_LOCAL_CENTROIDS {
                            let d = q - lane[c];
                            acc[c] += d * d;
                        }
                    }
                    lut.raw[m * NUM_LOCAL_CENTROIDS..(m + 1) * NUM_LOCAL_CENTROIDS]
                        .copy_from_slice(&acc);
                }
            }
        }

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in &lut.raw {
            min = min.min(v);
            max = max.max(v);
        }
        lut.bias = min;
        lut.scale = if max > min { (max - min) / 255.0 } else { 1.0 };

        lut.table.fill(0);
        for (i, &v) in lut.raw.iter().enumerate() {
            lut.table[i] = ((v - lut.bias) / lut.scale).round() as u8;
        }
    }

    /// Score up to 16 neighbors per group against a query LUT.
    ///
    /// `codes` must hold `ceil(count / 16)` whole group blocks; `out`
    /// receives one float per group slot (16 per group, trailing slots of a
    /// partial group included). The reported value is
    /// `accumulator · scale + bias`; only relative order is meaningful.
    pub fn approximate_group_distance(
        &self,
        lut: &QueryLut,
        codes: &[u8],
        count: usize,
        out: &mut [f32],
    ) {
        let num_groups = count.div_ceil(GROUP_SIZE);
        let gb = self.group_bytes();
        debug_assert!(codes.len() >= num_groups * gb);
        debug_assert!(out.len() >= num_groups * GROUP_SIZE);

        match self.kernel {
            Kernel::Avx512 => {
                #[cfg(target_arch = "x86_64")]
                // Probe verified at kernel selection.
                unsafe {
                    avx512::group_distance(
                        &lut.table,
                        codes,
                        self.padded_codebooks() / 4,
                        num_groups,
                        lut.scale,
                        lut.bias,
                        out,
                    );
                }
                #[cfg(not(target_arch = "x86_64"))]
                unreachable!("512-bit kernel selected on a non-x86_64 host");
            }
            Kernel::Scalar => {
                self.group_distance_scalar(lut, codes, num_groups, out);
            }
        }
    }

    fn group_distance_scalar(
        &self,
        lut: &QueryLut,
        codes: &[u8],
        num_groups: usize,
        out: &mut [f32],
    ) {
        let padded = self.padded_codebooks();
        let gb = self.group_bytes();
        for g in 0..num_groups {
            let block = &codes[g * gb..(g + 1) * gb];
            let mut acc = [0u32; GROUP_SIZE];
            for m in 0..padded {
                let lane = &lut.table[m * NUM_LOCAL_CENTROIDS..][..NUM_LOCAL_CENTROIDS];
                let base = (m / 4) * 32 + (m % 4) * 8;
                for i in 0..8 {
                    let byte = block[base + i];
                    acc[2 * i] += lane[(byte & 0x0f) as usize] as u32;
                    acc[2 * i + 1] += lane[(byte >> 4) as usize] as u32;
                }
            }
            for (k, &a) in acc.iter().enumerate() {
                out[g * GROUP_SIZE + k] = a as f32 * lut.scale + lut.bias;
            }
        }
    }
}

/// Average assigned rows per cluster; empty clusters are left at zero.
fn compute_centroids(data: &[f32], dim: usize, assignments: &[u32], centroids: &mut [f32]) {
    centroids.fill(0.0);
    let mut counts = vec![0u32; NUM_LOCAL_CENTROIDS];
    for (row, &a) in assignments.iter().enumerate() {
        let c = a as usize;
        counts[c] += 1;
        let src = &data[row * dim..(row + 1) * dim];
        let dst = &mut centroids[c * dim..(c + 1) * dim];
        for (d, &s) in dst.iter_mut().zip(src) {
            *d += s;
        }
    }
    for (c, &count) in counts.iter().enumerate() {
        if count > 0 {
            let inv = 1.0 / count as f32;
            for v in &mut centroids[c * dim..(c + 1) * dim] {
                *v *= inv;
            }
        }
    }
}
