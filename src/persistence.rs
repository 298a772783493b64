//! On-disk model directory: `config.json`, `index.bin`, `pq.bin`.
//!
//! `config.json` is a UTF-8 JSON sidecar carrying the implementation tag,
//! a version string, and the build hyperparameters. The binaries are
//! little-endian with explicit size headers; every recorded size is
//! validated on load and truncated or oversize payloads are refused.
//!
//! Layout of `index.bin`:
//!
//! ```text
//! [num_node, maxM, maxM0, efC, max_level, init_node]   6 x u32
//! level-0 block:
//!   [element, feature, code, neighbor_block]           4 x u64 byte sizes
//!   per node: features || codes || degree || neighbor_ids[capacity]
//! upper block:
//!   [total_lists, list_bytes]                          2 x u64
//!   per node: level_count, then level x (degree || neighbor_ids[maxM])
//! ```
//!
//! `pq.bin` is the quantizer state: codebook count, local dimension, then
//! three u64-length-prefixed float32 blocks (`global_centroid`,
//! `original_local_codebooks`, `local_codebooks`).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::hnsw::graph::{Level0Graph, UpperGraph};
use crate::hnsw::HnswIndex;
use crate::metric::Distance;
use crate::pq::{ProductQuantizer4Bits, GROUP_SIZE, NUM_LOCAL_CENTROIDS};

const VERSION: &str = "v1.0";

#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    hnsw_t: String,
    version: String,
    train_params: TrainParams,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrainParams {
    num_node: u32,
    #[serde(rename = "maxM")]
    max_m: u32,
    #[serde(rename = "maxM0")]
    max_m0: u32,
    #[serde(rename = "efC")]
    ef_c: u32,
    max_level: u32,
    init_node: u32,
}

pub(crate) fn save<D: Distance>(index: &HnswIndex<D>, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    save_config(index, &dir.join("config.json"))?;
    save_index_bin(index, &dir.join("index.bin"))?;
    if let Some(pq) = index.quantizer() {
        save_pq_bin(pq, &dir.join("pq.bin"))?;
    }
    Ok(())
}

pub(crate) fn load<D: Distance>(dir: &Path) -> Result<HnswIndex<D>> {
    let config = load_config::<D>(&dir.join("config.json"))?;
    let quantized = config.hnsw_t == HnswIndex::<D>::type_tag_for(true);

    let quantizer = if quantized {
        Some(load_pq_bin(&dir.join("pq.bin"))?)
    } else {
        None
    };
    load_index_bin(&dir.join("index.bin"), &config, quantizer)
}

fn save_config<D: Distance>(index: &HnswIndex<D>, path: &Path) -> Result<()> {
    let config = ConfigFile {
        hnsw_t: index.type_tag(),
        version: VERSION.to_string(),
        train_params: TrainParams {
            num_node: index.num_node as u32,
            max_m: index.max_m as u32,
            max_m0: index.max_m0 as u32,
            ef_c: index.ef_construction as u32,
            max_level: index.max_level() as u32,
            init_node: index.entry_point(),
        },
    };
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| IndexError::Internal(format!("config serialization: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn load_config<D: Distance>(path: &Path) -> Result<ConfigFile> {
    let text = std::fs::read_to_string(path)?;
    let config: ConfigFile = serde_json::from_str(&text)
        .map_err(|e| IndexError::state(format!("malformed config.json: {e}")))?;

    let plain = HnswIndex::<D>::type_tag_for(false);
    let quantized = HnswIndex::<D>::type_tag_for(true);
    if config.hnsw_t != plain && config.hnsw_t != quantized {
        return Err(IndexError::state(format!(
            "inconsistent hnsw_t: found {:?}, this index is {plain:?} or {quantized:?}",
            config.hnsw_t
        )));
    }
    if config.version != VERSION {
        return Err(IndexError::state(format!(
            "unsupported version {:?}, expected {VERSION:?}",
            config.version
        )));
    }
    Ok(config)
}

fn save_index_bin<D: Distance>(index: &HnswIndex<D>, path: &Path) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);

    for v in [
        index.num_node as u32,
        index.max_m as u32,
        index.max_m0 as u32,
        index.ef_construction as u32,
        index.max_level() as u32,
        index.entry_point(),
    ] {
        w.write_all(&v.to_le_bytes())?;
    }

    let g0 = &index.graph_l0;
    let feature_bytes = (g0.dim * 4) as u64;
    let code_bytes = g0.code_block as u64;
    let neighbor_block_bytes = (4 * (1 + g0.capacity)) as u64;
    let element_bytes = feature_bytes + code_bytes + neighbor_block_bytes;
    for v in [element_bytes, feature_bytes, code_bytes, neighbor_block_bytes] {
        w.write_all(&v.to_le_bytes())?;
    }

    for node in 0..index.num_node as u32 {
        for &f in g0.node_feat(node) {
            w.write_all(&f.to_le_bytes())?;
        }
        if g0.code_block > 0 {
            w.write_all(g0.node_codes(node))?;
        }
        let degree = g0.degree(node);
        w.write_all(&(degree as u32).to_le_bytes())?;
        for slot in 0..g0.capacity {
            let id = if slot < degree { g0.neighbor(node, slot) } else { 0 };
            w.write_all(&id.to_le_bytes())?;
        }
    }

    let upper = &index.graph_upper;
    let total_lists = upper.offsets[index.num_node] as u64;
    let list_bytes = (4 * (1 + upper.capacity)) as u64;
    w.write_all(&total_lists.to_le_bytes())?;
    w.write_all(&list_bytes.to_le_bytes())?;

    for node in 0..index.num_node as u32 {
        let levels = upper.level_of(node);
        w.write_all(&(levels as u32).to_le_bytes())?;
        for level in 1..=levels {
            let degree = upper.degree(node, level);
            w.write_all(&(degree as u32).to_le_bytes())?;
            for slot in 0..upper.capacity {
                let id = if slot < degree {
                    upper.neighbor(node, level, slot)
                } else {
                    0
                };
                w.write_all(&id.to_le_bytes())?;
            }
        }
    }

    w.flush()?;
    Ok(())
}

fn load_index_bin<D: Distance>(
    path: &Path,
    config: &ConfigFile,
    quantizer: Option<ProductQuantizer4Bits>,
) -> Result<HnswIndex<D>> {
    let mut r = BufReader::new(File::open(path)?);

    let num_node = read_u32(&mut r)? as usize;
    let max_m = read_u32(&mut r)? as usize;
    let max_m0 = read_u32(&mut r)? as usize;
    let ef_c = read_u32(&mut r)? as usize;
    let max_level = read_u32(&mut r)?;
    let init_node = read_u32(&mut r)?;

    let p = &config.train_params;
    if (p.num_node, p.max_m, p.max_m0, p.ef_c, p.max_level, p.init_node)
        != (
            num_node as u32,
            max_m as u32,
            max_m0 as u32,
            ef_c as u32,
            max_level,
            init_node,
        )
    {
        return Err(IndexError::state(
            "config.json train_params disagree with index.bin header",
        ));
    }
    if num_node == 0 || init_node as usize >= num_node {
        return Err(IndexError::state("corrupt scalar header"));
    }

    let element_bytes = read_u64(&mut r)?;
    let feature_bytes = read_u64(&mut r)?;
    let code_bytes = read_u64(&mut r)?;
    let neighbor_block_bytes = read_u64(&mut r)?;

    if element_bytes != feature_bytes + code_bytes + neighbor_block_bytes {
        return Err(IndexError::state("level-0 element size disagrees with parts"));
    }
    if feature_bytes == 0 || feature_bytes % 4 != 0 {
        return Err(IndexError::state("corrupt feature size"));
    }
    let dim = (feature_bytes / 4) as usize;
    if neighbor_block_bytes < 4 || neighbor_block_bytes % 4 != 0 {
        return Err(IndexError::state("corrupt neighbor block size"));
    }
    let capacity = (neighbor_block_bytes / 4 - 1) as usize;
    if capacity < max_m0 {
        return Err(IndexError::state(format!(
            "level-0 capacity {capacity} is below maxM0 {max_m0}"
        )));
    }

    match &quantizer {
        Some(pq) => {
            if pq.dimension() != dim {
                return Err(IndexError::state(format!(
                    "quantizer covers {} dimensions, index stores {dim}",
                    pq.dimension()
                )));
            }
            if capacity % GROUP_SIZE != 0 {
                return Err(IndexError::state("quantized capacity must be group-aligned"));
            }
            let expected = (capacity / GROUP_SIZE * pq.group_bytes()) as u64;
            if code_bytes != expected {
                return Err(IndexError::state(format!(
                    "code block is {code_bytes} bytes, expected {expected}"
                )));
            }
        }
        None => {
            if code_bytes != 0 {
                return Err(IndexError::state(
                    "index.bin carries codes but no quantizer was recorded",
                ));
            }
        }
    }

    let code_block = code_bytes as usize;
    let mut features = vec![0.0f32; num_node * dim];
    let mut codes = vec![0u8; num_node * code_block];
    let mut degrees = vec![0u32; num_node];
    let mut neighbors = vec![0u32; num_node * capacity];

    let mut feat_buf = vec![0u8; dim * 4];
    let mut id_buf = vec![0u8; capacity * 4];
    for node in 0..num_node {
        r.read_exact(&mut feat_buf)?;
        for (i, chunk) in feat_buf.chunks_exact(4).enumerate() {
            features[node * dim + i] =
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if code_block > 0 {
            r.read_exact(&mut codes[node * code_block..(node + 1) * code_block])?;
        }
        let degree = read_u32(&mut r)?;
        if degree as usize > max_m0 {
            return Err(IndexError::state(format!(
                "node {node} has level-0 degree {degree}, cap is {max_m0}"
            )));
        }
        degrees[node] = degree;
        r.read_exact(&mut id_buf)?;
        for (slot, chunk) in id_buf.chunks_exact(4).enumerate() {
            let id = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if slot < degree as usize && id as usize >= num_node {
                return Err(IndexError::state(format!(
                    "node {node} references out-of-range neighbor {id}"
                )));
            }
            neighbors[node * capacity + slot] = id;
        }
    }

    let graph_l0 =
        Level0Graph::from_parts(dim, capacity, code_block, features, degrees, neighbors, codes);

    let total_lists = read_u64(&mut r)? as usize;
    let list_bytes = read_u64(&mut r)?;
    if list_bytes != (4 * (1 + max_m)) as u64 {
        return Err(IndexError::state("upper list size disagrees with maxM"));
    }

    let mut levels = vec![0u32; num_node];
    let mut upper_degrees = Vec::with_capacity(total_lists);
    let mut upper_neighbors = vec![0u32; total_lists * max_m];
    let mut list_buf = vec![0u8; max_m * 4];
    for node in 0..num_node {
        let node_levels = read_u32(&mut r)?;
        levels[node] = node_levels;
        for _ in 0..node_levels {
            if upper_degrees.len() >= total_lists {
                return Err(IndexError::state("more upper lists than recorded"));
            }
            let degree = read_u32(&mut r)?;
            if degree as usize > max_m {
                return Err(IndexError::state(format!(
                    "node {node} has upper degree {degree}, cap is {max_m}"
                )));
            }
            let list = upper_degrees.len();
            upper_degrees.push(degree);
            r.read_exact(&mut list_buf)?;
            for (slot, chunk) in list_buf.chunks_exact(4).enumerate() {
                let id = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if slot < degree as usize && id as usize >= num_node {
                    return Err(IndexError::state(format!(
                        "node {node} references out-of-range upper neighbor {id}"
                    )));
                }
                upper_neighbors[list * max_m + slot] = id;
            }
        }
    }
    if upper_degrees.len() != total_lists {
        return Err(IndexError::state(format!(
            "upper block holds {} lists, header recorded {total_lists}",
            upper_degrees.len()
        )));
    }
    if levels[init_node as usize] != max_level {
        return Err(IndexError::state(
            "entry point level disagrees with max_level",
        ));
    }

    let mut trailing = [0u8; 1];
    if r.read(&mut trailing)? != 0 {
        return Err(IndexError::state("index.bin has trailing bytes"));
    }

    let graph_upper = UpperGraph::from_parts(max_m, levels, upper_degrees, upper_neighbors);
    Ok(HnswIndex::from_parts(
        num_node,
        max_m,
        max_m0,
        ef_c,
        max_level,
        init_node,
        graph_l0,
        graph_upper,
        quantizer,
    ))
}

fn save_pq_bin(pq: &ProductQuantizer4Bits, path: &Path) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&(pq.num_codebooks() as u32).to_le_bytes())?;
    w.write_all(&(pq.local_dim() as i32).to_le_bytes())?;
    for block in [
        pq.global_centroid(),
        pq.original_local_codebooks(),
        pq.local_codebooks(),
    ] {
        w.write_all(&(block.len() as u64).to_le_bytes())?;
        for &v in block {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    w.flush()?;
    Ok(())
}

fn load_pq_bin(path: &Path) -> Result<ProductQuantizer4Bits> {
    let mut r = BufReader::new(File::open(path)?);
    let num_codebooks = read_u32(&mut r)? as usize;
    let local_dim_raw = read_u32(&mut r)? as i32;
    if num_codebooks == 0 || local_dim_raw <= 0 {
        return Err(IndexError::state("corrupt quantizer header"));
    }
    let local_dim = local_dim_raw as usize;
    let dim = num_codebooks * local_dim;

    let global_centroid = read_f32_block(&mut r, dim)?;
    let codebook_len = num_codebooks * NUM_LOCAL_CENTROIDS * local_dim;
    let original = read_f32_block(&mut r, codebook_len)?;
    // The inference layout is host-dependent; validate the recorded block
    // and re-pack for this host instead of trusting it.
    let _local = read_f32_block(&mut r, codebook_len)?;

    let mut trailing = [0u8; 1];
    if r.read(&mut trailing)? != 0 {
        return Err(IndexError::state("pq.bin has trailing bytes"));
    }

    Ok(ProductQuantizer4Bits::from_parts(
        num_codebooks,
        local_dim,
        global_centroid,
        original,
    ))
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Length-prefixed float block; the prefix must match `expected` exactly.
fn read_f32_block(r: &mut impl Read, expected: usize) -> Result<Vec<f32>> {
    let len = read_u64(r)? as usize;
    if len != expected {
        return Err(IndexError::state(format!(
            "float block holds {len} values, expected {expected}"
        )));
    }
    let mut bytes = vec![0u8; len * 4];
    r.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::HnswConfig;
    use crate::matrix::DenseMatrix;
    use crate::metric::{DenseAngular, DenseL2};

    fn sample_index() -> HnswIndex<DenseL2> {
        let values: Vec<f32> = (0..200 * 8)
            .map(|i| ((i as u64).wrapping_mul(48271) % 613) as f32 / 306.5 - 1.0)
            .collect();
        let x = DenseMatrix::from_vec(200, 8, values).unwrap();
        HnswIndex::<DenseL2>::train(
            &x,
            &HnswConfig {
                m: 8,
                ef_construction: 32,
                seed: Some(5),
                ..HnswConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn save_load_round_trip_preserves_results() {
        let index = sample_index();
        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();

        let loaded = HnswIndex::<DenseL2>::load(dir.path()).unwrap();
        assert_eq!(loaded.num_nodes(), index.num_nodes());
        assert_eq!(loaded.max_level(), index.max_level());
        assert_eq!(loaded.entry_point(), index.entry_point());

        let q = vec![0.25f32; 8];
        let a = index.search(&q, 16, 5).unwrap();
        let b = loaded.search(&q, 16, 5).unwrap();
        assert_eq!(
            a.iter().map(|n| n.id).collect::<Vec<_>>(),
            b.iter().map(|n| n.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn load_rejects_wrong_metric() {
        let index = sample_index();
        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();
        match HnswIndex::<DenseAngular>::load(dir.path()) {
            Err(IndexError::InvalidState(msg)) => assert!(msg.contains("hnsw_t")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_unknown_version() {
        let index = sample_index();
        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();
        let config_path = dir.path().join("config.json");
        let text = std::fs::read_to_string(&config_path)
            .unwrap()
            .replace("v1.0", "v9.9");
        std::fs::write(&config_path, text).unwrap();
        match HnswIndex::<DenseL2>::load(dir.path()) {
            Err(IndexError::InvalidState(msg)) => assert!(msg.contains("version")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_truncated_index() {
        let index = sample_index();
        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();
        let bin_path = dir.path().join("index.bin");
        let bytes = std::fs::read(&bin_path).unwrap();
        std::fs::write(&bin_path, &bytes[..bytes.len() - 9]).unwrap();
        assert!(HnswIndex::<DenseL2>::load(dir.path()).is_err());
    }

    #[test]
    fn load_rejects_trailing_garbage() {
        let index = sample_index();
        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();
        let bin_path = dir.path().join("index.bin");
        let mut bytes = std::fs::read(&bin_path).unwrap();
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&bin_path, bytes).unwrap();
        match HnswIndex::<DenseL2>::load(dir.path()) {
            Err(IndexError::InvalidState(msg)) => assert!(msg.contains("trailing")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }
}
