//! Minimal `.npy` reader for rank-2 float32 tensors.
//!
//! Covers exactly what training and query data need: little-endian `<f4`,
//! C-order, two-dimensional shape, format versions 1.0 and 2.0. Anything
//! else is rejected rather than guessed at.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{IndexError, Result};
use crate::matrix::DenseMatrix;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Load a rank-2 float32 `.npy` file into a [`DenseMatrix`].
pub fn load_matrix(path: impl AsRef<Path>) -> Result<DenseMatrix> {
    let mut file = File::open(path.as_ref())?;

    let mut preamble = [0u8; 8];
    file.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC {
        return Err(IndexError::state("not a .npy file (bad magic)"));
    }
    let major = preamble[6];

    // Header length field is u16 in v1.x, u32 in v2.x.
    let header_len = match major {
        1 => {
            let mut len = [0u8; 2];
            file.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 => {
            let mut len = [0u8; 4];
            file.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        v => {
            return Err(IndexError::state(format!(
                "unsupported .npy format version {v}"
            )))
        }
    };

    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)?;
    let header = std::str::from_utf8(&header)
        .map_err(|_| IndexError::state("non-ascii .npy header"))?;

    let (rows, cols) = parse_header(header)?;

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    let expected = rows * cols * 4;
    if payload.len() != expected {
        return Err(IndexError::state(format!(
            ".npy payload is {} bytes, expected {} for shape ({}, {})",
            payload.len(),
            expected,
            rows,
            cols
        )));
    }

    let mut values = Vec::with_capacity(rows * cols);
    for chunk in payload.chunks_exact(4) {
        values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    DenseMatrix::from_vec(rows, cols, values)
}

/// Parse the python-dict header, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (1000, 128), }`.
fn parse_header(header: &str) -> Result<(usize, usize)> {
    if !header.contains("'descr'") || !find_value(header, "'descr':").starts_with("'<f4'") {
        return Err(IndexError::state(
            ".npy dtype must be little-endian float32 ('<f4')",
        ));
    }
    if !find_value(header, "'fortran_order':").starts_with("False") {
        return Err(IndexError::state(".npy must be C-order (fortran_order=False)"));
    }

    let shape = find_value(header, "'shape':");
    let open = shape
        .find('(')
        .ok_or_else(|| IndexError::state("malformed .npy shape"))?;
    let close = shape
        .find(')')
        .ok_or_else(|| IndexError::state("malformed .npy shape"))?;
    let dims: Vec<usize> = shape[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| IndexError::state("malformed .npy shape"))
        })
        .collect::<Result<_>>()?;
    if dims.len() != 2 {
        return Err(IndexError::state(format!(
            ".npy tensor has rank {}, expected 2",
            dims.len()
        )));
    }
    Ok((dims[0], dims[1]))
}

fn find_value<'a>(header: &'a str, key: &str) -> &'a str {
    match header.find(key) {
        Some(pos) => header[pos + key.len()..].trim_start(),
        None => "",
    }
}
