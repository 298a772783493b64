//! Dense row-major matrix used for training data and query batches.
//!
//! Rows are addressed by contiguous indices `[0, rows)`; `row(i)` returns a
//! borrowed view of `cols` values. The index copies features out of the
//! matrix at build time, so callers are free to drop it after `train`.

use crate::error::{IndexError, Result};

/// Owned dense matrix: `rows × cols` float32 values, row-major packed.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

impl DenseMatrix {
    /// Wrap an existing row-major buffer. Fails unless
    /// `values.len() == rows * cols` and `cols > 0`.
    pub fn from_vec(rows: usize, cols: usize, values: Vec<f32>) -> Result<Self> {
        if cols == 0 {
            return Err(IndexError::config("matrix must have at least one column"));
        }
        if values.len() != rows * cols {
            return Err(IndexError::config(format!(
                "buffer holds {} values, expected {} ({} x {})",
                values.len(),
                rows * cols,
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, values })
    }

    /// Build from an iterator of rows. All rows must share one length.
    pub fn from_rows<I, R>(rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[f32]>,
    {
        let mut values = Vec::new();
        let mut cols = 0usize;
        let mut count = 0usize;
        for row in rows {
            let row = row.as_ref();
            if count == 0 {
                cols = row.len();
            } else if row.len() != cols {
                return Err(IndexError::config(format!(
                    "row {} has {} values, expected {}",
                    count,
                    row.len(),
                    cols
                )));
            }
            values.extend_from_slice(row);
            count += 1;
        }
        Self::from_vec(count, cols, values)
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (the vector dimension).
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Borrow row `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        let start = i * self.cols;
        &self.values[start..start + self.cols]
    }

    /// The whole backing buffer, row-major.
    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Column-wise mean of all rows. Empty matrix yields all zeros.
    pub fn column_mean(&self) -> Vec<f32> {
        let mut mean = vec![0.0f32; self.cols];
        if self.rows == 0 {
            return mean;
        }
        for i in 0..self.rows {
            for (m, &v) in mean.iter_mut().zip(self.row(i)) {
                *m += v;
            }
        }
        let inv = 1.0 / self.rows as f32;
        for m in &mut mean {
            *m *= inv;
        }
        mean
    }
}
