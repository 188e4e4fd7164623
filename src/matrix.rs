//! Row-major `f32` matrices.
//!
//! Every tensor that flows between stages is a `(rows, cols)` matrix stored as one
//! contiguous buffer: features `X` are `(n, input_dim)`, raw scores are `(n, k)` and
//! labels are either `(n, 1)` hard indices or `(n, k - 1)` / `(n, k)` soft distributions.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    /// Build a matrix from a flat buffer with shape `(len / cols, cols)`.
    pub fn from_flat(data: Vec<f32>, cols: usize) -> Result<Self> {
        if cols == 0 {
            return Err(Error::InvalidData("cols must be > 0".to_owned()));
        }
        if !data.len().is_multiple_of(cols) {
            return Err(Error::InvalidData(format!(
                "buffer length {} is not divisible by cols {}",
                data.len(),
                cols
            )));
        }

        let rows = data.len() / cols;
        Ok(Self { data, rows, cols })
    }

    /// Build a matrix from per-sample rows.
    ///
    /// This is a convenience constructor (it copies into contiguous storage).
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::InvalidData("rows must not be empty".to_owned()));
        }

        let cols = rows[0].len();
        if cols == 0 {
            return Err(Error::InvalidData("cols must be > 0".to_owned()));
        }

        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(Error::InvalidData(format!(
                    "row {i} has len {}, expected {cols}",
                    row.len()
                )));
            }
        }

        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            data.extend_from_slice(row);
        }

        Ok(Self {
            data,
            rows: rows.len(),
            cols,
        })
    }

    /// A single-column matrix of hard class indices.
    pub fn from_labels(labels: &[usize]) -> Self {
        Self {
            data: labels.iter().map(|&y| y as f32).collect(),
            rows: labels.len(),
            cols: 1,
        }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Returns the `idx`-th row (shape: `(cols,)`).
    ///
    /// Panics if `idx >= rows`.
    #[inline]
    pub fn row(&self, idx: usize) -> &[f32] {
        let start = idx * self.cols;
        &self.data[start..start + self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, idx: usize) -> &mut [f32] {
        let start = idx * self.cols;
        &mut self.data[start..start + self.cols]
    }

    /// Copy the given rows (in order) into a new matrix.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &idx in indices {
            data.extend_from_slice(self.row(idx));
        }
        Self {
            data,
            rows: indices.len(),
            cols: self.cols,
        }
    }

    /// Drop the first `n` columns.
    pub fn drop_leading_cols(&self, n: usize) -> Self {
        let cols = self.cols.saturating_sub(n);
        let mut data = Vec::with_capacity(self.rows * cols);
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[n.min(self.cols)..]);
        }
        Self {
            data,
            rows: self.rows,
            cols,
        }
    }

    pub(crate) fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: self.data.iter().map(|&v| f(v)).collect(),
            rows: self.rows,
            cols: self.cols,
        }
    }

    pub(crate) fn expect_cols(&self, context: &str, cols: usize) -> Result<()> {
        if self.cols != cols {
            return Err(Error::dims(context, cols, self.cols));
        }
        Ok(())
    }
}
