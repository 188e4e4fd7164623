//! Label preprocessing.
//!
//! Hard labels are class indices `0..k` stored as an `(n, 1)` matrix. Training consumes
//! soft labels of shape `(n, k - 1)`: a distribution over classes `1..k` whose missing
//! mass (`1 - sum(row)`) belongs to the implicit class 0.
//!
//! The column count always comes from the declared cardinality, so a batch in which the
//! highest class never appears still produces `k - 1` columns.

use crate::{Error, Matrix, Result};

/// One-hot expand class indices into an `(n, k)` matrix.
///
/// Panics if any label is `>= k`; use [`preprocess_labels`] for validated input.
pub fn hard_to_soft(labels: &[usize], k: usize) -> Matrix {
    let mut soft = Matrix::zeros(labels.len(), k);
    for (i, &y) in labels.iter().enumerate() {
        soft.row_mut(i)[y] = 1.0;
    }
    soft
}

/// Convert labels into the soft `(n, k - 1)` format consumed by the loss.
///
/// - A matrix with `k - 1` or `k` columns is already distributional and is returned
///   unchanged; any other width above one is `Error::DimensionMismatch`.
/// - A single column is read as hard labels: each value must be a non-negative integer
///   (`Error::TypeConversion` otherwise) below `k` (`Error::InvalidData` otherwise).
///   The one-hot expansion drops the class 0 column.
pub fn preprocess_labels(y: &Matrix, k: usize) -> Result<Matrix> {
    if y.cols() > 1 {
        if y.cols() + 1 != k && y.cols() != k {
            return Err(Error::dims("soft labels", k.saturating_sub(1), y.cols()));
        }
        return Ok(y.clone());
    }

    let hard = hard_labels(y, k)?;
    Ok(hard_to_soft(&hard, k).drop_leading_cols(1))
}

/// Read a single-column matrix as validated class indices.
pub fn hard_labels(y: &Matrix, k: usize) -> Result<Vec<usize>> {
    y.expect_cols("hard labels", 1)?;

    let mut out = Vec::with_capacity(y.rows());
    for (i, &v) in y.as_slice().iter().enumerate() {
        if !(v.is_finite() && v >= 0.0 && v.fract() == 0.0) {
            return Err(Error::TypeConversion(format!(
                "label {i} is {v}, expected a non-negative integral class index"
            )));
        }
        let class = v as usize;
        if class >= k {
            return Err(Error::InvalidData(format!(
                "label {i} is class {class}, but cardinality is {k}"
            )));
        }
        out.push(class);
    }
    Ok(out)
}

/// Most likely class per row for hard, `k - 1`-wide soft, or `k`-wide soft labels.
pub fn gold_classes(y: &Matrix, k: usize) -> Result<Vec<usize>> {
    if y.cols() == 1 {
        return hard_labels(y, k);
    }

    let implicit_class0 = if y.cols() == k - 1 {
        true
    } else if y.cols() == k {
        false
    } else {
        return Err(Error::dims("soft labels", k, y.cols()));
    };

    let mut out = Vec::with_capacity(y.rows());
    for r in 0..y.rows() {
        let row = y.row(r);
        let (mut best, mut best_p, offset) = if implicit_class0 {
            (0, (1.0 - row.iter().sum::<f32>()).max(0.0), 1)
        } else {
            (0, row[0], 0)
        };
        for (j, &p) in row.iter().enumerate().skip(1 - offset) {
            if p > best_p {
                best = j + offset;
                best_p = p;
            }
        }
        out.push(best);
    }
    Ok(out)
}
