//! Soft cross-entropy.
//!
//! The per-example loss for raw scores `x` (length `k`) and a target distribution `t` is
//!
//! - `L = -sum_y t[y] * log softmax(x)[y]`
//!
//! i.e. the hard-label cross-entropy of every class weighted by its target mass. The
//! gradient is `dL/dx = softmax(x) * sum(t) - t`.
//!
//! Targets may be `k`-wide, or `k - 1`-wide with class 0 implicit: its mass is
//! reconstructed as `max(0, 1 - sum(row))`.

use crate::{Error, Matrix, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// How per-example losses are combined over a batch.
pub enum Reduction {
    #[default]
    Sum,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftCrossEntropyLoss {
    k: usize,
    reduction: Reduction,
}

impl SoftCrossEntropyLoss {
    pub fn new(k: usize, reduction: Reduction) -> Result<Self> {
        if k < 2 {
            return Err(Error::InvalidConfig(format!(
                "cardinality must be >= 2, got {k}"
            )));
        }
        Ok(Self { k, reduction })
    }

    #[inline]
    pub fn cardinality(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Compute the reduced loss.
    pub fn forward(&self, scores: &Matrix, targets: &Matrix) -> Result<f32> {
        let implicit = self.check(scores, targets)?;
        let mut full = vec![0.0_f32; self.k];
        let mut total = 0.0_f32;
        for r in 0..scores.rows() {
            let t = self.full_target(targets.row(r), implicit, &mut full);
            total += soft_cross_entropy(scores.row(r), t);
        }
        Ok(self.reduce(total, scores.rows()))
    }

    /// Compute the reduced loss and its gradient w.r.t. `scores`.
    pub fn backward(&self, scores: &Matrix, targets: &Matrix) -> Result<(f32, Matrix)> {
        let implicit = self.check(scores, targets)?;
        let mut full = vec![0.0_f32; self.k];
        let mut d_scores = Matrix::zeros(scores.rows(), self.k);
        let mut total = 0.0_f32;
        for r in 0..scores.rows() {
            let t = self.full_target(targets.row(r), implicit, &mut full);
            total += soft_cross_entropy_backward(scores.row(r), t, d_scores.row_mut(r));
        }

        if self.reduction == Reduction::Mean && scores.rows() > 0 {
            let inv_n = 1.0 / scores.rows() as f32;
            d_scores.as_mut_slice().iter_mut().for_each(|d| *d *= inv_n);
        }
        Ok((self.reduce(total, scores.rows()), d_scores))
    }

    /// Returns whether targets carry an implicit class 0 column.
    fn check(&self, scores: &Matrix, targets: &Matrix) -> Result<bool> {
        scores.expect_cols("loss scores", self.k)?;
        if targets.rows() != scores.rows() {
            return Err(Error::dims("loss target rows", scores.rows(), targets.rows()));
        }
        if targets.cols() == self.k - 1 {
            Ok(true)
        } else if targets.cols() == self.k {
            Ok(false)
        } else {
            Err(Error::dims("loss target width", self.k - 1, targets.cols()))
        }
    }

    fn full_target<'a>(&self, row: &'a [f32], implicit: bool, buf: &'a mut [f32]) -> &'a [f32] {
        if !implicit {
            return row;
        }
        buf[0] = (1.0 - row.iter().sum::<f32>()).max(0.0);
        buf[1..].copy_from_slice(row);
        buf
    }

    fn reduce(&self, total: f32, rows: usize) -> f32 {
        match self.reduction {
            Reduction::Sum => total,
            Reduction::Mean if rows > 0 => total / rows as f32,
            Reduction::Mean => 0.0,
        }
    }
}

/// Soft cross-entropy over a single sample.
///
/// `logits` and `target` are length-K vectors.
#[inline]
pub fn soft_cross_entropy(logits: &[f32], target: &[f32]) -> f32 {
    assert_eq!(
        logits.len(),
        target.len(),
        "pred len {} does not match target len {}",
        logits.len(),
        target.len()
    );
    assert!(
        !logits.is_empty(),
        "soft_cross_entropy requires at least 1 class"
    );

    let (log_sum_exp, _max) = log_sum_exp_and_max(logits);

    // log softmax_i = logits[i] - log_sum_exp
    let mut sum = 0.0_f32;
    for i in 0..logits.len() {
        let t = target[i];
        if t != 0.0 {
            sum -= t * (logits[i] - log_sum_exp);
        }
    }
    sum
}

/// Soft cross-entropy + gradient w.r.t logits.
///
/// Writes `d_logits = softmax(logits) * sum(target) - target` and returns the loss.
/// Softmax is computed into `d_logits` and turned into a gradient in place.
#[inline]
pub fn soft_cross_entropy_backward(logits: &[f32], target: &[f32], d_logits: &mut [f32]) -> f32 {
    assert_eq!(
        logits.len(),
        target.len(),
        "pred len {} does not match target len {}",
        logits.len(),
        target.len()
    );
    assert_eq!(
        logits.len(),
        d_logits.len(),
        "pred len {} does not match d_pred len {}",
        logits.len(),
        d_logits.len()
    );
    assert!(
        !logits.is_empty(),
        "soft_cross_entropy_backward requires at least 1 class"
    );

    softmax(logits, d_logits);
    let (log_sum_exp, _max) = log_sum_exp_and_max(logits);

    let mut loss = 0.0_f32;
    let mut mass = 0.0_f32;
    for i in 0..logits.len() {
        let t = target[i];
        mass += t;
        if t != 0.0 {
            loss -= t * (logits[i] - log_sum_exp);
        }
    }

    for i in 0..logits.len() {
        d_logits[i] = d_logits[i] * mass - target[i];
    }

    loss
}

/// Numerically stable softmax of `logits` into `out`.
#[inline]
pub fn softmax(logits: &[f32], out: &mut [f32]) {
    debug_assert_eq!(logits.len(), out.len());

    let (_, max_logit) = log_sum_exp_and_max(logits);
    let mut sum_exp = 0.0_f32;
    for (o, &x) in out.iter_mut().zip(logits) {
        *o = (x - max_logit).exp();
        sum_exp += *o;
    }
    let inv_sum = 1.0 / sum_exp;
    for o in out.iter_mut() {
        *o *= inv_sum;
    }
}

/// Row-wise softmax of a `(n, k)` score matrix.
pub fn softmax_rows(scores: &Matrix) -> Matrix {
    let mut probs = Matrix::zeros(scores.rows(), scores.cols());
    if scores.cols() == 0 {
        return probs;
    }
    for r in 0..scores.rows() {
        softmax(scores.row(r), probs.row_mut(r));
    }
    probs
}

#[inline]
fn log_sum_exp_and_max(xs: &[f32]) -> (f32, f32) {
    let mut max_x = xs[0];
    for &x in xs.iter().skip(1) {
        if x > max_x {
            max_x = x;
        }
    }
    let mut sum_exp = 0.0_f32;
    for &x in xs {
        sum_exp += (x - max_x).exp();
    }
    (max_x + sum_exp.ln(), max_x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_cross_entropy_prefers_correct_class() {
        let logits_good = [5.0_f32, 0.0, -1.0];
        let logits_bad = [-1.0_f32, 0.0, 5.0];
        let target = [1.0_f32, 0.0, 0.0];
        assert!(soft_cross_entropy(&logits_good, &target) < soft_cross_entropy(&logits_bad, &target));
    }

    #[test]
    fn one_hot_target_matches_hard_cross_entropy() {
        let logits = [0.0_f32, 0.0];
        let target = [0.0_f32, 1.0];
        let loss = soft_cross_entropy(&logits, &target);
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn backward_matches_softmax_minus_target() {
        let logits = [1.0_f32, 2.0, 3.0];
        let target = [0.2_f32, 0.3, 0.5];
        let mut d = [0.0_f32; 3];
        let loss = soft_cross_entropy_backward(&logits, &target, &mut d);
        assert!((loss - soft_cross_entropy(&logits, &target)).abs() < 1e-6);

        let mut p = [0.0_f32; 3];
        softmax(&logits, &mut p);
        for i in 0..3 {
            assert!((d[i] - (p[i] - target[i])).abs() < 1e-6);
        }
    }

    #[test]
    fn implicit_class0_is_reconstructed() {
        let loss = SoftCrossEntropyLoss::new(3, Reduction::Sum).unwrap();
        let scores = Matrix::from_rows(&[vec![2.0, 0.0, -1.0], vec![0.0, 1.0, 0.0]]).unwrap();

        // Row 0 is class 0 (all-zero soft row), row 1 is class 1.
        let implicit = Matrix::from_rows(&[vec![0.0, 0.0], vec![1.0, 0.0]]).unwrap();
        let explicit = Matrix::from_rows(&[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]).unwrap();

        let a = loss.forward(&scores, &implicit).unwrap();
        let b = loss.forward(&scores, &explicit).unwrap();
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn sum_reduction_is_n_times_mean() {
        let scores = Matrix::from_rows(&[vec![0.3, -0.2], vec![1.0, 0.5], vec![-1.0, 2.0]]).unwrap();
        let targets = Matrix::from_flat(vec![1.0, 0.0, 1.0], 1).unwrap();
        let sum = SoftCrossEntropyLoss::new(2, Reduction::Sum).unwrap();
        let mean = SoftCrossEntropyLoss::new(2, Reduction::Mean).unwrap();

        let (ls, ds) = sum.backward(&scores, &targets).unwrap();
        let (lm, dm) = mean.backward(&scores, &targets).unwrap();
        assert!((ls - 3.0 * lm).abs() < 1e-5);
        for (a, b) in ds.as_slice().iter().zip(dm.as_slice()) {
            assert!((a - 3.0 * b).abs() < 1e-5);
        }
    }

    #[test]
    fn mismatched_widths_are_dimension_errors() {
        let loss = SoftCrossEntropyLoss::new(3, Reduction::Sum).unwrap();
        let scores = Matrix::zeros(2, 3);
        assert!(matches!(
            loss.forward(&scores, &Matrix::zeros(2, 4)).unwrap_err(),
            Error::DimensionMismatch { .. }
        ));
        assert!(matches!(
            loss.forward(&Matrix::zeros(2, 2), &Matrix::zeros(2, 2)).unwrap_err(),
            Error::DimensionMismatch { .. }
        ));
        assert!(SoftCrossEntropyLoss::new(1, Reduction::Sum).is_err());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let scores = Matrix::from_rows(&[vec![100.0, -100.0, 0.0], vec![1.0, 1.0, 1.0]]).unwrap();
        let p = softmax_rows(&scores);
        for r in 0..2 {
            let s: f32 = p.row(r).iter().sum();
            assert!((s - 1.0).abs() < 1e-6);
            assert!(p.row(r).iter().all(|&v| v >= 0.0));
        }
    }
}
