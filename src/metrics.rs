//! Metrics.
//!
//! Metrics are evaluation helpers (they do not participate in backprop). They score a
//! `(n, k)` matrix of class probabilities or raw scores against gold class indices.

use serde::{Deserialize, Serialize};

use crate::{Error, Matrix, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Supported evaluation metrics.
pub enum Metric {
    /// Fraction of rows whose argmax is the gold class.
    Accuracy,
    /// Fraction of rows whose gold class is among the `k` highest entries.
    ///
    /// Requires `k <= cols`.
    TopKAccuracy { k: usize },
}

impl Metric {
    /// Validate metric parameters.
    pub fn validate(self) -> Result<()> {
        match self {
            Metric::TopKAccuracy { k } => {
                if k == 0 {
                    return Err(Error::InvalidConfig(
                        "TopKAccuracy requires k > 0".to_owned(),
                    ));
                }
            }
            Metric::Accuracy => {}
        }
        Ok(())
    }

    pub fn compute(self, probs: &Matrix, gold: &[usize]) -> Result<f32> {
        self.validate()?;
        if probs.rows() != gold.len() {
            return Err(Error::dims("metric gold labels", probs.rows(), gold.len()));
        }
        if probs.rows() == 0 {
            return Err(Error::InvalidData("cannot score an empty batch".to_owned()));
        }

        let k = match self {
            Metric::Accuracy => 1,
            Metric::TopKAccuracy { k } => {
                if k > probs.cols() {
                    return Err(Error::InvalidConfig(format!(
                        "TopKAccuracy k={k} exceeds {} classes",
                        probs.cols()
                    )));
                }
                k
            }
        };

        let mut correct = 0usize;
        for (r, &y) in gold.iter().enumerate() {
            if y >= probs.cols() {
                return Err(Error::InvalidData(format!(
                    "gold class {y} out of range for {} classes",
                    probs.cols()
                )));
            }
            if rank_of(probs.row(r), y) < k {
                correct += 1;
            }
        }
        Ok(correct as f32 / gold.len() as f32)
    }
}

/// Row-wise argmax; ties resolve to the lowest index.
pub fn argmax_rows(scores: &Matrix) -> Vec<usize> {
    (0..scores.rows())
        .map(|r| {
            let row = scores.row(r);
            let mut best = 0;
            for (j, &v) in row.iter().enumerate().skip(1) {
                if v > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

/// Number of entries ranked strictly ahead of `row[class]`.
///
/// Earlier indices win ties, matching [`argmax_rows`].
#[inline]
fn rank_of(row: &[f32], class: usize) -> usize {
    let target = row[class];
    row.iter()
        .enumerate()
        .filter(|&(j, &v)| v > target || (v == target && j < class))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probs() -> Matrix {
        Matrix::from_rows(&[
            vec![0.7, 0.2, 0.1],
            vec![0.1, 0.3, 0.6],
            vec![0.3, 0.4, 0.3],
            vec![0.5, 0.5, 0.0],
        ])
        .unwrap()
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let acc = Metric::Accuracy.compute(&probs(), &[0, 2, 0, 1]).unwrap();
        assert!((acc - 0.5).abs() < 1e-6);
        assert_eq!(argmax_rows(&probs()), vec![0, 2, 1, 0]);
    }

    #[test]
    fn top_k_accuracy_is_monotone_in_k() {
        let gold = [1, 1, 2, 2];
        let top1 = Metric::TopKAccuracy { k: 1 }.compute(&probs(), &gold).unwrap();
        let top2 = Metric::TopKAccuracy { k: 2 }.compute(&probs(), &gold).unwrap();
        let top3 = Metric::TopKAccuracy { k: 3 }.compute(&probs(), &gold).unwrap();
        assert!(top1 <= top2 && top2 <= top3);
        assert!((top3 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_arguments_are_errors() {
        assert!(Metric::TopKAccuracy { k: 0 }.validate().is_err());
        assert!(Metric::TopKAccuracy { k: 4 }.compute(&probs(), &[0, 0, 0, 0]).is_err());
        assert!(Metric::Accuracy.compute(&probs(), &[0, 0]).is_err());
        assert!(Metric::Accuracy.compute(&probs(), &[0, 0, 0, 3]).is_err());
    }
}
