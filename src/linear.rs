//! Dense (fully-connected) stage.
//!
//! Computes `y = x W^T + b` for a `(batch, in_dim)` input.

use rand::Rng;
use rand::rngs::StdRng;

use crate::matmul::{View, gemm};
use crate::stage::{Initializable, Param, Stage};
use crate::{Error, Matrix, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Weight initialization scheme (uniform variants, biases start at zero).
pub enum Init {
    /// He/Kaiming uniform: `U(-sqrt(6 / fan_in), sqrt(6 / fan_in))`. Suited to ReLU.
    #[default]
    He,
    /// Xavier/Glorot uniform: `U(-sqrt(6 / (fan_in + fan_out)), ...)`.
    Xavier,
}

impl Init {
    fn bound(self, fan_in: usize, fan_out: usize) -> f32 {
        match self {
            Init::He => (6.0 / fan_in as f32).sqrt(),
            Init::Xavier => (6.0 / (fan_in + fan_out) as f32).sqrt(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    in_dim: usize,
    out_dim: usize,
    init: Init,
    /// Row-major matrix with shape (out_dim, in_dim).
    weights: Vec<f32>,
    biases: Vec<f32>,
    d_weights: Vec<f32>,
    d_biases: Vec<f32>,
    input: Option<Matrix>,
}

impl Linear {
    /// A zero-initialized layer; call `reset_parameters` (or build through the network
    /// builder) before training.
    pub fn new(in_dim: usize, out_dim: usize, init: Init) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "linear dims must be > 0, got in_dim={in_dim} out_dim={out_dim}"
            )));
        }
        Ok(Self {
            in_dim,
            out_dim,
            init,
            weights: vec![0.0; in_dim * out_dim],
            biases: vec![0.0; out_dim],
            d_weights: vec![0.0; in_dim * out_dim],
            d_biases: vec![0.0; out_dim],
            input: None,
        })
    }

    pub fn new_with_rng(in_dim: usize, out_dim: usize, init: Init, rng: &mut StdRng) -> Result<Self> {
        let mut layer = Self::new(in_dim, out_dim, init)?;
        layer.reset_parameters(rng);
        Ok(layer)
    }

    /// Build a layer from explicit parameters.
    pub fn from_parts(in_dim: usize, out_dim: usize, weights: Vec<f32>, biases: Vec<f32>) -> Result<Self> {
        let mut layer = Self::new(in_dim, out_dim, Init::default())?;
        if weights.len() != in_dim * out_dim {
            return Err(Error::dims("linear weights", in_dim * out_dim, weights.len()));
        }
        if biases.len() != out_dim {
            return Err(Error::dims("linear biases", out_dim, biases.len()));
        }
        if weights.iter().chain(&biases).any(|v| !v.is_finite()) {
            return Err(Error::InvalidData(
                "linear parameters must be finite".to_owned(),
            ));
        }
        layer.weights = weights;
        layer.biases = biases;
        Ok(layer)
    }

    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    #[inline]
    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    #[inline]
    pub fn d_weights(&self) -> &[f32] {
        &self.d_weights
    }

    #[inline]
    pub fn d_biases(&self) -> &[f32] {
        &self.d_biases
    }
}

impl Initializable for Linear {
    fn reset_parameters(&mut self, rng: &mut StdRng) -> bool {
        let bound = self.init.bound(self.in_dim, self.out_dim);
        for w in &mut self.weights {
            *w = rng.gen_range(-bound..bound);
        }
        self.biases.fill(0.0);
        true
    }
}

impl Stage for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn describe(&self) -> String {
        format!("Linear(in_dim={}, out_dim={})", self.in_dim, self.out_dim)
    }

    fn in_dim(&self) -> Option<usize> {
        Some(self.in_dim)
    }

    fn out_dim(&self) -> Option<usize> {
        Some(self.out_dim)
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix> {
        input.expect_cols("Linear input", self.in_dim)?;

        let batch = input.rows();
        let mut out = Matrix::zeros(batch, self.out_dim);
        if batch == 0 {
            return Ok(out);
        }
        for r in 0..batch {
            out.row_mut(r).copy_from_slice(&self.biases);
        }

        // out (batch, out) += x (batch, in) * W^T (in, out)
        gemm(
            View::row_major(input.as_slice(), batch, self.in_dim),
            View::row_major(&self.weights, self.out_dim, self.in_dim).t(),
            1.0,
            out.as_mut_slice(),
        );
        Ok(out)
    }

    fn forward_train(&mut self, input: &Matrix, _rng: &mut StdRng) -> Result<Matrix> {
        let out = self.forward(input)?;
        self.input = Some(input.clone());
        Ok(out)
    }

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        let input = self.input.as_ref().ok_or_else(|| {
            Error::InvalidData("Linear backward called before forward_train".to_owned())
        })?;
        d_output.expect_cols("Linear gradient", self.out_dim)?;
        if d_output.rows() != input.rows() {
            return Err(Error::dims("Linear gradient rows", input.rows(), d_output.rows()));
        }

        let batch = input.rows();
        let mut d_input = Matrix::zeros(batch, self.in_dim);
        if batch == 0 {
            return Ok(d_input);
        }

        // d_biases += column sums of d_output
        for r in 0..batch {
            for (db, &g) in self.d_biases.iter_mut().zip(d_output.row(r)) {
                *db += g;
            }
        }

        let d_out = View::row_major(d_output.as_slice(), batch, self.out_dim);

        // d_weights (out, in) += d_output^T (out, batch) * x (batch, in)
        gemm(
            d_out.t(),
            View::row_major(input.as_slice(), batch, self.in_dim),
            1.0,
            &mut self.d_weights,
        );

        // d_input (batch, in) = d_output (batch, out) * W (out, in)
        gemm(
            d_out,
            View::row_major(&self.weights, self.out_dim, self.in_dim),
            0.0,
            d_input.as_mut_slice(),
        );

        Ok(d_input)
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.weights,
                grad: &mut self.d_weights,
            },
            Param {
                value: &mut self.biases,
                grad: &mut self.d_biases,
            },
        ]
    }

    fn param_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn forward_computes_affine_map() {
        let layer = Linear::from_parts(2, 2, vec![1.0, 2.0, 3.0, 4.0], vec![0.5, -0.5]).unwrap();
        let x = Matrix::from_rows(&[vec![1.0, 1.0], vec![0.0, 2.0]]).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.as_slice(), &[3.5, 6.5, 4.5, 7.5]);
    }

    #[test]
    fn forward_rejects_wrong_input_width() {
        let layer = Linear::new(3, 2, Init::He).unwrap();
        let x = Matrix::zeros(1, 4);
        assert!(matches!(
            layer.forward(&x).unwrap_err(),
            Error::DimensionMismatch {
                expected: 3,
                got: 4,
                ..
            }
        ));
    }

    #[test]
    fn backward_accumulates_gradients() {
        let mut layer = Linear::from_parts(2, 1, vec![1.0, -1.0], vec![0.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let x = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        layer.forward_train(&x, &mut rng).unwrap();

        let d = Matrix::from_rows(&[vec![1.0], vec![0.5]]).unwrap();
        let dx = layer.backward(&d).unwrap();

        assert_eq!(layer.d_weights(), &[1.0 + 1.5, 2.0 + 2.0]);
        assert_eq!(layer.d_biases(), &[1.5]);
        assert_eq!(dx.as_slice(), &[1.0, -1.0, 0.5, -0.5]);

        layer.zero_grad();
        assert_eq!(layer.d_weights(), &[0.0, 0.0]);
    }

    #[test]
    fn reset_draws_within_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::new_with_rng(6, 4, Init::He, &mut rng).unwrap();
        let bound = 1.0_f32;
        assert!(layer.weights().iter().all(|w| w.abs() <= bound));
        assert!(layer.weights().iter().any(|&w| w != 0.0));
        assert!(layer.biases().iter().all(|&b| b == 0.0));
    }
}
