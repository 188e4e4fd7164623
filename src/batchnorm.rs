//! Batch normalization over the feature dimension of `(batch, features)` inputs.

use rand::rngs::StdRng;

use crate::stage::{Initializable, Param, Stage};
use crate::{Error, Matrix, Result};

#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    num_features: usize,
    eps: f32,
    momentum: f32,
    // Parameters (learnable)
    gamma: Vec<f32>,
    beta: Vec<f32>,
    d_gamma: Vec<f32>,
    d_beta: Vec<f32>,
    // Buffers (non-learnable)
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    cache: Option<Cache>,
}

#[derive(Debug, Clone)]
struct Cache {
    x_hat: Matrix,
    inv_std: Vec<f32>,
}

impl BatchNorm1d {
    pub fn new(num_features: usize) -> Result<Self> {
        Self::new_with_params(num_features, 1e-5, 0.1)
    }

    pub fn new_with_params(num_features: usize, eps: f32, momentum: f32) -> Result<Self> {
        if num_features == 0 {
            return Err(Error::InvalidConfig(
                "batchnorm num_features must be > 0".to_owned(),
            ));
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "batchnorm eps must be finite and > 0, got {eps}"
            )));
        }
        if !(momentum.is_finite() && (0.0..=1.0).contains(&momentum)) {
            return Err(Error::InvalidConfig(format!(
                "batchnorm momentum must be in [0,1], got {momentum}"
            )));
        }

        Ok(Self {
            num_features,
            eps,
            momentum,
            gamma: vec![1.0; num_features],
            beta: vec![0.0; num_features],
            d_gamma: vec![0.0; num_features],
            d_beta: vec![0.0; num_features],
            running_mean: vec![0.0; num_features],
            running_var: vec![1.0; num_features],
            cache: None,
        })
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    #[inline]
    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    #[inline]
    pub fn running_var(&self) -> &[f32] {
        &self.running_var
    }

    fn normalize(&self, input: &Matrix, mean: &[f32], inv_std: &[f32]) -> (Matrix, Matrix) {
        let mut x_hat = input.clone();
        for r in 0..input.rows() {
            for (c, v) in x_hat.row_mut(r).iter_mut().enumerate() {
                *v = (*v - mean[c]) * inv_std[c];
            }
        }
        let mut out = x_hat.clone();
        for r in 0..out.rows() {
            for (c, v) in out.row_mut(r).iter_mut().enumerate() {
                *v = self.gamma[c].mul_add(*v, self.beta[c]);
            }
        }
        (x_hat, out)
    }
}

impl Initializable for BatchNorm1d {
    fn reset_parameters(&mut self, _rng: &mut StdRng) -> bool {
        self.gamma.fill(1.0);
        self.beta.fill(0.0);
        self.running_mean.fill(0.0);
        self.running_var.fill(1.0);
        true
    }
}

impl Stage for BatchNorm1d {
    fn name(&self) -> &'static str {
        "BatchNorm1d"
    }

    fn describe(&self) -> String {
        format!(
            "BatchNorm1d({}, eps={}, momentum={})",
            self.num_features, self.eps, self.momentum
        )
    }

    fn in_dim(&self) -> Option<usize> {
        Some(self.num_features)
    }

    fn out_dim(&self) -> Option<usize> {
        Some(self.num_features)
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix> {
        input.expect_cols("BatchNorm1d input", self.num_features)?;
        let inv_std: Vec<f32> = self
            .running_var
            .iter()
            .map(|&v| 1.0 / (v + self.eps).sqrt())
            .collect();
        let (_, out) = self.normalize(input, &self.running_mean, &inv_std);
        Ok(out)
    }

    fn forward_train(&mut self, input: &Matrix, _rng: &mut StdRng) -> Result<Matrix> {
        input.expect_cols("BatchNorm1d input", self.num_features)?;
        let n = input.rows();
        if n < 2 {
            return Err(Error::InvalidData(format!(
                "BatchNorm1d needs more than 1 sample per batch in training, got {n}; \
                 adjust batch_size or set drop_last to skip a short final batch"
            )));
        }

        let inv_n = 1.0 / n as f32;
        let mut mean = vec![0.0_f32; self.num_features];
        for r in 0..n {
            for (m, &x) in mean.iter_mut().zip(input.row(r)) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m *= inv_n);

        // Biased variance for normalization.
        let mut var = vec![0.0_f32; self.num_features];
        for r in 0..n {
            for (c, &x) in input.row(r).iter().enumerate() {
                let diff = x - mean[c];
                var[c] = diff.mul_add(diff, var[c]);
            }
        }
        var.iter_mut().for_each(|v| *v *= inv_n);

        // Running statistics use the unbiased variance.
        let m = self.momentum;
        let bessel = n as f32 / (n - 1) as f32;
        for c in 0..self.num_features {
            self.running_mean[c] = (1.0 - m) * self.running_mean[c] + m * mean[c];
            self.running_var[c] = (1.0 - m) * self.running_var[c] + m * var[c] * bessel;
        }

        let inv_std: Vec<f32> = var.iter().map(|&v| 1.0 / (v + self.eps).sqrt()).collect();
        let (x_hat, out) = self.normalize(input, &mean, &inv_std);
        self.cache = Some(Cache { x_hat, inv_std });
        Ok(out)
    }

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            Error::InvalidData("BatchNorm1d backward called before forward_train".to_owned())
        })?;
        d_output.expect_cols("BatchNorm1d gradient", self.num_features)?;
        let n = cache.x_hat.rows();
        if d_output.rows() != n {
            return Err(Error::dims("BatchNorm1d gradient rows", n, d_output.rows()));
        }

        let mut sum_dy = vec![0.0_f32; self.num_features];
        let mut sum_dy_xhat = vec![0.0_f32; self.num_features];
        for r in 0..n {
            for (c, (&dy, &xh)) in d_output.row(r).iter().zip(cache.x_hat.row(r)).enumerate() {
                sum_dy[c] += dy;
                sum_dy_xhat[c] = dy.mul_add(xh, sum_dy_xhat[c]);
            }
        }

        for c in 0..self.num_features {
            self.d_gamma[c] += sum_dy_xhat[c];
            self.d_beta[c] += sum_dy[c];
        }

        // dx = gamma * inv_std / N * (N * dy - sum(dy) - x_hat * sum(dy * x_hat))
        let n_f = n as f32;
        let mut d_input = Matrix::zeros(n, self.num_features);
        for r in 0..n {
            let dy = d_output.row(r);
            let xh = cache.x_hat.row(r);
            for (c, dx) in d_input.row_mut(r).iter_mut().enumerate() {
                let scale = self.gamma[c] * cache.inv_std[c] / n_f;
                *dx = scale * (n_f * dy[c] - sum_dy[c] - xh[c] * sum_dy_xhat[c]);
            }
        }
        Ok(d_input)
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.gamma,
                grad: &mut self.d_gamma,
            },
            Param {
                value: &mut self.beta,
                grad: &mut self.d_beta,
            },
        ]
    }

    fn buffers_mut(&mut self) -> Vec<&mut [f32]> {
        vec![&mut self.running_mean, &mut self.running_var]
    }

    fn param_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}
