//! Optimizers.
//!
//! Optimizers update a network given the gradients accumulated in its parameters.
//!
//! Design notes:
//! - Optimizer *state* (momentum/Adam moments) lives outside the network, one buffer per
//!   parameter slot in `Network::params_mut` order.
//! - The training loop owns the optimizer state and reuses it across steps.

use serde::{Deserialize, Serialize};

use crate::stage::Param;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// `train_config.optimizer_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    pub optimizer: OptimizerKind,
    pub lr: f32,
    /// SGD momentum; `0.0` selects plain SGD.
    pub momentum: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            lr: 0.01,
            momentum: 0.9,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "lr must be finite and > 0, got {}",
                self.lr
            )));
        }
        self.build()?.validate()
    }

    pub fn build(&self) -> Result<Optimizer> {
        let opt = match self.optimizer {
            OptimizerKind::Sgd if self.momentum == 0.0 => Optimizer::Sgd,
            OptimizerKind::Sgd => Optimizer::SgdMomentum {
                momentum: self.momentum,
            },
            OptimizerKind::Adam => Optimizer::Adam {
                beta1: self.beta1,
                beta2: self.beta2,
                eps: self.eps,
            },
        };
        Ok(opt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
/// Optimizer choice for training.
pub enum Optimizer {
    /// Plain SGD.
    #[default]
    Sgd,
    /// SGD with momentum.
    SgdMomentum { momentum: f32 },
    /// Adam (bias-corrected).
    Adam { beta1: f32, beta2: f32, eps: f32 },
}

impl Optimizer {
    /// Validate optimizer hyperparameters.
    pub fn validate(self) -> Result<()> {
        match self {
            Optimizer::Sgd => Ok(()),
            Optimizer::SgdMomentum { momentum } => {
                if !(momentum.is_finite() && (0.0..1.0).contains(&momentum)) {
                    return Err(Error::InvalidConfig(format!(
                        "momentum must be finite and in [0,1), got {momentum}"
                    )));
                }
                Ok(())
            }
            Optimizer::Adam { beta1, beta2, eps } => {
                if !(beta1.is_finite() && (0.0..1.0).contains(&beta1)) {
                    return Err(Error::InvalidConfig(format!(
                        "adam beta1 must be finite and in [0,1), got {beta1}"
                    )));
                }
                if !(beta2.is_finite() && (0.0..1.0).contains(&beta2)) {
                    return Err(Error::InvalidConfig(format!(
                        "adam beta2 must be finite and in [0,1), got {beta2}"
                    )));
                }
                if !(eps.is_finite() && eps > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "adam eps must be finite and > 0, got {eps}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Allocate optimizer state for the given parameter slots.
    pub fn state(self, params: &[Param<'_>]) -> Result<OptimizerState> {
        self.validate()?;

        match self {
            Optimizer::Sgd => Ok(OptimizerState::Sgd),
            Optimizer::SgdMomentum { momentum } => Ok(OptimizerState::SgdMomentum {
                momentum,
                velocity: zeros_like(params),
            }),
            Optimizer::Adam { beta1, beta2, eps } => Ok(OptimizerState::Adam {
                beta1,
                beta2,
                eps,
                t: 0,
                beta1_pow: 1.0,
                beta2_pow: 1.0,
                m: zeros_like(params),
                v: zeros_like(params),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Owned optimizer state.
pub enum OptimizerState {
    /// Plain SGD (no state).
    #[default]
    Sgd,
    /// SGD with momentum state.
    SgdMomentum {
        momentum: f32,
        velocity: Vec<Vec<f32>>,
    },
    /// Adam state.
    Adam {
        beta1: f32,
        beta2: f32,
        eps: f32,
        t: u64,
        beta1_pow: f32,
        beta2_pow: f32,
        m: Vec<Vec<f32>>,
        v: Vec<Vec<f32>>,
    },
}

impl OptimizerState {
    /// Apply one optimizer step.
    ///
    /// `lr` is passed in from the training loop to support learning rate schedules.
    /// A non-positive or non-finite `lr` is `InvalidConfig`; a state built for a
    /// different parameter list is `DimensionMismatch`.
    pub fn step(&mut self, params: &mut [Param<'_>], lr: f32) -> Result<()> {
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "lr must be finite and > 0, got {lr}"
            )));
        }

        match self {
            OptimizerState::Sgd => {
                for p in params.iter_mut() {
                    sgd_step(p.value, p.grad, lr);
                }
            }
            OptimizerState::SgdMomentum { momentum, velocity } => {
                if velocity.len() != params.len() {
                    return Err(Error::dims("optimizer state slots", velocity.len(), params.len()));
                }

                for (p, vel) in params.iter_mut().zip(velocity.iter_mut()) {
                    debug_assert_eq!(vel.len(), p.grad.len());
                    for (v, &g) in vel.iter_mut().zip(p.grad.iter()) {
                        *v = (*momentum) * *v + g;
                    }
                    sgd_step(p.value, vel, lr);
                }
            }
            OptimizerState::Adam {
                beta1,
                beta2,
                eps,
                t,
                beta1_pow,
                beta2_pow,
                m,
                v,
            } => {
                if m.len() != params.len() {
                    return Err(Error::dims("optimizer state slots", m.len(), params.len()));
                }

                *t += 1;
                *beta1_pow *= *beta1;
                *beta2_pow *= *beta2;

                let one_minus_beta1 = 1.0 - *beta1;
                let one_minus_beta2 = 1.0 - *beta2;
                let corr1 = 1.0 - *beta1_pow;
                let corr2 = 1.0 - *beta2_pow;

                for ((p, ms), vs) in params.iter_mut().zip(m.iter_mut()).zip(v.iter_mut()) {
                    debug_assert_eq!(ms.len(), p.grad.len());
                    for i in 0..p.value.len() {
                        let g = p.grad[i];
                        ms[i] = (*beta1) * ms[i] + one_minus_beta1 * g;
                        vs[i] = (*beta2) * vs[i] + one_minus_beta2 * (g * g);

                        let m_hat = ms[i] / corr1;
                        let v_hat = vs[i] / corr2;
                        p.value[i] -= lr * m_hat / (v_hat.sqrt() + *eps);
                    }
                }
            }
        }
        Ok(())
    }
}

#[inline]
fn sgd_step(value: &mut [f32], direction: &[f32], lr: f32) {
    for (w, &d) in value.iter_mut().zip(direction) {
        *w -= lr * d;
    }
}

fn zeros_like(params: &[Param<'_>]) -> Vec<Vec<f32>> {
    params.iter().map(|p| vec![0.0; p.value.len()]).collect()
}
