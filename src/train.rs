//! Training loop.
//!
//! [`run`] drives mini-batch optimization of a [`Network`] against a
//! [`SoftCrossEntropyLoss`]: per-batch forward/backward, L2 weight decay, global
//! gradient-norm clipping, an optimizer step at the scheduled learning rate, periodic
//! dev-set evaluation and (optionally) restoring the best dev checkpoint at the end.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{DataLoader, DataLoaderConfig};
use crate::labels::{gold_classes, preprocess_labels};
use crate::loss::{Reduction, SoftCrossEntropyLoss, softmax_rows};
use crate::metrics::Metric;
use crate::network::{Network, Snapshot};
use crate::optim::OptimizerConfig;
use crate::stage::Param;
use crate::{Error, Matrix, Result};

/// Dev-set criterion used for reporting and checkpoint selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMetric {
    /// Higher is better.
    #[default]
    Accuracy,
    /// Mean per-example loss; lower is better.
    Loss,
}

impl ValidationMetric {
    #[inline]
    fn improves(self, candidate: f32, best: f32) -> bool {
        match self {
            ValidationMetric::Accuracy => candidate > best,
            ValidationMetric::Loss => candidate < best,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Constant,
    Exponential,
    Step,
}

/// `train_config.scheduler_config`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub scheduler: SchedulerKind,
    pub gamma: f32,
    /// Epochs between decays for the `step` scheduler.
    pub step_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::Constant,
            gamma: 0.9,
            step_size: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn schedule(&self) -> LrSchedule {
        match self.scheduler {
            SchedulerKind::Constant => LrSchedule::Constant,
            SchedulerKind::Exponential => LrSchedule::Exponential { gamma: self.gamma },
            SchedulerKind::Step => LrSchedule::Step {
                step_size: self.step_size,
                gamma: self.gamma,
            },
        }
    }
}

/// Per-epoch learning rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `lr * gamma^epoch`
    Exponential { gamma: f32 },
    /// `lr * gamma^(epoch / step_size)`
    Step { step_size: usize, gamma: f32 },
}

impl LrSchedule {
    pub fn validate(self) -> Result<()> {
        let gamma = match self {
            LrSchedule::Constant => return Ok(()),
            LrSchedule::Exponential { gamma } => gamma,
            LrSchedule::Step { step_size, gamma } => {
                if step_size == 0 {
                    return Err(Error::InvalidConfig("step_size must be > 0".to_owned()));
                }
                gamma
            }
        };
        if !(gamma.is_finite() && gamma > 0.0 && gamma <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "scheduler gamma must be in (0,1], got {gamma}"
            )));
        }
        Ok(())
    }

    /// Learning rate for the zero-based `epoch`.
    ///
    /// Decaying schedules bottom out at `f32::MIN_POSITIVE` instead of underflowing to 0.
    pub fn lr_at(self, base_lr: f32, epoch: usize) -> f32 {
        let (gamma, decays) = match self {
            LrSchedule::Constant => return base_lr,
            LrSchedule::Exponential { gamma } => (gamma, epoch),
            LrSchedule::Step { step_size, gamma } => (gamma, epoch / step_size),
        };
        let exponent = i32::try_from(decays).unwrap_or(i32::MAX);
        (base_lr * gamma.powi(exponent)).max(f32::MIN_POSITIVE)
    }
}

/// `train_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub n_epochs: usize,
    /// L2 weight decay added to every parameter gradient.
    pub l2: f32,
    /// Maximum global gradient norm; `null` disables clipping.
    pub grad_clip: Option<f32>,
    /// Evaluate (and log, when verbose) every this many epochs.
    pub print_every: usize,
    pub validation_metric: ValidationMetric,
    /// Restore the parameters with the best dev score after training.
    pub checkpoint: bool,
    pub optimizer_config: OptimizerConfig,
    pub scheduler_config: SchedulerConfig,
    pub data_loader_config: DataLoaderConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epochs: 10,
            l2: 0.0,
            grad_clip: Some(20.0),
            print_every: 1,
            validation_metric: ValidationMetric::Accuracy,
            checkpoint: true,
            optimizer_config: OptimizerConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            data_loader_config: DataLoaderConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_epochs == 0 {
            return Err(Error::InvalidConfig("n_epochs must be > 0".to_owned()));
        }
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "l2 must be finite and >= 0, got {}",
                self.l2
            )));
        }
        if let Some(max_norm) = self.grad_clip {
            if !(max_norm.is_finite() && max_norm > 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "grad_clip must be finite and > 0, got {max_norm}"
                )));
            }
        }
        if self.print_every == 0 {
            return Err(Error::InvalidConfig("print_every must be > 0".to_owned()));
        }
        self.optimizer_config.validate()?;
        self.scheduler_config.schedule().validate()?;
        self.data_loader_config.validate()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Mean per-example training loss over the epoch.
    pub train_loss: f32,
    pub dev_score: Option<f32>,
    pub lr: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrainReport {
    pub epochs: Vec<EpochReport>,
    pub best_epoch: Option<usize>,
    pub best_dev_score: Option<f32>,
    /// Whether the best dev checkpoint was restored at the end.
    pub restored: bool,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.train_loss)
    }
}

/// Labeled held-out data for evaluation during training.
#[derive(Debug, Clone, Copy)]
pub struct DevSet<'a> {
    pub inputs: &'a Matrix,
    pub labels: &'a Matrix,
}

impl DevSet<'_> {
    /// Check row counts and labels against cardinality `k` without touching a network.
    pub fn validate(self, k: usize) -> Result<()> {
        if self.inputs.rows() != self.labels.rows() {
            return Err(Error::InvalidData(format!(
                "dev inputs/labels length mismatch: {} vs {}",
                self.inputs.rows(),
                self.labels.rows()
            )));
        }
        if self.inputs.rows() == 0 {
            return Err(Error::InvalidData("dev set must not be empty".to_owned()));
        }
        preprocess_labels(self.labels, k).map(drop)
    }
}

/// Evaluate `network` on held-out data; see [`ValidationMetric`].
pub fn evaluate(
    network: &Network,
    criteria: &SoftCrossEntropyLoss,
    dev: DevSet<'_>,
    metric: ValidationMetric,
) -> Result<f32> {
    let k = criteria.cardinality();
    dev.validate(k)?;

    let scores = network.forward(dev.inputs)?;
    match metric {
        ValidationMetric::Accuracy => {
            let gold = gold_classes(dev.labels, k)?;
            Metric::Accuracy.compute(&softmax_rows(&scores), &gold)
        }
        ValidationMetric::Loss => {
            let targets = preprocess_labels(dev.labels, k)?;
            let total = criteria.forward(&scores, &targets)?;
            Ok(match criteria.reduction() {
                Reduction::Sum => total / scores.rows() as f32,
                Reduction::Mean => total,
            })
        }
    }
}

/// Train `network` for `config.n_epochs` passes over `loader`.
///
/// The loader must yield labels in a width `criteria` accepts. `rng` drives the
/// training-mode randomness inside the network (dropout masks).
pub fn run(
    network: &mut Network,
    criteria: &SoftCrossEntropyLoss,
    loader: &mut DataLoader,
    dev: Option<DevSet<'_>>,
    config: &TrainConfig,
    verbose: bool,
    rng: &mut StdRng,
) -> Result<TrainReport> {
    config.validate()?;
    if loader.num_batches() == 0 {
        return Err(Error::InvalidData(format!(
            "loader yields no batches ({} examples, batch_size {}, drop_last)",
            loader.dataset().len(),
            loader.batch_size()
        )));
    }

    let base_lr = config.optimizer_config.lr;
    let schedule = config.scheduler_config.schedule();
    let mut opt = config
        .optimizer_config
        .build()?
        .state(&network.params_mut())?;

    let mut report = TrainReport::default();
    let mut best: Option<Snapshot> = None;

    for epoch in 0..config.n_epochs {
        let lr = schedule.lr_at(base_lr, epoch);
        let mut total_loss = 0.0_f32;
        let mut seen = 0usize;

        for batch in loader.epoch() {
            network.zero_grad();
            let scores = network.forward_train(&batch.inputs, rng)?;
            let (loss, d_scores) = criteria.backward(&scores, &batch.labels)?;
            if !loss.is_finite() {
                return Err(Error::InvalidData(format!(
                    "non-finite training loss at epoch {epoch}"
                )));
            }
            network.backward(&d_scores)?;

            let mut params = network.params_mut();
            if config.l2 > 0.0 {
                apply_weight_decay(&mut params, config.l2);
            }
            if let Some(max_norm) = config.grad_clip {
                clip_grad_norm(&mut params, max_norm);
            }
            opt.step(&mut params, lr)?;

            total_loss += match criteria.reduction() {
                Reduction::Sum => loss,
                Reduction::Mean => loss * batch.len() as f32,
            };
            seen += batch.len();
        }

        let train_loss = total_loss / seen as f32;
        let is_eval_epoch =
            (epoch + 1) % config.print_every == 0 || epoch + 1 == config.n_epochs;

        let mut dev_score = None;
        if let (Some(dev), true) = (dev, is_eval_epoch) {
            let score = evaluate(network, criteria, dev, config.validation_metric)?;
            dev_score = Some(score);

            let improved = report
                .best_dev_score
                .is_none_or(|b| config.validation_metric.improves(score, b));
            if improved {
                report.best_epoch = Some(epoch);
                report.best_dev_score = Some(score);
                if config.checkpoint {
                    best = Some(network.snapshot());
                }
            }
        }

        if verbose && is_eval_epoch {
            info!(
                epoch = epoch + 1,
                n_epochs = config.n_epochs,
                train_loss,
                dev_score,
                lr,
                "epoch"
            );
        }

        report.epochs.push(EpochReport {
            epoch,
            train_loss,
            dev_score,
            lr,
        });
    }

    if let (Some(snapshot), Some(best_epoch)) = (best, report.best_epoch) {
        if best_epoch + 1 != config.n_epochs {
            network.restore(&snapshot)?;
            report.restored = true;
            info!(
                epoch = best_epoch + 1,
                dev_score = report.best_dev_score,
                "restored best model checkpoint"
            );
        }
    }

    Ok(report)
}

/// `grad += l2 * value` for every parameter.
fn apply_weight_decay(params: &mut [Param<'_>], l2: f32) {
    for p in params.iter_mut() {
        for (g, &w) in p.grad.iter_mut().zip(p.value.iter()) {
            *g = l2.mul_add(w, *g);
        }
    }
}

/// Rescale all gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [Param<'_>], max_norm: f32) -> f32 {
    let norm = params
        .iter()
        .flat_map(|p| p.grad.iter())
        .map(|&g| g * g)
        .sum::<f32>()
        .sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for p in params.iter_mut() {
            p.grad.iter_mut().for_each(|g| *g *= scale);
        }
    }
    norm
}
