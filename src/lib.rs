//! A configuration-driven classifier assembled from interchangeable network stages.
//!
//! `end-model` builds a discriminative classifier over `k` classes as an ordered list of
//! stages, `[input, middle_1..m, head]`, from a nested configuration tree. Each non-head
//! stage is wrapped with a ReLU and, depending on the configuration, batch normalization
//! and dropout. Training is a from-scratch, mini-batch loop against a sum-reduced soft
//! cross-entropy.
//!
//! # Design goals
//!
//! - Clear contracts: widths are checked when the network is assembled wherever stages
//!   declare them, and on the first forward pass otherwise.
//! - One label convention: hard labels `0..k` become `(n, k - 1)` soft labels with class 0
//!   implicit; the head always emits `k` scores and probabilities are `(n, k)`.
//! - Reproducible runs: a configured `seed` fixes initialization, dropout and shuffling.
//!
//! # Panics vs `Result`
//!
//! - Low-level kernels (`loss::softmax`, `loss::soft_cross_entropy`, optimizer steps)
//!   treat shape mismatches as programmer error and panic via `assert!`.
//! - Stages, the network, the builders and [`EndModel`] validate their inputs and
//!   return [`Result`].
//!
//! # Data layout and shapes
//!
//! - Scalars are `f32`.
//! - [`Matrix`] stores `(rows, cols)` values contiguously in row-major layout.
//! - Dense weights are row-major with shape `(out_dim, in_dim)`.
//! - Features are `(n, input_dim)`, raw scores and probabilities are `(n, k)`.
//!
//! # Logging
//!
//! The crate emits `tracing` events (assembly, loader creation, resets, per-epoch progress
//! when `verbose`). Install any subscriber to see them.
//!
//! # MSRV
//!
//! This crate's minimum supported Rust version (MSRV) is specified in `Cargo.toml`.

//! # Quick start
//!
//! ```rust
//! use end_model::{EndModel, Matrix, Metric};
//! use serde_json::json;
//!
//! # fn main() -> end_model::Result<()> {
//! let x = Matrix::from_rows(&[
//!     vec![0.0, 0.0],
//!     vec![0.0, 1.0],
//!     vec![1.0, 0.0],
//!     vec![1.0, 1.0],
//! ])?;
//! let y = Matrix::from_labels(&[0, 1, 1, 2]);
//!
//! let mut model = EndModel::new(3, json!({"layer_out_dims": [2, 8], "seed": 0}))?;
//! let _report = model.train(
//!     &x,
//!     &y,
//!     None,
//!     &json!({"train_config": {"n_epochs": 50, "data_loader_config": {"batch_size": 4}}}),
//! )?;
//!
//! let probs = model.predict_proba(&x)?;
//! assert_eq!(probs.cols(), 3);
//! let _acc = model.score(&x, &y, Metric::Accuracy)?;
//! # Ok(())
//! # }
//! ```

//! # Driving a network yourself (advanced)
//!
//! The pieces the model uses are public. A custom loop owns the network, the criterion
//! and the optimizer state:
//!
//! ```rust
//! use end_model::{Matrix, NetworkBuilder, Optimizer, Reduction, SoftCrossEntropyLoss};
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//!
//! # fn main() -> end_model::Result<()> {
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut network = NetworkBuilder::new(2, vec![3, 8])?.build_with_rng(&mut rng)?;
//! let criteria = SoftCrossEntropyLoss::new(2, Reduction::Sum)?;
//! let mut opt = Optimizer::Sgd.state(&network.params_mut())?;
//!
//! let x = Matrix::from_rows(&[vec![0.1, -0.2, 0.3]])?;
//! let t = Matrix::from_rows(&[vec![1.0]])?;
//!
//! network.zero_grad();
//! let scores = network.forward_train(&x, &mut rng)?;
//! let (_loss, d_scores) = criteria.backward(&scores, &t)?;
//! network.backward(&d_scores)?;
//! opt.step(&mut network.params_mut(), 1e-2)?;
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod batchnorm;
pub mod builder;
pub mod config;
pub mod data;
pub mod dropout;
pub mod end_model;
pub mod error;
pub mod labels;
pub mod linear;
pub mod loss;
pub(crate) mod matmul;
pub mod matrix;
pub mod metrics;
pub mod network;
pub mod optim;
pub mod stage;
pub mod train;

pub use activation::{Activation, Nonlinearity};
pub use batchnorm::BatchNorm1d;
pub use builder::{LayerBuilder, NetworkBuilder};
pub use config::{Config, EndModelConfig, merge};
pub use data::{Batch, DataLoader, DataLoaderConfig, Dataset, make_loader};
pub use dropout::Dropout;
pub use end_model::{EndModel, EndModelBuilder};
pub use error::{Error, Result};
pub use labels::{hard_to_soft, preprocess_labels};
pub use linear::{Init, Linear};
pub use loss::{Reduction, SoftCrossEntropyLoss};
pub use matrix::Matrix;
pub use metrics::Metric;
pub use network::{Network, ResetReport, Snapshot};
pub use optim::{Optimizer, OptimizerConfig, OptimizerState};
pub use stage::{Identity, Initializable, Param, Sequential, Stage};
pub use train::{EpochReport, LrSchedule, TrainConfig, TrainReport, ValidationMetric};
