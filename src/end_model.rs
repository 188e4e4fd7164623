//! The configurable end-model classifier.
//!
//! An [`EndModel`] owns a configuration tree, the network assembled from it, a
//! sum-reduced soft cross-entropy criterion and the RNG that drives initialization,
//! dropout and shuffling.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::Value;
use tracing::debug;

use crate::builder::NetworkBuilder;
use crate::config::{Config, EndModelConfig};
use crate::data::make_loader;
use crate::labels::{gold_classes, preprocess_labels};
use crate::loss::{Reduction, SoftCrossEntropyLoss, softmax_rows};
use crate::metrics::{Metric, argmax_rows};
use crate::network::{Network, ResetReport};
use crate::stage::Stage;
use crate::train::{self, DevSet, TrainReport};
use crate::{Error, Matrix, Result};

/// Builder for an [`EndModel`].
///
/// ```rust
/// use end_model::{EndModelBuilder, Matrix};
/// use serde_json::json;
///
/// # fn main() -> end_model::Result<()> {
/// let model = EndModelBuilder::new(3)
///     .config(json!({"layer_out_dims": [4, 8], "seed": 1}))
///     .build()?;
///
/// let probs = model.predict_proba(&Matrix::zeros(2, 4))?;
/// assert_eq!((probs.rows(), probs.cols()), (2, 3));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EndModelBuilder {
    k: usize,
    overrides: Value,
    input_module: Option<Box<dyn Stage>>,
    middle_modules: Option<Vec<Box<dyn Stage>>>,
    head_module: Option<Box<dyn Stage>>,
}

impl EndModelBuilder {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            overrides: Value::Object(Default::default()),
            input_module: None,
            middle_modules: None,
            head_module: None,
        }
    }

    /// Merge `overrides` into the configuration; repeated calls accumulate.
    pub fn config(mut self, overrides: Value) -> Self {
        self.overrides = crate::config::merge(&self.overrides, &overrides);
        self
    }

    pub fn input_module(mut self, module: Box<dyn Stage>) -> Self {
        self.input_module = Some(module);
        self
    }

    pub fn middle_modules(mut self, modules: Vec<Box<dyn Stage>>) -> Self {
        self.middle_modules = Some(modules);
        self
    }

    pub fn head_module(mut self, module: Box<dyn Stage>) -> Self {
        self.head_module = Some(module);
        self
    }

    pub fn build(self) -> Result<EndModel> {
        let config = Config::with_overrides(&self.overrides);
        let settings = config.settings()?;
        let mut rng = seeded_rng(settings.seed);

        let mut network = NetworkBuilder::from_settings(self.k, &settings)?;
        if let Some(module) = self.input_module {
            network = network.input_module(module);
        }
        if let Some(modules) = self.middle_modules {
            network = network.middle_modules(modules);
        }
        if let Some(module) = self.head_module {
            network = network.head_module(module);
        }
        let network = network.build_with_rng(&mut rng)?;

        if settings.verbose {
            println!("{network}");
        }

        Ok(EndModel {
            k: self.k,
            config,
            network,
            criteria: SoftCrossEntropyLoss::new(self.k, Reduction::Sum)?,
            rng,
        })
    }
}

#[derive(Debug)]
pub struct EndModel {
    k: usize,
    config: Config,
    network: Network,
    criteria: SoftCrossEntropyLoss,
    rng: StdRng,
}

impl EndModel {
    /// Default architecture over `k` classes with `overrides` merged into the defaults.
    pub fn new(k: usize, overrides: Value) -> Result<Self> {
        EndModelBuilder::new(k).config(overrides).build()
    }

    #[inline]
    pub fn cardinality(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Typed view of the current configuration.
    pub fn settings(&self) -> Result<EndModelConfig> {
        self.config.settings()
    }

    #[inline]
    pub fn network(&self) -> &Network {
        &self.network
    }

    #[inline]
    pub fn criteria(&self) -> &SoftCrossEntropyLoss {
        &self.criteria
    }

    /// Raw `(n, k)` class scores.
    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        self.network.forward(x)
    }

    /// Train from scratch on `(x, y)`.
    ///
    /// `overrides` apply to this call only: they are merged into a copy of the
    /// configuration, which is left unchanged. Use [`EndModel::update_config`] for
    /// lasting changes. Architecture keys (`layer_out_dims`, `batchnorm`, `dropout`) are
    /// fixed at construction and have no effect here.
    ///
    /// All parameters are re-initialized before the first epoch. Inputs, labels and the
    /// dev set are checked first, so a rejected call leaves the network as it was.
    pub fn train(
        &mut self,
        x: &Matrix,
        y: &Matrix,
        dev: Option<(&Matrix, &Matrix)>,
        overrides: &Value,
    ) -> Result<TrainReport> {
        let settings = self.config.merged(overrides).settings()?;
        let train_config = &settings.train_config;

        let mut loader = make_loader(x, y, self.k, &train_config.data_loader_config, 0)?;
        self.network.infer_width(Some(x.cols()))?;
        if settings.batchnorm && loader.smallest_batch() == 1 {
            return Err(Error::InvalidData(format!(
                "{} examples with batch_size {} leave a 1-row batch, which batch norm \
                 cannot train on; set drop_last or change batch_size",
                x.rows(),
                loader.batch_size()
            )));
        }
        let dev = dev.map(|(inputs, labels)| DevSet { inputs, labels });
        if let Some(dev) = dev {
            dev.validate(self.k)?;
            dev.inputs.expect_cols("dev inputs", x.cols())?;
        }

        self.reset_with_seed(settings.seed);
        loader.reseed(self.rng.next_u64());
        train::run(
            &mut self.network,
            &self.criteria,
            &mut loader,
            dev,
            train_config,
            settings.verbose,
            &mut self.rng,
        )
    }

    /// Row-wise softmax over the raw scores; each row sums to 1.
    pub fn predict_proba(&self, x: &Matrix) -> Result<Matrix> {
        Ok(softmax_rows(&self.forward(x)?))
    }

    /// Most likely class index per row.
    pub fn predict(&self, x: &Matrix) -> Result<Vec<usize>> {
        Ok(argmax_rows(&self.forward(x)?))
    }

    /// Score predictions on `x` against hard or soft labels `y`.
    pub fn score(&self, x: &Matrix, y: &Matrix, metric: Metric) -> Result<f32> {
        let gold = gold_classes(y, self.k)?;
        metric.compute(&self.predict_proba(x)?, &gold)
    }

    /// Merge `overrides` into the configuration in place.
    ///
    /// The merged tree is validated first; on error the configuration is unchanged.
    pub fn update_config(&mut self, overrides: &Value) -> Result<()> {
        let mut next = self.config.clone();
        next.update(overrides);
        next.settings()?;
        self.config = next;
        Ok(())
    }

    /// Re-initialize every stage, reseeding first when `seed` is configured.
    pub fn reset(&mut self) -> ResetReport {
        let seed = self.config.get("seed").and_then(Value::as_u64);
        self.reset_with_seed(seed)
    }

    /// `loss(x, y) = criteria(forward(x), preprocess(y))`.
    pub fn loss_fn(&self) -> impl Fn(&Matrix, &Matrix) -> Result<f32> + '_ {
        move |x, y| {
            let targets = preprocess_labels(y, self.k)?;
            self.criteria.forward(&self.network.forward(x)?, &targets)
        }
    }

    fn reset_with_seed(&mut self, seed: Option<u64>) -> ResetReport {
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        let report = self.network.reset_parameters(&mut self.rng);
        debug!(
            initialized = report.initialized.len(),
            untouched = report.untouched.len(),
            "reset network parameters"
        );
        report
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
