//! Network builder.
//!
//! [`NetworkBuilder`] is the recommended way to assemble a network. It composes
//!
//! - an input stage (identity by default) sized to `layer_out_dims[0]`,
//! - one middle stage per remaining entry of `layer_out_dims`, synthesized as dense
//!   layers unless the caller supplies its own modules,
//! - a head emitting `k` raw class scores (a dense layer by default, never wrapped).
//!
//! Every non-head module goes through [`LayerBuilder::make_layer`], which appends the
//! activation and the optional batch normalization and dropout stages.
//!
//! Default weight initializers follow the activation that consumes the layer output:
//! He/Kaiming for the ReLU-wrapped middle layers, Xavier/Glorot for the linear head.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::activation::Nonlinearity;
use crate::batchnorm::BatchNorm1d;
use crate::config::EndModelConfig;
use crate::dropout::Dropout;
use crate::linear::{Init, Linear};
use crate::network::Network;
use crate::stage::{Identity, Sequential, Stage};
use crate::{Error, Result};

/// Wraps base modules with activation, normalization and dropout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerBuilder {
    batchnorm: bool,
    dropout: f32,
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self {
            batchnorm: false,
            dropout: 0.0,
        }
    }
}

impl LayerBuilder {
    pub fn new(batchnorm: bool, dropout: f32) -> Result<Self> {
        if !(dropout.is_finite() && (0.0..1.0).contains(&dropout)) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be finite and in [0,1), got {dropout}"
            )));
        }
        Ok(Self { batchnorm, dropout })
    }

    #[inline]
    pub fn batchnorm(&self) -> bool {
        self.batchnorm
    }

    #[inline]
    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    /// Wrap `module` into `[module, ReLU, BatchNorm1d?, Dropout?]`.
    ///
    /// The passthrough module is returned as-is, whatever the flags. Batch normalization
    /// is only added when `output_dim` is known, since its size cannot be inferred.
    pub fn make_layer(
        &self,
        module: Box<dyn Stage>,
        output_dim: Option<usize>,
    ) -> Result<Box<dyn Stage>> {
        if module.is_passthrough() {
            return Ok(module);
        }

        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(4);
        stages.push(module);
        stages.push(Box::new(Nonlinearity::relu()));
        if self.batchnorm {
            if let Some(dim) = output_dim {
                stages.push(Box::new(BatchNorm1d::new(dim)?));
            }
        }
        if self.dropout > 0.0 {
            stages.push(Box::new(Dropout::new(self.dropout)?));
        }
        Ok(Box::new(Sequential::new(stages)))
    }
}

/// Builder for a [`Network`].
///
/// Example:
///
/// ```rust
/// use end_model::NetworkBuilder;
/// use end_model::Matrix;
///
/// # fn main() -> end_model::Result<()> {
/// let network = NetworkBuilder::new(3, vec![4, 8, 3])?
///     .batchnorm(true)
///     .dropout(0.1)?
///     .build_with_seed(0)?;
///
/// let scores = network.forward(&Matrix::zeros(2, 4))?;
/// assert_eq!(scores.cols(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct NetworkBuilder {
    k: usize,
    layer_out_dims: Vec<usize>,
    layers: LayerBuilder,
    input_module: Option<Box<dyn Stage>>,
    middle_modules: Option<Vec<Box<dyn Stage>>>,
    head_module: Option<Box<dyn Stage>>,
}

impl NetworkBuilder {
    /// Start building a network over `k` classes with the given layer widths.
    pub fn new(k: usize, layer_out_dims: Vec<usize>) -> Result<Self> {
        if k < 2 {
            return Err(Error::InvalidConfig(format!(
                "cardinality must be >= 2, got {k}"
            )));
        }
        if layer_out_dims.is_empty() {
            return Err(Error::InvalidConfig(
                "layer_out_dims must contain at least one dimension".to_owned(),
            ));
        }
        if layer_out_dims.contains(&0) {
            return Err(Error::InvalidConfig(
                "all layer_out_dims must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            k,
            layer_out_dims,
            layers: LayerBuilder::default(),
            input_module: None,
            middle_modules: None,
            head_module: None,
        })
    }

    /// Take `layer_out_dims`, `batchnorm` and `dropout` from validated settings.
    pub fn from_settings(k: usize, settings: &EndModelConfig) -> Result<Self> {
        let mut b = Self::new(k, settings.layer_out_dims.clone())?;
        b.layers = LayerBuilder::new(settings.batchnorm, settings.dropout)?;
        Ok(b)
    }

    pub fn batchnorm(mut self, enabled: bool) -> Self {
        self.layers.batchnorm = enabled;
        self
    }

    pub fn dropout(mut self, p: f32) -> Result<Self> {
        self.layers = LayerBuilder::new(self.layers.batchnorm, p)?;
        Ok(self)
    }

    /// Replace the identity input stage. The module is wrapped like a middle layer.
    pub fn input_module(mut self, module: Box<dyn Stage>) -> Self {
        self.input_module = Some(module);
        self
    }

    /// Supply one module per entry of `layer_out_dims[1..]` instead of dense layers.
    pub fn middle_modules(mut self, modules: Vec<Box<dyn Stage>>) -> Self {
        self.middle_modules = Some(modules);
        self
    }

    /// Replace the dense head. The module is used un-wrapped and must emit `k` scores.
    pub fn head_module(mut self, module: Box<dyn Stage>) -> Self {
        self.head_module = Some(module);
        self
    }

    /// Build using a deterministic seed.
    pub fn build_with_seed(self, seed: u64) -> Result<Network> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build_with_rng(&mut rng)
    }

    /// Build using the provided RNG for the synthesized dense layers.
    ///
    /// Caller-supplied modules keep their current parameters. Widths are checked here
    /// wherever neighbouring stages declare them; the rest is checked on first forward.
    pub fn build_with_rng(self, rng: &mut StdRng) -> Result<Network> {
        let dims = &self.layer_out_dims;
        let num_middle = dims.len() - 1;

        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(dims.len() + 1);

        let input = self
            .input_module
            .unwrap_or_else(|| Box::new(Identity) as Box<dyn Stage>);
        stages.push(self.layers.make_layer(input, Some(dims[0]))?);

        match self.middle_modules {
            None => {
                for i in 1..dims.len() {
                    // Every middle stage is followed by a ReLU.
                    let linear = Linear::new_with_rng(dims[i - 1], dims[i], Init::He, rng)?;
                    stages.push(self.layers.make_layer(Box::new(linear), Some(dims[i]))?);
                }
            }
            Some(modules) => {
                if modules.len() != num_middle {
                    return Err(Error::InvalidConfig(format!(
                        "expected {num_middle} middle modules for layer_out_dims {dims:?}, got {}",
                        modules.len()
                    )));
                }
                for module in modules {
                    stages.push(self.layers.make_layer(module, None)?);
                }
            }
        }

        let head = match self.head_module {
            Some(module) => module,
            None => {
                let last = dims[num_middle];
                Box::new(Linear::new_with_rng(last, self.k, Init::Xavier, rng)?)
            }
        };
        stages.push(head);

        check_widths(&stages, dims[0], self.k)?;

        let network = Network::from_stages(stages);
        debug!(
            k = self.k,
            layer_out_dims = ?dims,
            stages = network.num_stages(),
            params = network.param_count(),
            batchnorm = self.layers.batchnorm,
            dropout = self.layers.dropout,
            "assembled network"
        );
        Ok(network)
    }
}

/// Fold declared widths through `[input, middle.., head]`.
///
/// The input stage's output is pinned to `input_width`; the head must emit `k`.
fn check_widths(stages: &[Box<dyn Stage>], input_width: usize, k: usize) -> Result<()> {
    let Some((input, rest)) = stages.split_first() else {
        return Ok(());
    };

    let width = if input.is_passthrough() {
        Some(input_width)
    } else {
        match input.infer_width(None)? {
            Some(w) if w != input_width => {
                return Err(Error::dims("input stage output", input_width, w));
            }
            _ => Some(input_width),
        }
    };

    let out = rest
        .iter()
        .try_fold(width, |width, stage| stage.infer_width(width))?;
    match out {
        Some(w) if w != k => Err(Error::dims("head output", k, w)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Matrix;

    fn child_names(stage: &dyn Stage) -> Vec<&'static str> {
        stage.children().iter().map(|s| s.name()).collect()
    }

    #[test]
    fn layer_order_is_module_activation_norm_dropout() {
        let layers = LayerBuilder::new(true, 0.25).unwrap();
        let module = Box::new(Linear::new(3, 4, Init::He).unwrap());
        let layer = layers.make_layer(module, Some(4)).unwrap();

        assert_eq!(
            child_names(layer.as_ref()),
            vec!["Linear", "ReLU", "BatchNorm1d", "Dropout"]
        );
    }

    #[test]
    fn batchnorm_needs_a_known_width() {
        let layers = LayerBuilder::new(true, 0.0).unwrap();
        let module = Box::new(Linear::new(3, 4, Init::He).unwrap());
        let layer = layers.make_layer(module, None).unwrap();
        assert_eq!(child_names(layer.as_ref()), vec!["Linear", "ReLU"]);
    }

    #[test]
    fn identity_is_returned_unwrapped() {
        let layers = LayerBuilder::new(true, 0.5).unwrap();
        let layer = layers.make_layer(Box::new(Identity), Some(7)).unwrap();
        assert!(layer.is_passthrough());
        assert!(layer.children().is_empty());
        assert_eq!(layer.name(), "Identity");
    }

    #[test]
    fn dropout_rate_is_validated() {
        assert!(LayerBuilder::new(false, 1.0).is_err());
        assert!(LayerBuilder::new(false, f32::NAN).is_err());
        assert!(NetworkBuilder::new(3, vec![4]).unwrap().dropout(-0.5).is_err());
    }

    #[test]
    fn default_network_accepts_first_dim_and_emits_k_scores() {
        let network = NetworkBuilder::new(5, vec![4, 8, 3])
            .unwrap()
            .build_with_seed(0)
            .unwrap();

        // identity + two dense middle layers + head
        assert_eq!(network.num_stages(), 4);
        assert_eq!(network.infer_width(Some(4)).unwrap(), Some(5));

        let scores = network.forward(&Matrix::zeros(3, 4)).unwrap();
        assert_eq!((scores.rows(), scores.cols()), (3, 5));

        let err = network.forward(&Matrix::zeros(3, 5)).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn single_dim_network_is_input_plus_head() {
        let network = NetworkBuilder::new(2, vec![6])
            .unwrap()
            .build_with_seed(1)
            .unwrap();
        assert_eq!(network.num_stages(), 2);
        assert_eq!(network.stages()[1].name(), "Linear");
        assert_eq!(network.stages()[1].in_dim(), Some(6));
    }

    #[test]
    fn custom_input_module_is_wrapped_and_checked() {
        let network = NetworkBuilder::new(3, vec![4, 2])
            .unwrap()
            .batchnorm(true)
            .input_module(Box::new(Linear::new(6, 4, Init::He).unwrap()))
            .build_with_seed(0)
            .unwrap();
        assert_eq!(
            child_names(network.stages()[0].as_ref()),
            vec!["Linear", "ReLU", "BatchNorm1d"]
        );
        assert_eq!(network.infer_width(Some(6)).unwrap(), Some(3));

        let err = NetworkBuilder::new(3, vec![4, 2])
            .unwrap()
            .input_module(Box::new(Linear::new(6, 5, Init::He).unwrap()))
            .build_with_seed(0)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn custom_middle_modules_must_match_dims() {
        let err = NetworkBuilder::new(3, vec![4, 8, 3])
            .unwrap()
            .middle_modules(vec![Box::new(Linear::new(4, 8, Init::He).unwrap())])
            .build_with_seed(0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = NetworkBuilder::new(3, vec![4, 8])
            .unwrap()
            .middle_modules(vec![Box::new(Linear::new(5, 8, Init::He).unwrap())])
            .build_with_seed(0)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));

        // Custom middle modules are wrapped without batch norm.
        let network = NetworkBuilder::new(3, vec![4, 8])
            .unwrap()
            .batchnorm(true)
            .middle_modules(vec![Box::new(Linear::new(4, 8, Init::He).unwrap())])
            .build_with_seed(0)
            .unwrap();
        assert_eq!(child_names(network.stages()[1].as_ref()), vec!["Linear", "ReLU"]);
    }

    #[test]
    fn custom_head_must_emit_k_scores() {
        let err = NetworkBuilder::new(3, vec![4, 2])
            .unwrap()
            .head_module(Box::new(Linear::new(2, 2, Init::Xavier).unwrap()))
            .build_with_seed(0)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));

        let network = NetworkBuilder::new(3, vec![4, 2])
            .unwrap()
            .head_module(Box::new(Linear::new(2, 3, Init::Xavier).unwrap()))
            .build_with_seed(0)
            .unwrap();
        // The head is never wrapped.
        assert_eq!(network.stages()[2].name(), "Linear");
    }

    #[test]
    fn invalid_shapes_are_config_errors() {
        assert!(NetworkBuilder::new(1, vec![4]).is_err());
        assert!(NetworkBuilder::new(3, vec![]).is_err());
        assert!(NetworkBuilder::new(3, vec![4, 0]).is_err());
    }

    #[test]
    fn same_seed_builds_same_weights() {
        let mut a = NetworkBuilder::new(3, vec![4, 8])
            .unwrap()
            .build_with_seed(42)
            .unwrap();
        let mut b = NetworkBuilder::new(3, vec![4, 8])
            .unwrap()
            .build_with_seed(42)
            .unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
    }
}
