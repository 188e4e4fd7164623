//! Configuration tree and deep merge.
//!
//! The live configuration is a nested `serde_json::Value` mapping. User overrides are
//! merged into it with [`merge`], and a typed snapshot ([`EndModelConfig`]) is derived
//! from the merged tree whenever the model needs to act on it.
//!
//! ```rust
//! use end_model::config::Config;
//! use serde_json::json;
//!
//! # fn main() -> end_model::Result<()> {
//! let config = Config::defaults().merged(&json!({
//!     "layer_out_dims": [4, 8, 3],
//!     "train_config": { "data_loader_config": { "batch_size": 8 } }
//! }));
//! let settings = config.settings()?;
//! assert_eq!(settings.layer_out_dims, vec![4, 8, 3]);
//! assert_eq!(settings.train_config.data_loader_config.batch_size, 8);
//! // Siblings keep their defaults.
//! assert_eq!(settings.train_config.data_loader_config.num_workers, 1);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::train::TrainConfig;
use crate::{Error, Result};

/// Recursively merge `overrides` into a copy of `base`.
///
/// For each key in `overrides`: when both sides hold a mapping the two are merged
/// recursively, otherwise the override value replaces the base value. Keys absent
/// from `overrides` keep their base value. Neither argument is modified.
pub fn merge(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in override_map {
                let next = match base_map.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

/// Typed view of the model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndModelConfig {
    /// Seed for parameter initialization, dropout masks and shuffling.
    pub seed: Option<u64>,
    /// Print the assembled network at construction and log epoch progress.
    pub verbose: bool,
    /// Insert `BatchNorm1d` after the activation of layers with a known width.
    pub batchnorm: bool,
    /// Dropout rate appended to every wrapped layer; `0.0` disables it.
    pub dropout: f32,
    /// `[d0, d1, ..., dm]`: input stage width followed by each middle stage width.
    pub layer_out_dims: Vec<usize>,
    pub train_config: TrainConfig,
}

impl EndModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.layer_out_dims.is_empty() {
            return Err(Error::InvalidConfig(
                "layer_out_dims must contain at least one dimension".to_owned(),
            ));
        }
        if self.layer_out_dims.contains(&0) {
            return Err(Error::InvalidConfig(
                "all layer_out_dims must be > 0".to_owned(),
            ));
        }
        if !(self.dropout.is_finite() && (0.0..1.0).contains(&self.dropout)) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be finite and in [0,1), got {}",
                self.dropout
            )));
        }
        self.train_config.validate()
    }
}

/// The nested configuration mapping owned by a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    tree: Value,
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Config {
    /// The default configuration tree.
    pub fn defaults() -> Self {
        Self {
            tree: json!({
                "seed": null,
                "verbose": false,
                "batchnorm": false,
                "dropout": 0.0,
                "layer_out_dims": [10, 2],
                "train_config": {
                    "n_epochs": 10,
                    "l2": 0.0,
                    "grad_clip": 20.0,
                    "print_every": 1,
                    "validation_metric": "accuracy",
                    "checkpoint": true,
                    "optimizer_config": {
                        "optimizer": "adam",
                        "lr": 0.01,
                        "momentum": 0.9,
                        "beta1": 0.9,
                        "beta2": 0.999,
                        "eps": 1e-8
                    },
                    "scheduler_config": {
                        "scheduler": "constant",
                        "gamma": 0.9,
                        "step_size": 10
                    },
                    "data_loader_config": {
                        "batch_size": 32,
                        "num_workers": 1,
                        "shuffle": true,
                        "drop_last": false
                    }
                }
            }),
        }
    }

    /// Defaults with `overrides` merged in.
    pub fn with_overrides(overrides: &Value) -> Self {
        Self::defaults().merged(overrides)
    }

    /// Parse a JSON document of overrides and merge it into the defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let overrides: Value = serde_json::from_str(s)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config json: {e}")))?;
        Ok(Self::with_overrides(&overrides))
    }

    #[inline]
    pub fn as_value(&self) -> &Value {
        &self.tree
    }

    /// Look up a value by dotted path, e.g. `"train_config.data_loader_config.batch_size"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.tree, |node, key| node.get(key))
    }

    /// A new configuration with `overrides` merged in; `self` is left untouched.
    pub fn merged(&self, overrides: &Value) -> Self {
        Self {
            tree: merge(&self.tree, overrides),
        }
    }

    /// Merge `overrides` into this configuration in place.
    pub fn update(&mut self, overrides: &Value) {
        self.tree = merge(&self.tree, overrides);
    }

    /// Deserialize and validate the typed settings.
    pub fn settings(&self) -> Result<EndModelConfig> {
        let settings: EndModelConfig = serde_json::from_value(self.tree.clone())
            .map_err(|e| Error::InvalidConfig(format!("malformed config: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }
}
