//! Datasets and batch loading.
//!
//! [`make_loader`] wraps features and preprocessed labels into a [`Dataset`] and puts a
//! [`DataLoader`] over it. The loader visits the dataset in mini-batches and draws a
//! fresh shuffled order at the start of every pass.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::labels::preprocess_labels;
use crate::{Error, Matrix, Result};

/// `train_config.data_loader_config`.
///
/// Keys other than the four below are kept verbatim in `extra`. They are accepted for
/// compatibility with loader configs written for other backends and have no effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    pub batch_size: usize,
    /// Accepted and ignored: loading is single-threaded.
    pub num_workers: usize,
    pub shuffle: bool,
    /// Skip the trailing batch when it is smaller than `batch_size`.
    pub drop_last: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_workers: 1,
            shuffle: true,
            drop_last: false,
            extra: Map::new(),
        }
    }
}

impl DataLoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        Ok(())
    }
}

/// A supervised dataset: inputs `(n, input_dim)` and labels `(n, label_dim)`.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Matrix,
    labels: Matrix,
}

impl Dataset {
    pub fn new(inputs: Matrix, labels: Matrix) -> Result<Self> {
        if inputs.is_empty() {
            return Err(Error::InvalidData("dataset must not be empty".to_owned()));
        }
        if inputs.rows() != labels.rows() {
            return Err(Error::InvalidData(format!(
                "inputs/labels length mismatch: {} vs {}",
                inputs.rows(),
                labels.rows()
            )));
        }
        Ok(Self { inputs, labels })
    }

    /// Build a dataset whose labels are converted to the soft `(n, k - 1)` format.
    pub fn with_soft_labels(inputs: &Matrix, y: &Matrix, k: usize) -> Result<Self> {
        let labels = preprocess_labels(y, k)?;
        Self::new(inputs.clone(), labels)
    }

    #[inline]
    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        self.inputs.rows()
    }

    #[inline]
    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.inputs.rows() == 0
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.inputs.cols()
    }

    #[inline]
    pub fn label_dim(&self) -> usize {
        self.labels.cols()
    }

    #[inline]
    pub fn inputs(&self) -> &Matrix {
        &self.inputs
    }

    #[inline]
    pub fn labels(&self) -> &Matrix {
        &self.labels
    }

    /// Returns the `idx`-th `(example, label)` pair.
    ///
    /// Panics if `idx >= len`.
    #[inline]
    pub fn get(&self, idx: usize) -> (&[f32], &[f32]) {
        (self.inputs.row(idx), self.labels.row(idx))
    }

    /// Gather the rows at `indices` into a batch.
    pub fn batch(&self, indices: &[usize]) -> Batch {
        Batch {
            inputs: self.inputs.select_rows(indices),
            labels: self.labels.select_rows(indices),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Matrix,
    pub labels: Matrix,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.inputs.rows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inputs.rows() == 0
    }
}

/// Mini-batch iteration over an owned [`Dataset`].
///
/// Each call to [`DataLoader::epoch`] is one full pass. With `shuffle` enabled the
/// visitation order is re-drawn from the loader's own RNG every pass, so two loaders
/// built with the same seed produce the same sequence of batches.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    config: DataLoaderConfig,
    order: Vec<usize>,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(dataset: Dataset, config: DataLoaderConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let order = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            config,
            order,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    #[inline]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    #[inline]
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Number of batches yielded per pass.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        let bs = self.config.batch_size;
        if self.config.drop_last {
            n / bs
        } else {
            n.div_ceil(bs)
        }
    }

    /// Row count of the smallest batch a pass yields, or 0 when it yields none.
    pub fn smallest_batch(&self) -> usize {
        if self.num_batches() == 0 {
            return 0;
        }
        let bs = self.config.batch_size;
        match self.dataset.len() % bs {
            0 => bs,
            _ if self.config.drop_last => bs,
            tail => tail,
        }
    }

    /// Restart the shuffle sequence from `seed`, as if the loader had been built with it.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
        for (i, slot) in self.order.iter_mut().enumerate() {
            *slot = i;
        }
    }

    /// Start a new pass over the dataset.
    pub fn epoch(&mut self) -> Batches<'_> {
        if self.config.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        Batches {
            dataset: &self.dataset,
            order: &self.order,
            batch_size: self.config.batch_size,
            drop_last: self.config.drop_last,
            pos: 0,
        }
    }
}

/// Batches of one pass, see [`DataLoader::epoch`].
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: &'a [usize],
    batch_size: usize,
    drop_last: bool,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.len() - self.pos;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let end = self.pos + remaining.min(self.batch_size);
        let batch = self.dataset.batch(&self.order[self.pos..end]);
        self.pos = end;
        Some(batch)
    }
}

/// Wrap `(x, preprocess(y))` into a dataset and a loader configured by `config`.
pub fn make_loader(
    x: &Matrix,
    y: &Matrix,
    k: usize,
    config: &DataLoaderConfig,
    seed: u64,
) -> Result<DataLoader> {
    let dataset = Dataset::with_soft_labels(x, y, k)?;
    if config.num_workers > 1 {
        debug!(
            num_workers = config.num_workers,
            "num_workers is ignored; batches are loaded on the calling thread"
        );
    }
    if !config.extra.is_empty() {
        let keys: Vec<&str> = config.extra.keys().map(String::as_str).collect();
        debug!(?keys, "ignoring unrecognized data loader options");
    }

    let loader = DataLoader::new(dataset, config.clone(), seed)?;
    debug!(
        examples = loader.dataset().len(),
        batch_size = loader.batch_size(),
        batches = loader.num_batches(),
        shuffle = config.shuffle,
        "created data loader"
    );
    Ok(loader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(n: usize) -> (Matrix, Matrix) {
        let x = Matrix::from_flat((0..n).map(|i| i as f32).collect(), 1).unwrap();
        let y = Matrix::from_labels(&(0..n).map(|i| i % 3).collect::<Vec<_>>());
        (x, y)
    }

    fn config(batch_size: usize, shuffle: bool, drop_last: bool) -> DataLoaderConfig {
        DataLoaderConfig {
            batch_size,
            shuffle,
            drop_last,
            ..DataLoaderConfig::default()
        }
    }

    #[test]
    fn dataset_validates_row_counts() {
        assert!(Dataset::new(Matrix::zeros(3, 2), Matrix::zeros(2, 1)).is_err());
        assert!(Dataset::new(Matrix::zeros(0, 2), Matrix::zeros(0, 1)).is_err());
        assert!(Dataset::new(Matrix::zeros(3, 2), Matrix::zeros(3, 1)).is_ok());
    }

    #[test]
    fn loader_exposes_preprocessed_labels() {
        let (x, y) = toy(4);
        let loader = make_loader(&x, &y, 3, &config(2, false, false), 0).unwrap();
        assert_eq!(loader.dataset().label_dim(), 2);

        let (example, label) = loader.dataset().get(2);
        assert_eq!(example, &[2.0]);
        assert_eq!(label, &[0.0, 1.0]);
    }

    #[test]
    fn unshuffled_pass_keeps_order_and_partial_batch() {
        let (x, y) = toy(5);
        let mut loader = make_loader(&x, &y, 3, &config(2, false, false), 0).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let sizes: Vec<usize> = loader.epoch().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let first: Vec<f32> = loader.epoch().flat_map(|b| b.inputs.into_vec()).collect();
        assert_eq!(first, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn drop_last_skips_the_short_batch() {
        let (x, y) = toy(5);
        let mut loader = make_loader(&x, &y, 3, &config(2, false, true), 0).unwrap();
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.epoch().count(), 2);
    }

    #[test]
    fn shuffled_passes_cover_every_example_and_differ() {
        let (x, y) = toy(32);
        let mut loader = make_loader(&x, &y, 3, &config(8, true, false), 7).unwrap();

        let pass = |loader: &mut DataLoader| -> Vec<f32> {
            loader.epoch().flat_map(|b| b.inputs.into_vec()).collect()
        };
        let a = pass(&mut loader);
        let b = pass(&mut loader);

        let mut sorted = a.clone();
        sorted.sort_by(f32::total_cmp);
        assert_eq!(sorted, (0..32).map(|i| i as f32).collect::<Vec<_>>());
        assert_ne!(a, b);

        // Same seed, same sequence of passes.
        let mut again = make_loader(&x, &y, 3, &config(8, true, false), 7).unwrap();
        assert_eq!(pass(&mut again), a);

        // Reseeding after use replays a fresh loader built with that seed.
        let mut reused = make_loader(&x, &y, 3, &config(8, true, false), 1).unwrap();
        pass(&mut reused);
        reused.reseed(7);
        assert_eq!(pass(&mut reused), a);
    }

    #[test]
    fn smallest_batch_reports_the_trailing_remainder() {
        let (x, y) = toy(33);
        let sized = |bs, drop_last| {
            make_loader(&x, &y, 3, &config(bs, false, drop_last), 0)
                .unwrap()
                .smallest_batch()
        };
        assert_eq!(sized(32, false), 1);
        assert_eq!(sized(32, true), 32);
        assert_eq!(sized(11, false), 11);
        assert_eq!(sized(64, false), 33);
        assert_eq!(sized(64, true), 0);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let (x, y) = toy(3);
        let err = make_loader(&x, &y, 3, &config(0, false, false), 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
