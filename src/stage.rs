//! Network stages.
//!
//! A stage is one callable unit of the composed network. Stages work on whole batches
//! (`(batch, width)` matrices) and own their parameter gradients:
//!
//! - [`Stage::forward`] is the pure inference path (running statistics, no dropout).
//! - [`Stage::forward_train`] caches whatever [`Stage::backward`] needs and may update
//!   stateful statistics (batch-norm running averages).
//! - [`Stage::backward`] takes `dL/d(output)`, accumulates `dL/d(params)` and returns
//!   `dL/d(input)`.
//!
//! Parameter (re-)initialization is the separate [`Initializable`] capability. Every
//! concrete stage implements it explicitly, so a stage without initialization is a
//! visible `impl Initializable for X {}` rather than a silent runtime skip.

use std::fmt;

use rand::rngs::StdRng;

use crate::{Error, Matrix, Result};

/// A trainable parameter buffer and its accumulated gradient (same length).
#[derive(Debug)]
pub struct Param<'a> {
    pub value: &'a mut [f32],
    pub grad: &'a mut [f32],
}

pub trait Initializable {
    /// Re-draw this stage's own parameters.
    ///
    /// Returns `true` if anything was initialized. Containers do not recurse here; the
    /// network visits every stage in the tree.
    fn reset_parameters(&mut self, _rng: &mut StdRng) -> bool {
        false
    }
}

pub trait Stage: Initializable + fmt::Debug {
    /// Short type name, e.g. `"Linear"`.
    fn name(&self) -> &'static str;

    /// One-line description used when printing the network.
    fn describe(&self) -> String {
        self.name().to_owned()
    }

    /// Declared input width, if fixed.
    fn in_dim(&self) -> Option<usize> {
        None
    }

    /// Declared output width, if fixed.
    fn out_dim(&self) -> Option<usize> {
        None
    }

    /// Propagate a (possibly unknown) input width to this stage's output width.
    ///
    /// Fails with `Error::DimensionMismatch` when both the incoming width and the
    /// declared input width are known and disagree.
    fn infer_width(&self, input: Option<usize>) -> Result<Option<usize>> {
        if let (Some(expected), Some(got)) = (self.in_dim(), input) {
            if expected != got {
                return Err(Error::dims(format!("{} input", self.name()), expected, got));
            }
        }
        Ok(self.out_dim())
    }

    /// `true` only for the do-nothing stage that the layer builder never wraps.
    fn is_passthrough(&self) -> bool {
        false
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix>;

    fn forward_train(&mut self, input: &Matrix, rng: &mut StdRng) -> Result<Matrix>;

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix>;

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    /// Non-trainable state that belongs in a checkpoint (e.g. running statistics).
    fn buffers_mut(&mut self) -> Vec<&mut [f32]> {
        Vec::new()
    }

    /// Number of trainable scalars, including those of child stages.
    fn param_count(&self) -> usize {
        0
    }

    fn zero_grad(&mut self) {
        for param in self.params_mut() {
            param.grad.fill(0.0);
        }
    }

    fn children(&self) -> &[Box<dyn Stage>] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Stage>] {
        &mut []
    }
}

/// The do-nothing stage: output equals input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Initializable for Identity {}

impl Stage for Identity {
    fn name(&self) -> &'static str {
        "Identity"
    }

    fn infer_width(&self, input: Option<usize>) -> Result<Option<usize>> {
        Ok(input)
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix> {
        Ok(input.clone())
    }

    fn forward_train(&mut self, input: &Matrix, _rng: &mut StdRng) -> Result<Matrix> {
        Ok(input.clone())
    }

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        Ok(d_output.clone())
    }
}

/// Runs its child stages in order.
#[derive(Debug)]
pub struct Sequential {
    stages: Vec<Box<dyn Stage>>,
}

impl Sequential {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Initializable for Sequential {}

impl Stage for Sequential {
    fn name(&self) -> &'static str {
        "Sequential"
    }

    fn in_dim(&self) -> Option<usize> {
        self.stages.first().and_then(|s| s.in_dim())
    }

    fn out_dim(&self) -> Option<usize> {
        self.infer_width(None).ok().flatten()
    }

    fn infer_width(&self, input: Option<usize>) -> Result<Option<usize>> {
        self.stages
            .iter()
            .try_fold(input, |width, stage| stage.infer_width(width))
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix> {
        let mut current = input.clone();
        for stage in &self.stages {
            current = stage.forward(&current)?;
        }
        Ok(current)
    }

    fn forward_train(&mut self, input: &Matrix, rng: &mut StdRng) -> Result<Matrix> {
        let mut current = input.clone();
        for stage in &mut self.stages {
            current = stage.forward_train(&current, rng)?;
        }
        Ok(current)
    }

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        let mut grad = d_output.clone();
        for stage in self.stages.iter_mut().rev() {
            grad = stage.backward(&grad)?;
        }
        Ok(grad)
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        let mut params = Vec::new();
        for stage in &mut self.stages {
            params.extend(stage.params_mut());
        }
        params
    }

    fn buffers_mut(&mut self) -> Vec<&mut [f32]> {
        let mut buffers = Vec::new();
        for stage in &mut self.stages {
            buffers.extend(stage.buffers_mut());
        }
        buffers
    }

    fn param_count(&self) -> usize {
        self.stages.iter().map(|s| s.param_count()).sum()
    }

    fn children(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Stage>] {
        &mut self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn identity_is_a_passthrough() {
        let mut id = Identity;
        let x = Matrix::from_rows(&[vec![1.0, -2.0]]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        assert!(id.is_passthrough());
        assert_eq!(id.forward(&x).unwrap(), x);
        assert_eq!(id.forward_train(&x, &mut rng).unwrap(), x);
        assert_eq!(id.backward(&x).unwrap(), x);
        assert_eq!(id.infer_width(Some(7)).unwrap(), Some(7));
        assert!(!id.reset_parameters(&mut rng));
    }

    #[test]
    fn empty_sequential_forwards_unchanged() {
        let seq = Sequential::new(Vec::new());
        let x = Matrix::from_rows(&[vec![3.0]]).unwrap();
        assert!(seq.is_empty());
        assert_eq!(seq.forward(&x).unwrap(), x);
        assert_eq!(seq.infer_width(Some(1)).unwrap(), Some(1));
    }
}
