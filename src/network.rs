use std::fmt;

use rand::rngs::StdRng;
use tracing::{trace, warn};

use crate::stage::{Param, Stage};
use crate::{Error, Matrix, Result};

/// The assembled classifier network: `[input_stage, middle_stage_1..m, head_stage]`.
///
/// The stage list is fixed once built; only parameter values change afterwards.
#[derive(Debug)]
pub struct Network {
    stages: Vec<Box<dyn Stage>>,
}

/// Saved parameter and buffer values of a `Network`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    tensors: Vec<Vec<f32>>,
}

/// Which stages (by tree path, e.g. `"1.0"`) were initialized by a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub initialized: Vec<String>,
    pub untouched: Vec<String>,
}

impl Network {
    pub(crate) fn from_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    #[inline]
    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    #[inline]
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn param_count(&self) -> usize {
        self.stages.iter().map(|s| s.param_count()).sum()
    }

    /// Propagate an input width through every stage, failing on the first declared mismatch.
    pub fn infer_width(&self, input: Option<usize>) -> Result<Option<usize>> {
        self.stages
            .iter()
            .try_fold(input, |width, stage| stage.infer_width(width))
    }

    /// Inference forward pass: a pure function of the current parameters.
    pub fn forward(&self, input: &Matrix) -> Result<Matrix> {
        let mut current = input.clone();
        for stage in &self.stages {
            current = stage.forward(&current)?;
        }
        Ok(current)
    }

    /// Training forward pass. Caches activations for `backward`.
    pub fn forward_train(&mut self, input: &Matrix, rng: &mut StdRng) -> Result<Matrix> {
        let mut current = input.clone();
        for stage in &mut self.stages {
            current = stage.forward_train(&current, rng)?;
        }
        Ok(current)
    }

    /// Backprop `dL/d(output)` through all stages, accumulating parameter gradients.
    ///
    /// You must call `forward_train` first. Returns `dL/d(input)`.
    pub fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        let mut grad = d_output.clone();
        for stage in self.stages.iter_mut().rev() {
            grad = stage.backward(&grad)?;
        }
        Ok(grad)
    }

    pub fn params_mut(&mut self) -> Vec<Param<'_>> {
        let mut params = Vec::new();
        for stage in &mut self.stages {
            params.extend(stage.params_mut());
        }
        params
    }

    pub fn zero_grad(&mut self) {
        for stage in &mut self.stages {
            stage.zero_grad();
        }
    }

    /// Re-initialize every stage in the tree that supports it.
    ///
    /// Stages without initialization are left as they are; a leaf that holds
    /// parameters but initialized nothing is flagged with a warning.
    pub fn reset_parameters(&mut self, rng: &mut StdRng) -> ResetReport {
        let mut report = ResetReport::default();
        for (i, stage) in self.stages.iter_mut().enumerate() {
            reset_tree(stage.as_mut(), i.to_string(), rng, &mut report);
        }
        report
    }

    pub fn snapshot(&mut self) -> Snapshot {
        let mut tensors = Vec::new();
        for stage in &mut self.stages {
            for param in stage.params_mut() {
                tensors.push(param.value.to_vec());
            }
            for buffer in stage.buffers_mut() {
                tensors.push(buffer.to_vec());
            }
        }
        Snapshot { tensors }
    }

    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        let mut saved = snapshot.tensors.iter();
        for stage in &mut self.stages {
            for param in stage.params_mut() {
                copy_saved(param.value, saved.next())?;
            }
            for buffer in stage.buffers_mut() {
                copy_saved(buffer, saved.next())?;
            }
        }
        if saved.next().is_some() {
            return Err(Error::InvalidData(
                "snapshot has more tensors than the network".to_owned(),
            ));
        }
        Ok(())
    }
}

fn copy_saved(target: &mut [f32], source: Option<&Vec<f32>>) -> Result<()> {
    let source = source.ok_or_else(|| {
        Error::InvalidData("snapshot has fewer tensors than the network".to_owned())
    })?;
    if source.len() != target.len() {
        return Err(Error::dims("snapshot tensor", target.len(), source.len()));
    }
    target.copy_from_slice(source);
    Ok(())
}

fn reset_tree(
    stage: &mut (dyn Stage + 'static),
    path: String,
    rng: &mut StdRng,
    report: &mut ResetReport,
) {
    if stage.reset_parameters(rng) {
        report.initialized.push(path.clone());
    } else {
        if stage.children().is_empty() && stage.param_count() > 0 {
            warn!(
                stage = %path,
                name = stage.name(),
                params = stage.param_count(),
                "stage holds parameters but was not initialized"
            );
        } else {
            trace!(stage = %path, name = stage.name(), "stage left untouched by reset");
        }
        report.untouched.push(path.clone());
    }

    for (i, child) in stage.children_mut().iter_mut().enumerate() {
        reset_tree(child.as_mut(), format!("{path}.{i}"), rng, report);
    }
}

fn write_tree(f: &mut fmt::Formatter<'_>, stage: &dyn Stage, depth: usize) -> fmt::Result {
    let children = stage.children();
    if children.is_empty() {
        return writeln!(f, "{}", stage.describe());
    }
    writeln!(f, "{}(", stage.describe())?;
    for (i, child) in children.iter().enumerate() {
        write!(f, "{:indent$}({i}): ", "", indent = (depth + 1) * 2)?;
        write_tree(f, child.as_ref(), depth + 1)?;
    }
    writeln!(f, "{:indent$})", "", indent = depth * 2)
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network(")?;
        for (i, stage) in self.stages.iter().enumerate() {
            write!(f, "  ({i}): ")?;
            write_tree(f, stage.as_ref(), 1)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    use crate::activation::{Activation, Nonlinearity};
    use crate::batchnorm::BatchNorm1d;
    use crate::linear::{Init, Linear};
    use crate::loss::{Reduction, SoftCrossEntropyLoss};
    use crate::stage::Sequential;

    fn small_network(rng: &mut StdRng) -> Network {
        let hidden: Vec<Box<dyn Stage>> = vec![
            Box::new(Linear::new_with_rng(3, 5, Init::Xavier, rng).unwrap()),
            Box::new(Nonlinearity::new(Activation::Tanh).unwrap()),
            Box::new(BatchNorm1d::new(5).unwrap()),
        ];
        Network::from_stages(vec![
            Box::new(Sequential::new(hidden)),
            Box::new(Linear::new_with_rng(5, 3, Init::Xavier, rng).unwrap()),
        ])
    }

    fn batch() -> (Matrix, Matrix) {
        let x = Matrix::from_rows(&[
            vec![0.2, -0.4, 0.1],
            vec![-0.3, 0.8, 0.5],
            vec![0.9, 0.1, -0.7],
            vec![-0.5, -0.2, 0.3],
        ])
        .unwrap();
        // Classes 0, 1, 2 and a soft row; class 0 implicit.
        let t = Matrix::from_rows(&[
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.3, 0.3],
        ])
        .unwrap();
        (x, t)
    }

    fn train_loss(network: &mut Network, loss: &SoftCrossEntropyLoss, rng: &mut StdRng) -> f32 {
        let (x, t) = batch();
        let scores = network.forward_train(&x, rng).unwrap();
        loss.forward(&scores, &t).unwrap()
    }

    #[test]
    fn backward_matches_numeric_gradients() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut network = small_network(&mut rng);
        let loss = SoftCrossEntropyLoss::new(3, Reduction::Sum).unwrap();
        let (x, t) = batch();

        network.zero_grad();
        let scores = network.forward_train(&x, &mut rng).unwrap();
        let (_, d_scores) = loss.backward(&scores, &t).unwrap();
        network.backward(&d_scores).unwrap();
        let analytic: Vec<Vec<f32>> = network
            .params_mut()
            .iter()
            .map(|p| p.grad.to_vec())
            .collect();

        let eps = 1e-3_f32;
        for (i, grads) in analytic.iter().enumerate() {
            for (j, &g) in grads.iter().enumerate() {
                network.params_mut()[i].value[j] += eps;
                let plus = train_loss(&mut network, &loss, &mut rng);
                network.params_mut()[i].value[j] -= 2.0 * eps;
                let minus = train_loss(&mut network, &loss, &mut rng);
                network.params_mut()[i].value[j] += eps;

                let numeric = (plus - minus) / (2.0 * eps);
                let tol = 5e-3 + 5e-2 * numeric.abs();
                assert!(
                    (numeric - g).abs() <= tol,
                    "param {i}[{j}]: numeric {numeric} vs analytic {g}"
                );
            }
        }
    }

    #[test]
    fn restore_undoes_a_reset() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut network = small_network(&mut rng);
        let (x, _) = batch();
        // Move the batch-norm running statistics away from their initial values.
        network.forward_train(&x, &mut rng).unwrap();

        let saved = network.snapshot();
        let before = network.forward(&x).unwrap();

        network.reset_parameters(&mut rng);
        assert_ne!(network.forward(&x).unwrap(), before);

        network.restore(&saved).unwrap();
        assert_eq!(network.forward(&x).unwrap(), before);
    }

    #[test]
    fn restore_rejects_foreign_snapshots() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut network = small_network(&mut rng);
        let mut narrow = Network::from_stages(vec![Box::new(Linear::new(3, 3, Init::He).unwrap())]);
        let err = network.restore(&narrow.snapshot()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));

        // Same leading shapes, but fewer tensors.
        let mut prefix = Network::from_stages(vec![Box::new(Linear::new(3, 5, Init::He).unwrap())]);
        let err = prefix.restore(&network.snapshot()).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
        let err = network.restore(&prefix.snapshot()).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn reset_reports_every_stage() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut network = small_network(&mut rng);
        let report = network.reset_parameters(&mut rng);
        assert_eq!(report.initialized, vec!["0.0", "0.2", "1"]);
        assert_eq!(report.untouched, vec!["0", "0.1"]);
    }

    #[test]
    fn display_prints_the_stage_tree() {
        let mut rng = StdRng::seed_from_u64(4);
        let network = small_network(&mut rng);
        let printed = network.to_string();

        assert!(printed.starts_with("Network(\n  (0): Sequential(\n"));
        assert!(printed.contains("    (0): Linear(in_dim=3, out_dim=5)\n"));
        assert!(printed.contains("    (1): Tanh\n"));
        assert!(printed.contains("  (1): Linear(in_dim=5, out_dim=3)\n"));
        assert!(printed.ends_with(')'));
        assert_eq!(network.param_count(), 3 * 5 + 5 + 2 * 5 + 5 * 3 + 3);
    }
}
