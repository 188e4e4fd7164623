//! Activation functions.
//!
//! The activation stage applies a function element-wise: `y = activation(x)`.
//!
//! During training we cache the *post-activation* outputs `y`. Backprop computes
//! `dL/dx` from `dL/dy` using `y` alone, so no separate pre-activation buffer is kept.

use rand::rngs::StdRng;

use crate::stage::{Initializable, Stage};
use crate::{Error, Matrix, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
/// Element-wise activation function.
pub enum Activation {
    ReLU,
    LeakyReLU { alpha: f32 },
    Tanh,
    Sigmoid,
}

impl Activation {
    /// Validate activation parameters.
    pub fn validate(self) -> Result<()> {
        match self {
            Activation::LeakyReLU { alpha } => {
                if !(alpha.is_finite() && alpha >= 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "leaky ReLU alpha must be finite and >= 0, got {alpha}"
                    )));
                }
            }
            Activation::ReLU | Activation::Tanh | Activation::Sigmoid => {}
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn forward(self, x: f32) -> f32 {
        match self {
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative of the activation with respect to its input, expressed in terms
    /// of the cached post-activation output `y`.
    #[inline]
    pub(crate) fn grad_from_output(self, y: f32) -> f32 {
        match self {
            Activation::ReLU => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU { alpha } => {
                if y > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Tanh => 1.0 - y * y,
            Activation::Sigmoid => y * (1.0 - y),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Activation::ReLU => "ReLU",
            Activation::LeakyReLU { .. } => "LeakyReLU",
            Activation::Tanh => "Tanh",
            Activation::Sigmoid => "Sigmoid",
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    // Numerically stable sigmoid.
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Stage wrapper around an [`Activation`].
#[derive(Debug, Clone)]
pub struct Nonlinearity {
    activation: Activation,
    output: Option<Matrix>,
}

impl Nonlinearity {
    pub fn new(activation: Activation) -> Result<Self> {
        activation.validate()?;
        Ok(Self {
            activation,
            output: None,
        })
    }

    pub fn relu() -> Self {
        Self {
            activation: Activation::ReLU,
            output: None,
        }
    }

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Initializable for Nonlinearity {}

impl Stage for Nonlinearity {
    fn name(&self) -> &'static str {
        self.activation.name()
    }

    fn describe(&self) -> String {
        match self.activation {
            Activation::LeakyReLU { alpha } => format!("LeakyReLU(alpha={alpha})"),
            act => act.name().to_owned(),
        }
    }

    fn infer_width(&self, input: Option<usize>) -> Result<Option<usize>> {
        Ok(input)
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix> {
        let act = self.activation;
        Ok(input.map(|x| act.forward(x)))
    }

    fn forward_train(&mut self, input: &Matrix, _rng: &mut StdRng) -> Result<Matrix> {
        let out = self.forward(input)?;
        self.output = Some(out.clone());
        Ok(out)
    }

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        let output = self.output.as_ref().ok_or_else(|| {
            Error::InvalidData(format!("{} backward called before forward_train", self.name()))
        })?;
        d_output.expect_cols(self.name(), output.cols())?;
        if d_output.rows() != output.rows() {
            return Err(Error::dims(
                format!("{} gradient rows", self.name()),
                output.rows(),
                d_output.rows(),
            ));
        }

        let mut d_input = d_output.clone();
        for (d, &y) in d_input.as_mut_slice().iter_mut().zip(output.as_slice()) {
            *d *= self.activation.grad_from_output(y);
        }
        Ok(d_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn leaky_relu_alpha_must_be_finite_and_non_negative() {
        assert!(
            Activation::LeakyReLU { alpha: f32::NAN }
                .validate()
                .is_err()
        );
        assert!(Activation::LeakyReLU { alpha: -0.1 }.validate().is_err());
        assert!(Nonlinearity::new(Activation::LeakyReLU { alpha: 0.1 }).is_ok());
    }

    #[test]
    fn sigmoid_basic_values() {
        let y0 = Activation::Sigmoid.forward(0.0);
        assert!((y0 - 0.5).abs() < 1e-6);

        assert!(Activation::Sigmoid.forward(10.0) > 0.999);
        assert!(Activation::Sigmoid.forward(-10.0) < 0.001);
    }

    #[test]
    fn relu_and_leaky_relu_shapes() {
        assert_eq!(Activation::ReLU.forward(-2.0), 0.0);
        assert_eq!(Activation::ReLU.forward(3.0), 3.0);

        let act = Activation::LeakyReLU { alpha: 0.1 };
        assert_eq!(act.forward(-2.0), -0.2);
        assert_eq!(act.forward(3.0), 3.0);

        // Gradients expressed via cached outputs.
        assert_eq!(Activation::ReLU.grad_from_output(0.0), 0.0);
        assert_eq!(Activation::ReLU.grad_from_output(1.0), 1.0);
        assert_eq!(act.grad_from_output(-0.2), 0.1);
        assert_eq!(act.grad_from_output(3.0), 1.0);
    }

    #[test]
    fn relu_stage_masks_gradient_of_inactive_units() {
        let mut relu = Nonlinearity::relu();
        let mut rng = StdRng::seed_from_u64(0);
        let x = Matrix::from_rows(&[vec![-1.0, 2.0], vec![0.5, -3.0]]).unwrap();

        let y = relu.forward_train(&x, &mut rng).unwrap();
        assert_eq!(y.as_slice(), &[0.0, 2.0, 0.5, 0.0]);

        let d = Matrix::from_rows(&[vec![1.0, 1.0], vec![1.0, 1.0]]).unwrap();
        let dx = relu.backward(&d).unwrap();
        assert_eq!(dx.as_slice(), &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn backward_without_forward_is_an_error() {
        let mut tanh = Nonlinearity::new(Activation::Tanh).unwrap();
        let d = Matrix::zeros(1, 1);
        assert!(tanh.backward(&d).is_err());
    }
}
