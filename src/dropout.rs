//! Inverted dropout: in training, zero each element with probability `p` and scale the
//! survivors by `1 / (1 - p)`; at inference the stage is the identity.

use rand::Rng;
use rand::rngs::StdRng;

use crate::stage::{Initializable, Stage};
use crate::{Error, Matrix, Result};

#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
    mask: Option<Matrix>,
}

impl Dropout {
    /// `p` is the probability of an element being zeroed; it must be in `[0, 1)`.
    pub fn new(p: f32) -> Result<Self> {
        if !(p.is_finite() && (0.0..1.0).contains(&p)) {
            return Err(Error::InvalidConfig(format!(
                "dropout probability must be in [0,1), got {p}"
            )));
        }
        Ok(Self { p, mask: None })
    }

    #[inline]
    pub fn p(&self) -> f32 {
        self.p
    }
}

impl Initializable for Dropout {}

impl Stage for Dropout {
    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn describe(&self) -> String {
        format!("Dropout(p={})", self.p)
    }

    fn infer_width(&self, input: Option<usize>) -> Result<Option<usize>> {
        Ok(input)
    }

    fn forward(&self, input: &Matrix) -> Result<Matrix> {
        Ok(input.clone())
    }

    fn forward_train(&mut self, input: &Matrix, rng: &mut StdRng) -> Result<Matrix> {
        let keep = 1.0 - self.p;
        let scale = 1.0 / keep;

        let mut mask = Matrix::zeros(input.rows(), input.cols());
        for m in mask.as_mut_slice() {
            if rng.gen_range(0.0..1.0_f32) < keep {
                *m = scale;
            }
        }

        let mut out = input.clone();
        for (v, &m) in out.as_mut_slice().iter_mut().zip(mask.as_slice()) {
            *v *= m;
        }
        self.mask = Some(mask);
        Ok(out)
    }

    fn backward(&mut self, d_output: &Matrix) -> Result<Matrix> {
        let mask = self.mask.as_ref().ok_or_else(|| {
            Error::InvalidData("Dropout backward called before forward_train".to_owned())
        })?;
        d_output.expect_cols("Dropout gradient", mask.cols())?;
        if d_output.rows() != mask.rows() {
            return Err(Error::dims("Dropout gradient rows", mask.rows(), d_output.rows()));
        }

        let mut d_input = d_output.clone();
        for (d, &m) in d_input.as_mut_slice().iter_mut().zip(mask.as_slice()) {
            *d *= m;
        }
        Ok(d_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn rate_must_be_in_unit_interval() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(f32::NAN).is_err());
        assert!(Dropout::new(0.0).is_ok());
    }

    #[test]
    fn inference_is_identity() {
        let d = Dropout::new(0.9).unwrap();
        let x = Matrix::from_rows(&[vec![1.0, 2.0, 3.0]]).unwrap();
        assert_eq!(d.forward(&x).unwrap(), x);
    }

    #[test]
    fn training_zeroes_or_scales_and_backward_uses_same_mask() {
        let mut d = Dropout::new(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let x = Matrix::from_flat(vec![1.0; 200], 10).unwrap();
        let y = d.forward_train(&x, &mut rng).unwrap();

        assert!(y.as_slice().iter().all(|&v| v == 0.0 || v == 2.0));
        let zeros = y.as_slice().iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 50 && zeros < 150, "zeros={zeros}");

        let dx = d.backward(&x).unwrap();
        assert_eq!(dx, y);
    }
}
