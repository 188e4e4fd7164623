use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Hard labels could not be interpreted as class indices.
    #[error("type conversion failed: {0}")]
    TypeConversion(String),

    /// Two neighbouring widths disagree (stage input/output, labels vs scores, ...).
    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn dims(context: impl Into<String>, expected: usize, got: usize) -> Self {
        Error::DimensionMismatch {
            context: context.into(),
            expected,
            got,
        }
    }
}
