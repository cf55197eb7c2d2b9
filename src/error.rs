use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EpError {
    /// A matrix that has to be positive definite could not be factorized,
    /// or inverting an existing Cholesky factor failed.
    #[error("Matrix factorization failed in {routine}: {reason}")]
    Factorization {
        routine: &'static str,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Sampler returned an error")]
    Sampler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, EpError>;

pub(crate) fn check_dim(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(EpError::DimensionMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}
