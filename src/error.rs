use thiserror::Error;

use crate::model::VariableRef;

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),

    #[error("The model has no latent variables to sample")]
    NoLatentVariables,

    #[error("Starting position has zero or undefined probability (log prob {0})")]
    BadInitLogProb(f64),

    #[error("Gradient at starting position is missing or not finite for {0}")]
    BadInitGradient(VariableRef),

    #[error("Logp function returned no gradient for {0}")]
    MissingGradient(VariableRef),

    #[error("Gradient of {var} has shape {found:?}, expected {expected:?}")]
    GradientShape {
        var: VariableRef,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Logp function returned unrecoverable error")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, NutsError>;
