//! Core abstractions for the models we sample from.
//!
//! A model exposes a set of continuous latent variables, each holding a
//! tensor of fixed shape, and can evaluate the joint log probability and its
//! gradient with respect to those latents at any assignment.

use std::collections::BTreeMap;
use std::fmt;

/// Numeric value of a single variable.
pub type Tensor = ndarray::ArrayD<f64>;

/// Per-variable values, ordered by variable reference.
pub type VarMap<T> = BTreeMap<VariableRef, T>;

pub type Position = VarMap<Tensor>;
pub type Momentum = VarMap<Tensor>;
pub type Gradient = VarMap<Tensor>;

/// The values of the variables a caller wants recorded for each draw.
pub type Sample = VarMap<Tensor>;

/// Identifier of a variable in the model.
///
/// References are stable for the lifetime of a sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableRef(u64);

impl VariableRef {
    pub const fn new(id: u64) -> Self {
        VariableRef(id)
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "variable {}", self.0)
    }
}

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// The capability the sampler needs from a model: log probability and
/// gradient at a given latent assignment.
///
/// Implementations usually keep a working copy of the latent values that
/// derived quantities are computed from. `log_prob_and_gradient` sets those
/// values and reads the result in one call, so nothing can be interleaved
/// between the two. A model instance must not be shared between chains.
pub trait ProbabilisticModel {
    type LogpError: LogpError + Send + Sync + 'static;

    /// The current values of all continuous latent variables.
    fn latent_position(&self) -> Position;

    /// Set the latent variables to `position` and return the joint log
    /// probability together with its gradient for every latent variable.
    fn log_prob_and_gradient(
        &mut self,
        position: &Position,
    ) -> Result<(f64, Gradient), Self::LogpError>;

    /// Values of the requested variables at the position that was evaluated
    /// last. The variables may include non-latent (derived) ones.
    fn sample_from(&self, variables: &[VariableRef]) -> Sample;
}
