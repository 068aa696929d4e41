//! Simple models with known posteriors, used in tests and benchmarks.

use thiserror::Error;

use crate::model::{Gradient, LogpError, Position, ProbabilisticModel, Sample, Tensor, VariableRef};

#[derive(Error, Debug)]
pub enum NormalLogpError {
    #[error("position {value} of {var} is outside of [-{bound}, {bound}]")]
    OutOfBounds {
        var: VariableRef,
        value: f64,
        bound: f64,
        recoverable: bool,
    },
}

impl LogpError for NormalLogpError {
    fn is_recoverable(&self) -> bool {
        match self {
            NormalLogpError::OutOfBounds { recoverable, .. } => *recoverable,
        }
    }
}

/// Independent normal distributions with a shared standard deviation.
///
/// Every latent variable holds a tensor of arbitrary shape. Optionally the
/// model exposes a derived variable holding the sum over all latent
/// elements.
#[derive(Debug, Clone)]
pub struct NormalModel {
    values: Position,
    mu: f64,
    sigma: f64,
    sum_var: Option<VariableRef>,
    evaluations: u64,
}

impl NormalModel {
    pub const LATENT: VariableRef = VariableRef::new(0);

    /// A model with one latent variable `LATENT` starting at `initial`.
    pub fn new(initial: Tensor, sigma: f64) -> Self {
        let mut values = Position::new();
        values.insert(Self::LATENT, initial);
        Self {
            values,
            mu: 0.,
            sigma,
            sum_var: None,
            evaluations: 0,
        }
    }

    /// A model with `dim` scalar latent variables `0..dim`, all starting at `init`.
    pub fn scalars(dim: u64, init: f64, mu: f64, sigma: f64) -> Self {
        let values = (0..dim)
            .map(|id| (VariableRef::new(id), ndarray::arr0(init).into_dyn()))
            .collect();
        Self {
            values,
            mu,
            sigma,
            sum_var: None,
            evaluations: 0,
        }
    }

    pub fn with_mean(mut self, mu: f64) -> Self {
        self.mu = mu;
        self
    }

    pub fn with_variable(mut self, var: VariableRef, initial: Tensor) -> Self {
        self.values.insert(var, initial);
        self
    }

    pub fn with_sum(mut self, var: VariableRef) -> Self {
        self.sum_var = Some(var);
        self
    }

    /// Number of log probability evaluations so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    fn total(&self) -> f64 {
        self.values.values().map(|value| value.sum()).sum()
    }
}

impl ProbabilisticModel for NormalModel {
    type LogpError = NormalLogpError;

    fn latent_position(&self) -> Position {
        self.values.clone()
    }

    fn log_prob_and_gradient(
        &mut self,
        position: &Position,
    ) -> Result<(f64, Gradient), NormalLogpError> {
        self.evaluations += 1;
        self.values = position.clone();
        let precision = 1. / (self.sigma * self.sigma);

        let mut logp = 0f64;
        let gradient = position
            .iter()
            .map(|(var, value)| {
                let grad = value.mapv(|x| {
                    let diff = x - self.mu;
                    logp -= 0.5 * diff * diff * precision;
                    -diff * precision
                });
                (*var, grad)
            })
            .collect();
        Ok((logp, gradient))
    }

    fn sample_from(&self, variables: &[VariableRef]) -> Sample {
        variables
            .iter()
            .filter_map(|var| {
                if Some(*var) == self.sum_var {
                    return Some((*var, ndarray::arr0(self.total()).into_dyn()));
                }
                self.values.get(var).map(|value| (*var, value.clone()))
            })
            .collect()
    }
}

/// A `NormalModel` that fails outside of `[-bound, bound]`.
#[derive(Debug, Clone)]
pub struct BoundedModel {
    inner: NormalModel,
    bound: f64,
    recoverable: bool,
}

impl BoundedModel {
    pub fn new(inner: NormalModel, bound: f64, recoverable: bool) -> Self {
        Self {
            inner,
            bound,
            recoverable,
        }
    }
}

impl ProbabilisticModel for BoundedModel {
    type LogpError = NormalLogpError;

    fn latent_position(&self) -> Position {
        self.inner.latent_position()
    }

    fn log_prob_and_gradient(
        &mut self,
        position: &Position,
    ) -> Result<(f64, Gradient), NormalLogpError> {
        for (var, value) in position.iter() {
            if let Some(&x) = value.iter().find(|x| x.abs() > self.bound) {
                return Err(NormalLogpError::OutOfBounds {
                    var: *var,
                    value: x,
                    bound: self.bound,
                    recoverable: self.recoverable,
                });
            }
        }
        self.inner.log_prob_and_gradient(position)
    }

    fn sample_from(&self, variables: &[VariableRef]) -> Sample {
        self.inner.sample_from(variables)
    }
}
