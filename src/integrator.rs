use std::sync::Arc;

use rand::distr::{Distribution, StandardUniform};

use crate::{
    error::{NutsError, Result},
    math::axpy_map,
    model::{Gradient, LogpError, Momentum, Position, ProbabilisticModel},
    potential::Potential,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Forward => 1.,
            Direction::Backward => -1.,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The change in the joint log probability is larger than
///   a cutoff value or not finite.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_location: Option<Position>,
    pub end_location: Option<Position>,
    /// Energy at the end of the diverging leapfrog minus the energy at the
    /// start of the trajectory.
    pub energy_error: Option<f64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// A point in phase space.
#[derive(Debug, Clone)]
pub struct LeapfrogState {
    pub position: Position,
    pub momentum: Momentum,
    pub gradient: Gradient,
    pub log_prob: f64,
    pub kinetic_energy: f64,
}

impl LeapfrogState {
    pub fn new(
        position: Position,
        momentum: Momentum,
        gradient: Gradient,
        log_prob: f64,
        potential: &Potential,
    ) -> Self {
        let kinetic_energy = potential.kinetic_energy(&momentum);
        LeapfrogState {
            position,
            momentum,
            gradient,
            log_prob,
            kinetic_energy,
        }
    }

    /// Log density of the joint distribution of position and momentum,
    /// i.e. the negative total energy.
    pub fn log_joint(&self) -> f64 {
        self.log_prob - self.kinetic_energy
    }

    pub fn energy(&self) -> f64 {
        -self.log_joint()
    }
}

/// Symplectic integrator for the Hamiltonian defined by the model log
/// probability and the kinetic energy of `potential`.
pub struct LeapfrogIntegrator<'a> {
    potential: &'a Potential,
}

impl<'a> LeapfrogIntegrator<'a> {
    pub fn new(potential: &'a Potential) -> Self {
        Self { potential }
    }

    /// Perform one leapfrog step with signed step size `epsilon`.
    ///
    /// The model is evaluated (and its latent values set) at the new
    /// position. Return either an unrecoverable error, a new state, or a
    /// divergence if the model reported a recoverable error. Non-finite
    /// values are passed through to the caller.
    pub fn step<M: ProbabilisticModel>(
        &self,
        model: &mut M,
        start: &LeapfrogState,
        epsilon: f64,
    ) -> Result<std::result::Result<LeapfrogState, DivergenceInfo>> {
        let half_step = epsilon / 2.;

        let momentum = axpy_map(&start.gradient, &start.momentum, half_step);
        let velocity = self.potential.velocity(&momentum);
        let position = axpy_map(&velocity, &start.position, epsilon);

        let (log_prob, mut gradient) = match model.log_prob_and_gradient(&position) {
            Ok(val) => val,
            Err(logp_error) => {
                if !logp_error.is_recoverable() {
                    return Err(NutsError::LogpFailure(Box::new(logp_error)));
                }
                return Ok(Err(DivergenceInfo {
                    start_location: Some(start.position.clone()),
                    end_location: Some(position),
                    energy_error: None,
                    logp_function_error: Some(Arc::new(logp_error)),
                }));
            }
        };

        for (var, value) in position.iter() {
            match gradient.get(var) {
                None => return Err(NutsError::MissingGradient(*var)),
                Some(grad) if grad.shape() != value.shape() => {
                    return Err(NutsError::GradientShape {
                        var: *var,
                        expected: value.shape().to_vec(),
                        found: grad.shape().to_vec(),
                    })
                }
                Some(_) => {}
            }
        }
        gradient.retain(|var, _| position.contains_key(var));

        let momentum = axpy_map(&gradient, &momentum, half_step);

        Ok(Ok(LeapfrogState::new(
            position,
            momentum,
            gradient,
            log_prob,
            self.potential,
        )))
    }
}
