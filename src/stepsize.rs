use std::f64::consts::LN_2;

use log::{debug, warn};
use rand::Rng;

use crate::{
    error::Result,
    integrator::{LeapfrogIntegrator, LeapfrogState},
    model::ProbabilisticModel,
    potential::Potential,
    tree::Proposal,
};

pub(crate) const MIN_STEP_SIZE: f64 = 1e-10;
pub(crate) const MAX_STEP_SIZE: f64 = 1e5;
const MAX_SEARCH_ITERATIONS: usize = 100;

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    /// Mean acceptance probability the adaptation aims for.
    pub target_accept: f64,
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageSettings {
    fn default() -> DualAverageSettings {
        DualAverageSettings {
            target_accept: 0.65,
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    settings: DualAverageSettings,
}

impl DualAverage {
    fn new(settings: DualAverageSettings, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: 0.,
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            settings,
        }
    }

    fn advance(&mut self, accept_stat: f64, iteration: u64) {
        let count = iteration.max(1) as f64;
        let w = 1. / (count + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.settings.target_accept - accept_stat);
        self.log_step = self.mu - self.hbar * count.sqrt() / self.settings.gamma;
        let mk = count.powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
    }
}

fn clamp_step(step_size: f64) -> f64 {
    step_size.clamp(MIN_STEP_SIZE, MAX_STEP_SIZE)
}

/// Dual averaging step size adaptation.
///
/// During the first `adapt_count` iterations the step size follows the
/// dual averaging iterate. Afterwards it is fixed to the weighted average of
/// all iterates.
#[derive(Debug, Clone)]
pub struct AdaptiveStepSize {
    dual_average: DualAverage,
    step_size: f64,
    adapt_count: u64,
}

impl AdaptiveStepSize {
    pub fn new(initial_step: f64, adapt_count: u64, settings: DualAverageSettings) -> Self {
        Self {
            dual_average: DualAverage::new(settings, initial_step),
            step_size: initial_step,
            adapt_count,
        }
    }

    /// Update the step size with the mean acceptance probability of the
    /// trajectory at 1-based `iteration` and return the step size for the
    /// next trajectory. From the last warmup iteration on this is the
    /// averaged step size.
    pub fn adapt(&mut self, mean_accept_prob: f64, iteration: u64) -> f64 {
        if iteration > self.adapt_count {
            self.step_size = self.step_size_bar();
            return self.step_size;
        }

        let accept = if mean_accept_prob.is_finite() {
            mean_accept_prob
        } else {
            0.
        };
        self.dual_average.advance(accept, iteration);

        if iteration == self.adapt_count {
            self.step_size = self.step_size_bar();
            return self.step_size;
        }

        let next = self.dual_average.log_step.exp();
        if next.is_nan() {
            warn!("Step size adaptation produced NaN, keeping {}", self.step_size);
        } else {
            self.step_size = clamp_step(next);
        }
        self.step_size
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// The averaged step size that is used after adaptation.
    pub fn step_size_bar(&self) -> f64 {
        let step = self.dual_average.log_step_adapted.exp();
        if step.is_nan() {
            return self.step_size;
        }
        clamp_step(step)
    }
}

fn log_joint_after<M: ProbabilisticModel>(
    model: &mut M,
    integrator: &LeapfrogIntegrator,
    start: &LeapfrogState,
    step_size: f64,
) -> Result<f64> {
    let log_joint = match integrator.step(model, start, step_size)? {
        Ok(end) => end.log_joint(),
        Err(_) => f64::NEG_INFINITY,
    };
    if log_joint.is_nan() {
        return Ok(f64::NEG_INFINITY);
    }
    Ok(log_joint)
}

/// Heuristic for a reasonable first step size.
///
/// Starting at 1, the step size is doubled (or halved) until the
/// acceptance ratio of a single leapfrog step from `proposal` crosses 1/2.
/// If the search does not converge within the step size bounds, the last
/// step size is used and a warning logged.
pub fn find_starting_step_size<M: ProbabilisticModel, R: Rng + ?Sized>(
    model: &mut M,
    potential: &Potential,
    proposal: &Proposal,
    rng: &mut R,
) -> Result<f64> {
    let start = LeapfrogState::new(
        proposal.position.clone(),
        potential.random(rng),
        proposal.gradient.clone(),
        proposal.log_prob,
        potential,
    );
    let integrator = LeapfrogIntegrator::new(potential);
    let initial_log_joint = start.log_joint();

    let mut step_size = 1f64;
    let mut log_ratio =
        log_joint_after(model, &integrator, &start, step_size)? - initial_log_joint;
    let direction = if log_ratio > 0.5f64.ln() { 1f64 } else { -1f64 };

    for _ in 0..MAX_SEARCH_ITERATIONS {
        if !(direction * log_ratio > -direction * LN_2) {
            debug!("Found starting step size {}", step_size);
            return Ok(step_size);
        }
        let next = step_size * 2f64.powf(direction);
        if !(MIN_STEP_SIZE..=MAX_STEP_SIZE).contains(&next) {
            warn!(
                "Starting step size search left [{}, {}], using {}",
                MIN_STEP_SIZE, MAX_STEP_SIZE, step_size
            );
            return Ok(step_size);
        }
        step_size = next;
        log_ratio = log_joint_after(model, &integrator, &start, step_size)? - initial_log_joint;
    }

    warn!(
        "Starting step size search did not converge after {} iterations, using {}",
        MAX_SEARCH_ITERATIONS, step_size
    );
    Ok(step_size)
}
