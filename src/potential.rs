use itertools::izip;
use log::debug;
use ndarray::Zip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    math::{all_finite, same_keys, tensor_mul, tensor_sum_sq_scaled},
    model::{Momentum, Position, Tensor, VarMap, VariableRef},
};

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy)]
pub struct PotentialSettings {
    /// Number of accepted positions that make up one estimation window.
    /// The mass matrix is replaced by the estimate at the end of every window.
    pub window_size: u64,
    /// Lower and upper bound for the estimated variances.
    pub variance_clamp: (f64, f64),
}

impl Default for PotentialSettings {
    fn default() -> Self {
        Self {
            window_size: 50,
            variance_clamp: (1e-10, 1e10),
        }
    }
}

/// Diagonal mass matrix, stored as its inverse (the posterior variance
/// estimate) together with the inverse standard deviations used to draw
/// momenta.
#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    variance: VarMap<Tensor>,
    inv_stds: VarMap<Tensor>,
}

impl DiagMassMatrix {
    pub(crate) fn unit(position: &Position) -> Self {
        let ones: VarMap<Tensor> = position
            .iter()
            .map(|(var, value)| (*var, Tensor::ones(value.raw_dim())))
            .collect();
        Self {
            variance: ones.clone(),
            inv_stds: ones,
        }
    }

    /// Replace the diagonal by `new_variance`.
    ///
    /// Entries that are not finite and positive keep their previous value.
    pub(crate) fn update_diag(&mut self, new_variance: &VarMap<Tensor>, clamp: (f64, f64)) {
        izip!(
            self.variance.values_mut(),
            self.inv_stds.values_mut(),
            new_variance.values()
        )
        .for_each(|(variance, inv_std, new)| {
            Zip::from(variance)
                .and(inv_std)
                .and(new)
                .for_each(|var, inv_std, &x| {
                    if !x.is_finite() || x <= 0f64 {
                        return;
                    }
                    *var = x.clamp(clamp.0, clamp.1);
                    *inv_std = (1. / *var).sqrt();
                });
        });
    }
}

/// Welford estimator of the elementwise variance of a stream of positions.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: VarMap<Tensor>,
    sum_sq_diff: VarMap<Tensor>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(position: &Position) -> Self {
        let zeros: VarMap<Tensor> = position
            .iter()
            .map(|(var, value)| (*var, Tensor::zeros(value.raw_dim())))
            .collect();
        Self {
            mean: zeros.clone(),
            sum_sq_diff: zeros,
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, position: &Position) {
        self.count += 1;
        let n = self.count as f64;
        izip!(
            self.mean.values_mut(),
            self.sum_sq_diff.values_mut(),
            position.values()
        )
        .for_each(|(mean, sum_sq_diff, value)| {
            Zip::from(mean)
                .and(sum_sq_diff)
                .and(value)
                .for_each(|mean, sum_sq_diff, &x| {
                    let delta = x - *mean;
                    *mean += delta / n;
                    *sum_sq_diff += delta * (x - *mean);
                });
        });
    }

    /// The unbiased sample variance, if at least two samples were added.
    pub(crate) fn current(&self) -> Option<VarMap<Tensor>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count - 1) as f64;
        Some(
            self.sum_sq_diff
                .iter()
                .map(|(var, value)| (*var, value / denom))
                .collect(),
        )
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn reset(&mut self) {
        self.mean.values_mut().for_each(|v| v.fill(0.));
        self.sum_sq_diff.values_mut().for_each(|v| v.fill(0.));
        self.count = 0;
    }
}

/// The kinetic energy part of the Hamiltonian.
///
/// Momenta are drawn from `N(0, M)` with a diagonal mass matrix `M`. Without
/// adaptation `M` is the identity.
#[derive(Debug, Clone)]
pub struct Potential {
    mass_matrix: DiagMassMatrix,
    estimator: RunningVariance,
    settings: PotentialSettings,
    num_updates: u64,
}

impl Potential {
    /// A unit-mass potential for the variables (and shapes) of `position`.
    pub fn new(position: &Position, settings: PotentialSettings) -> Self {
        Self {
            mass_matrix: DiagMassMatrix::unit(position),
            estimator: RunningVariance::new(position),
            settings,
            num_updates: 0,
        }
    }

    /// Draw a fresh momentum for every variable.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Momentum {
        self.mass_matrix
            .inv_stds
            .iter()
            .map(|(var, inv_std)| {
                let momentum = inv_std.map(|&s| s * rng.sample::<f64, _>(StandardNormal));
                (*var, momentum)
            })
            .collect()
    }

    /// `0.5 * sum(p^2 / m)` over all variables and elements.
    pub fn kinetic_energy(&self, momentum: &Momentum) -> f64 {
        debug_assert!(same_keys(momentum, &self.mass_matrix.variance));
        0.5 * momentum
            .values()
            .zip(self.mass_matrix.variance.values())
            .map(|(p, var)| tensor_sum_sq_scaled(p, var))
            .sum::<f64>()
    }

    /// The time derivative of the position, `M^-1 p`.
    pub fn velocity(&self, momentum: &Momentum) -> VarMap<Tensor> {
        momentum
            .iter()
            .zip(self.mass_matrix.variance.values())
            .map(|((var, p), variance)| (*var, tensor_mul(p, variance)))
            .collect()
    }

    /// Incorporate an accepted position into the variance estimate.
    ///
    /// At the end of each window the mass matrix is replaced by the inverse
    /// of the estimated variance and a new window starts.
    pub fn update(&mut self, position: &Position) {
        if !same_keys(position, &self.mass_matrix.variance) || !all_finite(position) {
            return;
        }
        self.estimator.add_sample(position);
        if self.estimator.count() < self.settings.window_size {
            return;
        }
        if let Some(variance) = self.estimator.current() {
            self.mass_matrix
                .update_diag(&variance, self.settings.variance_clamp);
            self.num_updates += 1;
            debug!(
                "Updated mass matrix from {} positions (update {})",
                self.estimator.count(),
                self.num_updates
            );
        }
        self.estimator.reset();
    }

    /// The current inverse mass (variance estimate) of a variable.
    pub fn variance(&self, var: &VariableRef) -> Option<&Tensor> {
        self.mass_matrix.variance.get(var)
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }
}
