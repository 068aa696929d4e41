use anyhow::Context;
use log::{debug, info, trace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    error::{NutsError, Result},
    integrator::{Direction, LeapfrogIntegrator, LeapfrogState},
    math::same_keys,
    model::{ProbabilisticModel, VariableRef},
    potential::{Potential, PotentialSettings},
    sampler_stats::SampleStats,
    samples::{NetworkSample, NetworkSamples, SampleSink},
    stepsize::{find_starting_step_size, AdaptiveStepSize, DualAverageSettings},
    tree::{Proposal, Tree, TreeContext},
};

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy)]
pub struct NutsSettings {
    /// Number of warmup draws. Step size and mass matrix are adapted
    /// only during warmup.
    pub adapt_count: u64,
    /// Maximum number of doublings of a trajectory.
    pub max_tree_height: u64,
    /// Leaves whose log joint falls more than this below the slice are
    /// counted as divergent.
    pub max_energy_change: f64,
    pub adapt_step_size: bool,
    pub adapt_potential: bool,
    /// Skip the starting step size search and use this value.
    pub initial_step_size: Option<f64>,
    pub dual_average: DualAverageSettings,
    pub potential: PotentialSettings,
    /// The last `final_window` warmup draws do not update the mass matrix.
    pub final_window: u64,
    pub seed: u64,
    /// Keep the details of divergences in the sample stats.
    pub store_divergences: bool,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            adapt_count: 1000,
            max_tree_height: 10,
            max_energy_change: 1000.,
            adapt_step_size: true,
            adapt_potential: true,
            initial_step_size: None,
            dual_average: DualAverageSettings::default(),
            potential: PotentialSettings::default(),
            final_window: 50,
            seed: 0,
            store_divergences: false,
        }
    }
}

impl NutsSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(NutsError::InvalidSettings(msg));

        if (self.adapt_step_size || self.adapt_potential) && self.adapt_count == 0 {
            return invalid("adapt_count must be positive when adaptation is enabled".into());
        }
        if self.max_tree_height == 0 || self.max_tree_height > 63 {
            return invalid(format!(
                "max_tree_height must be in 1..=63, got {}",
                self.max_tree_height
            ));
        }
        if !(self.max_energy_change > 0.) {
            return invalid(format!(
                "max_energy_change must be positive, got {}",
                self.max_energy_change
            ));
        }
        if let Some(step) = self.initial_step_size {
            if !(step.is_finite() && step > 0.) {
                return invalid(format!("initial_step_size must be positive, got {}", step));
            }
        }
        let target = self.dual_average.target_accept;
        if !(target > 0. && target < 1.) {
            return invalid(format!("target_accept must be in (0, 1), got {}", target));
        }
        if self.potential.window_size < 2 {
            return invalid("potential window_size must be at least 2".into());
        }
        Ok(())
    }
}

/// The No-U-Turn sampler.
///
/// Each call to [`NutsSampler::step`] builds one trajectory from the
/// current proposal and returns the next draw.
pub struct NutsSampler<M: ProbabilisticModel, R: Rng = ChaCha8Rng> {
    model: M,
    sample_from: Vec<VariableRef>,
    settings: NutsSettings,
    rng: R,
    potential: Potential,
    step_size: AdaptiveStepSize,
    proposal: Proposal,
    /// 1-based index of the next draw.
    sample_num: u64,
    last_stats: Option<SampleStats>,
}

impl<M: ProbabilisticModel> NutsSampler<M, ChaCha8Rng> {
    /// Create a sampler with a `ChaCha8Rng` seeded from `settings.seed`.
    pub fn new(model: M, sample_from: Vec<VariableRef>, settings: NutsSettings) -> Result<Self> {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Self::with_rng(model, sample_from, settings, rng)
    }
}

impl<M: ProbabilisticModel, R: Rng> NutsSampler<M, R> {
    pub fn with_rng(
        mut model: M,
        sample_from: Vec<VariableRef>,
        settings: NutsSettings,
        mut rng: R,
    ) -> Result<Self> {
        settings.validate()?;

        let position = model.latent_position();
        if position.is_empty() {
            return Err(NutsError::NoLatentVariables);
        }

        let (log_prob, mut gradient) = model
            .log_prob_and_gradient(&position)
            .map_err(|err| NutsError::LogpFailure(Box::new(err)))?;
        if !log_prob.is_finite() {
            return Err(NutsError::BadInitLogProb(log_prob));
        }
        for (var, value) in position.iter() {
            match gradient.get(var) {
                Some(grad) if grad.shape() == value.shape() && grad.iter().all(|g| g.is_finite()) => {}
                _ => return Err(NutsError::BadInitGradient(*var)),
            }
        }
        gradient.retain(|var, _| position.contains_key(var));
        debug_assert!(same_keys(&position, &gradient));

        let sample = model.sample_from(&sample_from);
        let potential = Potential::new(&position, settings.potential);
        let proposal = Proposal {
            position,
            gradient,
            log_prob,
            sample,
        };

        let initial_step = match settings.initial_step_size {
            Some(step) => step,
            None => find_starting_step_size(&mut model, &potential, &proposal, &mut rng)?,
        };
        info!("Initial step size {}", initial_step);

        Ok(Self {
            model,
            sample_from,
            settings,
            rng,
            potential,
            step_size: AdaptiveStepSize::new(initial_step, settings.adapt_count, settings.dual_average),
            proposal,
            sample_num: 1,
            last_stats: None,
        })
    }

    /// Whether the next draw is part of the warmup.
    pub fn is_tuning(&self) -> bool {
        self.sample_num <= self.settings.adapt_count
    }

    fn updates_potential(&self) -> bool {
        self.settings.adapt_potential
            && self.sample_num + self.settings.final_window <= self.settings.adapt_count
    }

    /// Build one trajectory and return the next draw.
    pub fn step(&mut self) -> Result<NetworkSample> {
        let tuning = self.is_tuning();
        let step_size = self.step_size.step_size();

        let momentum = self.potential.random(&mut self.rng);
        let root = LeapfrogState::new(
            self.proposal.position.clone(),
            momentum,
            self.proposal.gradient.clone(),
            self.proposal.log_prob,
            &self.potential,
        );
        let mut tree = Tree::new(
            root,
            self.proposal.clone(),
            self.settings.max_energy_change,
            &mut self.rng,
        );

        let mut ctx = TreeContext {
            model: &mut self.model,
            integrator: LeapfrogIntegrator::new(&self.potential),
            sample_from: &self.sample_from,
        };
        while tree.should_continue() && tree.height() < self.settings.max_tree_height {
            let direction: Direction = self.rng.random();
            tree.grow(&mut ctx, direction, step_size, &mut self.rng)?;
        }

        let maxdepth_reached = tree.should_continue();
        let mean_accept_prob = tree.mean_accept_prob();
        let tree_height = tree.height();
        let n_leapfrog = tree.n_leapfrog();
        let accepted_count = tree.accepted_count();
        let (proposal, divergence) = tree.into_parts();
        self.proposal = proposal;

        if let Some(info) = divergence.as_ref() {
            debug!(
                "Divergence in draw {} (energy error {:?})",
                self.sample_num, info.energy_error
            );
        }

        if self.settings.adapt_step_size {
            self.step_size.adapt(mean_accept_prob, self.sample_num);
        }
        if self.updates_potential() {
            self.potential.update(&self.proposal.position);
        }

        self.last_stats = Some(SampleStats {
            draw: self.sample_num,
            tree_height,
            maxdepth_reached,
            diverging: divergence.is_some(),
            divergence_info: if self.settings.store_divergences {
                divergence
            } else {
                None
            },
            log_prob: self.proposal.log_prob,
            step_size,
            step_size_bar: self.step_size.step_size_bar(),
            mean_accept_prob,
            n_leapfrog,
            accepted_count,
            tuning,
        });

        if tuning && self.sample_num == self.settings.adapt_count {
            info!(
                "Finished warmup after {} draws, step size {}",
                self.sample_num,
                self.step_size.step_size()
            );
        }
        trace!(
            "Draw {}: height {}, accept {:.3}",
            self.sample_num, tree_height, mean_accept_prob
        );
        self.sample_num += 1;

        Ok(NetworkSample {
            sample: self.proposal.sample.clone(),
            log_prob: self.proposal.log_prob,
        })
    }

    /// Take one step and pass the draw to `sink`.
    pub fn sample<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        let draw = self.step()?;
        sink.append(&draw);
        Ok(())
    }

    /// Take `count` steps, passing every draw to `sink`.
    pub fn run<S: SampleSink + ?Sized>(&mut self, count: u64, sink: &mut S) -> Result<()> {
        for _ in 0..count {
            self.sample(sink)?;
        }
        Ok(())
    }

    /// Run the remaining warmup draws without recording them.
    pub fn warmup(&mut self) -> Result<()> {
        while self.is_tuning() {
            self.step()?;
        }
        Ok(())
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    /// The step size of the next trajectory.
    pub fn step_size(&self) -> f64 {
        self.step_size.step_size()
    }

    pub fn potential(&self) -> &Potential {
        &self.potential
    }

    pub fn last_stats(&self) -> Option<&SampleStats> {
        self.last_stats.as_ref()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }
}

/// Sample independent chains in parallel, one per model.
///
/// Chain `i` uses a `ChaCha8Rng` seeded with `settings.seed` on stream `i`.
/// The warmup draws of every chain are discarded and `num_draws` draws are
/// returned per chain.
pub fn sample_parallel<M>(
    models: Vec<M>,
    sample_from: &[VariableRef],
    settings: NutsSettings,
    num_draws: u64,
) -> anyhow::Result<Vec<NetworkSamples>>
where
    M: ProbabilisticModel + Send,
{
    models
        .into_par_iter()
        .enumerate()
        .map(|(chain, model)| -> anyhow::Result<NetworkSamples> {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(chain as u64);

            let mut sampler = NutsSampler::with_rng(model, sample_from.to_vec(), settings, rng)
                .with_context(|| format!("Could not initialize chain {}", chain))?;
            sampler
                .warmup()
                .with_context(|| format!("Warmup failed in chain {}", chain))?;

            let mut samples = NetworkSamples::new();
            sampler
                .run(num_draws, &mut samples)
                .with_context(|| format!("Sampling failed in chain {}", chain))?;
            Ok(samples)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logps::NormalModel;
    use ndarray::arr1;
    use pretty_assertions::assert_eq;

    #[test]
    fn deterministic() {
        let run = || {
            let model = NormalModel::new(arr1(&[3.5, 3.5, 3.5]).into_dyn(), 1.).with_mean(3.);
            let settings = NutsSettings {
                seed: 42,
                adapt_count: 20,
                ..Default::default()
            };
            let mut sampler = NutsSampler::new(model, vec![NormalModel::LATENT], settings).unwrap();
            let mut draws: Vec<NetworkSample> = Vec::new();
            sampler.run(30, &mut draws).unwrap();
            draws
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn settings_validation() {
        assert!(NutsSettings::default().validate().is_ok());

        let settings = NutsSettings {
            adapt_count: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(NutsError::InvalidSettings(_))));

        let settings = NutsSettings {
            adapt_count: 0,
            adapt_step_size: false,
            adapt_potential: false,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = NutsSettings {
            max_tree_height: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = NutsSettings {
            initial_step_size: Some(-1.),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn stats_follow_warmup() {
        let model = NormalModel::scalars(2, 1., 0., 1.);
        let settings = NutsSettings {
            adapt_count: 5,
            ..Default::default()
        };
        let mut sampler =
            NutsSampler::new(model, vec![VariableRef::new(0), VariableRef::new(1)], settings).unwrap();
        assert!(sampler.last_stats().is_none());
        let setup_evaluations = sampler.model().evaluations();
        assert!(setup_evaluations >= 2);

        let mut n_leapfrog = 0;
        for draw in 1..=8 {
            let sample = sampler.step().unwrap();
            assert_eq!(sample.sample.len(), 2);
            let stats = sampler.last_stats().unwrap();
            assert_eq!(stats.draw, draw);
            assert_eq!(stats.tuning, draw <= 5);
            assert!(stats.tree_height >= 1);
            assert!(stats.tree_height <= 10);
            assert!(stats.n_leapfrog >= 1);
            n_leapfrog += stats.n_leapfrog;
        }
        assert!(!sampler.is_tuning());
        // mass matrix window of 50 never completes
        assert_eq!(sampler.potential().num_updates(), 0);

        let model = sampler.into_model();
        assert_eq!(model.evaluations(), setup_evaluations + n_leapfrog);
    }
}
