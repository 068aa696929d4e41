//! Sample from differentiable probabilistic models with the No-U-Turn
//! sampler.
//!
//! A model implements [`ProbabilisticModel`]: it exposes its continuous
//! latent variables as tensors and evaluates the joint log probability with
//! its gradient. [`NutsSampler`] then produces draws, adapting the step
//! size and a diagonal mass matrix during warmup.
//!
//! ```ignore
//! let settings = NutsSettings { adapt_count: 500, ..Default::default() };
//! let mut sampler = NutsSampler::new(model, vec![var], settings)?;
//! let mut samples = NetworkSamples::new();
//! sampler.run(1500, &mut samples)?;
//! let posterior = samples.drop_count(500);
//! ```

pub(crate) mod error;
pub(crate) mod integrator;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod potential;
pub(crate) mod sampler;
pub(crate) mod sampler_stats;
pub(crate) mod samples;
pub(crate) mod stepsize;
pub(crate) mod tree;

pub mod test_logps;

pub use error::{NutsError, Result};
pub use integrator::{Direction, DivergenceInfo, LeapfrogIntegrator, LeapfrogState};
pub use model::{
    Gradient, LogpError, Momentum, Position, ProbabilisticModel, Sample, Tensor, VarMap,
    VariableRef,
};
pub use potential::{Potential, PotentialSettings};
pub use sampler::{sample_parallel, NutsSampler, NutsSettings};
pub use sampler_stats::{AsSampleStatMap, SampleStatValue, SampleStats};
pub use samples::{NetworkSample, NetworkSamples, SampleSink};
pub use stepsize::{find_starting_step_size, AdaptiveStepSize, DualAverageSettings};
pub use tree::{is_not_u_turning, Proposal, Tree, TreeContext};
