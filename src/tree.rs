use std::rc::Rc;

use itertools::izip;
use rand::Rng;
use rand_distr::Exp1;

use crate::{
    error::Result,
    integrator::{Direction, DivergenceInfo, LeapfrogIntegrator, LeapfrogState},
    math::{all_finite, tensor_prods_of_diff},
    model::{Gradient, Position, ProbabilisticModel, Sample, VariableRef},
};

/// The current candidate for the next draw.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub position: Position,
    pub gradient: Gradient,
    pub log_prob: f64,
    /// Values of the recorded variables at `position`.
    pub sample: Sample,
}

/// Everything a tree needs to take leapfrog steps.
pub struct TreeContext<'a, M: ProbabilisticModel> {
    pub model: &'a mut M,
    pub integrator: LeapfrogIntegrator<'a>,
    pub sample_from: &'a [VariableRef],
}

/// Slice variable and energy references shared by every leaf of one trajectory.
#[derive(Debug, Clone, Copy)]
struct Slice {
    /// `log(u)` with `u ~ Uniform(0, exp(log_joint(root)))`.
    log_u: f64,
    initial_log_joint: f64,
    max_energy_change: f64,
}

/// True if the trajectory between `backward` and `forward` is still
/// expanding in both directions.
///
/// Non-finite dot products count as a U-turn.
pub fn is_not_u_turning(forward: &LeapfrogState, backward: &LeapfrogState) -> bool {
    let (forward_dot, backward_dot) = izip!(
        forward.position.values(),
        backward.position.values(),
        forward.momentum.values(),
        backward.momentum.values()
    )
    .fold((0f64, 0f64), |(acc_f, acc_b), (qf, qb, pf, pb)| {
        let (f, b) = tensor_prods_of_diff(qf, qb, pf, pb);
        (acc_f + f, acc_b + b)
    });

    forward_dot.is_finite() && backward_dot.is_finite() && forward_dot >= 0. && backward_dot >= 0.
}

/// A completed subtree of the trajectory.
///
/// Invariant: `proposal.is_some()` iff `accepted_count > 0`.
struct Subtree {
    backward: Rc<LeapfrogState>,
    forward: Rc<LeapfrogState>,
    proposal: Option<Proposal>,
    accepted_count: u64,
    should_continue: bool,
    alpha: f64,
    n_alpha: u64,
    n_leapfrog: u64,
    divergence: Option<DivergenceInfo>,
}

impl Subtree {
    /// A leaf whose leapfrog step failed. The trajectory does not move.
    fn failed(start: &Rc<LeapfrogState>, info: DivergenceInfo) -> Self {
        Subtree {
            backward: start.clone(),
            forward: start.clone(),
            proposal: None,
            accepted_count: 0,
            should_continue: false,
            alpha: 0.,
            n_alpha: 1,
            n_leapfrog: 1,
            divergence: Some(info),
        }
    }

    fn single_step<M: ProbabilisticModel>(
        ctx: &mut TreeContext<M>,
        slice: &Slice,
        start: &Rc<LeapfrogState>,
        direction: Direction,
        epsilon: f64,
    ) -> Result<Subtree> {
        let end = match ctx
            .integrator
            .step(ctx.model, start, direction.sign() * epsilon)?
        {
            Ok(end) => end,
            Err(info) => return Ok(Subtree::failed(start, info)),
        };

        let log_joint = end.log_joint();
        let finite = log_joint.is_finite() && all_finite(&end.gradient);
        let acceptable = finite && slice.log_u <= log_joint;
        let diverging = !finite || !(log_joint - slice.log_u > -slice.max_energy_change);

        let alpha = if finite {
            (log_joint - slice.initial_log_joint).exp().min(1.)
        } else {
            0.
        };

        let divergence = if diverging {
            Some(DivergenceInfo {
                start_location: Some(start.position.clone()),
                end_location: Some(end.position.clone()),
                energy_error: Some(slice.initial_log_joint - log_joint),
                logp_function_error: None,
            })
        } else {
            None
        };

        let proposal = if acceptable {
            Some(Proposal {
                position: end.position.clone(),
                gradient: end.gradient.clone(),
                log_prob: end.log_prob,
                sample: ctx.model.sample_from(ctx.sample_from),
            })
        } else {
            None
        };

        let end = Rc::new(end);
        Ok(Subtree {
            backward: end.clone(),
            forward: end,
            proposal,
            accepted_count: acceptable as u64,
            should_continue: !diverging,
            alpha,
            n_alpha: 1,
            n_leapfrog: 1,
            divergence,
        })
    }

    /// Build a subtree with `2^height` leaves, starting after `start`.
    fn build<M: ProbabilisticModel, R: Rng + ?Sized>(
        ctx: &mut TreeContext<M>,
        slice: &Slice,
        start: &Rc<LeapfrogState>,
        direction: Direction,
        height: u64,
        epsilon: f64,
        rng: &mut R,
    ) -> Result<Subtree> {
        if height == 0 {
            return Self::single_step(ctx, slice, start, direction, epsilon);
        }

        let first = Self::build(ctx, slice, start, direction, height - 1, epsilon, rng)?;
        if !first.should_continue {
            return Ok(first);
        }

        let next_start = match direction {
            Direction::Forward => first.forward.clone(),
            Direction::Backward => first.backward.clone(),
        };
        let other = Self::build(ctx, slice, &next_start, direction, height - 1, epsilon, rng)?;
        Ok(first.merge(other, direction, rng))
    }

    /// Join two adjacent subtrees of the same height.
    ///
    /// The proposal of `other` replaces ours with probability
    /// `n_other / (n_self + n_other)`.
    fn merge<R: Rng + ?Sized>(self, other: Subtree, direction: Direction, rng: &mut R) -> Subtree {
        let (backward, forward) = match direction {
            Direction::Forward => (self.backward, other.forward),
            Direction::Backward => (other.backward, self.forward),
        };

        let accepted_count = self.accepted_count + other.accepted_count;
        let take_other = other.accepted_count > 0
            && rng.random::<f64>() * (accepted_count as f64) < other.accepted_count as f64;
        let proposal = if take_other {
            other.proposal
        } else {
            self.proposal
        };

        let should_continue = self.should_continue
            && other.should_continue
            && is_not_u_turning(&forward, &backward);

        Subtree {
            backward,
            forward,
            proposal,
            accepted_count,
            should_continue,
            alpha: self.alpha + other.alpha,
            n_alpha: self.n_alpha + other.n_alpha,
            n_leapfrog: self.n_leapfrog + other.n_leapfrog,
            divergence: self.divergence.or(other.divergence),
        }
    }
}

/// The trajectory of one NUTS step, doubled in random directions until it
/// turns around, diverges or reaches its maximum height.
pub struct Tree {
    backward: Rc<LeapfrogState>,
    forward: Rc<LeapfrogState>,
    proposal: Proposal,
    accepted_count: u64,
    should_continue: bool,
    height: u64,
    alpha: f64,
    n_alpha: u64,
    n_leapfrog: u64,
    slice: Slice,
    divergence: Option<DivergenceInfo>,
}

impl Tree {
    /// Start a trajectory at `root`, which must carry a freshly drawn
    /// momentum. `proposal` is returned if no other point is accepted.
    pub fn new<R: Rng + ?Sized>(
        root: LeapfrogState,
        proposal: Proposal,
        max_energy_change: f64,
        rng: &mut R,
    ) -> Tree {
        let initial_log_joint = root.log_joint();
        let slice = Slice {
            log_u: initial_log_joint - rng.sample::<f64, _>(Exp1),
            initial_log_joint,
            max_energy_change,
        };
        let root = Rc::new(root);
        Tree {
            backward: root.clone(),
            forward: root,
            proposal,
            accepted_count: 1,
            should_continue: true,
            height: 0,
            alpha: 0.,
            n_alpha: 0,
            n_leapfrog: 0,
            slice,
            divergence: None,
        }
    }

    /// Double the trajectory in `direction`. Does nothing if the tree
    /// already stopped.
    pub fn grow<M: ProbabilisticModel, R: Rng + ?Sized>(
        &mut self,
        ctx: &mut TreeContext<M>,
        direction: Direction,
        epsilon: f64,
        rng: &mut R,
    ) -> Result<()> {
        if !self.should_continue {
            return Ok(());
        }

        let start = match direction {
            Direction::Forward => self.forward.clone(),
            Direction::Backward => self.backward.clone(),
        };
        let other = Subtree::build(ctx, &self.slice, &start, direction, self.height, epsilon, rng)?;

        if other.should_continue {
            if let Some(proposal) = other.proposal {
                let accept_prob = other.accepted_count as f64 / self.accepted_count as f64;
                if accept_prob >= 1. || rng.random::<f64>() < accept_prob {
                    self.proposal = proposal;
                }
            }
        }

        match direction {
            Direction::Forward => self.forward = other.forward,
            Direction::Backward => self.backward = other.backward,
        }

        self.accepted_count += other.accepted_count;
        // Only the newest subtree enters the acceptance statistic.
        self.alpha = other.alpha;
        self.n_alpha = other.n_alpha;
        self.n_leapfrog += other.n_leapfrog;
        if self.divergence.is_none() {
            self.divergence = other.divergence;
        }
        self.should_continue =
            other.should_continue && is_not_u_turning(&self.forward, &self.backward);
        self.height += 1;
        Ok(())
    }

    pub fn should_continue(&self) -> bool {
        self.should_continue
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Mean Metropolis acceptance probability over the leaves of the last
    /// subtree, 0 before the first doubling.
    pub fn mean_accept_prob(&self) -> f64 {
        if self.n_alpha == 0 {
            return 0.;
        }
        let mean = self.alpha / self.n_alpha as f64;
        if mean.is_finite() {
            mean
        } else {
            0.
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted_count
    }

    pub fn n_leapfrog(&self) -> u64 {
        self.n_leapfrog
    }

    pub fn divergence(&self) -> Option<&DivergenceInfo> {
        self.divergence.as_ref()
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn into_parts(self) -> (Proposal, Option<DivergenceInfo>) {
        (self.proposal, self.divergence)
    }

    #[cfg(test)]
    pub(crate) fn extremes(&self) -> (&LeapfrogState, &LeapfrogState) {
        (&self.backward, &self.forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Momentum, Tensor};
    use crate::potential::{Potential, PotentialSettings};
    use crate::test_logps::NormalModel;
    use ndarray::arr1;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn state(q: f64, p: f64) -> LeapfrogState {
        let var = VariableRef::new(0);
        let mut position = Position::new();
        position.insert(var, arr1(&[q]).into_dyn());
        let mut momentum = Momentum::new();
        momentum.insert(var, arr1(&[p]).into_dyn());
        LeapfrogState {
            position: position.clone(),
            momentum,
            gradient: position,
            log_prob: 0.,
            kinetic_energy: 0.5 * p * p,
        }
    }

    #[test]
    fn u_turn_criterion() {
        assert!(is_not_u_turning(&state(1., 1.), &state(-1., 1.)));
        assert!(!is_not_u_turning(&state(1., -1.), &state(-1., 1.)));
        assert!(!is_not_u_turning(&state(1., 1.), &state(-1., -1.)));
        assert!(!is_not_u_turning(&state(f64::NAN, 1.), &state(-1., 1.)));
        assert!(is_not_u_turning(&state(0., 1.), &state(0., 1.)));
    }

    fn leaf(q: f64, accepted: bool) -> Subtree {
        let state = Rc::new(state(q, 1.));
        let proposal = accepted.then(|| Proposal {
            position: state.position.clone(),
            gradient: state.gradient.clone(),
            log_prob: 0.,
            sample: Sample::new(),
        });
        Subtree {
            backward: state.clone(),
            forward: state,
            proposal,
            accepted_count: accepted as u64,
            should_continue: true,
            alpha: 0.5,
            n_alpha: 1,
            n_leapfrog: 1,
            divergence: None,
        }
    }

    fn proposal_value(tree: &Subtree) -> Option<f64> {
        tree.proposal
            .as_ref()
            .map(|p| p.position[&VariableRef::new(0)][[0]])
    }

    #[test]
    fn merge_weights_by_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 4000;
        let mut took_other = 0;
        for _ in 0..n {
            let first = leaf(1., true);
            let mut other = leaf(2., true).merge(leaf(3., true), Direction::Forward, &mut rng);
            other = other.merge(leaf(4., false), Direction::Forward, &mut rng);
            assert_eq!(other.accepted_count, 2);
            let merged = first.merge(other, Direction::Forward, &mut rng);
            assert_eq!(merged.accepted_count, 3);
            assert_eq!(merged.n_alpha, 4);
            if proposal_value(&merged) != Some(1.) {
                took_other += 1;
            }
        }
        let frac = took_other as f64 / n as f64;
        assert!((frac - 2. / 3.).abs() < 0.03, "fraction {}", frac);
    }

    #[test]
    fn merge_empty_subtrees() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let merged = leaf(1., false).merge(leaf(2., false), Direction::Backward, &mut rng);
        assert!(merged.proposal.is_none());
        assert_eq!(merged.accepted_count, 0);
        assert_eq!(merged.backward.position[&VariableRef::new(0)][[0]], 2.);
        assert_eq!(merged.forward.position[&VariableRef::new(0)][[0]], 1.);

        let merged = leaf(1., false).merge(leaf(2., true), Direction::Forward, &mut rng);
        assert_eq!(proposal_value(&merged), Some(2.));
    }

    fn stopped(mut tree: Subtree) -> Subtree {
        tree.should_continue = false;
        tree
    }

    #[test]
    fn merge_detects_u_turn() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // Every leaf has p = 1, so positions must increase forward in time.
        let merged = leaf(1., true).merge(leaf(2., true), Direction::Forward, &mut rng);
        assert!(merged.should_continue);
        let merged = leaf(2., true).merge(leaf(1., true), Direction::Forward, &mut rng);
        assert!(!merged.should_continue);
        let merged = leaf(1., false).merge(leaf(2., false), Direction::Backward, &mut rng);
        assert!(!merged.should_continue);
    }

    #[test]
    fn stopped_subtrees_stop_the_merge() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for direction in [Direction::Forward, Direction::Backward] {
            let next = 1. + direction.sign();
            let after = 1. + 2. * direction.sign();

            let merged = leaf(1., true).merge(leaf(next, true), direction, &mut rng);
            assert!(merged.should_continue);

            let merged = stopped(leaf(1., true)).merge(leaf(next, true), direction, &mut rng);
            assert!(!merged.should_continue);

            let merged = leaf(1., true).merge(stopped(leaf(next, true)), direction, &mut rng);
            assert!(!merged.should_continue);
            let merged = merged.merge(leaf(after, true), direction, &mut rng);
            assert!(!merged.should_continue);
        }
    }

    #[test]
    fn build_stops_after_inner_u_turn() {
        // Unit normal from q = 0, p = 1 with step 2: the leaves are
        // (q, p) = (2, -1) and (-4, 1), which head back toward each other.
        let mut model = NormalModel::new(arr1(&[0.]).into_dyn(), 1.);
        let potential = Potential::new(&model.latent_position(), PotentialSettings::default());
        let position = model.latent_position();
        let (log_prob, gradient) = model.log_prob_and_gradient(&position).unwrap();
        let mut momentum = Momentum::new();
        momentum.insert(NormalModel::LATENT, arr1(&[1.]).into_dyn());
        let start = Rc::new(LeapfrogState::new(
            position, momentum, gradient, log_prob, &potential,
        ));
        let slice = Slice {
            log_u: start.log_joint() - 1.,
            initial_log_joint: start.log_joint(),
            max_energy_change: 1000.,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut ctx = TreeContext {
            model: &mut model,
            integrator: LeapfrogIntegrator::new(&potential),
            sample_from: &[NormalModel::LATENT],
        };

        let half = Subtree::build(&mut ctx, &slice, &start, Direction::Forward, 1, 2., &mut rng)
            .unwrap();
        assert!(!half.should_continue);
        assert!(half.divergence.is_none());
        assert_eq!(half.n_leapfrog, 2);
        assert_eq!(half.backward.position[&NormalModel::LATENT][[0]], 2.);
        assert_eq!(half.forward.position[&NormalModel::LATENT][[0]], -4.);

        let subtree = Subtree::build(&mut ctx, &slice, &start, Direction::Forward, 3, 2., &mut rng)
            .unwrap();
        assert!(!subtree.should_continue);
        assert_eq!(subtree.n_leapfrog, 2);
        assert_eq!(subtree.n_alpha, 2);
        assert!(subtree.divergence.is_none());

        // One evaluation for the start and two for each build.
        assert_eq!(model.evaluations(), 5);
    }

    fn root(model: &mut NormalModel, potential: &Potential, rng: &mut ChaCha8Rng) -> (LeapfrogState, Proposal) {
        let position = model.latent_position();
        let (log_prob, gradient) = model.log_prob_and_gradient(&position).unwrap();
        let proposal = Proposal {
            position: position.clone(),
            gradient: gradient.clone(),
            log_prob,
            sample: model.sample_from(&[NormalModel::LATENT]),
        };
        let momentum = potential.random(rng);
        (
            LeapfrogState::new(position, momentum, gradient, log_prob, potential),
            proposal,
        )
    }

    #[test]
    fn divergence_is_contained() {
        let mut model = NormalModel::new(arr1(&[0.5, -0.5]).into_dyn(), 1.);
        let potential = Potential::new(&model.latent_position(), PotentialSettings::default());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (root, proposal) = root(&mut model, &potential, &mut rng);
        let mut tree = Tree::new(root, proposal.clone(), 1000., &mut rng);

        let mut ctx = TreeContext {
            model: &mut model,
            integrator: LeapfrogIntegrator::new(&potential),
            sample_from: &[NormalModel::LATENT],
        };
        tree.grow(&mut ctx, Direction::Forward, 1e4, &mut rng).unwrap();

        assert!(!tree.should_continue());
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.n_leapfrog(), 1);
        assert!(tree.divergence().is_some());
        assert_eq!(tree.proposal(), &proposal);
        assert_eq!(tree.mean_accept_prob(), 0.);

        tree.grow(&mut ctx, Direction::Backward, 1e4, &mut rng).unwrap();
        assert_eq!(tree.height(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn grows_until_u_turn(seed in any::<u64>(), step in 0.05f64..1.5) {
            let mut model = NormalModel::new(arr1(&[0.3, 1., -2.]).into_dyn(), 1.);
            let potential = Potential::new(&model.latent_position(), PotentialSettings::default());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let (root, proposal) = root(&mut model, &potential, &mut rng);
            let mut tree = Tree::new(root, proposal, 1000., &mut rng);
            let mut ctx = TreeContext {
                model: &mut model,
                integrator: LeapfrogIntegrator::new(&potential),
                sample_from: &[NormalModel::LATENT],
            };

            while tree.should_continue() && tree.height() < 10 {
                let height = tree.height();
                tree.grow(&mut ctx, rng.random(), step, &mut rng).unwrap();
                prop_assert_eq!(tree.height(), height + 1);
                prop_assert!(tree.n_leapfrog() <= (1u64 << (height + 1)) - 1);
                if tree.should_continue() {
                    let (backward, forward) = tree.extremes();
                    prop_assert!(is_not_u_turning(forward, backward));
                }
                let accept = tree.mean_accept_prob();
                prop_assert!((0. ..=1.).contains(&accept));
            }

            let height = tree.height();
            let stopped = !tree.should_continue();
            tree.grow(&mut ctx, Direction::Forward, step, &mut rng).unwrap();
            if stopped {
                prop_assert_eq!(tree.height(), height);
            }
            let sample: &Tensor = &tree.proposal().sample[&NormalModel::LATENT];
            prop_assert_eq!(sample, &tree.proposal().position[&NormalModel::LATENT]);
        }
    }
}
