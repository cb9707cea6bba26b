//! Hamiltonian (Hybrid) Monte Carlo for a scalar parameter on the unit interval, with
//! step-size adaptation during burn-in.
//!
//! A chain proposes by integrating Hamiltonian dynamics with the leapfrog scheme and then
//! applies the usual Metropolis accept/reject step. Trajectories that leave `[0, 1]` are
//! reflected at the boundary (position mirrored, momentum negated), which keeps every
//! state inside the support of the uniform prior.
//!
//! The target is supplied through [`HamiltonianTarget`]: either a closed-form gradient or a
//! `burn` autodiff target wrapped in
//! [`BurnGradientTarget`](crate::distributions::BurnGradientTarget).
//!
//! # Example
//!
//! ```rust
//! use coinflip_mcmc::hmc::{HmcConfig, HMC};
//! use coinflip_mcmc::model::CoinFlipModel;
//!
//! let posterior = CoinFlipModel::new(10).condition(7).unwrap();
//! let config = HmcConfig::default()
//!     .with_num_burnin_steps(200)
//!     .with_num_adaptation_steps(150)
//!     .with_num_results(500)
//!     .with_seed(42);
//! let trace = HMC::new(posterior, config).unwrap().run().unwrap();
//! assert_eq!(trace.num_results(), 500);
//! assert!(trace.samples().iter().all(|x| (0.0..=1.0).contains(x)));
//! ```

use crate::adaptation::{AdaptationState, StepSizeAdaptation};
use crate::core::{ChainRunner, HasChains, MarkovChain};
use crate::distributions::HamiltonianTarget;
use crate::error::{McmcError, Result};
use crate::stats;
use indicatif::ProgressBar;
use log::{info, warn};
use ndarray::{Array2, Axis};
use ndarray_stats::QuantileExt;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::StandardNormal;

/// Energy increase beyond which a transition is flagged as divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Split R-hat above which a run is reported as not converged.
const RHAT_THRESHOLD: f64 = 1.1;

/// Kernel configuration and run lengths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HmcConfig {
    /// Initial step size of the leapfrog integrator.
    pub step_size: f64,
    /// Number of leapfrog steps per proposal.
    pub n_leapfrog: usize,
    /// Discarded iterations, including the adaptation window.
    pub num_burnin_steps: usize,
    /// Retained iterations per chain.
    pub num_results: usize,
    /// Length of the adaptation window at the start of burn-in. Must be strictly smaller
    /// than `num_burnin_steps`.
    pub num_adaptation_steps: usize,
    pub adaptation: StepSizeAdaptation,
    /// Starting value of every chain.
    pub initial_state: f64,
    pub n_chains: usize,
    /// `None` seeds from entropy; chain `i` uses `seed + i` otherwise.
    pub seed: Option<u64>,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.05,
            n_leapfrog: 3,
            num_burnin_steps: 1000,
            num_results: 5000,
            num_adaptation_steps: 800,
            adaptation: StepSizeAdaptation::default(),
            initial_state: 0.5,
            n_chains: 1,
            seed: None,
        }
    }
}

impl HmcConfig {
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_n_leapfrog(mut self, n_leapfrog: usize) -> Self {
        self.n_leapfrog = n_leapfrog;
        self
    }

    pub fn with_num_burnin_steps(mut self, num_burnin_steps: usize) -> Self {
        self.num_burnin_steps = num_burnin_steps;
        self
    }

    pub fn with_num_results(mut self, num_results: usize) -> Self {
        self.num_results = num_results;
        self
    }

    pub fn with_num_adaptation_steps(mut self, num_adaptation_steps: usize) -> Self {
        self.num_adaptation_steps = num_adaptation_steps;
        self
    }

    pub fn with_adaptation(mut self, adaptation: StepSizeAdaptation) -> Self {
        self.adaptation = adaptation;
        self
    }

    pub fn with_initial_state(mut self, initial_state: f64) -> Self {
        self.initial_state = initial_state;
        self
    }

    pub fn with_n_chains(mut self, n_chains: usize) -> Self {
        self.n_chains = n_chains;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Burn-in plus retained iterations.
    pub fn total_steps(&self) -> usize {
        self.num_burnin_steps + self.num_results
    }

    /// Rejects unusable configurations before any sampling happens.
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(McmcError::InvalidStepSize {
                step_size: self.step_size,
            });
        }
        if self.n_leapfrog == 0 {
            return Err(McmcError::InvalidLeapfrogSteps);
        }
        if self.num_adaptation_steps >= self.num_burnin_steps {
            return Err(McmcError::AdaptationWindow {
                num_adaptation_steps: self.num_adaptation_steps,
                num_burnin_steps: self.num_burnin_steps,
            });
        }
        if self.num_results == 0 {
            return Err(McmcError::NoResults);
        }
        if self.n_chains == 0 {
            return Err(McmcError::NoChains);
        }
        if !(0.0..=1.0).contains(&self.initial_state) {
            return Err(McmcError::InvalidInitialState {
                value: self.initial_state,
            });
        }
        self.adaptation.validate()
    }
}

/// Lifecycle of a single chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialized,
    Adapting,
    BurningIn,
    Sampling,
    Done,
}

/// Outcome of one HMC iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// State of the chain after the iteration.
    pub position: f64,
    pub accept_prob: f64,
    pub accepted: bool,
    pub divergent: bool,
    /// Step size used for this iteration.
    pub step_size: f64,
}

/// Retained draws and run statistics of one finished chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTrace {
    samples: Vec<f64>,
    step_size: f64,
    mean_accept: f64,
    adaptation_accept: Option<f64>,
    n_divergent: usize,
}

impl ChainTrace {
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f64> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Step size after adaptation froze.
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Mean acceptance probability over the retained iterations.
    pub fn mean_accept(&self) -> f64 {
        self.mean_accept
    }

    /// Mean acceptance probability reached during the adaptation window.
    pub fn adaptation_accept(&self) -> Option<f64> {
        self.adaptation_accept
    }

    /// Divergent transitions over the whole run, burn-in included.
    pub fn n_divergent(&self) -> usize {
        self.n_divergent
    }
}

/// A single HMC chain driven through `Initialized → Adapting → BurningIn → Sampling → Done`.
///
/// The chain owns its random number generator and its adaptation state; nothing is shared.
pub struct HmcChain<T> {
    target: T,
    config: HmcConfig,
    position: f64,
    logp: f64,
    grad: f64,
    adaptation: AdaptationState,
    phase: Phase,
    iteration: usize,
    accept_sum: f64,
    n_divergent: usize,
    rng: SmallRng,
}

impl<T: HamiltonianTarget> HmcChain<T> {
    /// Validates `config` and evaluates the target at `config.initial_state`, which must
    /// have a finite log density.
    pub fn new(target: T, config: &HmcConfig, rng: SmallRng) -> Result<Self> {
        config.validate()?;
        let theta = config.initial_state;
        let (logp, grad) = target.logp_and_grad(theta);
        if !logp.is_finite() {
            return Err(McmcError::NonFiniteLogDensity {
                iteration: 0,
                theta,
                value: logp,
            });
        }
        if !grad.is_finite() {
            return Err(McmcError::NonFiniteGradient {
                iteration: 0,
                theta,
                value: grad,
            });
        }
        Ok(Self {
            target,
            config: *config,
            position: theta,
            logp,
            grad,
            adaptation: AdaptationState::new(
                config.adaptation,
                config.step_size,
                config.num_adaptation_steps,
            ),
            phase: Phase::Initialized,
            iteration: 0,
            accept_sum: 0.0,
            n_divergent: 0,
            rng,
        })
    }

    /// Replaces the random number generator with one seeded from `seed`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn step_size(&self) -> f64 {
        self.adaptation.step_size()
    }

    pub fn adaptation(&self) -> &AdaptationState {
        &self.adaptation
    }

    fn phase_at(&self, iteration: usize) -> Phase {
        let c = &self.config;
        if iteration < c.num_adaptation_steps {
            Phase::Adapting
        } else if iteration < c.num_burnin_steps {
            Phase::BurningIn
        } else if iteration < c.total_steps() {
            Phase::Sampling
        } else {
            Phase::Done
        }
    }

    /// Performs one HMC iteration, updating the adaptation state while in the adaptation
    /// window.
    pub fn step(&mut self) -> Result<Transition> {
        let phase = self.phase_at(self.iteration);
        if phase == Phase::Done {
            return Err(McmcError::ChainExhausted {
                num_results: self.config.num_results,
            });
        }
        self.phase = phase;

        let transition = self.transition(self.adaptation.step_size())?;
        match phase {
            Phase::Adapting => self.adaptation.update(transition.accept_prob),
            Phase::Sampling => self.accept_sum += transition.accept_prob,
            _ => {}
        }
        if transition.divergent {
            self.n_divergent += 1;
        }

        self.iteration += 1;
        if self.iteration == self.config.total_steps() {
            self.phase = Phase::Done;
        }
        Ok(transition)
    }

    /// Runs burn-in and sampling to completion and returns the retained draws.
    pub fn run(mut self) -> Result<ChainTrace> {
        let remaining = self.config.total_steps() - self.iteration;
        let n_collect = remaining.min(self.config.num_results);
        let samples = crate::core::run_chain(&mut self, n_collect, remaining - n_collect)?;
        Ok(self.into_trace(samples))
    }

    /// Like [`HmcChain::run`], reporting progress on `pb`.
    pub fn run_progress(mut self, pb: &ProgressBar) -> Result<ChainTrace> {
        let remaining = self.config.total_steps() - self.iteration;
        let n_collect = remaining.min(self.config.num_results);
        let samples =
            crate::core::run_chain_with_progress(&mut self, n_collect, remaining - n_collect, pb)?;
        Ok(self.into_trace(samples))
    }

    fn into_trace(self, samples: Vec<f64>) -> ChainTrace {
        ChainTrace {
            mean_accept: self.accept_sum / self.config.num_results as f64,
            step_size: self.adaptation.step_size(),
            adaptation_accept: self.adaptation.mean_accept(),
            n_divergent: self.n_divergent,
            samples,
        }
    }

    fn evaluate(&self, theta: f64) -> Result<(f64, f64)> {
        let (logp, grad) = self.target.logp_and_grad(theta);
        if logp.is_nan() || logp == f64::INFINITY {
            return Err(McmcError::NonFiniteLogDensity {
                iteration: self.iteration,
                theta,
                value: logp,
            });
        }
        if logp.is_finite() && !grad.is_finite() {
            return Err(McmcError::NonFiniteGradient {
                iteration: self.iteration,
                theta,
                value: grad,
            });
        }
        Ok((logp, grad))
    }

    /// Momentum refresh, leapfrog trajectory and Metropolis correction.
    fn transition(&mut self, step_size: f64) -> Result<Transition> {
        let momentum_0: f64 = self.rng.sample(StandardNormal);
        let h_current = -self.logp + 0.5 * momentum_0 * momentum_0;

        let (mut theta, mut mom) = (self.position, momentum_0);
        let (mut logp, mut grad) = (self.logp, self.grad);
        let mut divergent = false;

        mom += 0.5 * step_size * grad;
        for step_i in 0..self.config.n_leapfrog {
            theta += step_size * mom;
            if !theta.is_finite() {
                return Err(McmcError::NonFinitePosition {
                    iteration: self.iteration,
                    theta,
                });
            }
            let (reflected, flipped) = reflect_into_unit_interval(theta);
            theta = reflected;
            if flipped {
                mom = -mom;
            }

            (logp, grad) = self.evaluate(theta)?;
            if logp == f64::NEG_INFINITY {
                divergent = true;
                break;
            }
            let scale = if step_i + 1 == self.config.n_leapfrog {
                0.5
            } else {
                1.0
            };
            mom += scale * step_size * grad;
        }

        let (accept_prob, accepted) = if divergent {
            (0.0, false)
        } else {
            let h_proposed = -logp + 0.5 * mom * mom;
            let accept_logp = h_current - h_proposed;
            if -accept_logp > DIVERGENCE_THRESHOLD {
                divergent = true;
            }
            let ln_u = self.rng.gen::<f64>().ln();
            (accept_logp.min(0.0).exp(), ln_u < accept_logp)
        };

        if accepted {
            self.position = theta;
            self.logp = logp;
            self.grad = grad;
        }
        Ok(Transition {
            position: self.position,
            accept_prob,
            accepted,
            divergent,
            step_size,
        })
    }
}

impl<T: HamiltonianTarget> MarkovChain for HmcChain<T> {
    fn step(&mut self) -> Result<f64> {
        HmcChain::step(self).map(|t| t.position)
    }

    fn current_state(&self) -> f64 {
        self.position
    }
}

/// Folds `theta` back into `[0, 1]` by repeated reflection at the boundaries. The flag is
/// set when an odd number of reflections happened, i.e. when the momentum must flip.
fn reflect_into_unit_interval(theta: f64) -> (f64, bool) {
    if (0.0..=1.0).contains(&theta) {
        return (theta, false);
    }
    let r = theta.rem_euclid(2.0);
    if r > 1.0 {
        (2.0 - r, true)
    } else {
        (r, false)
    }
}

/// Runs a single chain from `config.initial_state` with an explicit random number generator
/// and returns the `config.num_results` retained states. `config.n_chains` and
/// `config.seed` are ignored.
pub fn sample_chain<T: HamiltonianTarget>(
    target: T,
    config: &HmcConfig,
    rng: SmallRng,
) -> Result<Vec<f64>> {
    Ok(HmcChain::new(target, config, rng)?.run()?.into_samples())
}

/// Draws of all chains of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    chains: Vec<ChainTrace>,
}

impl Trace {
    /// Collects finished chains, which must all hold the same number of draws.
    pub fn new(chains: Vec<ChainTrace>) -> Result<Self> {
        let expected = chains.first().ok_or(McmcError::NoChains)?.len();
        if let Some((chain, c)) = chains
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != expected)
        {
            return Err(McmcError::ChainLengthMismatch {
                chain,
                expected,
                got: c.len(),
            });
        }
        Ok(Self { chains })
    }

    pub fn chains(&self) -> &[ChainTrace] {
        &self.chains
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Retained draws per chain.
    pub fn num_results(&self) -> usize {
        self.chains.first().map_or(0, ChainTrace::len)
    }

    /// All draws, chain after chain.
    pub fn samples(&self) -> Vec<f64> {
        self.chains
            .iter()
            .flat_map(|c| c.samples.iter().copied())
            .collect()
    }

    /// Draws as a `[n_chains, num_results]` array.
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.n_chains(), self.num_results()), |(c, i)| {
            self.chains[c].samples[i]
        })
    }

    pub fn mean(&self) -> Result<f64> {
        self.to_array()
            .mean()
            .filter(|m| m.is_finite())
            .ok_or(McmcError::EmptySamples)
    }

    /// Smallest and largest draw.
    pub fn range(&self) -> Result<(f64, f64)> {
        let draws = self.to_array();
        let min = draws.min().map_err(|_| McmcError::EmptySamples)?;
        let max = draws.max().map_err(|_| McmcError::EmptySamples)?;
        Ok((*min, *max))
    }

    pub fn rhat(&self) -> Result<f64> {
        stats::split_rhat(self.to_array().view())
    }

    pub fn ess(&self) -> Result<f64> {
        stats::ess(self.to_array().view())
    }

    /// Whether split R-hat could be estimated and stays below 1.1.
    pub fn has_converged(&self) -> bool {
        self.rhat().is_ok_and(|rhat| rhat <= RHAT_THRESHOLD)
    }

    pub fn mcse(&self) -> Result<f64> {
        stats::mcse_mean(self.to_array().view())
    }

    /// Per-chain means.
    pub fn chain_means(&self) -> Vec<f64> {
        self.to_array()
            .mean_axis(Axis(1))
            .map_or_else(Vec::new, |m| m.to_vec())
    }

    pub fn mean_accept(&self) -> f64 {
        let n = self.chains.len().max(1) as f64;
        self.chains.iter().map(ChainTrace::mean_accept).sum::<f64>() / n
    }

    pub fn n_divergent(&self) -> usize {
        self.chains.iter().map(ChainTrace::n_divergent).sum()
    }
}

/// Runs `config.n_chains` independent HMC chains in parallel.
pub struct HMC<T> {
    chains: Vec<HmcChain<T>>,
    config: HmcConfig,
}

impl<T> HasChains for HMC<T>
where
    T: HamiltonianTarget + Send,
{
    type Chain = HmcChain<T>;

    fn chains_mut(&mut self) -> &mut Vec<HmcChain<T>> {
        &mut self.chains
    }
}

impl<T> HMC<T>
where
    T: HamiltonianTarget + Clone + Send,
{
    /// Creates the chains, all starting from `config.initial_state`. Chain `i` gets a
    /// generator seeded with `seed + i`; without a seed one is drawn from entropy.
    pub fn new(target: T, config: HmcConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(|| thread_rng().gen::<u64>());
        let chains = (0..config.n_chains)
            .map(|i| {
                let rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
                HmcChain::new(target.clone(), &config, rng)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { chains, config })
    }

    /// Re-seeds every chain so that runs become reproducible.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self.chains = self
            .chains
            .into_iter()
            .enumerate()
            .map(|(i, chain)| chain.set_seed(seed.wrapping_add(i as u64)))
            .collect();
        self
    }

    pub fn config(&self) -> &HmcConfig {
        &self.config
    }

    /// Runs all chains to completion.
    pub fn run(mut self) -> Result<Trace> {
        self.log_start();
        let (n_collect, n_discard) = (self.config.num_results, self.config.num_burnin_steps);
        let samples = self.run_chains(n_collect, n_discard)?;
        self.finish(samples)
    }

    /// Runs all chains to completion with one progress bar per chain.
    pub fn run_progress(mut self) -> Result<Trace> {
        self.log_start();
        let (n_collect, n_discard) = (self.config.num_results, self.config.num_burnin_steps);
        let samples = self.run_chains_with_progress(n_collect, n_discard)?;
        self.finish(samples)
    }

    fn log_start(&self) {
        let c = &self.config;
        info!(
            "Running {} HMC chain(s): {} burn-in ({} adapting) + {} results, {} leapfrog steps",
            c.n_chains, c.num_burnin_steps, c.num_adaptation_steps, c.num_results, c.n_leapfrog
        );
    }

    fn finish(self, samples: Vec<Vec<f64>>) -> Result<Trace> {
        let chains: Vec<ChainTrace> = self
            .chains
            .into_iter()
            .zip(samples)
            .map(|(chain, samples)| chain.into_trace(samples))
            .collect();
        let trace = Trace::new(chains)?;

        let n_divergent = trace.n_divergent();
        if n_divergent > 0 {
            warn!("{} divergent transition(s) encountered", n_divergent);
        }
        if let Ok(rhat) = trace.rhat() {
            if rhat > RHAT_THRESHOLD {
                warn!(
                    "Split R-hat is {:.3}; the chains have not mixed, consider another initial state or longer burn-in",
                    rhat
                );
            }
        }
        info!(
            "Sampling finished: mean p(accept) {:.3}, step sizes {:?}",
            trace.mean_accept(),
            trace
                .chains()
                .iter()
                .map(ChainTrace::step_size)
                .collect::<Vec<_>>()
        );
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{BurnGradientTarget, DefaultBackend};
    use crate::model::{CoinFlipModel, CoinPosterior, Observations};
    use approx::assert_abs_diff_eq;

    fn posterior(trials: u64, successes: u64) -> CoinPosterior {
        CoinFlipModel::new(trials).condition(successes).unwrap()
    }

    fn short_config() -> HmcConfig {
        HmcConfig::default()
            .with_num_burnin_steps(100)
            .with_num_adaptation_steps(80)
            .with_num_results(200)
            .with_seed(42)
    }

    // Target whose density turns NaN above 0.6.
    #[derive(Clone)]
    struct Poisoned;

    impl HamiltonianTarget for Poisoned {
        fn logp_and_grad(&self, theta: f64) -> (f64, f64) {
            if theta > 0.6 {
                (f64::NAN, 0.0)
            } else {
                (0.0, 1.0)
            }
        }
    }

    // Finite density everywhere, NaN gradient above 0.6.
    #[derive(Clone)]
    struct BrokenGradient;

    impl HamiltonianTarget for BrokenGradient {
        fn logp_and_grad(&self, theta: f64) -> (f64, f64) {
            if theta > 0.6 {
                (0.0, f64::NAN)
            } else {
                (0.0, 1.0)
            }
        }
    }

    // Gradient large enough for the first momentum half step to overflow.
    #[derive(Clone)]
    struct Exploding;

    impl HamiltonianTarget for Exploding {
        fn logp_and_grad(&self, _theta: f64) -> (f64, f64) {
            (0.0, f64::MAX)
        }
    }

    fn chain_trace(samples: Vec<f64>) -> ChainTrace {
        ChainTrace {
            samples,
            step_size: 0.1,
            mean_accept: 0.9,
            adaptation_accept: None,
            n_divergent: 0,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(HmcConfig::default().validate().is_ok());
        assert_eq!(
            HmcConfig::default().with_step_size(0.0).validate(),
            Err(McmcError::InvalidStepSize { step_size: 0.0 })
        );
        assert!(HmcConfig::default()
            .with_step_size(f64::NAN)
            .validate()
            .is_err());
        assert_eq!(
            HmcConfig::default().with_n_leapfrog(0).validate(),
            Err(McmcError::InvalidLeapfrogSteps)
        );
        assert_eq!(
            HmcConfig::default()
                .with_num_burnin_steps(100)
                .with_num_adaptation_steps(100)
                .validate(),
            Err(McmcError::AdaptationWindow {
                num_adaptation_steps: 100,
                num_burnin_steps: 100
            })
        );
        assert_eq!(
            HmcConfig::default().with_num_results(0).validate(),
            Err(McmcError::NoResults)
        );
        assert_eq!(
            HmcConfig::default().with_n_chains(0).validate(),
            Err(McmcError::NoChains)
        );
        assert_eq!(
            HmcConfig::default().with_initial_state(1.5).validate(),
            Err(McmcError::InvalidInitialState { value: 1.5 })
        );
    }

    #[test]
    fn test_reflection() {
        assert_eq!(reflect_into_unit_interval(0.3), (0.3, false));
        let (x, flipped) = reflect_into_unit_interval(-0.25);
        assert_abs_diff_eq!(x, 0.25, epsilon = 1e-12);
        assert!(flipped);
        let (x, flipped) = reflect_into_unit_interval(1.2);
        assert_abs_diff_eq!(x, 0.8, epsilon = 1e-12);
        assert!(flipped);
        let (x, flipped) = reflect_into_unit_interval(2.3);
        assert_abs_diff_eq!(x, 0.3, epsilon = 1e-12);
        assert!(!flipped);
        let (x, flipped) = reflect_into_unit_interval(-1.5);
        assert_abs_diff_eq!(x, 0.5, epsilon = 1e-12);
        assert!(!flipped);
    }

    #[test]
    fn test_phase_transitions() {
        let config = HmcConfig::default()
            .with_num_burnin_steps(5)
            .with_num_adaptation_steps(3)
            .with_num_results(4);
        let rng = SmallRng::seed_from_u64(1);
        let mut chain = HmcChain::new(posterior(10, 7), &config, rng).unwrap();
        assert_eq!(chain.phase(), Phase::Initialized);

        let mut phases = Vec::new();
        for _ in 0..config.total_steps() {
            chain.step().unwrap();
            phases.push(chain.phase());
        }
        use Phase::*;
        assert_eq!(
            phases,
            vec![Adapting, Adapting, Adapting, BurningIn, BurningIn, Sampling, Sampling, Sampling, Done]
        );
        assert!(!chain.adaptation().is_adapting());
        assert_eq!(
            chain.step(),
            Err(McmcError::ChainExhausted { num_results: 4 })
        );
    }

    #[test]
    fn test_step_size_frozen_after_adaptation() {
        let config = short_config();
        let mut chain =
            HmcChain::new(posterior(10, 7), &config, SmallRng::seed_from_u64(3)).unwrap();
        for _ in 0..config.num_adaptation_steps {
            chain.step().unwrap();
        }
        let frozen = chain.step_size();
        while chain.phase() != Phase::Done {
            let t = chain.step().unwrap();
            assert_eq!(t.step_size, frozen);
        }
    }

    #[test]
    fn test_sample_chain_length_and_support() {
        for (n, k) in [(10, 7), (10, 0), (10, 10), (0, 0), (1, 1)] {
            let samples = sample_chain(
                posterior(n, k),
                &short_config(),
                SmallRng::seed_from_u64(n + 100 * k),
            )
            .unwrap();
            assert_eq!(samples.len(), 200);
            assert!(
                samples.iter().all(|x| (0.0..=1.0).contains(x)),
                "sample outside [0, 1] for ({n}, {k})"
            );
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let a = sample_chain(posterior(10, 7), &short_config(), SmallRng::seed_from_u64(9));
        let b = sample_chain(posterior(10, 7), &short_config(), SmallRng::seed_from_u64(9));
        let c = sample_chain(posterior(10, 7), &short_config(), SmallRng::seed_from_u64(10));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_initial_state_with_zero_density_is_rejected() {
        let config = short_config().with_initial_state(0.0);
        let result = HmcChain::new(posterior(10, 7), &config, SmallRng::seed_from_u64(0));
        assert!(matches!(
            result,
            Err(McmcError::NonFiniteLogDensity { iteration: 0, .. })
        ));
    }

    #[test]
    fn test_nan_density_aborts_run() {
        let config = short_config().with_initial_state(0.5).with_step_size(0.5);
        let result = sample_chain(Poisoned, &config, SmallRng::seed_from_u64(0));
        assert!(matches!(
            result,
            Err(McmcError::NonFiniteLogDensity { value, .. }) if value.is_nan()
        ));
    }

    #[test]
    fn test_run_progress_matches_run() {
        let config = short_config();
        let chain = |seed| HmcChain::new(posterior(6, 2), &config, SmallRng::seed_from_u64(seed));
        let plain = chain(8).unwrap().run().unwrap();
        let pb = ProgressBar::hidden();
        let with_bar = chain(8).unwrap().run_progress(&pb).unwrap();
        assert_eq!(plain, with_bar);
        assert_eq!(pb.position(), config.total_steps() as u64);
    }

    #[test]
    fn test_nan_gradient_aborts_run() {
        let config = short_config().with_step_size(0.5);
        let result = sample_chain(BrokenGradient, &config, SmallRng::seed_from_u64(0));
        assert!(matches!(
            result,
            Err(McmcError::NonFiniteGradient { theta, value, .. })
                if theta > 0.6 && value.is_nan()
        ));
    }

    #[test]
    fn test_overflowing_trajectory_aborts_run() {
        let config = short_config().with_step_size(10.0);
        let result = sample_chain(Exploding, &config, SmallRng::seed_from_u64(0));
        assert!(matches!(
            result,
            Err(McmcError::NonFinitePosition { iteration: 0, theta }) if !theta.is_finite()
        ));
    }

    #[test]
    fn test_trace_rejects_ragged_chains() {
        let ragged = Trace::new(vec![
            chain_trace(vec![0.1, 0.2, 0.3]),
            chain_trace(vec![0.4, 0.5]),
        ]);
        assert_eq!(
            ragged,
            Err(McmcError::ChainLengthMismatch {
                chain: 1,
                expected: 3,
                got: 2
            })
        );
        assert_eq!(Trace::new(Vec::new()), Err(McmcError::NoChains));

        let trace = Trace::new(vec![
            chain_trace(vec![0.1, 0.2, 0.3]),
            chain_trace(vec![0.4, 0.5, 0.6]),
        ])
        .unwrap();
        assert_eq!(trace.to_array(), ndarray::array![[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]);
        assert_eq!(trace.range(), Ok((0.1, 0.6)));
    }

    #[test]
    fn test_stalled_chains_are_not_converged() {
        // Posterior concentrated near 2e-6 while the chains start at 0.5.
        let config = HmcConfig::default().with_n_chains(2).with_seed(1);
        let trace = HMC::new(posterior(1_000_000, 1), config)
            .unwrap()
            .run()
            .unwrap();
        assert!(!trace.has_converged(), "rhat = {:?}", trace.rhat());

        let trace = HMC::new(posterior(10, 7), config).unwrap().run().unwrap();
        assert!(trace.has_converged(), "rhat = {:?}", trace.rhat());
    }

    #[test]
    fn test_multi_chain_run() {
        let config = short_config().with_n_chains(3);
        let trace = HMC::new(posterior(10, 7), config).unwrap().run().unwrap();
        assert_eq!(trace.n_chains(), 3);
        assert_eq!(trace.num_results(), 200);
        assert_eq!(trace.to_array().dim(), (3, 200));
        let (min, max) = trace.range().unwrap();
        assert!(min >= 0.0 && max <= 1.0);
        assert_eq!(trace.chain_means().len(), 3);
        // Chains use different seeds.
        assert_ne!(trace.chains()[0].samples(), trace.chains()[1].samples());
    }

    #[test]
    fn test_set_seed_reproducible() {
        let config = short_config().with_n_chains(2);
        let a = HMC::new(posterior(10, 7), config)
            .unwrap()
            .set_seed(5)
            .run()
            .unwrap();
        let b = HMC::new(posterior(10, 7), config)
            .unwrap()
            .set_seed(5)
            .run_progress()
            .unwrap();
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn test_autodiff_target_matches_analytic_target() {
        let config = HmcConfig::default()
            .with_num_burnin_steps(20)
            .with_num_adaptation_steps(10)
            .with_num_results(30);
        let obs = Observations::new(10, 7).unwrap();
        let analytic = sample_chain(
            CoinPosterior::new(obs),
            &config,
            SmallRng::seed_from_u64(4),
        )
        .unwrap();
        let autodiff = sample_chain(
            BurnGradientTarget::<_, DefaultBackend>::new(CoinPosterior::new(obs)),
            &config,
            SmallRng::seed_from_u64(4),
        )
        .unwrap();
        assert_eq!(analytic.len(), autodiff.len());
        for (a, b) in analytic.iter().zip(&autodiff) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }
}
