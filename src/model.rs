/*!
The coin-flip model: observed data, the two-stage generative model and the posterior it
induces once the success count is fixed.

```rust
use coinflip_mcmc::model::{CoinFlipModel, Observations};
use coinflip_mcmc::distributions::HamiltonianTarget;

let model = CoinFlipModel::new(10);
let posterior = model.condition(7).unwrap();
assert_eq!(posterior.observations(), Observations::new(10, 7).unwrap());

// Outside the unit interval the log density is -inf.
let (logp, _) = posterior.logp_and_grad(1.2);
assert_eq!(logp, f64::NEG_INFINITY);
```
*/

use crate::distributions::{
    ln_binomial_coefficient, Binomial, GradientTarget, HamiltonianTarget, TargetDistribution,
    UnitUniform,
};
use crate::error::{McmcError, Result};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::Rng;

/// Number of trials and number of successes, fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Observations {
    trials: u64,
    successes: u64,
}

impl Observations {
    /// Validates and stores the observed counts.
    ///
    /// `trials = 0` is accepted and means that no data was observed.
    pub fn new(trials: u64, successes: u64) -> Result<Self> {
        if successes > trials {
            return Err(McmcError::SuccessesExceedTrials { trials, successes });
        }
        Ok(Self { trials, successes })
    }

    /// Counts heads (`true`) in a sequence of flips.
    pub fn from_flips(flips: &[bool]) -> Self {
        Self {
            trials: flips.len() as u64,
            successes: flips.iter().filter(|&&heads| heads).count() as u64,
        }
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.trials - self.successes
    }
}

/// One ancestral draw from the joint model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointDraw {
    pub theta: f64,
    pub successes: u64,
}

/// Two-stage generative model: `theta ~ Uniform(0, 1)`, then
/// `successes ~ Binomial(trials, theta)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinFlipModel {
    trials: u64,
}

impl CoinFlipModel {
    pub fn new(trials: u64) -> Self {
        Self { trials }
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    /// First stage of the model.
    pub fn prior(&self) -> UnitUniform {
        UnitUniform
    }

    /// Second stage of the model, conditioned on `theta`.
    pub fn likelihood(&self, theta: f64) -> Result<Binomial> {
        Binomial::new(self.trials, theta)
    }

    /// Draws `theta` from the prior and then a success count given `theta`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<JointDraw> {
        let theta = self.prior().sample(rng);
        let successes = self.likelihood(theta)?.sample(rng);
        Ok(JointDraw { theta, successes })
    }

    /// Joint log density `log p(theta) + log p(successes | theta)`.
    pub fn log_prob(&self, theta: f64, successes: u64) -> f64 {
        let prior_lp = self.prior().log_prob(theta);
        if prior_lp == f64::NEG_INFINITY {
            return prior_lp;
        }
        match self.likelihood(theta) {
            Ok(likelihood) => prior_lp + likelihood.log_pmf(successes),
            Err(_) => f64::NEG_INFINITY,
        }
    }

    /// Fixes the observed success count and returns the induced posterior target.
    pub fn condition(&self, successes: u64) -> Result<CoinPosterior> {
        Ok(CoinPosterior::new(Observations::new(self.trials, successes)?))
    }
}

/// Unnormalized posterior over the coin's bias given fixed observations.
///
/// The log density is `ln C(n, k) + k ln(theta) + (n - k) ln(1 - theta)` on `[0, 1]` and
/// `-inf` elsewhere (the uniform prior contributes zero inside its support).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoinPosterior {
    observations: Observations,
    log_binom: f64,
}

impl CoinPosterior {
    pub fn new(observations: Observations) -> Self {
        let log_binom = ln_binomial_coefficient(observations.trials, observations.successes);
        Self {
            observations,
            log_binom,
        }
    }

    pub fn observations(&self) -> Observations {
        self.observations
    }

    fn in_unit_interval(theta: f64) -> bool {
        (0.0..=1.0).contains(&theta)
    }
}

impl TargetDistribution for CoinPosterior {
    fn unnorm_log_prob(&self, theta: f64) -> f64 {
        self.logp_and_grad(theta).0
    }
}

impl HamiltonianTarget for CoinPosterior {
    fn logp_and_grad(&self, theta: f64) -> (f64, f64) {
        if !Self::in_unit_interval(theta) {
            return (f64::NEG_INFINITY, 0.0);
        }
        let k = self.observations.successes as f64;
        let m = self.observations.failures() as f64;
        let (mut logp, mut grad) = (self.log_binom, 0.0);
        if self.observations.successes > 0 {
            logp += k * theta.ln();
            grad += k / theta;
        }
        if self.observations.failures() > 0 {
            logp += m * (-theta).ln_1p();
            grad -= m / (1.0 - theta);
        }
        (logp, grad)
    }
}

impl<B: AutodiffBackend> GradientTarget<B> for CoinPosterior {
    fn unnorm_logp(&self, position: Tensor<B, 1>) -> Tensor<B, 1> {
        let mut logp = position.zeros_like().add_scalar(self.log_binom);
        if self.observations.successes > 0 {
            logp = logp
                + position
                    .clone()
                    .log()
                    .mul_scalar(self.observations.successes as f64);
        }
        if self.observations.failures() > 0 {
            logp = logp
                + position
                    .neg()
                    .log1p()
                    .mul_scalar(self.observations.failures() as f64);
        }
        logp
    }

    fn in_support(&self, theta: f64) -> bool {
        Self::in_unit_interval(theta)
    }
}
