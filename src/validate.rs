/*!
Checks sampler output against the closed-form posterior.

With a uniform prior and binomial likelihood the posterior over the coin's bias is
`Beta(k + 1, n - k + 1)`, so the sampler can be validated exactly: the empirical mean must
match `(k + 1) / (n + 2)` and the draws must follow the Beta CDF.

```rust
use coinflip_mcmc::model::Observations;
use coinflip_mcmc::validate::{analytic_posterior_mean, BetaPosterior};

let obs = Observations::new(10, 7).unwrap();
assert!((analytic_posterior_mean(&obs) - 8.0 / 12.0).abs() < 1e-12);

let posterior = BetaPosterior::from_observations(&obs);
assert_eq!((posterior.alpha(), posterior.beta()), (8.0, 4.0));
assert!((posterior.cdf(0.5) - 0.11328125).abs() < 1e-9);
```
*/

use crate::error::{McmcError, Result};
use crate::hmc::Trace;
use crate::ks_test::{one_sample_ks_test, TestResult};
use crate::model::Observations;
use log::debug;
use statrs::function::beta::beta_reg;

/// Exact posterior `Beta(alpha, beta)` of the coin-flip model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetaPosterior {
    alpha: f64,
    beta: f64,
}

impl BetaPosterior {
    pub fn from_observations(obs: &Observations) -> Self {
        Self {
            alpha: (obs.successes() + 1) as f64,
            beta: (obs.failures() + 1) as f64,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn variance(&self) -> f64 {
        let s = self.alpha + self.beta;
        self.alpha * self.beta / (s * s * (s + 1.0))
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Regularized incomplete beta function; arguments outside `[0, 1]` are clamped.
    pub fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            0.0
        } else if x >= 1.0 {
            1.0
        } else {
            beta_reg(self.alpha, self.beta, x)
        }
    }
}

/// Posterior mean `(k + 1) / (n + 2)`.
pub fn analytic_posterior_mean(obs: &Observations) -> f64 {
    BetaPosterior::from_observations(obs).mean()
}

pub fn empirical_mean(samples: &[f64]) -> Result<f64> {
    if samples.is_empty() {
        return Err(McmcError::EmptySamples);
    }
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Allowed deviation between the empirical and the analytic posterior mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    /// Fixed absolute bound.
    Absolute(f64),
    /// `z` Monte Carlo standard errors, where the standard error is the exact posterior
    /// standard deviation divided by the square root of the effective sample size.
    StandardErrors(f64),
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::StandardErrors(4.0)
    }
}

/// Result of comparing the sampled posterior mean with the exact one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanCheck {
    pub empirical: f64,
    pub analytic: f64,
    pub abs_error: f64,
    /// Resolved absolute tolerance.
    pub tolerance: f64,
    /// Monte Carlo standard error, when enough draws were available to estimate it.
    pub mcse: Option<f64>,
    pub ess: Option<f64>,
    pub passed: bool,
}

impl MeanCheck {
    /// Turns a failed check into [`McmcError::PosteriorMeanMismatch`].
    pub fn ensure(&self) -> Result<()> {
        if self.passed {
            Ok(())
        } else {
            Err(McmcError::PosteriorMeanMismatch {
                empirical: self.empirical,
                analytic: self.analytic,
                tolerance: self.tolerance,
            })
        }
    }
}

/// Compares the pooled sample mean of `trace` with `(k + 1) / (n + 2)`.
///
/// [`Tolerance::StandardErrors`] needs an ESS estimate and therefore at least four draws
/// per chain.
pub fn check_posterior_mean(
    trace: &Trace,
    obs: &Observations,
    tolerance: Tolerance,
) -> Result<MeanCheck> {
    let empirical = empirical_mean(&trace.samples())?;
    let posterior = BetaPosterior::from_observations(obs);
    let analytic = posterior.mean();

    let ess = match tolerance {
        Tolerance::StandardErrors(_) => Some(trace.ess()?),
        Tolerance::Absolute(_) => trace.ess().ok(),
    };
    let mcse = ess.map(|ess| posterior.std_dev() / ess.sqrt());
    let tolerance = match tolerance {
        Tolerance::Absolute(eps) => eps,
        Tolerance::StandardErrors(z) => z * mcse.unwrap_or(f64::INFINITY),
    };

    let abs_error = (empirical - analytic).abs();
    let check = MeanCheck {
        empirical,
        analytic,
        abs_error,
        tolerance,
        mcse,
        ess,
        passed: abs_error <= tolerance,
    };
    debug!("{check:?}");
    Ok(check)
}

/// One-sample KS test of the draws against the exact Beta CDF.
///
/// Each chain is thinned by the ratio of total draws to ESS so that the tested draws are
/// approximately independent.
pub fn check_distribution(trace: &Trace, obs: &Observations, level: f64) -> Result<TestResult> {
    let total = (trace.n_chains() * trace.num_results()) as f64;
    let ess = trace.ess()?.clamp(1.0, total);
    let stride = (total / ess).ceil().max(1.0) as usize;

    let thinned: Vec<f64> = trace
        .chains()
        .iter()
        .flat_map(|chain| chain.samples().iter().step_by(stride).copied())
        .collect();
    debug!(
        "KS test on {} draws (stride {stride}, ESS {ess:.1})",
        thinned.len()
    );

    let posterior = BetaPosterior::from_observations(obs);
    one_sample_ks_test(&thinned, |x| posterior.cdf(x), level)
}
