/*!
Target-distribution traits and the building-block densities of the coin-flip model.

Two gradient paths are supported. [`HamiltonianTarget`] is the scalar interface the HMC
kernel consumes; implement it directly when the derivative is known in closed form. A
[`GradientTarget`] instead only describes the log density on `burn` tensors and gets its
derivative from reverse-mode autodiff once wrapped in a [`BurnGradientTarget`].

# Examples

```rust
use coinflip_mcmc::distributions::{Binomial, UnitUniform};

let prior = UnitUniform;
assert_eq!(prior.log_prob(0.3), 0.0);
assert_eq!(prior.log_prob(1.3), f64::NEG_INFINITY);

let likelihood = Binomial::new(10, 0.5).unwrap();
let lp = likelihood.log_pmf(5);
assert!((lp.exp() - 0.24609375).abs() < 1e-12);
```
*/

use crate::error::{McmcError, Result};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use rand::Rng;
use rand_distr::Distribution;
use statrs::function::gamma::ln_gamma;
use std::marker::PhantomData;

/// CPU backend with autodiff, used by default for [`BurnGradientTarget`].
pub type DefaultBackend = burn::backend::Autodiff<burn::backend::NdArray<f64>>;

/// A continuous target distribution over a scalar parameter.
pub trait TargetDistribution {
    /// Returns the log of the unnormalized density at `theta`.
    fn unnorm_log_prob(&self, theta: f64) -> f64;
}

/// A scalar target that provides its log density together with the derivative.
///
/// This is what the HMC kernel evaluates at every leapfrog step.
pub trait HamiltonianTarget {
    /// Returns `(log p(theta), d/dtheta log p(theta))`.
    ///
    /// Outside the support the log density must be `-inf`.
    fn logp_and_grad(&self, theta: f64) -> (f64, f64);
}

/// A target whose unnormalized log density is written in `burn` tensor operations so
/// that gradients can be obtained through autodiff.
///
/// # Type Parameters
///
/// * `B`: The autodiff backend from the `burn` crate.
pub trait GradientTarget<B: AutodiffBackend> {
    /// Compute the unnormalized log density for a position tensor of shape `[1]`.
    ///
    /// # Returns
    ///
    /// A tensor of shape `[1]` holding the log density.
    fn unnorm_logp(&self, position: Tensor<B, 1>) -> Tensor<B, 1>;

    /// Whether `theta` lies in the support. Positions outside are never handed to
    /// [`GradientTarget::unnorm_logp`].
    fn in_support(&self, _theta: f64) -> bool {
        true
    }
}

/// Adapts a [`GradientTarget`] into a [`HamiltonianTarget`] by differentiating the tensor
/// log density with `burn`'s autodiff.
pub struct BurnGradientTarget<G, B> {
    inner: G,
    _backend: PhantomData<fn() -> B>,
}

impl<G, B> BurnGradientTarget<G, B> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            _backend: PhantomData,
        }
    }
}

impl<G: Clone, B> Clone for BurnGradientTarget<G, B> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<G, B> HamiltonianTarget for BurnGradientTarget<G, B>
where
    B: AutodiffBackend,
    G: GradientTarget<B>,
{
    fn logp_and_grad(&self, theta: f64) -> (f64, f64) {
        if !self.inner.in_support(theta) {
            return (f64::NEG_INFINITY, 0.0);
        }
        let td = TensorData::new(vec![B::FloatElem::from_elem(theta)], [1]);
        let position = Tensor::<B, 1>::from_data(td, &B::Device::default()).require_grad();

        let logp = self.inner.unnorm_logp(position.clone());
        let grads = logp.backward();
        // No gradient is registered when the density does not depend on the position.
        let grad = position
            .grad(&grads)
            .map(|g| g.into_scalar().elem::<f64>())
            .unwrap_or(0.0);
        (logp.into_scalar().elem::<f64>(), grad)
    }
}

/// Uniform distribution on the unit interval `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitUniform;

impl UnitUniform {
    /// Normalized log density: `0` on `[0, 1]`, `-inf` elsewhere.
    pub fn log_prob(&self, theta: f64) -> f64 {
        if (0.0..=1.0).contains(&theta) {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        rng.gen::<f64>()
    }
}

/// Binomial distribution with `trials` draws and success probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct Binomial {
    trials: u64,
    p: f64,
    sampler: rand_distr::Binomial,
}

impl Binomial {
    /// Creates a binomial distribution, rejecting `p` outside `[0, 1]`.
    pub fn new(trials: u64, p: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(McmcError::ParameterOutOfSupport { theta: p });
        }
        let sampler = rand_distr::Binomial::new(trials, p)
            .map_err(|_| McmcError::ParameterOutOfSupport { theta: p })?;
        Ok(Self { trials, p, sampler })
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    /// Log probability mass of `successes`; `-inf` when `successes > trials`.
    pub fn log_pmf(&self, successes: u64) -> f64 {
        if successes > self.trials {
            return f64::NEG_INFINITY;
        }
        let failures = self.trials - successes;
        let mut lp = ln_binomial_coefficient(self.trials, successes);
        // Zero counts contribute nothing, which also keeps p = 0 and p = 1 finite.
        if successes > 0 {
            lp += successes as f64 * self.p.ln();
        }
        if failures > 0 {
            lp += failures as f64 * (-self.p).ln_1p();
        }
        lp
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        self.sampler.sample(rng)
    }
}

/// `ln C(n, k)` computed through the log-gamma function.
pub fn ln_binomial_coefficient(n: u64, k: u64) -> f64 {
    debug_assert!(k <= n);
    let (n, k) = (n as f64, k as f64);
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}
