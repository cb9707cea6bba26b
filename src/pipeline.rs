//! End-to-end inference: build the model, condition on the data, sample and validate.

use crate::distributions::{BurnGradientTarget, HamiltonianTarget};
use crate::error::Result;
use crate::hmc::{HmcConfig, Trace, HMC};
use crate::model::{CoinFlipModel, CoinPosterior, Observations};
use crate::validate::{check_posterior_mean, BetaPosterior, MeanCheck, Tolerance};
use burn::tensor::backend::AutodiffBackend;
use log::info;

/// Everything a single inference run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceReport {
    pub observations: Observations,
    /// Exact posterior the draws are compared with.
    pub posterior: BetaPosterior,
    pub trace: Trace,
    pub mean_check: MeanCheck,
    /// Split R-hat, when the chains are long enough to estimate it.
    pub rhat: Option<f64>,
    pub ess: Option<f64>,
}

impl InferenceReport {
    /// Sampled posterior mean of the coin's bias.
    pub fn posterior_mean(&self) -> f64 {
        self.mean_check.empirical
    }
}

/// Infers the bias of a coin from `obs` using the closed-form gradient.
///
/// A mean mismatch is reported in [`InferenceReport::mean_check`] rather than as an
/// error; use [`MeanCheck::ensure`] to fail on it.
pub fn infer_coin_bias(
    obs: Observations,
    config: &HmcConfig,
    tolerance: Tolerance,
) -> Result<InferenceReport> {
    let posterior = condition(obs)?;
    infer_with_target(posterior, obs, config, tolerance)
}

/// Same as [`infer_coin_bias`] with gradients from `burn` autodiff on backend `B`.
pub fn infer_coin_bias_autodiff<B: AutodiffBackend>(
    obs: Observations,
    config: &HmcConfig,
    tolerance: Tolerance,
) -> Result<InferenceReport> {
    let posterior = condition(obs)?;
    infer_with_target(
        BurnGradientTarget::<_, B>::new(posterior),
        obs,
        config,
        tolerance,
    )
}

fn condition(obs: Observations) -> Result<CoinPosterior> {
    CoinFlipModel::new(obs.trials()).condition(obs.successes())
}

/// Runs [`HMC`] on `target`, which must be the posterior induced by `obs`, and validates
/// the draws against the exact Beta posterior.
pub fn infer_with_target<T>(
    target: T,
    obs: Observations,
    config: &HmcConfig,
    tolerance: Tolerance,
) -> Result<InferenceReport>
where
    T: HamiltonianTarget + Clone + Send,
{
    info!(
        "Inferring coin bias from {} successes in {} trials",
        obs.successes(),
        obs.trials()
    );
    let trace = HMC::new(target, *config)?.run()?;
    let mean_check = check_posterior_mean(&trace, &obs, tolerance)?;
    let rhat = trace.rhat().ok();
    let ess = mean_check.ess.or_else(|| trace.ess().ok());
    info!(
        "Posterior mean {:.4} (exact {:.4}), R-hat {:?}, ESS {:?}",
        mean_check.empirical, mean_check.analytic, rhat, ess
    );

    Ok(InferenceReport {
        observations: obs,
        posterior: BetaPosterior::from_observations(&obs),
        trace,
        mean_check,
        rhat,
        ess,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DefaultBackend;
    use crate::error::McmcError;

    fn config() -> HmcConfig {
        HmcConfig::default()
            .with_num_burnin_steps(300)
            .with_num_adaptation_steps(200)
            .with_num_results(1500)
            .with_n_chains(2)
            .with_seed(7)
    }

    #[test]
    fn test_infer_coin_bias() {
        let obs = Observations::new(10, 7).unwrap();
        let report = infer_coin_bias(obs, &config(), Tolerance::default()).unwrap();
        assert!(report.mean_check.ensure().is_ok(), "{:?}", report.mean_check);
        assert_eq!(report.trace.n_chains(), 2);
        assert_eq!(report.posterior.mean(), 8.0 / 12.0);
        let rhat = report.rhat.unwrap();
        assert!(rhat < 1.05, "rhat = {rhat}");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let obs = Observations::new(10, 7).unwrap();
        let config = config().with_num_adaptation_steps(300);
        assert!(matches!(
            infer_coin_bias(obs, &config, Tolerance::default()),
            Err(McmcError::AdaptationWindow { .. })
        ));
    }

    #[test]
    fn test_autodiff_pipeline_matches_analytic_pipeline() {
        let obs = Observations::new(5, 1).unwrap();
        let config = config()
            .with_num_burnin_steps(60)
            .with_num_adaptation_steps(40)
            .with_num_results(100);
        let analytic = infer_coin_bias(obs, &config, Tolerance::Absolute(1.0)).unwrap();
        let autodiff =
            infer_coin_bias_autodiff::<DefaultBackend>(obs, &config, Tolerance::Absolute(1.0))
                .unwrap();
        assert_eq!(analytic.trace.num_results(), autodiff.trace.num_results());
        assert!((analytic.posterior_mean() - autodiff.posterior_mean()).abs() < 1e-6);
    }
}
