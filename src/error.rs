//! Error types for model construction, sampler configuration, sampling and validation.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, McmcError>;

/// Errors that can occur while building the model, configuring or running the sampler,
/// or validating its output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum McmcError {
    /// Step size must be finite and strictly positive.
    #[error("Invalid step size: {step_size} (expected a finite value > 0)")]
    InvalidStepSize { step_size: f64 },

    /// At least one leapfrog step is needed per proposal.
    #[error("Number of leapfrog steps must be at least 1")]
    InvalidLeapfrogSteps,

    /// The adaptation window must be a strict prefix of burn-in.
    #[error(
        "Adaptation steps ({num_adaptation_steps}) must be strictly less than burn-in steps ({num_burnin_steps})"
    )]
    AdaptationWindow {
        num_adaptation_steps: usize,
        num_burnin_steps: usize,
    },

    /// Target acceptance probability outside (0, 1).
    #[error("Target acceptance probability must lie in (0, 1), got {value}")]
    InvalidTargetAcceptance { value: f64 },

    /// A tuning constant of the adaptation scheme is not usable.
    #[error("Invalid adaptation parameter `{name}`: {value}")]
    InvalidAdaptationParameter { name: &'static str, value: f64 },

    /// The chain must start inside the support with a finite position.
    #[error("Initial state {value} lies outside [0, 1]")]
    InvalidInitialState { value: f64 },

    /// `num_results` is zero.
    #[error("Number of retained results must be at least 1")]
    NoResults,

    /// `n_chains` is zero.
    #[error("Number of chains must be at least 1")]
    NoChains,

    /// Observed data are malformed.
    #[error("Observed successes ({successes}) exceed the number of trials ({trials})")]
    SuccessesExceedTrials { trials: u64, successes: u64 },

    /// A success probability outside [0, 1] was passed where a valid one is required.
    #[error("Parameter {theta} lies outside the support [0, 1]")]
    ParameterOutOfSupport { theta: f64 },

    /// The log density evaluated to NaN or +inf.
    #[error("Non-finite log density {value} at theta = {theta} (iteration {iteration})")]
    NonFiniteLogDensity {
        iteration: usize,
        theta: f64,
        value: f64,
    },

    /// The gradient is not finite although the log density is.
    #[error("Non-finite gradient {value} at theta = {theta} (iteration {iteration})")]
    NonFiniteGradient {
        iteration: usize,
        theta: f64,
        value: f64,
    },

    /// The integrator produced a non-finite position.
    #[error("Non-finite position {theta} (iteration {iteration})")]
    NonFinitePosition { iteration: usize, theta: f64 },

    /// `step` was called on a chain that already collected all results.
    #[error("Chain has already produced all {num_results} results")]
    ChainExhausted { num_results: usize },

    /// Chains of a trace hold different numbers of draws.
    #[error("Chain {chain} has {got} draws, expected {expected} like chain 0")]
    ChainLengthMismatch {
        chain: usize,
        expected: usize,
        got: usize,
    },

    /// Statistics were requested for an empty sample.
    #[error("Sample sequence is empty")]
    EmptySamples,

    /// A diagnostic needs more draws per chain than were supplied.
    #[error("Need at least {needed} draws per chain, got {got}")]
    InsufficientSamples { needed: usize, got: usize },

    /// The empirical posterior mean missed the analytic one.
    #[error(
        "Empirical posterior mean {empirical} differs from analytic mean {analytic} by more than {tolerance}"
    )]
    PosteriorMeanMismatch {
        empirical: f64,
        analytic: f64,
        tolerance: f64,
    },
}
