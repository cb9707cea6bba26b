//! Bayesian inference of a coin's bias with Hamiltonian Monte Carlo.
//!
//! ```rust
//! use coinflip_mcmc::hmc::HmcConfig;
//! use coinflip_mcmc::model::Observations;
//! use coinflip_mcmc::pipeline::infer_coin_bias;
//! use coinflip_mcmc::validate::Tolerance;
//!
//! let obs = Observations::new(10, 7).unwrap();
//! let config = HmcConfig::default().with_num_results(2000).with_seed(42);
//! let report = infer_coin_bias(obs, &config, Tolerance::Absolute(0.03)).unwrap();
//! assert!(report.mean_check.passed);
//! ```

pub mod adaptation;
pub mod core;
pub mod distributions;
pub mod error;
pub mod hmc;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod stats;
pub mod validate;

pub use error::{McmcError, Result};
