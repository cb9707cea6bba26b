//! Infers the bias of a coin from 10 flips with 7 heads and compares the HMC estimate
//! with the exact Beta(8, 4) posterior.
//!
//! Run with `RUST_LOG=debug cargo run --release --example coin_flip --features csv`.

use coinflip_mcmc::hmc::{HmcConfig, HMC};
use coinflip_mcmc::io::csv::save_csv;
use coinflip_mcmc::model::{CoinFlipModel, Observations};
use coinflip_mcmc::validate::{check_distribution, check_posterior_mean, Tolerance};
use env_logger::Env;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let obs = Observations::from_flips(&[
        true, false, true, true, false, true, true, false, true, true,
    ]);
    let posterior = CoinFlipModel::new(obs.trials()).condition(obs.successes())?;

    let config = HmcConfig::default().with_n_chains(4).with_seed(42);
    let trace = HMC::new(posterior, config)?.run_progress()?;

    let check = check_posterior_mean(&trace, &obs, Tolerance::default())?;
    println!(
        "Posterior mean: {:.4} (exact {:.4}, tolerance {:.4})",
        check.empirical, check.analytic, check.tolerance
    );
    println!("Split R-hat: {:.4}", trace.rhat()?);
    println!("ESS: {:.1}", trace.ess()?);
    println!("Mean p(accept): {:.3}", trace.mean_accept());

    let ks = check_distribution(&trace, &obs, 0.01)?;
    println!(
        "KS vs. Beta({}, {}): D = {:.4}, p = {:.4}",
        obs.successes() + 1,
        obs.failures() + 1,
        ks.statistic,
        ks.p_value
    );
    check.ensure()?;

    save_csv(&trace, "/tmp/coin_flip_trace.csv")?;
    println!("Saved draws to /tmp/coin_flip_trace.csv");
    Ok(())
}
