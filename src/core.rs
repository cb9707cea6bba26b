use crate::error::Result;
use crate::stats::{ChainStats, ChainTracker};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rayon::prelude::*;

/// Refresh the progress message every this many iterations.
const MESSAGE_EVERY: usize = 50;

pub trait MarkovChain {
    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> Result<f64>;

    /// Get the current state without stepping.
    fn current_state(&self) -> f64;
}

/// Takes `n_discard` steps, then collects the states of `n_collect` further steps.
pub fn run_chain<M>(chain: &mut M, n_collect: usize, n_discard: usize) -> Result<Vec<f64>>
where
    M: MarkovChain,
{
    for _ in 0..n_discard {
        chain.step()?;
    }
    let mut out = Vec::with_capacity(n_collect);
    for _ in 0..n_collect {
        out.push(chain.step()?);
    }
    Ok(out)
}

/// Same as [`run_chain`] but reports progress, the windowed acceptance rate and the
/// running mean on `pb`.
pub fn run_chain_with_progress<M>(
    chain: &mut M,
    n_collect: usize,
    n_discard: usize,
    pb: &ProgressBar,
) -> Result<Vec<f64>>
where
    M: MarkovChain,
{
    let total = n_discard + n_collect;
    pb.set_length(total as u64);

    let mut tracker = ChainTracker::new(chain.current_state());
    let mut out = Vec::with_capacity(n_collect);
    for i in 0..total {
        let state = chain.step()?;
        tracker.step(state);
        if i >= n_discard {
            out.push(state);
        }
        pb.inc(1);
        if i % MESSAGE_EVERY == 0 || i + 1 == total {
            let phase = if i < n_discard { "warmup" } else { "sampling" };
            pb.set_message(progress_message(phase, &tracker.stats()));
        }
    }
    Ok(out)
}

fn progress_message(phase: &str, stats: &ChainStats) -> String {
    format!(
        "{phase} p(accept)≈{:.2} mean≈{:.3} sd≈{:.3}",
        stats.p_accept,
        stats.mean,
        stats.sm2.sqrt()
    )
}

/// A trait for "anything that owns multiple MarkovChains".
pub trait HasChains {
    type Chain: MarkovChain + Send;

    /// Returns a mutable reference to the vector of chains.
    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

pub trait ChainRunner: HasChains {
    /// Runs the chains in parallel, discarding burn-in. Returns one vector of retained
    /// states per chain.
    fn run_chains(&mut self, n_collect: usize, n_discard: usize) -> Result<Vec<Vec<f64>>> {
        self.chains_mut()
            .par_iter_mut()
            .map(|chain| run_chain(chain, n_collect, n_discard))
            .collect()
    }

    /// Like [`ChainRunner::run_chains`], with one progress bar per chain.
    fn run_chains_with_progress(
        &mut self,
        n_collect: usize,
        n_discard: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let multi = MultiProgress::new();
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix:8} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        self.chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new((n_collect + n_discard) as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(pb_style.clone());

                let samples = run_chain_with_progress(chain, n_collect, n_discard, &pb);
                match &samples {
                    Ok(_) => pb.finish_with_message("Done!"),
                    Err(e) => pb.abandon_with_message(format!("Failed: {e}")),
                }
                samples
            })
            .collect()
    }
}

impl<T: HasChains> ChainRunner for T {}
