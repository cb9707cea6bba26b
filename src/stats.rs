//! Running chain statistics and convergence diagnostics (split R-hat, effective sample
//! size, Monte Carlo standard error).
//!
//! Diagnostics take a `[n_chains, n_draws]` view of the retained draws.

use crate::error::{McmcError, Result};
use ndarray::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::VecDeque;

/// Number of recent transitions used for the windowed acceptance rate.
const ACCEPT_WINDOW: usize = 100;

/// Streaming statistics of a single chain, fed one state at a time.
///
/// A transition counts as accepted when the state changed, which holds almost surely for
/// continuous targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTracker {
    n: u64,
    mean: f64,
    mean_sq: f64,
    last_state: f64,
    accept_queue: VecDeque<bool>,
    n_accepted_in_window: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainStats {
    pub n: u64,
    pub p_accept: f64,
    pub mean: f64,
    pub sm2: f64,
}

impl ChainTracker {
    pub fn new(initial_state: f64) -> Self {
        Self {
            n: 0,
            mean: 0.0,
            mean_sq: 0.0,
            last_state: initial_state,
            accept_queue: VecDeque::with_capacity(ACCEPT_WINDOW + 1),
            n_accepted_in_window: 0,
        }
    }

    pub fn step(&mut self, x: f64) {
        self.n += 1;

        let accepted = x != self.last_state;
        self.accept_queue.push_back(accepted);
        self.n_accepted_in_window += accepted as usize;
        if self.accept_queue.len() > ACCEPT_WINDOW {
            if let Some(true) = self.accept_queue.pop_front() {
                self.n_accepted_in_window -= 1;
            }
        }
        self.last_state = x;

        let n = self.n as f64;
        self.mean += (x - self.mean) / n;
        self.mean_sq += (x * x - self.mean_sq) / n;
    }

    /// Acceptance rate over the last (up to) 100 transitions.
    pub fn p_accept(&self) -> f64 {
        if self.accept_queue.is_empty() {
            0.0
        } else {
            self.n_accepted_in_window as f64 / self.accept_queue.len() as f64
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance of the states seen so far.
    pub fn sm2(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        (self.mean_sq - self.mean * self.mean) * n / (n - 1.0)
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            n: self.n,
            p_accept: self.p_accept(),
            mean: self.mean,
            sm2: self.sm2(),
        }
    }
}

fn check_draws(samples: &ArrayView2<f64>, needed: usize) -> Result<()> {
    let (n_chains, n_draws) = samples.dim();
    if n_chains == 0 || n_draws == 0 {
        return Err(McmcError::EmptySamples);
    }
    if n_draws < needed {
        return Err(McmcError::InsufficientSamples {
            needed,
            got: n_draws,
        });
    }
    Ok(())
}

/// Split potential scale reduction factor.
///
/// Every chain is cut into two halves (dropping the middle draw for odd lengths) and the
/// classic between/within variance ratio is computed over the `2 * n_chains` pieces.
/// Values close to 1 indicate that the chains agree. Pieces without any spread give 1 when
/// they all sit at the same value and `+inf` otherwise.
pub fn split_rhat(samples: ArrayView2<f64>) -> Result<f64> {
    check_draws(&samples, 4)?;
    let half = samples.ncols() / 2;
    let offset = samples.ncols() - half;
    let first = samples.slice(s![.., ..half]);
    let second = samples.slice(s![.., offset..]);
    let pieces = ndarray::concatenate(Axis(0), &[first, second])
        .map_err(|_| McmcError::EmptySamples)?;

    let n = half as f64;
    let m = pieces.nrows() as f64;
    let means = pieces
        .mean_axis(Axis(1))
        .ok_or(McmcError::EmptySamples)?;
    let variances = pieces.var_axis(Axis(1), 1.0);
    let within = variances.sum() / m;
    let grand_mean = means.sum() / m;
    let between = n * means.mapv(|x| (x - grand_mean).powi(2)).sum() / (m - 1.0);
    if within == 0.0 {
        return Ok(if between == 0.0 { 1.0 } else { f64::INFINITY });
    }
    let var_plus = within * (n - 1.0) / n + between / n;
    Ok((var_plus / within).sqrt())
}

/// Biased autocovariance `1/n * sum_i (x_i - mean)(x_{i+t} - mean)` for every lag `t`,
/// computed with a zero-padded FFT.
pub fn autocovariance(x: ArrayView1<f64>) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = x.sum() / n as f64;
    let len = (2 * n).next_power_of_two();

    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(len)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(len).process(&mut buffer);
    buffer
        .iter_mut()
        .for_each(|c| *c = Complex::new(c.norm_sqr(), 0.0));
    planner.plan_fft_inverse(len).process(&mut buffer);

    // rustfft leaves both transforms unnormalized.
    let scale = 1.0 / (len as f64 * n as f64);
    buffer[..n].iter().map(|c| c.re * scale).collect()
}

/// Effective sample size of the pooled draws.
///
/// Combines the per-chain autocovariances with the between-chain variance and truncates
/// the autocorrelation sum with Geyer's initial monotone sequence.
pub fn ess(samples: ArrayView2<f64>) -> Result<f64> {
    check_draws(&samples, 4)?;
    let (n_chains, n_draws) = samples.dim();
    let (m, n) = (n_chains as f64, n_draws as f64);

    let acovs: Vec<Vec<f64>> = samples.outer_iter().map(autocovariance).collect();
    let mean_acov = |t: usize| acovs.iter().map(|a| a[t]).sum::<f64>() / m;

    let mean_var = mean_acov(0) * n / (n - 1.0);
    let mut var_plus = mean_var * (n - 1.0) / n;
    if n_chains > 1 {
        let chain_means = samples
            .mean_axis(Axis(1))
            .ok_or(McmcError::EmptySamples)?;
        var_plus += chain_means.var(1.0);
    }
    if var_plus <= 0.0 {
        // Constant draws carry no autocorrelation information.
        return Ok(m * n);
    }

    let rho = |t: usize| 1.0 - (mean_var - mean_acov(t)) / var_plus;
    let mut pair_sum = 0.0;
    let mut prev_pair = f64::INFINITY;
    let mut t = 0;
    while t + 1 < n_draws {
        let pair = rho(t) + rho(t + 1);
        if pair <= 0.0 {
            break;
        }
        let pair = pair.min(prev_pair);
        pair_sum += pair;
        prev_pair = pair;
        t += 2;
    }
    let tau = (2.0 * pair_sum - 1.0).max(1.0 / (m * n).log10().max(1.0));
    Ok(m * n / tau)
}

/// Monte Carlo standard error of the pooled mean: `sd / sqrt(ess)`.
pub fn mcse_mean(samples: ArrayView2<f64>) -> Result<f64> {
    let ess = ess(samples)?;
    let sd = samples.std(1.0);
    Ok(sd / ess.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn ar1(n: usize, phi: f64, seed: u64) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut x = 0.0;
        (0..n)
            .map(|_| {
                let eps: f64 = rng.sample(StandardNormal);
                x = phi * x + eps;
                x
            })
            .collect()
    }

    #[test]
    fn test_chain_tracker() {
        let mut tracker = ChainTracker::new(0.0);
        for x in [0.0, 1.0, 1.0, 3.0] {
            tracker.step(x);
        }
        let stats = tracker.stats();
        assert_eq!(stats.n, 4);
        assert_abs_diff_eq!(stats.p_accept, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.mean, 1.25, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.sm2, 1.583_333_333_333_333_3, epsilon = 1e-12);
    }

    #[test]
    fn test_chain_tracker_window() {
        let mut tracker = ChainTracker::new(0.0);
        for i in 1..=100 {
            tracker.step(i as f64);
        }
        for _ in 0..100 {
            tracker.step(100.0);
        }
        assert_eq!(tracker.p_accept(), 0.0);
    }

    #[test]
    fn test_autocovariance_matches_direct_sum() {
        let x = array![1.0, 3.0, 2.0, 5.0, 4.0, 4.5];
        let acov = autocovariance(x.view());
        let n = x.len();
        let mean = x.sum() / n as f64;
        for t in 0..n {
            let direct: f64 = (0..n - t)
                .map(|i| (x[i] - mean) * (x[i + t] - mean))
                .sum::<f64>()
                / n as f64;
            assert_abs_diff_eq!(acov[t], direct, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_rhat_close_to_one_for_identical_distributions() {
        let chains: Vec<f64> = (0..4).flat_map(|c| ar1(2000, 0.0, c)).collect();
        let samples = Array2::from_shape_vec((4, 2000), chains).unwrap();
        let rhat = split_rhat(samples.view()).unwrap();
        assert!((rhat - 1.0).abs() < 0.02, "rhat = {rhat}");
    }

    #[test]
    fn test_rhat_detects_shifted_chain() {
        let mut chains: Vec<f64> = (0..3).flat_map(|c| ar1(1000, 0.0, c)).collect();
        chains.extend(ar1(1000, 0.0, 99).into_iter().map(|x| x + 5.0));
        let samples = Array2::from_shape_vec((4, 1000), chains).unwrap();
        let rhat = split_rhat(samples.view()).unwrap();
        assert!(rhat > 1.5, "rhat = {rhat}");
    }

    #[test]
    fn test_rhat_of_constant_chains() {
        let stuck = array![[0.5, 0.5, 0.5, 0.5], [0.5, 0.5, 0.5, 0.5]];
        assert_eq!(split_rhat(stuck.view()), Ok(1.0));

        let apart = array![[0.2, 0.2, 0.2, 0.2], [0.7, 0.7, 0.7, 0.7]];
        assert_eq!(split_rhat(apart.view()), Ok(f64::INFINITY));
    }

    #[test]
    fn test_ess_iid_close_to_draw_count() {
        let samples = Array2::from_shape_vec((1, 5000), ar1(5000, 0.0, 3)).unwrap();
        let ess = ess(samples.view()).unwrap();
        assert!(ess > 4000.0 && ess < 6000.0, "ess = {ess}");
    }

    #[test]
    fn test_ess_ar1() {
        // Integrated autocorrelation time of AR(1) is (1 + phi) / (1 - phi) = 19.
        let samples = Array2::from_shape_vec((1, 20_000), ar1(20_000, 0.9, 11)).unwrap();
        let ess = ess(samples.view()).unwrap();
        assert!(ess > 600.0 && ess < 1600.0, "ess = {ess}");
    }

    #[test]
    fn test_diagnostics_reject_short_chains() {
        let samples = array![[0.1, 0.2, 0.3]];
        assert_eq!(
            split_rhat(samples.view()),
            Err(McmcError::InsufficientSamples { needed: 4, got: 3 })
        );
        let empty = Array2::<f64>::zeros((0, 0));
        assert_eq!(ess(empty.view()), Err(McmcError::EmptySamples));
    }
}
