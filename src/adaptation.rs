//! Step-size adaptation for the HMC kernel.
//!
//! During the first `num_adaptation_steps` iterations of burn-in the step size is tuned
//! towards a target acceptance probability, after which it is frozen for the rest of the
//! run. The controller is an explicit tagged state ([`AdaptationState`]) owned by a single
//! chain.

use crate::error::{McmcError, Result};
use log::{debug, warn};

/// Acceptance rates further than this from the target at freeze time are reported.
const ACCEPT_WARN_MARGIN: f64 = 0.15;

/// How the step size is tuned during the adaptation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepSizeAdaptation {
    /// Keep the initial step size.
    Fixed,
    /// Multiply the step size by `1 + adaptation_rate` after an iteration whose acceptance
    /// probability exceeds `target_accept`, divide by it otherwise.
    Simple {
        target_accept: f64,
        adaptation_rate: f64,
    },
    /// Nesterov dual averaging on the log step size (Hoffman & Gelman, 2014).
    DualAveraging {
        target_accept: f64,
        gamma: f64,
        t0: f64,
        kappa: f64,
    },
}

impl Default for StepSizeAdaptation {
    fn default() -> Self {
        Self::simple(0.65)
    }
}

impl StepSizeAdaptation {
    /// Multiplicative adaptation with a rate of 1%.
    pub fn simple(target_accept: f64) -> Self {
        Self::Simple {
            target_accept,
            adaptation_rate: 0.01,
        }
    }

    /// Dual averaging with the usual constants `gamma = 0.05`, `t0 = 10`, `kappa = 0.75`.
    pub fn dual_averaging(target_accept: f64) -> Self {
        Self::DualAveraging {
            target_accept,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
        }
    }

    pub fn target_accept(&self) -> Option<f64> {
        match *self {
            Self::Fixed => None,
            Self::Simple { target_accept, .. } | Self::DualAveraging { target_accept, .. } => {
                Some(target_accept)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(target) = self.target_accept() {
            if !(target > 0.0 && target < 1.0) {
                return Err(McmcError::InvalidTargetAcceptance { value: target });
            }
        }
        match *self {
            Self::Fixed => Ok(()),
            Self::Simple {
                adaptation_rate, ..
            } => positive("adaptation_rate", adaptation_rate),
            Self::DualAveraging {
                gamma, t0, kappa, ..
            } => {
                positive("gamma", gamma)?;
                if !(t0.is_finite() && t0 >= 0.0) {
                    return Err(McmcError::InvalidAdaptationParameter {
                        name: "t0",
                        value: t0,
                    });
                }
                if !(kappa > 0.5 && kappa <= 1.0) {
                    return Err(McmcError::InvalidAdaptationParameter {
                        name: "kappa",
                        value: kappa,
                    });
                }
                Ok(())
            }
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(McmcError::InvalidAdaptationParameter { name, value })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DualAveraging {
    mu: f64,
    h_bar: f64,
    log_step_bar: f64,
}

/// Running state of an active adaptation window.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSizeAdapter {
    scheme: StepSizeAdaptation,
    step_size: f64,
    n_updates: usize,
    num_adaptation_steps: usize,
    mean_accept: f64,
    dual: DualAveraging,
}

impl StepSizeAdapter {
    fn new(scheme: StepSizeAdaptation, step_size: f64, num_adaptation_steps: usize) -> Self {
        Self {
            scheme,
            step_size,
            n_updates: 0,
            num_adaptation_steps,
            mean_accept: 0.0,
            dual: DualAveraging {
                mu: (10.0 * step_size).ln(),
                h_bar: 0.0,
                log_step_bar: 0.0,
            },
        }
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Mean acceptance probability over the updates seen so far.
    pub fn mean_accept(&self) -> f64 {
        self.mean_accept
    }

    pub fn n_updates(&self) -> usize {
        self.n_updates
    }

    fn observe(&mut self, accept_prob: f64) {
        self.n_updates += 1;
        let m = self.n_updates as f64;
        self.mean_accept += (accept_prob - self.mean_accept) / m;

        match self.scheme {
            StepSizeAdaptation::Fixed => {}
            StepSizeAdaptation::Simple {
                target_accept,
                adaptation_rate,
            } => {
                if accept_prob > target_accept {
                    self.step_size *= 1.0 + adaptation_rate;
                } else {
                    self.step_size /= 1.0 + adaptation_rate;
                }
            }
            StepSizeAdaptation::DualAveraging {
                target_accept,
                gamma,
                t0,
                kappa,
            } => {
                let da = &mut self.dual;
                let eta = 1.0 / (m + t0);
                da.h_bar = (1.0 - eta) * da.h_bar + eta * (target_accept - accept_prob);
                let log_step = da.mu - m.sqrt() / gamma * da.h_bar;
                let weight = m.powf(-kappa);
                da.log_step_bar = weight * log_step + (1.0 - weight) * da.log_step_bar;
                self.step_size = log_step.exp();
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.n_updates >= self.num_adaptation_steps
    }

    /// Step size to keep once the window closes.
    fn final_step_size(&self) -> f64 {
        match self.scheme {
            StepSizeAdaptation::DualAveraging { .. } => self.dual.log_step_bar.exp(),
            _ => self.step_size,
        }
    }
}

/// Step-size controller of one chain: adapting during the adaptation window, frozen after.
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptationState {
    Adapting(StepSizeAdapter),
    Frozen {
        step_size: f64,
        /// Mean acceptance probability reached during adaptation, if any happened.
        mean_accept: Option<f64>,
    },
}

impl AdaptationState {
    /// Starts adapting unless the scheme is [`StepSizeAdaptation::Fixed`] or the window is
    /// empty, in which case the controller starts frozen at `step_size`.
    pub fn new(scheme: StepSizeAdaptation, step_size: f64, num_adaptation_steps: usize) -> Self {
        if scheme == StepSizeAdaptation::Fixed || num_adaptation_steps == 0 {
            Self::Frozen {
                step_size,
                mean_accept: None,
            }
        } else {
            Self::Adapting(StepSizeAdapter::new(scheme, step_size, num_adaptation_steps))
        }
    }

    pub fn step_size(&self) -> f64 {
        match self {
            Self::Adapting(adapter) => adapter.step_size,
            Self::Frozen { step_size, .. } => *step_size,
        }
    }

    pub fn is_adapting(&self) -> bool {
        matches!(self, Self::Adapting(_))
    }

    pub fn mean_accept(&self) -> Option<f64> {
        match self {
            Self::Adapting(adapter) => Some(adapter.mean_accept),
            Self::Frozen { mean_accept, .. } => *mean_accept,
        }
    }

    /// Feeds the acceptance probability of the latest transition. Does nothing once frozen.
    pub fn update(&mut self, accept_prob: f64) {
        let frozen = match self {
            Self::Adapting(adapter) => {
                adapter.observe(accept_prob);
                if adapter.is_complete() {
                    Some((
                        adapter.final_step_size(),
                        adapter.mean_accept,
                        adapter.scheme.target_accept(),
                        adapter.n_updates(),
                    ))
                } else {
                    None
                }
            }
            Self::Frozen { .. } => None,
        };

        if let Some((step_size, mean_accept, target, n_updates)) = frozen {
            debug!(
                "Step-size adaptation frozen after {} steps: step size {:.5}, mean p(accept) {:.3}",
                n_updates, step_size, mean_accept
            );
            if let Some(target) = target {
                if (mean_accept - target).abs() > ACCEPT_WARN_MARGIN {
                    warn!(
                        "Mean acceptance during adaptation was {:.3}, target {:.3}; consider a longer adaptation window",
                        mean_accept, target
                    );
                }
            }
            *self = Self::Frozen {
                step_size,
                mean_accept: Some(mean_accept),
            };
        }
    }
}
