use crate::hamiltonian::{DivergenceInfo, State};
use crate::nuts::{NutsOptions, TrajectoryObserver};

/// Step size adaptation. `k` is the decay exponent of the averaging
/// weights, `t0` damps the first iterations and `gamma` scales the
/// shrinkage towards `10 * initial_step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
    pub initial_step: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            initial_step: 0.1,
        }
    }
}

/// Nesterov dual averaging on the log step size. `log_step` is the value
/// used for the next warmup step, `log_step_adapted` its running average
/// that sampling keeps once warmup ends.
#[derive(Debug, Clone)]
pub(crate) struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    /// Running mean of `target - accept_stat`.
    hbar: f64,
    /// Shrinkage point, ten times the initial step.
    mu: f64,
    iteration: u64,
    options: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(options: DualAverageOptions) -> DualAverage {
        let log_initial = options.initial_step.ln();
        DualAverage {
            log_step: log_initial,
            log_step_adapted: log_initial,
            hbar: 0.,
            mu: std::f64::consts::LN_10 + log_initial,
            iteration: 1,
            options,
        }
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let DualAverageOptions { k, t0, gamma, .. } = self.options;
        let t = self.iteration as f64;
        let w = (t + t0).recip();
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * t.sqrt() / gamma;
        let weight = t.powf(-k);
        self.log_step_adapted = weight * self.log_step + (1. - weight) * self.log_step_adapted;
        self.iteration += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Zero when nothing was added yet.
    pub(crate) fn current(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability of the leapfrog steps in a
/// trajectory.
#[derive(Debug, Clone)]
pub(crate) struct AcceptanceTracker {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceTracker {
    pub(crate) fn new() -> AcceptanceTracker {
        AcceptanceTracker {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }
}

impl TrajectoryObserver for AcceptanceTracker {
    fn on_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        }
    }

    fn on_start(&mut self, state: &State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}
