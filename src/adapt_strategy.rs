use std::iter;

use itertools::izip;

use crate::hamiltonian::{DivergenceInfo, EuclideanHamiltonian, State};
use crate::mass_matrix::{DecayingVariance, DiagAdaptExpSettings, LastDraw};
use crate::nuts::{DrawInfo, NutsOptions, TrajectoryObserver};
use crate::stepsize::{AcceptanceTracker, DualAverage, DualAverageOptions};

const LOWER_LIMIT: f64 = 1e-10f64;
const UPPER_LIMIT: f64 = 1e10f64;

/// Settings for the warmup phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptOptions {
    pub dual_average: DualAverageOptions,
    pub early_target_accept: f64,
    pub target_accept: f64,
    /// Fraction of the warmup during which the target acceptance rate
    /// moves from `early_target_accept` to `target_accept`.
    pub early_window_ratio: f64,
    pub mass_matrix: DiagAdaptExpSettings,
}

impl Default for AdaptOptions {
    fn default() -> Self {
        Self {
            dual_average: DualAverageOptions::default(),
            early_target_accept: 0.5,
            target_accept: 0.8,
            early_window_ratio: 0.4,
            mass_matrix: DiagAdaptExpSettings::default(),
        }
    }
}

pub(crate) struct DualAverageStrategy {
    step_size_adapt: DualAverage,
    options: AdaptOptions,
    num_early: u64,
}

impl DualAverageStrategy {
    fn new(options: AdaptOptions, num_tune: u64) -> Self {
        Self {
            num_early: ((num_tune as f64) * options.early_window_ratio).ceil() as u64,
            options,
            step_size_adapt: DualAverage::new(options.dual_average),
        }
    }

    fn init(&mut self, hamiltonian: &mut EuclideanHamiltonian) {
        hamiltonian.step_size = self.options.dual_average.initial_step;
    }

    fn adapt(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        draw: u64,
        observer: &AcceptanceTracker,
    ) {
        let target = if draw >= self.num_early {
            self.options.target_accept
        } else {
            let start = self.options.early_target_accept;
            let end = self.options.target_accept;
            let time = (draw as f64) / (self.num_early as f64);
            start + (end - start) * (1f64 + (6f64 * (time - 0.6)).tanh()) / 2f64
        };
        self.step_size_adapt.advance(observer.mean.current(), target);
        hamiltonian.step_size = self.step_size_adapt.current_step_size();
    }

    fn final_step_size(&self) -> f64 {
        self.step_size_adapt.current_step_size_adapted()
    }
}

/// Diagonal mass matrix estimated from draw and gradient variances,
/// with a foreground and a background estimator that are swapped at
/// every window switch.
pub(crate) struct ExpWindowDiagAdapt {
    dim: usize,
    adapt_until: u64,
    window_switch_freq: u64,
    exp_variance_draw: DecayingVariance,
    exp_variance_grad: DecayingVariance,
    exp_variance_draw_bg: DecayingVariance,
    exp_variance_grad_bg: DecayingVariance,
    settings: DiagAdaptExpSettings,
}

impl ExpWindowDiagAdapt {
    fn new(settings: DiagAdaptExpSettings, num_tune: u64, dim: usize) -> Self {
        let final_window = ((num_tune as f64) * settings.final_window_ratio).ceil() as u64;
        let window_switch_freq = (((num_tune as f64) * settings.window_switch_ratio).ceil() as u64).max(1);
        Self {
            dim,
            adapt_until: num_tune.saturating_sub(final_window),
            window_switch_freq,
            exp_variance_draw: DecayingVariance::new(dim, settings.early_variance_decay, true),
            exp_variance_grad: DecayingVariance::new(dim, settings.early_variance_decay, true),
            exp_variance_draw_bg: DecayingVariance::new(dim, settings.early_variance_decay, true),
            exp_variance_grad_bg: DecayingVariance::new(dim, settings.early_variance_decay, true),
            settings,
        }
    }

    fn init(&mut self, hamiltonian: &mut EuclideanHamiltonian, state: &State) {
        self.exp_variance_draw.set_variance(iter::repeat(1f64));
        self.exp_variance_draw.set_mean(state.q.iter().copied());
        let grad_init = self.settings.grad_init;
        self.exp_variance_grad
            .set_variance(state.grad.iter().map(|&val| {
                let out = val * val;
                if !grad_init || out == 0f64 || !out.is_finite() {
                    1f64
                } else {
                    out
                }
            }));
        self.exp_variance_grad.set_mean(iter::repeat(0f64));

        self.update_mass_matrix(hamiltonian);
    }

    fn update_mass_matrix(&self, hamiltonian: &mut EuclideanHamiltonian) {
        hamiltonian.mass_matrix.update_diag(
            izip!(
                self.exp_variance_draw.current(),
                self.exp_variance_grad.current(),
            )
            .map(|(draw, grad)| (draw / grad).sqrt().clamp(LOWER_LIMIT, UPPER_LIMIT)),
        );
    }

    fn adapt(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        draw: u64,
        observer: &LastDraw,
    ) {
        if draw >= self.adapt_until {
            return;
        }

        let count = self.exp_variance_draw_bg.count();
        if (draw % self.window_switch_freq == 0) & (count > 5) {
            self.exp_variance_draw = std::mem::replace(
                &mut self.exp_variance_draw_bg,
                DecayingVariance::new(self.dim, self.settings.variance_decay, true),
            );
            self.exp_variance_grad = std::mem::replace(
                &mut self.exp_variance_grad_bg,
                DecayingVariance::new(self.dim, self.settings.variance_decay, true),
            );

            self.exp_variance_draw_bg
                .set_mean(observer.draw.iter().copied());
            self.exp_variance_grad_bg
                .set_mean(observer.grad.iter().copied());
        } else if observer.is_good {
            self.exp_variance_draw
                .add_sample(observer.draw.iter().copied());
            self.exp_variance_grad
                .add_sample(observer.grad.iter().copied());
            self.exp_variance_draw_bg
                .add_sample(observer.draw.iter().copied());
            self.exp_variance_grad_bg
                .add_sample(observer.grad.iter().copied());
        }

        if self.exp_variance_draw.count() > 2 {
            self.update_mass_matrix(hamiltonian);
        }
    }
}

/// Step size and mass matrix adaptation during warmup.
pub(crate) struct WindowAdaptation {
    step_size: DualAverageStrategy,
    mass_matrix: ExpWindowDiagAdapt,
}

impl WindowAdaptation {
    pub(crate) fn new(options: AdaptOptions, num_tune: u64, dim: usize) -> Self {
        Self {
            step_size: DualAverageStrategy::new(options, num_tune),
            mass_matrix: ExpWindowDiagAdapt::new(options.mass_matrix, num_tune, dim),
        }
    }

    pub(crate) fn init(&mut self, hamiltonian: &mut EuclideanHamiltonian, state: &State) {
        self.step_size.init(hamiltonian);
        self.mass_matrix.init(hamiltonian, state);
    }

    pub(crate) fn adapt(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        draw: u64,
        observer: &WarmupObserver,
    ) {
        self.step_size
            .adapt(hamiltonian, draw, &observer.acceptance);
        self.mass_matrix
            .adapt(hamiltonian, draw, &observer.draw_grad);
    }

    /// Fix the step size at its averaged value once warmup is over.
    pub(crate) fn finalize(&self, hamiltonian: &mut EuclideanHamiltonian) {
        hamiltonian.step_size = self.step_size.final_step_size();
    }

    pub(crate) fn new_observer(&self) -> WarmupObserver {
        WarmupObserver {
            acceptance: AcceptanceTracker::new(),
            draw_grad: LastDraw::new(self.mass_matrix.dim),
        }
    }
}

pub(crate) struct WarmupObserver {
    pub(crate) acceptance: AcceptanceTracker,
    pub(crate) draw_grad: LastDraw,
}

impl TrajectoryObserver for WarmupObserver {
    fn on_leapfrog(
        &mut self,
        start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.acceptance
            .on_leapfrog(start, end, divergence_info);
        self.draw_grad
            .on_leapfrog(start, end, divergence_info);
    }

    fn on_draw(&mut self, state: &State, info: &DrawInfo) {
        self.acceptance.on_draw(state, info);
        self.draw_grad.on_draw(state, info);
    }

    fn on_start(&mut self, state: &State, options: &NutsOptions) {
        self.acceptance.on_start(state, options);
        self.draw_grad.on_start(state, options);
    }
}
