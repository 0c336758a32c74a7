use itertools::izip;
use rand_distr::StandardNormal;

use crate::hamiltonian::State;
use crate::math::{multiply, vector_dot};
use crate::nuts::{DrawInfo, TrajectoryObserver};

#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(dim: usize) -> Self {
        DiagMassMatrix {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    /// Replace the diagonal. Entries that are not finite and positive
    /// fall back to one.
    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
    }

    pub(crate) fn update_velocity(&self, state: &mut State) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    pub(crate) fn update_kinetic_energy(&self, state: &mut State) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    /// Momentum drawn from `N(0, M)` with `M` the inverse of `variance`.
    pub(crate) fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        for (p, &inv_std) in state.p.iter_mut().zip(self.inv_stds.iter()) {
            let z: f64 = rng.sample(StandardNormal);
            *p = inv_std * z;
        }
    }
}

fn update_diag(
    variance_out: &mut [f64],
    inv_std_out: &mut [f64],
    new_variance: impl Iterator<Item = f64>,
) {
    for (var, inv_std, x) in izip!(variance_out, inv_std_out, new_variance) {
        let x = if x.is_finite() && x > 0. { x } else { 1. };
        *var = x;
        *inv_std = x.sqrt().recip();
    }
}

/// Exponentially decaying estimate of a per-coordinate variance. With
/// `use_mean` off the values are taken to be centred already, which is how
/// gradients are tracked.
#[derive(Debug)]
pub(crate) struct DecayingVariance {
    mean: Box<[f64]>,
    variance: Box<[f64]>,
    count: u64,
    alpha: f64,
    use_mean: bool,
}

impl DecayingVariance {
    pub(crate) fn new(dim: usize, alpha: f64, use_mean: bool) -> Self {
        DecayingVariance {
            mean: vec![0f64; dim].into(),
            variance: vec![0f64; dim].into(),
            count: 0,
            alpha,
            use_mean,
        }
    }

    pub(crate) fn set_mean(&mut self, values: impl Iterator<Item = f64>) {
        for (out, val) in self.mean.iter_mut().zip(values) {
            *out = val;
        }
    }

    pub(crate) fn set_variance(&mut self, values: impl Iterator<Item = f64>) {
        for (out, val) in self.variance.iter_mut().zip(values) {
            *out = val;
        }
    }

    pub(crate) fn add_sample(&mut self, values: impl Iterator<Item = f64>) {
        let alpha = self.alpha;
        if self.use_mean {
            for (x, mean, var) in izip!(values, self.mean.iter_mut(), self.variance.iter_mut()) {
                let delta = x - *mean;
                *mean = alpha.mul_add(delta, *mean);
                *var = (1. - alpha) * (*var + alpha * delta * delta);
            }
        } else {
            for (x, var) in values.zip(self.variance.iter_mut()) {
                *var = (1. - alpha) * (*var + alpha * x * x);
            }
        }
        self.count += 1;
    }

    pub(crate) fn current(&self) -> &[f64] {
        &self.variance
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Tuning of the diagonal mass matrix during warmup. Ratios are fractions
/// of `num_warmup`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagAdaptExpSettings {
    /// Decay of the draw and gradient variance estimates.
    pub variance_decay: f64,
    /// Decay used until the first estimator switch, while the chain is
    /// still moving towards the typical set.
    pub early_variance_decay: f64,
    /// Trailing part of warmup where the mass matrix stays fixed.
    pub final_window_ratio: f64,
    pub window_switch_ratio: f64,
    /// Seed the gradient estimate from the gradient at the initial position.
    pub grad_init: bool,
}

impl Default for DiagAdaptExpSettings {
    fn default() -> Self {
        Self {
            variance_decay: 0.02,
            early_variance_decay: 0.8,
            final_window_ratio: 0.2,
            window_switch_ratio: 0.1,
            grad_init: true,
        }
    }
}

/// Position and gradient of the latest draw. `is_good` is false when the
/// draw stayed at, or diverged close to, the starting position.
pub(crate) struct LastDraw {
    pub(crate) draw: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) is_good: bool,
}

impl LastDraw {
    pub(crate) fn new(dim: usize) -> Self {
        LastDraw {
            draw: vec![0f64; dim].into(),
            grad: vec![0f64; dim].into(),
            is_good: true,
        }
    }
}

impl TrajectoryObserver for LastDraw {
    fn on_draw(&mut self, state: &State, info: &DrawInfo) {
        self.draw.copy_from_slice(&state.q);
        self.grad.copy_from_slice(&state.grad);
        let idx = state.index_in_trajectory();
        self.is_good = match info.divergence_info {
            Some(_) => idx.abs() >= 4,
            None => idx != 0,
        };
    }
}
