//! The transition kernel contract used by the orchestrator, and its
//! NUTS implementation.

use std::fmt::Debug;
use std::sync::Arc;

use rand::Rng;

use crate::adapt_strategy::{AdaptOptions, WindowAdaptation};
use crate::density::LogDensity;
use crate::hamiltonian::{DivergenceInfo, EuclideanHamiltonian, State};
use crate::mass_matrix::DiagMassMatrix;
use crate::nuts::{draw, NutsError, NutsOptions, TrajectoryObserver};
use crate::stepsize::AcceptanceTracker;

/// Statistics about a single transition.
pub trait SampleStats: Clone + Debug + Send {
    fn depth(&self) -> u64;
    fn diverging(&self) -> bool;
    fn logp(&self) -> f64;
    fn energy(&self) -> f64;
}

/// A Markov kernel on the unconstrained parameter space.
pub trait TransitionKernel: Send {
    type State: Clone + Debug + Send;
    type Stats: SampleStats;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Evaluate the log density at `position` and wrap it in a state.
    fn init(&self, position: &[f64]) -> Result<Self::State, Self::Error>;

    /// One transition. The returned state depends only on `state` and the
    /// randomness drawn from `rng`.
    fn step<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        state: &Self::State,
    ) -> Result<(Self::State, Self::Stats), Self::Error>;

    fn position<'a>(&self, state: &'a Self::State) -> &'a [f64];
}

/// Builds kernels, either with fixed default tuning or by running
/// window adaptation.
pub trait KernelSettings: Clone + Debug + Send {
    type Kernel: TransitionKernel;

    fn build(&self, density: Arc<dyn LogDensity>) -> Self::Kernel;

    /// Tune a kernel over `num_steps` warmup transitions that start at
    /// `position`. At least one step is always run.
    #[allow(clippy::type_complexity)]
    fn window_adaptation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        density: Arc<dyn LogDensity>,
        position: &[f64],
        num_steps: u64,
    ) -> Result<
        (Self::Kernel, <Self::Kernel as TransitionKernel>::State),
        <Self::Kernel as TransitionKernel>::Error,
    >;
}

/// Settings of the NUTS kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NutsSettings {
    /// The maximum tree depth during sampling.
    pub maxdepth: u64,
    /// Leapfrog steps with a larger energy error count as divergences.
    pub max_energy_error: f64,
    pub adapt_options: AdaptOptions,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            maxdepth: 10,
            max_energy_error: 1000f64,
            adapt_options: AdaptOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NutsState {
    inner: State,
}

impl NutsState {
    pub fn logp(&self) -> f64 {
        self.inner.logp()
    }
}

#[derive(Debug, Clone)]
pub struct NutsSampleStats {
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub index_in_trajectory: i64,
    pub logp: f64,
    pub energy: f64,
    pub step_size: f64,
    pub mean_tree_accept: f64,
    pub divergence_info: Option<DivergenceInfo>,
}

impl SampleStats for NutsSampleStats {
    fn depth(&self) -> u64 {
        self.depth
    }
    fn diverging(&self) -> bool {
        self.divergence_info.is_some()
    }
    fn logp(&self) -> f64 {
        self.logp
    }
    fn energy(&self) -> f64 {
        self.energy
    }
}

pub struct NutsKernel {
    hamiltonian: EuclideanHamiltonian,
    options: NutsOptions,
}

impl Debug for NutsKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NutsKernel")
            .field("step_size", &self.hamiltonian.step_size)
            .field("maxdepth", &self.options.maxdepth)
            .finish()
    }
}

impl NutsKernel {
    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size
    }

    /// Diagonal of the inverse mass matrix.
    pub fn mass_matrix_inv(&self) -> &[f64] {
        &self.hamiltonian.mass_matrix.variance
    }

    fn transition<R: Rng + ?Sized, C: TrajectoryObserver>(
        &self,
        rng: &mut R,
        state: &State,
        observer: &mut C,
        mean_tree_accept: impl FnOnce(&C) -> f64,
    ) -> Result<(State, NutsSampleStats), NutsError> {
        let mut init = state.clone();
        let (next, info) = draw(&mut init, rng, &self.hamiltonian, &self.options, observer)?;
        let stats = NutsSampleStats {
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            index_in_trajectory: next.index_in_trajectory(),
            logp: next.logp(),
            energy: next.energy(),
            step_size: self.hamiltonian.step_size,
            mean_tree_accept: mean_tree_accept(&*observer),
            divergence_info: info.divergence_info,
        };
        Ok((next, stats))
    }
}

impl TransitionKernel for NutsKernel {
    type State = NutsState;
    type Stats = NutsSampleStats;
    type Error = NutsError;

    fn init(&self, position: &[f64]) -> Result<NutsState, NutsError> {
        Ok(NutsState {
            inner: self.hamiltonian.init_state(position)?,
        })
    }

    fn step<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        state: &NutsState,
    ) -> Result<(NutsState, NutsSampleStats), NutsError> {
        let mut observer = AcceptanceTracker::new();
        let (inner, stats) =
            self.transition(rng, &state.inner, &mut observer, |c| c.mean.current())?;
        Ok((NutsState { inner }, stats))
    }

    fn position<'a>(&self, state: &'a NutsState) -> &'a [f64] {
        state.inner.position()
    }
}

impl KernelSettings for NutsSettings {
    type Kernel = NutsKernel;

    fn build(&self, density: Arc<dyn LogDensity>) -> NutsKernel {
        let dim = density.dim();
        NutsKernel {
            hamiltonian: EuclideanHamiltonian::new(
                density,
                DiagMassMatrix::new(dim),
                self.max_energy_error,
                self.adapt_options.dual_average.initial_step,
            ),
            options: NutsOptions {
                maxdepth: self.maxdepth,
            },
        }
    }

    fn window_adaptation<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        density: Arc<dyn LogDensity>,
        position: &[f64],
        num_steps: u64,
    ) -> Result<(NutsKernel, NutsState), NutsError> {
        let num_steps = num_steps.max(1);
        let dim = density.dim();
        let mut kernel = self.build(density);
        let mut state = kernel.hamiltonian.init_state(position)?;

        let mut adapt = WindowAdaptation::new(self.adapt_options, num_steps, dim);
        let mut observer = adapt.new_observer();
        adapt.init(&mut kernel.hamiltonian, &state);

        let mut divergences = 0u64;
        for idx in 0..num_steps {
            let (next, stats) =
                kernel.transition(rng, &state, &mut observer, |c| c.acceptance.mean.current())?;
            if stats.diverging() {
                divergences += 1;
            }
            adapt.adapt(&mut kernel.hamiltonian, idx, &observer);
            state = next;
        }
        adapt.finalize(&mut kernel.hamiltonian);

        log::info!(
            "warmup finished after {num_steps} steps with step size {:.4} and {divergences} divergences",
            kernel.hamiltonian.step_size
        );
        Ok((kernel, NutsState { inner: state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::test_densities::NormalDensity;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn warmup_then_sample() {
        let density: Arc<dyn LogDensity> = Arc::new(NormalDensity::new(-1., 4));
        let settings = NutsSettings::default();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let (mut kernel, mut state) = settings
            .window_adaptation(&mut rng, density, &[0.; 4], 200)
            .unwrap();
        assert!(kernel.step_size() > 0.1);
        assert!(kernel.mass_matrix_inv().iter().all(|v| *v > 0.));

        let mut mean = 0.;
        let n = 500;
        for _ in 0..n {
            let (next, stats) = kernel.step(&mut rng, &state).unwrap();
            assert!(!stats.diverging());
            mean += kernel.position(&next)[0] / n as f64;
            state = next;
        }
        assert!((mean + 1.).abs() < 0.2, "mean {mean}");
    }

    #[test]
    fn zero_warmup_steps_still_adapts_once() {
        let density: Arc<dyn LogDensity> = Arc::new(NormalDensity::new(0., 2));
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let result = NutsSettings::default().window_adaptation(&mut rng, density, &[0.; 2], 0);
        assert!(result.is_ok());
    }

    #[test]
    fn default_kernel_starts_at_position() {
        let density: Arc<dyn LogDensity> = Arc::new(NormalDensity::new(0., 2));
        let kernel = NutsSettings::default().build(density);
        let state = kernel.init(&[0.5, 0.5]).unwrap();
        assert_eq!(kernel.position(&state), &[0.5, 0.5]);
        assert_eq!(state.logp(), -0.25);
        assert!(matches!(
            kernel.init(&[0.5]),
            Err(NutsError::DimensionMismatch { .. })
        ));
    }
}
