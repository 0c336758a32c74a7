use std::sync::Arc;

use rand_distr::{Distribution, StandardUniform};

use crate::density::{LogDensity, LogpError};
use crate::mass_matrix::DiagMassMatrix;
use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};
use crate::nuts::{NutsError, TrajectoryObserver};

/// Why a leapfrog step was rejected as divergent. Either the energy error
/// left `[-max_energy_error, max_energy_error]` (`energy_error` is set) or
/// the log density failed recoverably at the new position
/// (`logp_function_error` is set).
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_location: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<LogpError>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Position `q`, momentum `p` and velocity `v = M^-1 p` of one leapfrog
/// state. `p_sum` is the summed momentum between the trajectory start and
/// this state, which the U-turn check needs.
#[derive(Debug, Clone)]
pub(crate) struct State {
    pub(crate) q: Box<[f64]>,
    pub(crate) p: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

impl State {
    fn new(dim: usize) -> Self {
        State {
            q: vec![0.; dim].into(),
            p: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            p_sum: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
        }
    }

    /// Negative log density plus kinetic energy.
    pub(crate) fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub(crate) fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub(crate) fn position(&self) -> &[f64] {
        &self.q
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&self.grad, &self.p, epsilon / 2., &mut out.p);
    }

    fn position_step(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.grad, &mut self.p, epsilon / 2.);
    }

    fn set_psum(&self, out: &mut Self) {
        if out.idx_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
        }
    }
}

/// Potential `-logp(q)` with kinetic energy `p^T M^-1 p / 2` for a
/// diagonal mass matrix `M`.
pub(crate) struct EuclideanHamiltonian {
    density: Arc<dyn LogDensity>,
    pub(crate) mass_matrix: DiagMassMatrix,
    max_energy_error: f64,
    pub(crate) step_size: f64,
}

impl EuclideanHamiltonian {
    pub(crate) fn new(
        density: Arc<dyn LogDensity>,
        mass_matrix: DiagMassMatrix,
        max_energy_error: f64,
        step_size: f64,
    ) -> Self {
        EuclideanHamiltonian {
            density,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.density.dim()
    }

    /// One step of size `step_size` in direction `dir`. The inner result is
    /// `Err` for a divergence, the outer one for a log density failure that
    /// cannot be treated as one.
    pub(crate) fn leapfrog<C: TrajectoryObserver>(
        &self,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        observer: &mut C,
    ) -> Result<Result<State, DivergenceInfo>, NutsError> {
        let mut out = start.clone();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.mass_matrix.update_velocity(&mut out);

        start.position_step(&mut out, epsilon);
        if let Err(logp_error) = self.update_potential_gradient(&mut out) {
            if !logp_error.is_recoverable() {
                return Err(NutsError::LogpFailure(logp_error));
            }
            let div_info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: None,
                energy_error: None,
                end_idx_in_trajectory: None,
                logp_function_error: Some(Arc::new(logp_error)),
            };
            observer.on_leapfrog(start, &out, Some(&div_info));
            return Ok(Err(div_info));
        }

        out.second_momentum_halfstep(epsilon);

        self.mass_matrix.update_velocity(&mut out);
        self.mass_matrix.update_kinetic_energy(&mut out);

        out.idx_in_trajectory = start.idx_in_trajectory + sign;
        start.set_psum(&mut out);

        let energy_error = out.energy() - initial_energy;
        if (energy_error.abs() > self.max_energy_error) | !energy_error.is_finite() {
            let div_info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                energy_error: Some(energy_error),
                end_idx_in_trajectory: Some(out.idx_in_trajectory),
                logp_function_error: None,
            };
            observer.on_leapfrog(start, &out, Some(&div_info));
            return Ok(Err(div_info));
        }

        observer.on_leapfrog(start, &out, None);

        Ok(Ok(out))
    }

    /// State at `init` with zero momentum.
    pub(crate) fn init_state(&self, init: &[f64]) -> Result<State, NutsError> {
        if init.len() != self.dim() {
            return Err(NutsError::DimensionMismatch {
                expected: self.dim(),
                found: init.len(),
            });
        }
        if init.iter().any(|x| !x.is_finite()) {
            return Err(NutsError::BadInitPosition(None));
        }
        let mut state = State::new(self.dim());
        state.q.copy_from_slice(init);
        self.update_potential_gradient(&mut state)
            .map_err(|err| NutsError::BadInitPosition(Some(err)))?;
        Ok(state)
    }

    /// Fresh momentum; `state` becomes index zero of a new trajectory.
    pub(crate) fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        self.mass_matrix.randomize_momentum(state, rng);
        self.mass_matrix.update_velocity(state);
        self.mass_matrix.update_kinetic_energy(state);
        state.idx_in_trajectory = 0;
        state.p_sum.copy_from_slice(&state.p);
    }

    fn update_potential_gradient(&self, state: &mut State) -> Result<(), LogpError> {
        let logp = self.density.logp(&state.q, &mut state.grad)?;
        state.potential_energy = -logp;
        Ok(())
    }
}
