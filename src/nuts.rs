use thiserror::Error;

use crate::density::LogpError;
use crate::hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, State};
use crate::math::logaddexp;

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("log density failed during a leapfrog step")]
    LogpFailure(#[source] LogpError),
    #[error("log density is not usable at the initial position")]
    BadInitPosition(#[source] Option<LogpError>),
    #[error("initial position has {found} entries, the log density has dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Hooks into one transition. Warmup uses them to track acceptance and
/// to keep the last draw and gradient for the mass matrix.
pub(crate) trait TrajectoryObserver {
    fn on_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn on_draw(&mut self, _state: &State, _info: &DrawInfo) {}
    fn on_start(&mut self, _state: &State, _options: &NutsOptions) {}
}

#[derive(Debug)]
pub(crate) struct DrawInfo {
    /// Doublings before the trajectory stopped.
    pub depth: u64,
    pub divergence_info: Option<DivergenceInfo>,
    pub reached_maxdepth: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NutsOptions {
    pub maxdepth: u64,
}

/// A contiguous stretch of `2^depth` leapfrog states.
///
/// `left` is the earliest state in integration time, `right` the latest.
/// Backward steps grow the stretch from `left`, forward steps from
/// `right`.
struct Subtree {
    left: State,
    right: State,
    /// Multinomial pick among the states between `left` and `right`.
    draw: State,
    /// Log of the summed `exp(-energy error)` over the stretch.
    log_size: f64,
    depth: u64,
    initial_energy: f64,
    /// Whether the stretch holds the starting position.
    is_main: bool,
}

enum Extension {
    Ok(Subtree),
    Err(NutsError),
    /// The no-U-turn criterion fired, the subtree must not grow further.
    Turning(Subtree),
    Diverging(Subtree, DivergenceInfo),
}

impl Subtree {
    fn new(state: State) -> Subtree {
        let initial_energy = state.energy();
        Subtree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    fn extend<R, C>(
        mut self,
        rng: &mut R,
        hamiltonian: &EuclideanHamiltonian,
        direction: Direction,
        observer: &mut C,
    ) -> Extension
    where
        R: rand::Rng + ?Sized,
        C: TrajectoryObserver,
    {
        let mut other = match self.leaf(hamiltonian, direction, observer) {
            Ok(Ok(leaf)) => leaf,
            Ok(Err(info)) => return Extension::Diverging(self, info),
            Err(err) => return Extension::Err(err),
        };

        // The new subtree has to reach our depth before the two merge.
        while other.depth < self.depth {
            other = match other.extend(rng, hamiltonian, direction, observer) {
                Extension::Ok(grown) => grown,
                Extension::Turning(_) => return Extension::Turning(self),
                Extension::Diverging(_, info) => return Extension::Diverging(self, info),
                Extension::Err(err) => return Extension::Err(err),
            };
        }

        let turning = self.u_turn(&other, direction);
        self.absorb(other, rng, direction);
        if turning {
            Extension::Turning(self)
        } else {
            Extension::Ok(self)
        }
    }

    /// Checks the merged span end to end, and for deeper trees also the
    /// two spans that straddle the seam.
    fn u_turn(&self, other: &Subtree, direction: Direction) -> bool {
        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };
        first.is_turning(last)
            || (self.depth > 0
                && (self.right.is_turning(&other.right) || self.left.is_turning(&other.left)))
    }

    /// Join a subtree of equal depth on the `direction` side. The draw
    /// moves into `other` with probability `size(other) / size(self)` for
    /// the main tree and `size(other) / size(merged)` for nested ones.
    fn absorb<R: rand::Rng + ?Sized>(
        &mut self,
        other: Subtree,
        rng: &mut R,
        direction: Direction,
    ) {
        debug_assert_eq!(self.depth, other.depth);
        let merged = logaddexp(self.log_size, other.log_size);
        let reference = if self.is_main { self.log_size } else { merged };
        let log_accept = other.log_size - reference;
        let accept = log_accept.exp();
        if log_accept >= 0. || (accept > 0. && rng.random_bool(accept)) {
            self.draw = other.draw;
        }
        match direction {
            Direction::Forward => self.right = other.right,
            Direction::Backward => self.left = other.left,
        }
        self.depth += 1;
        self.log_size = merged;
    }

    fn leaf<C: TrajectoryObserver>(
        &self,
        hamiltonian: &EuclideanHamiltonian,
        direction: Direction,
        observer: &mut C,
    ) -> Result<std::result::Result<Subtree, DivergenceInfo>> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction, self.initial_energy, observer)? {
            Ok(end) => end,
            Err(info) => return Ok(Err(info)),
        };

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(Subtree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }
}

/// One NUTS transition starting at `init`. The momentum of `init` is
/// resampled.
pub(crate) fn draw<R, C>(
    init: &mut State,
    rng: &mut R,
    hamiltonian: &EuclideanHamiltonian,
    options: &NutsOptions,
    observer: &mut C,
) -> Result<(State, DrawInfo)>
where
    R: rand::Rng + ?Sized,
    C: TrajectoryObserver,
{
    hamiltonian.randomize_momentum(init, rng);
    observer.on_start(init, options);

    let mut tree = Subtree::new(init.clone());
    let (tree, divergence_info, reached_maxdepth) = loop {
        if tree.depth >= options.maxdepth {
            break (tree, None, true);
        }
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, observer) {
            Extension::Ok(tree) => tree,
            Extension::Turning(tree) => break (tree, None, false),
            Extension::Diverging(tree, info) => break (tree, Some(info), false),
            Extension::Err(err) => return Err(err),
        };
    };
    let info = DrawInfo {
        depth: tree.depth,
        divergence_info,
        reached_maxdepth,
    };
    observer.on_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::density::test_densities::NormalDensity;
    use crate::mass_matrix::DiagMassMatrix;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct CountDraws(usize);

    impl TrajectoryObserver for CountDraws {
        fn on_draw(&mut self, _state: &State, _info: &DrawInfo) {
            self.0 += 1;
        }
    }

    #[test]
    fn draws_normal() {
        let dim = 3;
        let density = Arc::new(NormalDensity::new(2., dim));
        let hamiltonian = EuclideanHamiltonian::new(density, DiagMassMatrix::new(dim), 1000., 0.3);
        let options = NutsOptions { maxdepth: 10 };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut state = hamiltonian.init_state(&[0.; 3]).unwrap();
        let mut observer = CountDraws(0);

        let mut sum = vec![0f64; dim];
        let num_draws = 2000;
        for _ in 0..num_draws {
            let (next, info) = draw(&mut state, &mut rng, &hamiltonian, &options, &mut observer)
                .unwrap();
            assert!(info.divergence_info.is_none());
            assert!(info.depth >= 1);
            sum.iter_mut().zip(next.position()).for_each(|(s, x)| *s += x);
            state = next;
        }
        assert_eq!(observer.0, num_draws);
        for s in sum {
            let mean = s / num_draws as f64;
            assert!((mean - 2.).abs() < 0.15, "mean {mean}");
        }
    }

    #[test]
    fn maxdepth_limits_tree() {
        let density = Arc::new(NormalDensity::new(0., 2));
        let hamiltonian = EuclideanHamiltonian::new(density, DiagMassMatrix::new(2), 1000., 1e-4);
        let options = NutsOptions { maxdepth: 3 };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut state = hamiltonian.init_state(&[1., -1.]).unwrap();
        let (_, info) =
            draw(&mut state, &mut rng, &hamiltonian, &options, &mut CountDraws(0)).unwrap();
        assert!(info.reached_maxdepth);
        assert_eq!(info.depth, 3);
    }
}
