//! Forward simulation of the renewal equation.
//!
//! `incidence[t] = introductions[t] + R[t] * (g_rev . incidence[t-L..t])`,
//! with history before index zero taken as zero.

use faer::Mat;
use log::debug;

use crate::{error::ConfigurationError, math::vector_dot};

pub const PREVALENCE_FLOOR: f64 = 1e-12;
pub const PREVALENCE_CEILING: f64 = 1e32;

/// Result of a clipped simulation.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub incidence: Vec<f64>,
    /// Number of entries that were moved into `[PREVALENCE_FLOOR, PREVALENCE_CEILING]`.
    pub clipped: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RenewalSimulator<'a> {
    kernel_rev: &'a [f64],
    delays: Option<&'a [f64]>,
}

impl<'a> RenewalSimulator<'a> {
    pub fn new(kernel_rev: &'a [f64], delays: Option<&'a [f64]>) -> Self {
        RenewalSimulator { kernel_rev, delays }
    }

    /// The raw recursion without delay or clipping.
    pub fn forward(&self, intros: &[f64], r: &[f64]) -> Result<Vec<f64>, ConfigurationError> {
        let n = intros.len();
        let l = self.kernel_rev.len();
        if r.len() != n {
            return Err(ConfigurationError::ShapeMismatch {
                r: r.len(),
                intros: n,
            });
        }
        if l > n {
            return Err(ConfigurationError::KernelTooLong {
                kernel: l,
                history: n,
            });
        }

        let mut padded = vec![0f64; l + n];
        for t in 0..n {
            let force = vector_dot(self.kernel_rev, &padded[t..t + l]);
            padded[l + t] = intros[t] + r[t] * force;
        }
        Ok(padded.split_off(l))
    }

    /// Run the recursion, apply the optional delay and clip the result.
    pub fn simulate(&self, intros: &[f64], r: &[f64]) -> Result<Simulation, ConfigurationError> {
        let mut incidence = self.forward(intros, r)?;
        if let Some(delays) = self.delays {
            incidence = convolve_delays(&incidence, delays);
        }
        let clipped = clip_prevalence(&mut incidence);
        if clipped > 0 {
            debug!("clipped {clipped} of {} prevalence entries", incidence.len());
        }
        Ok(Simulation { incidence, clipped })
    }
}

/// Causal convolution truncated to the input length.
pub fn convolve_delays(incidence: &[f64], delays: &[f64]) -> Vec<f64> {
    (0..incidence.len())
        .map(|t| {
            delays
                .iter()
                .take(t + 1)
                .enumerate()
                .map(|(j, d)| d * incidence[t - j])
                .sum()
        })
        .collect()
}

pub fn clip_prevalence(values: &mut [f64]) -> usize {
    let mut clipped = 0;
    for val in values.iter_mut() {
        // NaN is mapped to the floor as well.
        if !(*val >= PREVALENCE_FLOOR) {
            *val = PREVALENCE_FLOOR;
            clipped += 1;
        } else if *val > PREVALENCE_CEILING {
            *val = PREVALENCE_CEILING;
            clipped += 1;
        }
    }
    clipped
}

/// Simulate every variant (column) independently.
///
/// `intros` and `r` are `time x variant`, `kernels` holds one reversed
/// kernel per variant.
pub fn simulate_variants(
    intros: &Mat<f64>,
    r: &Mat<f64>,
    kernels: &[Box<[f64]>],
    delays: Option<&[f64]>,
) -> Result<(Mat<f64>, usize), ConfigurationError> {
    let (n, num_variants) = (intros.nrows(), intros.ncols());
    if r.nrows() != n || r.ncols() != num_variants {
        return Err(ConfigurationError::ShapeMismatch {
            r: r.nrows(),
            intros: n,
        });
    }
    if kernels.len() != num_variants {
        return Err(ConfigurationError::InvalidData(format!(
            "{} generation kernels for {} variants",
            kernels.len(),
            num_variants
        )));
    }

    let mut out = Mat::<f64>::zeros(n, num_variants);
    let mut clipped = 0;
    for (v, kernel) in kernels.iter().enumerate() {
        let intro: Vec<f64> = (0..n).map(|t| intros[(t, v)]).collect();
        let rv: Vec<f64> = (0..n).map(|t| r[(t, v)]).collect();
        let sim = RenewalSimulator::new(kernel, delays).simulate(&intro, &rv)?;
        clipped += sim.clipped;
        for (t, val) in sim.incidence.into_iter().enumerate() {
            out[(t, v)] = val;
        }
    }
    Ok((out, clipped))
}
