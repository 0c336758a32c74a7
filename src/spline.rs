//! Clamped B-spline bases used as smooth feature matrices.

use faer::Mat;

use crate::error::ConfigurationError;

/// `k` B-spline basis functions of the given order (degree `order - 1`)
/// with uniformly spaced interior knots, clamped at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplineBasis {
    k: usize,
    order: usize,
}

impl SplineBasis {
    pub fn new(k: usize, order: usize) -> Result<Self, ConfigurationError> {
        if order == 0 || k < order {
            return Err(ConfigurationError::InvalidOption(format!(
                "spline basis needs 1 <= order <= k (got order {order}, k {k})"
            )));
        }
        Ok(SplineBasis { k, order })
    }

    pub fn num_basis(&self) -> usize {
        self.k
    }

    fn knots(&self, lower: f64, upper: f64) -> Vec<f64> {
        let interior = self.k - self.order;
        let mut knots = vec![lower; self.order];
        let width = (upper - lower) / (interior + 1) as f64;
        knots.extend((1..=interior).map(|i| lower + width * i as f64));
        knots.extend(std::iter::repeat(upper).take(self.order));
        knots
    }

    /// Values of all basis functions of order `order` at `t`, by the
    /// Cox-de Boor recursion.
    fn eval(knots: &[f64], order: usize, t: f64, upper: f64) -> Vec<f64> {
        let n = knots.len() - 1;
        let mut basis: Vec<f64> = (0..n)
            .map(|i| {
                let (lo, hi) = (knots[i], knots[i + 1]);
                // The right end belongs to the last non-empty interval.
                let inside = (lo <= t && t < hi) || (t == upper && hi == upper && lo < hi);
                if inside {
                    1.
                } else {
                    0.
                }
            })
            .collect();
        for p in 2..=order {
            let next: Vec<f64> = (0..n + 1 - p)
                .map(|i| {
                    let left_den = knots[i + p - 1] - knots[i];
                    let right_den = knots[i + p] - knots[i + 1];
                    let left = if left_den > 0. {
                        (t - knots[i]) / left_den * basis[i]
                    } else {
                        0.
                    };
                    let right = if right_den > 0. {
                        (knots[i + p] - t) / right_den * basis[i + 1]
                    } else {
                        0.
                    };
                    left + right
                })
                .collect();
            basis = next;
        }
        basis
    }

    fn range(times: &[f64]) -> (f64, f64) {
        let lower = times.iter().copied().fold(f64::INFINITY, f64::min);
        let upper = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if upper > lower {
            (lower, upper)
        } else {
            (lower, lower + 1.)
        }
    }

    /// Basis matrix with one row per time point. The knots span the range
    /// of `times`.
    pub fn matrix(&self, times: &[f64]) -> Mat<f64> {
        let (lower, upper) = Self::range(times);
        let knots = self.knots(lower, upper);
        let mut out = Mat::<f64>::zeros(times.len(), self.k);
        for (row, &t) in times.iter().enumerate() {
            for (col, val) in Self::eval(&knots, self.order, t, upper)
                .into_iter()
                .enumerate()
            {
                out[(row, col)] = val;
            }
        }
        out
    }

    /// Time derivative of [`SplineBasis::matrix`].
    pub fn derivative(&self, times: &[f64]) -> Mat<f64> {
        let mut out = Mat::<f64>::zeros(times.len(), self.k);
        if self.order < 2 {
            return out;
        }
        let (lower, upper) = Self::range(times);
        let knots = self.knots(lower, upper);
        let p = self.order;
        for (row, &t) in times.iter().enumerate() {
            let lower_order = Self::eval(&knots, p - 1, t, upper);
            for col in 0..self.k {
                let left_den = knots[col + p - 1] - knots[col];
                let right_den = knots[col + p] - knots[col + 1];
                let mut val = 0.;
                if left_den > 0. {
                    val += lower_order[col] / left_den;
                }
                if right_den > 0. {
                    val -= lower_order[col + 1] / right_den;
                }
                out[(row, col)] = (p - 1) as f64 * val;
            }
        }
        out
    }
}

/// Integer time points `0..len` as floats.
pub fn time_points(len: usize) -> Vec<f64> {
    (0..len).map(|t| t as f64).collect()
}
