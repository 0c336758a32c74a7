//! Densities and samplers for the primitives used by the generative models.
//!
//! Latent priors are described by [`Prior`], observation models by
//! [`Likelihood`]. Matrices are `time x variant`; flattened values are
//! row-major.

use std::f64::consts::LN_2;

use faer::Mat;
use rand::Rng;
use rand_distr::{Beta, Binomial, Cauchy, Distribution, Exp, Gamma, Normal, Poisson};
use statrs::distribution::{self as stats, Continuous, Discrete};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("invalid parameters for {0} distribution")]
    InvalidParameters(&'static str),
    #[error("observed values have shape {observed:?}, expected {expected:?}")]
    ShapeMismatch {
        observed: Vec<usize>,
        expected: Vec<usize>,
    },
}

impl From<stats::NormalError> for DistributionError {
    fn from(_: stats::NormalError) -> Self {
        DistributionError::InvalidParameters("normal")
    }
}

impl From<stats::CauchyError> for DistributionError {
    fn from(_: stats::CauchyError) -> Self {
        DistributionError::InvalidParameters("cauchy")
    }
}

impl From<stats::ExpError> for DistributionError {
    fn from(_: stats::ExpError) -> Self {
        DistributionError::InvalidParameters("exponential")
    }
}

impl From<stats::BetaError> for DistributionError {
    fn from(_: stats::BetaError) -> Self {
        DistributionError::InvalidParameters("beta")
    }
}

impl From<stats::PoissonError> for DistributionError {
    fn from(_: stats::PoissonError) -> Self {
        DistributionError::InvalidParameters("poisson")
    }
}

impl From<stats::NegativeBinomialError> for DistributionError {
    fn from(_: stats::NegativeBinomialError) -> Self {
        DistributionError::InvalidParameters("negative binomial")
    }
}

/// Support of a latent variable, used to pick an unconstraining transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    Positive,
    UnitInterval,
}

fn softplus(x: f64) -> f64 {
    if x > 30. {
        x
    } else {
        x.exp().ln_1p()
    }
}

impl Support {
    /// Map an unconstrained value into the support.
    ///
    /// Returns the constrained value and the log absolute Jacobian of the
    /// transform.
    pub fn constrain(self, x: f64) -> (f64, f64) {
        match self {
            Support::Real => (x, 0.),
            Support::Positive => (x.exp(), x),
            Support::UnitInterval => {
                let y = 1. / (1. + (-x).exp());
                (y, -softplus(-x) - softplus(x))
            }
        }
    }

    pub fn unconstrain(self, y: f64) -> f64 {
        match self {
            Support::Real => y,
            Support::Positive => y.ln(),
            Support::UnitInterval => (y / (1. - y)).ln(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Normal { loc: f64, scale: f64 },
    HalfNormal { scale: f64 },
    HalfCauchy { scale: f64 },
    Exponential { rate: f64 },
    Beta { alpha: f64, beta: f64 },
    /// Gaussian random walk along the last axis of the site shape.
    /// The first step is drawn around zero.
    GaussianRandomWalk { scale: f64 },
}

/// Density of a distribution symmetric around zero, folded onto the
/// positive half-line.
fn folded(x: f64, ln_pdf: f64) -> f64 {
    if x < 0. {
        f64::NEG_INFINITY
    } else {
        LN_2 + ln_pdf
    }
}

impl Prior {
    pub fn support(&self) -> Support {
        match self {
            Prior::Normal { .. } | Prior::GaussianRandomWalk { .. } => Support::Real,
            Prior::HalfNormal { .. } | Prior::HalfCauchy { .. } | Prior::Exponential { .. } => {
                Support::Positive
            }
            Prior::Beta { .. } => Support::UnitInterval,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Prior::Normal { .. } => "normal",
            Prior::HalfNormal { .. } => "half-normal",
            Prior::HalfCauchy { .. } => "half-cauchy",
            Prior::Exponential { .. } => "exponential",
            Prior::Beta { .. } => "beta",
            Prior::GaussianRandomWalk { .. } => "gaussian random walk",
        }
    }

    /// Joint log density of `values`, laid out row-major with `shape`.
    pub fn log_prob(&self, values: &[f64], shape: &[usize]) -> Result<f64, DistributionError> {
        let lp = match *self {
            Prior::Normal { loc, scale } => {
                let dist = stats::Normal::new(loc, scale)?;
                values.iter().map(|&x| dist.ln_pdf(x)).sum()
            }
            Prior::HalfNormal { scale } => {
                let dist = stats::Normal::new(0., scale)?;
                values.iter().map(|&x| folded(x, dist.ln_pdf(x))).sum()
            }
            Prior::HalfCauchy { scale } => {
                let dist = stats::Cauchy::new(0., scale)?;
                values.iter().map(|&x| folded(x, dist.ln_pdf(x))).sum()
            }
            Prior::Exponential { rate } => {
                let dist = stats::Exp::new(rate)?;
                values.iter().map(|&x| dist.ln_pdf(x)).sum()
            }
            Prior::Beta { alpha, beta } => {
                let dist = stats::Beta::new(alpha, beta)?;
                values.iter().map(|&x| dist.ln_pdf(x)).sum()
            }
            Prior::GaussianRandomWalk { scale } => {
                let steps = shape.last().copied().unwrap_or(1);
                if steps == 0 {
                    return Ok(0.);
                }
                let increment = stats::Normal::new(0., scale)?;
                values
                    .chunks(steps)
                    .map(|walk| {
                        let mut prev = 0.;
                        walk.iter()
                            .map(|&x| {
                                let lp = increment.ln_pdf(x - prev);
                                prev = x;
                                lp
                            })
                            .sum::<f64>()
                    })
                    .sum()
            }
        };
        Ok(lp)
    }

    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        shape: &[usize],
    ) -> Result<Vec<f64>, DistributionError> {
        let n: usize = shape.iter().product();
        let invalid = || DistributionError::InvalidParameters(self.name());
        let values = match *self {
            Prior::Normal { loc, scale } => {
                let dist = Normal::new(loc, scale).map_err(|_| invalid())?;
                dist.sample_iter(&mut *rng).take(n).collect()
            }
            Prior::HalfNormal { scale } => {
                let dist = Normal::new(0., scale).map_err(|_| invalid())?;
                (0..n).map(|_| dist.sample(rng).abs()).collect()
            }
            Prior::HalfCauchy { scale } => {
                let dist = Cauchy::new(0., scale).map_err(|_| invalid())?;
                (0..n).map(|_| dist.sample(rng).abs()).collect()
            }
            Prior::Exponential { rate } => {
                let dist = Exp::new(rate).map_err(|_| invalid())?;
                dist.sample_iter(&mut *rng).take(n).collect()
            }
            Prior::Beta { alpha, beta } => {
                let dist = Beta::new(alpha, beta).map_err(|_| invalid())?;
                dist.sample_iter(&mut *rng).take(n).collect()
            }
            Prior::GaussianRandomWalk { scale } => {
                let dist = Normal::new(0., scale).map_err(|_| invalid())?;
                let steps = shape.last().copied().unwrap_or(1).max(1);
                let mut values: Vec<f64> = dist.sample_iter(&mut *rng).take(n).collect();
                for walk in values.chunks_mut(steps) {
                    for i in 1..walk.len() {
                        walk[i] += walk[i - 1];
                    }
                }
                values
            }
        };
        Ok(values)
    }
}

/// Observed data handed to a likelihood. NaN entries mark missing values.
#[derive(Debug, Clone, Copy)]
pub enum Observed<'a> {
    Vector(&'a [f64]),
    Matrix(&'a Mat<f64>),
}

impl Observed<'_> {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Observed::Vector(v) => vec![v.len()],
            Observed::Matrix(m) => vec![m.nrows(), m.ncols()],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Likelihood<'a> {
    /// Negative binomial parameterised by mean and concentration.
    NegativeBinomial { mean: &'a [f64], concentration: f64 },
    Poisson { rate: &'a [f64] },
    DirichletMultinomial {
        concentration: &'a Mat<f64>,
        total_count: &'a [f64],
    },
    Multinomial {
        probs: &'a Mat<f64>,
        total_count: &'a [f64],
    },
}

fn as_count(k: f64) -> Option<u64> {
    (k >= 0. && k.fract() == 0.).then_some(k as u64)
}

/// Point mass at zero, the limit of both count families as the mean
/// vanishes.
fn degenerate_lpmf(k: u64) -> f64 {
    if k == 0 {
        0.
    } else {
        f64::NEG_INFINITY
    }
}

/// Negative binomial log mass parameterised by mean and concentration.
pub fn negative_binomial_lpmf(
    k: f64,
    mean: f64,
    concentration: f64,
) -> Result<f64, DistributionError> {
    let Some(k) = as_count(k) else {
        return Ok(f64::NEG_INFINITY);
    };
    if mean == 0. {
        return Ok(degenerate_lpmf(k));
    }
    let p = concentration / (concentration + mean);
    Ok(stats::NegativeBinomial::new(concentration, p)?.ln_pmf(k))
}

pub fn poisson_lpmf(k: f64, rate: f64) -> Result<f64, DistributionError> {
    let Some(k) = as_count(k) else {
        return Ok(f64::NEG_INFINITY);
    };
    if rate == 0. {
        return Ok(degenerate_lpmf(k));
    }
    Ok(stats::Poisson::new(rate)?.ln_pmf(k))
}

pub fn dirichlet_multinomial_lpmf(counts: &[f64], alpha: &[f64]) -> f64 {
    let total: f64 = counts.iter().sum();
    let alpha_sum: f64 = alpha.iter().sum();
    let terms: f64 = counts
        .iter()
        .zip(alpha)
        .map(|(&n, &a)| ln_gamma(n + a) - ln_gamma(a) - ln_gamma(n + 1.))
        .sum();
    ln_gamma(alpha_sum) - ln_gamma(total + alpha_sum) + ln_gamma(total + 1.) + terms
}

pub fn multinomial_lpmf(counts: &[f64], probs: &[f64]) -> f64 {
    let total: f64 = counts.iter().sum();
    let terms: f64 = counts
        .iter()
        .zip(probs)
        .map(|(&n, &p)| if n == 0. { 0. } else { n * p.ln() } - ln_gamma(n + 1.))
        .sum();
    ln_gamma(total + 1.) + terms
}

fn row(mat: &Mat<f64>, t: usize) -> Vec<f64> {
    (0..mat.ncols()).map(|v| mat[(t, v)]).collect()
}

fn total_or_zero(total: f64) -> u64 {
    if total.is_finite() && total > 0. {
        total.round() as u64
    } else {
        0
    }
}

/// Multinomial draw by sequential conditional binomials.
fn sample_multinomial<R: Rng + ?Sized>(
    rng: &mut R,
    n: u64,
    probs: &[f64],
) -> Result<Vec<f64>, DistributionError> {
    let mut remaining = n;
    let mut mass: f64 = probs.iter().sum();
    let mut out = vec![0f64; probs.len()];
    for (i, &p) in probs.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if i + 1 == probs.len() {
            out[i] = remaining as f64;
            break;
        }
        let q = if mass > 0. { (p / mass).clamp(0., 1.) } else { 0. };
        let draw = Binomial::new(remaining, q)
            .map_err(|_| DistributionError::InvalidParameters("binomial"))?
            .sample(rng);
        out[i] = draw as f64;
        remaining -= draw;
        mass -= p;
    }
    Ok(out)
}

impl Likelihood<'_> {
    fn name(&self) -> &'static str {
        match self {
            Likelihood::NegativeBinomial { .. } => "negative binomial",
            Likelihood::Poisson { .. } => "poisson",
            Likelihood::DirichletMultinomial { .. } => "dirichlet-multinomial",
            Likelihood::Multinomial { .. } => "multinomial",
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Likelihood::NegativeBinomial { mean, .. } => vec![mean.len()],
            Likelihood::Poisson { rate } => vec![rate.len()],
            Likelihood::DirichletMultinomial { concentration, .. } => {
                vec![concentration.nrows(), concentration.ncols()]
            }
            Likelihood::Multinomial { probs, .. } => vec![probs.nrows(), probs.ncols()],
        }
    }

    /// Log likelihood of `observed`. Missing entries (NaN counts, or a NaN
    /// total for a multinomial row) carry zero weight.
    pub fn log_prob(&self, observed: Observed<'_>) -> Result<f64, DistributionError> {
        let expected = self.shape();
        let mismatch = || DistributionError::ShapeMismatch {
            observed: observed.shape(),
            expected: expected.clone(),
        };
        if observed.shape() != expected {
            return Err(mismatch());
        }
        let lp = match (self, observed) {
            (Likelihood::NegativeBinomial { mean, concentration }, Observed::Vector(obs)) => obs
                .iter()
                .zip(mean.iter())
                .filter(|(k, _)| !k.is_nan())
                .map(|(&k, &mu)| negative_binomial_lpmf(k, mu, *concentration))
                .sum::<Result<f64, _>>()?,
            (Likelihood::Poisson { rate }, Observed::Vector(obs)) => obs
                .iter()
                .zip(rate.iter())
                .filter(|(k, _)| !k.is_nan())
                .map(|(&k, &lam)| poisson_lpmf(k, lam))
                .sum::<Result<f64, _>>()?,
            (
                Likelihood::DirichletMultinomial {
                    concentration,
                    total_count,
                },
                Observed::Matrix(obs),
            ) => (0..obs.nrows())
                .filter(|&t| total_count[t].is_finite())
                .map(|t| (row(obs, t), t))
                .filter(|(counts, _)| counts.iter().all(|c| c.is_finite()))
                .map(|(counts, t)| dirichlet_multinomial_lpmf(&counts, &row(concentration, t)))
                .sum(),
            (Likelihood::Multinomial { probs, total_count }, Observed::Matrix(obs)) => (0..obs
                .nrows())
                .filter(|&t| total_count[t].is_finite())
                .map(|t| (row(obs, t), t))
                .filter(|(counts, _)| counts.iter().all(|c| c.is_finite()))
                .map(|(counts, t)| multinomial_lpmf(&counts, &row(probs, t)))
                .sum(),
            _ => return Err(mismatch()),
        };
        Ok(lp)
    }

    /// Draw a full set of observations, row-major.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f64>, DistributionError> {
        let invalid = || DistributionError::InvalidParameters(self.name());
        match *self {
            Likelihood::NegativeBinomial {
                mean,
                concentration,
            } => mean
                .iter()
                .map(|&mu| {
                    if !(mu > 0.) {
                        return Ok(0.);
                    }
                    let lam = Gamma::new(concentration, mu / concentration)
                        .map_err(|_| invalid())?
                        .sample(rng);
                    sample_poisson(rng, lam).ok_or_else(invalid)
                })
                .collect(),
            Likelihood::Poisson { rate } => rate
                .iter()
                .map(|&lam| sample_poisson(rng, lam).ok_or_else(invalid))
                .collect(),
            Likelihood::DirichletMultinomial {
                concentration,
                total_count,
            } => {
                let mut out = Vec::with_capacity(concentration.nrows() * concentration.ncols());
                for t in 0..concentration.nrows() {
                    let alpha = row(concentration, t);
                    let mut probs = alpha
                        .iter()
                        .map(|&a| {
                            Gamma::new(a, 1.)
                                .map(|g| g.sample(rng))
                                .map_err(|_| invalid())
                        })
                        .collect::<Result<Vec<f64>, _>>()?;
                    if !(probs.iter().sum::<f64>() > 0.) {
                        probs = alpha;
                    }
                    out.extend(sample_multinomial(rng, total_or_zero(total_count[t]), &probs)?);
                }
                Ok(out)
            }
            Likelihood::Multinomial { probs, total_count } => {
                let mut out = Vec::with_capacity(probs.nrows() * probs.ncols());
                for t in 0..probs.nrows() {
                    out.extend(sample_multinomial(
                        rng,
                        total_or_zero(total_count[t]),
                        &row(probs, t),
                    )?);
                }
                Ok(out)
            }
        }
    }
}

fn sample_poisson<R: Rng + ?Sized>(rng: &mut R, lam: f64) -> Option<f64> {
    if lam == 0. {
        return Some(0.);
    }
    Poisson::new(lam).ok().map(|dist| dist.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn scalar_densities() {
        let normal = Prior::Normal { loc: 1., scale: 2. };
        assert_abs_diff_eq!(
            normal.log_prob(&[1.], &[1]).unwrap(),
            -(2f64.ln()) - 0.5 * (2. * PI).ln(),
            epsilon = 1e-12
        );
        let exp = Prior::Exponential { rate: 2. };
        assert_abs_diff_eq!(exp.log_prob(&[0.5], &[1]).unwrap(), 2f64.ln() - 1., epsilon = 1e-12);
        assert_eq!(exp.log_prob(&[-0.5], &[1]).unwrap(), f64::NEG_INFINITY);
        // Beta(1, 1) is uniform
        let beta = Prior::Beta { alpha: 1., beta: 1. };
        assert_abs_diff_eq!(beta.log_prob(&[0.3, 0.9], &[2]).unwrap(), 0., epsilon = 1e-12);
        let half_cauchy = Prior::HalfCauchy { scale: 1. };
        assert_abs_diff_eq!(
            half_cauchy.log_prob(&[0.], &[1]).unwrap(),
            (2. / PI).ln(),
            epsilon = 1e-12
        );
        let half_normal = Prior::HalfNormal { scale: 1. };
        assert_abs_diff_eq!(
            half_normal.log_prob(&[0.], &[1]).unwrap(),
            (2. / PI).ln() / 2.,
            epsilon = 1e-12
        );
        assert_eq!(half_normal.log_prob(&[-1.], &[1]).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn invalid_parameters_are_errors() {
        assert_eq!(
            Prior::Normal { loc: 0., scale: -1. }.log_prob(&[0.], &[1]),
            Err(DistributionError::InvalidParameters("normal"))
        );
        assert_eq!(
            Prior::Exponential { rate: 0. }.log_prob(&[1.], &[1]),
            Err(DistributionError::InvalidParameters("exponential"))
        );
        assert_eq!(
            poisson_lpmf(1., f64::NAN),
            Err(DistributionError::InvalidParameters("poisson"))
        );
        let rate = [-2.];
        let lik = Likelihood::Poisson { rate: &rate };
        assert!(lik.log_prob(Observed::Vector(&[1.])).is_err());
    }

    #[test]
    fn random_walk_density_uses_increments() {
        let grw = Prior::GaussianRandomWalk { scale: 1. };
        let normal = Prior::Normal { loc: 0., scale: 1. };
        let walk = [0.5, 1.0, 0.0];
        let increments = [0.5, 0.5, -1.0];
        assert_abs_diff_eq!(
            grw.log_prob(&walk, &[3]).unwrap(),
            normal.log_prob(&increments, &[3]).unwrap(),
            epsilon = 1e-12
        );
        // Two independent walks of length two.
        assert_abs_diff_eq!(
            grw.log_prob(&[1., 1., 2., 2.], &[2, 2]).unwrap(),
            normal.log_prob(&[1., 0., 2., 0.], &[4]).unwrap(),
            epsilon = 1e-12
        );
        assert_eq!(grw.log_prob(&[], &[0, 5]), Ok(0.));
    }

    #[test]
    fn transforms_invert() {
        for support in [Support::Real, Support::Positive, Support::UnitInterval] {
            for x in [-3., -0.2, 0., 1.7] {
                let (y, _) = support.constrain(x);
                assert_abs_diff_eq!(support.unconstrain(y), x, epsilon = 1e-9);
            }
        }
        // d/dx sigmoid(x) at 0 is 1/4
        let (_, log_jac) = Support::UnitInterval.constrain(0.);
        assert_abs_diff_eq!(log_jac, 0.25f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn count_densities() {
        // Large concentration approaches poisson
        assert_abs_diff_eq!(
            negative_binomial_lpmf(3., 2.5, 1e6).unwrap(),
            poisson_lpmf(3., 2.5).unwrap(),
            epsilon = 1e-4
        );
        assert_eq!(poisson_lpmf(0., 0.), Ok(0.));
        assert_eq!(poisson_lpmf(2., 0.), Ok(f64::NEG_INFINITY));
        assert_eq!(negative_binomial_lpmf(1.5, 2., 3.), Ok(f64::NEG_INFINITY));
        // DirMult with alpha = (1, 1) is uniform over the N + 1 splits
        assert_abs_diff_eq!(
            dirichlet_multinomial_lpmf(&[2., 3.], &[1., 1.]),
            -(6f64.ln()),
            epsilon = 1e-10
        );
    }

    #[test]
    fn multinomial_families_match_binomial() {
        let binomial = stats::Binomial::new(0.3, 7).unwrap();
        for k in 0..=7u64 {
            let counts = [k as f64, (7 - k) as f64];
            assert_abs_diff_eq!(
                multinomial_lpmf(&counts, &[0.3, 0.7]),
                binomial.ln_pmf(k),
                epsilon = 1e-10
            );
            // A very concentrated Dirichlet collapses onto its mean.
            assert_abs_diff_eq!(
                dirichlet_multinomial_lpmf(&counts, &[0.3e7, 0.7e7]),
                binomial.ln_pmf(k),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn missing_entries_have_zero_weight() {
        let mean = [2., 3., 4.];
        let lik = Likelihood::NegativeBinomial {
            mean: &mean,
            concentration: 10.,
        };
        let full = lik.log_prob(Observed::Vector(&[1., 5., 2.])).unwrap();
        let masked = lik.log_prob(Observed::Vector(&[1., f64::NAN, 2.])).unwrap();
        assert_abs_diff_eq!(
            full - masked,
            negative_binomial_lpmf(5., 3., 10.).unwrap(),
            epsilon = 1e-10
        );

        let probs = Mat::from_fn(2, 2, |_, _| 0.5);
        let counts = Mat::from_fn(2, 2, |t, _| if t == 0 { f64::NAN } else { 1. });
        let total = [f64::NAN, 2.];
        let lik = Likelihood::Multinomial {
            probs: &probs,
            total_count: &total,
        };
        assert_abs_diff_eq!(
            lik.log_prob(Observed::Matrix(&counts)).unwrap(),
            0.5f64.ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn shape_is_checked() {
        let mean = [2., 3.];
        let lik = Likelihood::Poisson { rate: &mean };
        assert!(matches!(
            lik.log_prob(Observed::Vector(&[1.])),
            Err(DistributionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn sampled_counts_respect_totals() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let alpha = Mat::from_fn(4, 3, |_, v| (v + 1) as f64);
        let total = [10., 0., f64::NAN, 25.];
        let lik = Likelihood::DirichletMultinomial {
            concentration: &alpha,
            total_count: &total,
        };
        let draws = lik.sample(&mut rng).unwrap();
        assert_eq!(draws.len(), 12);
        let sums: Vec<f64> = draws.chunks(3).map(|r| r.iter().sum()).collect();
        assert_eq!(sums, vec![10., 0., 0., 25.]);
        assert!(draws.iter().all(|&c| c >= 0. && c.fract() == 0.));

        let walk = Prior::GaussianRandomWalk { scale: 0.1 }
            .sample(&mut rng, &[2, 5])
            .unwrap();
        assert_eq!(walk.len(), 10);
    }
}
