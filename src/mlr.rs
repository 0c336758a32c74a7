//! Multinomial logistic regression on variant frequencies.
//!
//! Each variant's log-odds against the last variant grow linearly in time,
//! so frequencies follow `softmax(X · beta)` with `X = [1, t]`. The model
//! supplies its own log density, initial position and predictive function
//! through [`CustomBackend`].

use std::sync::Arc;

use faer::Mat;
use rand::{Rng, RngCore};
use statrs::distribution::{Continuous, Normal};
use statrs::function::gamma::ln_gamma;

use crate::data::ModelData;
use crate::density::{LogDensity, LogpError};
use crate::distributions::{DistributionError, Likelihood};
use crate::error::ConfigurationError;
use crate::model::{Backend, CustomBackend, ModelSpec};
use crate::options::{check_positive, row_major};
use crate::samples::{SampleSet, SiteDraws};
use crate::trace::{ModelError, ParameterLayout};

const BETA_SCALE: f64 = 3.;

/// Design matrix with rows `[1, t]` for `t` in `start..start + len`.
pub fn make_ols_feature(start: usize, len: usize) -> Mat<f64> {
    Mat::from_fn(len, 2, |row, col| {
        if col == 0 {
            1.
        } else {
            (start + row) as f64
        }
    })
}

/// Softmax of `features · beta` row by row.
fn frequencies(features: &Mat<f64>, beta: &Mat<f64>) -> Mat<f64> {
    let logits = features * beta;
    let mut freq = Mat::zeros(logits.nrows(), logits.ncols());
    for t in 0..logits.nrows() {
        let max = (0..logits.ncols())
            .map(|v| logits[(t, v)])
            .fold(f64::NEG_INFINITY, f64::max);
        let total: f64 = (0..logits.ncols())
            .map(|v| (logits[(t, v)] - max).exp())
            .sum();
        for v in 0..logits.ncols() {
            freq[(t, v)] = (logits[(t, v)] - max).exp() / total;
        }
    }
    freq
}

/// Coefficients `[raw_beta | 0]` with the last variant as pivot.
fn full_beta(raw: &[f64], num_features: usize, num_variants: usize) -> Mat<f64> {
    let free = num_variants - 1;
    Mat::from_fn(num_features, num_variants, |p, v| {
        if v < free {
            raw[p * free + v]
        } else {
            0.
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultinomialLogisticRegression {
    tau: f64,
}

impl MultinomialLogisticRegression {
    pub fn new(tau: f64) -> Result<Self, ConfigurationError> {
        check_positive("tau", tau)?;
        Ok(MultinomialLogisticRegression { tau })
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    fn predictive(
        tau: f64,
        rng: &mut dyn RngCore,
        samples: &SampleSet,
        data: &ModelData,
    ) -> Result<SampleSet, ModelError> {
        let features = data.features()?;
        let (num_t, num_v) = (data.num_times(), data.num_variants());
        let num_p = features.ncols();
        let raw = samples.get("raw_beta").ok_or_else(|| {
            ConfigurationError::InvalidData("samples have no raw_beta site".to_string())
        })?;
        if raw.draw_len() != num_p * (num_v - 1) {
            return Err(ModelError::SiteShape {
                site: "raw_beta".to_string(),
                expected: vec![num_p, num_v - 1],
                found: raw.shape().to_vec(),
            });
        }

        let mut beta_draws = SiteDraws::new(vec![num_p, num_v]);
        let mut freq_draws = SiteDraws::new(vec![num_t, num_v]);
        let mut ga_draws = SiteDraws::new(vec![num_v - 1]);
        let mut count_draws = SiteDraws::new(vec![num_t, num_v]);
        let invalid = |err: anyhow::Error| ConfigurationError::InvalidData(err.to_string());
        for draw in 0..raw.num_draws() {
            let Some(values) = raw.draw(draw) else {
                break;
            };
            let beta = full_beta(values, num_p, num_v);
            let freq = frequencies(features, &beta);
            let ga: Vec<f64> = (0..num_v - 1)
                .map(|v| (beta[(num_p - 1, v)] * tau).exp())
                .collect();
            let counts = Likelihood::Multinomial {
                probs: &freq,
                total_count: &data.total_counts,
            }
            .sample(&mut *rng)
            .map_err(|source| ModelError::Distribution {
                site: "seq_counts".to_string(),
                source,
            })?;
            beta_draws.push(&row_major(&beta)).map_err(invalid)?;
            freq_draws.push(&row_major(&freq)).map_err(invalid)?;
            ga_draws.push(&ga).map_err(invalid)?;
            count_draws.push(&counts).map_err(invalid)?;
        }

        let mut out = SampleSet::new();
        out.insert("beta", beta_draws);
        out.insert("freq", freq_draws);
        out.insert("ga", ga_draws);
        out.insert("seq_counts", count_draws);
        Ok(out)
    }
}

impl ModelSpec for MultinomialLogisticRegression {
    fn augment_data(&self, data: &mut ModelData) -> Result<(), ConfigurationError> {
        if data.num_variants() < 2 {
            return Err(ConfigurationError::InvalidData(
                "multinomial logistic regression needs at least two variants".to_string(),
            ));
        }
        data.augmentation.tau = Some(self.tau);
        data.augmentation.features = Some(make_ols_feature(0, data.num_times()));
        Ok(())
    }

    fn backend(&self) -> Backend {
        let tau = self.tau;
        let custom = CustomBackend::new()
            .with_log_density_generator(Box::new(|data: &ModelData| {
                let density: Arc<dyn LogDensity> = Arc::new(MlrDensity::new(data)?);
                Ok(density)
            }))
            .with_initial_position_generator(Box::new(
                |_: &mut dyn RngCore, dim: usize| -> Box<[f64]> { vec![0.; dim].into() },
            ))
            .with_predictive(Box::new(
                move |rng: &mut dyn RngCore, samples: &SampleSet, data: &ModelData| {
                    Self::predictive(tau, rng, samples, data)
                },
            ));
        Backend::Custom(Arc::new(custom))
    }
}

/// Posterior of `raw_beta ~ Normal(0, 3)` under the multinomial-logit
/// sequence likelihood, with an analytic gradient.
#[derive(Debug, Clone)]
pub struct MlrDensity {
    features: Mat<f64>,
    seq_counts: Mat<f64>,
    totals: Vec<f64>,
    /// Rows that enter the likelihood.
    observed: Vec<usize>,
    prior: Normal,
}

impl MlrDensity {
    pub fn new(data: &ModelData) -> Result<Self, ModelError> {
        let features = data.features()?.clone();
        if data.num_variants() < 2 {
            return Err(ConfigurationError::InvalidData(
                "multinomial logistic regression needs at least two variants".to_string(),
            )
            .into());
        }
        if features.nrows() != data.num_times() {
            return Err(ConfigurationError::ShapeMismatch {
                r: features.nrows(),
                intros: data.num_times(),
            }
            .into());
        }
        let seq_counts = data.seq_counts.clone();
        let observed = (0..seq_counts.nrows())
            .filter(|&t| {
                data.total_counts[t].is_finite()
                    && (0..seq_counts.ncols()).all(|v| seq_counts[(t, v)].is_finite())
            })
            .collect();
        let totals = (0..seq_counts.nrows())
            .map(|t| (0..seq_counts.ncols()).map(|v| seq_counts[(t, v)]).sum())
            .collect();
        let prior = Normal::new(0., BETA_SCALE)
            .map_err(DistributionError::from)
            .map_err(ModelError::at("raw_beta"))?;
        Ok(MlrDensity {
            features,
            seq_counts,
            totals,
            observed,
            prior,
        })
    }

    fn num_free(&self) -> usize {
        self.seq_counts.ncols() - 1
    }
}

impl LogDensity for MlrDensity {
    fn dim(&self) -> usize {
        self.features.ncols() * self.num_free()
    }

    fn logp(&self, position: &[f64], grad: &mut [f64]) -> Result<f64, LogpError> {
        let (num_p, num_v) = (self.features.ncols(), self.seq_counts.ncols());
        let free = self.num_free();
        let beta = full_beta(position, num_p, num_v);
        let freq = frequencies(&self.features, &beta);
        let logits = &self.features * &beta;

        let mut logp = 0.;
        for (g, &b) in grad.iter_mut().zip(position) {
            logp += self.prior.ln_pdf(b);
            *g = -b / BETA_SCALE.powi(2);
        }

        for &t in &self.observed {
            let lse = (0..num_v)
                .map(|v| logits[(t, v)])
                .fold(f64::NEG_INFINITY, f64::max);
            let lse = lse
                + (0..num_v)
                    .map(|v| (logits[(t, v)] - lse).exp())
                    .sum::<f64>()
                    .ln();
            logp += ln_gamma(self.totals[t] + 1.);
            for v in 0..num_v {
                let n = self.seq_counts[(t, v)];
                logp += n * (logits[(t, v)] - lse) - ln_gamma(n + 1.);
                if v < free {
                    let resid = n - self.totals[t] * freq[(t, v)];
                    for p in 0..num_p {
                        grad[p * free + v] += self.features[(t, p)] * resid;
                    }
                }
            }
        }

        if !logp.is_finite() {
            return Err(LogpError::NonFinite(logp));
        }
        if let Some(idx) = grad.iter().position(|g| !g.is_finite()) {
            return Err(LogpError::NonFiniteGradient(idx));
        }
        Ok(logp)
    }

    fn layout(&self) -> ParameterLayout {
        ParameterLayout::real("raw_beta", vec![self.features.ncols(), self.num_free()])
    }
}

/// Append `freq_forecast` for `forecast_l` days after the fitted window,
/// extrapolating every posterior `beta` draw.
pub fn forecast_frequencies(
    samples: &mut SampleSet,
    forecast_l: usize,
) -> Result<(), ConfigurationError> {
    let missing = |site: &str| ConfigurationError::InvalidData(format!("samples have no {site} site"));
    let beta = samples.get("beta").ok_or_else(|| missing("beta"))?;
    let last_t = samples
        .get("freq")
        .ok_or_else(|| missing("freq"))?
        .shape()
        .first()
        .copied()
        .unwrap_or(0);
    let &[num_p, num_v] = beta.shape() else {
        return Err(ConfigurationError::InvalidData(format!(
            "beta has shape {:?}",
            beta.shape()
        )));
    };
    let features = make_ols_feature(last_t, forecast_l);
    if features.ncols() != num_p {
        return Err(ConfigurationError::InvalidData(format!(
            "beta has {num_p} rows, expected {}",
            features.ncols()
        )));
    }
    let mut out = SiteDraws::new(vec![forecast_l, num_v]);
    for draw in 0..beta.num_draws() {
        let Some(values) = beta.draw(draw) else {
            break;
        };
        let beta_mat = Mat::from_fn(num_p, num_v, |p, v| values[p * num_v + v]);
        out.push(&row_major(&frequencies(&features, &beta_mat)))
            .map_err(|err| ConfigurationError::InvalidData(err.to_string()))?;
    }
    samples.insert("freq_forecast", out);
    Ok(())
}

/// Deterministic frequencies over `max_time` days when variant `v` has
/// growth advantage `growth_advantage[v]` at generation time `tau`.
pub fn simulate_mlr_freq(
    growth_advantage: &[f64],
    freq0: &[f64],
    tau: f64,
    max_time: usize,
) -> Result<Mat<f64>, ConfigurationError> {
    if growth_advantage.len() != freq0.len() {
        return Err(ConfigurationError::ShapeMismatch {
            r: growth_advantage.len(),
            intros: freq0.len(),
        });
    }
    check_positive("tau", tau)?;
    if let Some(&bad) = growth_advantage.iter().find(|&&ga| !(ga > 0.)) {
        return Err(ConfigurationError::InvalidOption(format!(
            "growth advantages must be positive, got {bad}"
        )));
    }
    let delta: Vec<f64> = growth_advantage.iter().map(|ga| ga.ln() / tau).collect();
    let num_v = freq0.len();
    let mut freq = Mat::from_fn(max_time, num_v, |t, v| freq0[v] * (delta[v] * t as f64).exp());
    for t in 0..max_time {
        let total: f64 = (0..num_v).map(|v| freq[(t, v)]).sum();
        for v in 0..num_v {
            freq[(t, v)] /= total;
        }
    }
    Ok(freq)
}

/// [`simulate_mlr_freq`] plus multinomial sequence counts with
/// `totals[t]` sequences on day `t`.
pub fn simulate_mlr<R: Rng + ?Sized>(
    rng: &mut R,
    growth_advantage: &[f64],
    freq0: &[f64],
    tau: f64,
    totals: &[f64],
) -> Result<(Mat<f64>, Mat<f64>), ConfigurationError> {
    let freq = simulate_mlr_freq(growth_advantage, freq0, tau, totals.len())?;
    let counts = Likelihood::Multinomial {
        probs: &freq,
        total_count: totals,
    }
    .sample(rng)
    .map_err(|err| ConfigurationError::InvalidData(err.to_string()))?;
    let num_v = freq.ncols();
    let counts = Mat::from_fn(totals.len(), num_v, |t, v| counts[t * num_v + v]);
    Ok((freq, counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn data() -> ModelData {
        let counts = Mat::from_fn(6, 3, |t, v| (1 + t * v) as f64);
        let mut data =
            ModelData::new(counts, vec!["a".into(), "b".into(), "c".into()]).unwrap();
        MultinomialLogisticRegression::new(4.)
            .unwrap()
            .augment_data(&mut data)
            .unwrap();
        data
    }

    #[test]
    fn ols_features() {
        let x = make_ols_feature(3, 2);
        assert_eq!((x[(0, 0)], x[(0, 1)], x[(1, 1)]), (1., 3., 4.));
    }

    #[test]
    fn gradient_matches_differences() {
        let density = MlrDensity::new(&data()).unwrap();
        assert_eq!(density.dim(), 4);
        let x = [0.3, -0.2, 0.1, 0.05];
        let mut grad = [0.; 4];
        let logp = density.logp(&x, &mut grad).unwrap();
        assert!(logp.is_finite());
        let h = 1e-6;
        for i in 0..4 {
            let mut up = x;
            let mut down = x;
            up[i] += h;
            down[i] -= h;
            let mut scratch = [0.; 4];
            let fd = (density.logp(&up, &mut scratch).unwrap()
                - density.logp(&down, &mut scratch).unwrap())
                / (2. * h);
            assert_abs_diff_eq!(grad[i], fd, epsilon = 1e-4);
        }
    }

    #[test]
    fn missing_rows_are_skipped() {
        let mut data = data();
        data.seq_counts[(2, 1)] = f64::NAN;
        let density = MlrDensity::new(&data).unwrap();
        assert_eq!(density.observed, vec![0, 1, 3, 4, 5]);
        let mut grad = [0.; 4];
        assert!(density.logp(&[0.; 4], &mut grad).unwrap().is_finite());
    }

    #[test]
    fn predictive_sites() {
        let data = data();
        let mut raw = SiteDraws::new(vec![2, 2]);
        raw.push(&[0., 0., 0.25, 0.]).unwrap();
        raw.push(&[0.1, 0.2, -0.1, 0.3]).unwrap();
        let mut samples = SampleSet::new();
        samples.insert("raw_beta", raw);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let out = MultinomialLogisticRegression::predictive(4., &mut rng, &samples, &data).unwrap();
        let ga = out.get("ga").unwrap();
        assert_abs_diff_eq!(ga.draw(0).unwrap()[0], 1f64.exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(ga.draw(0).unwrap()[1], 1.);
        let counts = out.get("seq_counts").unwrap().draw(1).unwrap();
        for (t, row) in counts.chunks(3).enumerate() {
            assert_eq!(row.iter().sum::<f64>(), data.total_counts[t]);
        }

        let mut merged = samples.merge_predictive(out);
        forecast_frequencies(&mut merged, 3).unwrap();
        assert_eq!(merged.get("freq_forecast").unwrap().shape(), &[3, 3]);
    }

    #[test]
    fn simulated_frequencies_follow_advantage() {
        let freq = simulate_mlr_freq(&[2., 1.], &[0.5, 0.5], 2., 5).unwrap();
        // Odds double every `tau` days.
        let odds = |t: usize| freq[(t, 0)] / freq[(t, 1)];
        assert_abs_diff_eq!(odds(4) / odds(2), 2., epsilon = 1e-12);
        assert!(simulate_mlr_freq(&[0., 1.], &[0.5, 0.5], 2., 5).is_err());

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (_, counts) = simulate_mlr(&mut rng, &[1.5, 1.], &[0.1, 0.9], 4., &[20.; 8]).unwrap();
        assert_eq!(counts.nrows(), 8);
        assert_eq!((0..2).map(|v| counts[(7, v)]).sum::<f64>(), 20.);
    }
}
