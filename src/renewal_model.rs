//! Renewal-equation model of variant-specific prevalence.

use std::sync::Arc;

use faer::Mat;
use log::warn;

use crate::data::ModelData;
use crate::distributions::Prior;
use crate::error::ConfigurationError;
use crate::generation::GenerationKernel;
use crate::model::{Backend, GenerativeModel, ModelSpec};
use crate::options::{
    row_major, CaseLikelihood, DirMultinomialSeq, GaussianRandomWalkR, NegBinomCases, RPrior,
    SeqLikelihood,
};
use crate::renewal::simulate_variants;
use crate::reporting::ReportingCycle;
use crate::spline::{time_points, SplineBasis};
use crate::trace::{Handler, ModelError};

/// Number of free reporting fractions. The seventh day is the reference.
pub const REPORTING_PARAMS: usize = 6;

#[derive(Debug, Clone)]
pub struct RenewalModel {
    generation: GenerationKernel,
    delays: Option<Box<[f64]>>,
    seed_l: usize,
    forecast_l: usize,
    k: usize,
    order: usize,
    r_prior: Arc<dyn RPrior>,
    case_likelihood: Arc<dyn CaseLikelihood>,
    seq_likelihood: Arc<dyn SeqLikelihood>,
}

impl RenewalModel {
    pub fn new(generation: GenerationKernel, seed_l: usize, forecast_l: usize) -> Self {
        RenewalModel {
            generation,
            delays: None,
            seed_l,
            forecast_l,
            k: 10,
            order: 4,
            r_prior: Arc::new(GaussianRandomWalkR::default()),
            case_likelihood: Arc::new(NegBinomCases::default()),
            seq_likelihood: Arc::new(DirMultinomialSeq::default()),
        }
    }

    pub fn with_delays(mut self, delays: Vec<f64>) -> Self {
        self.delays = Some(delays.into());
        self
    }

    /// Number of spline basis functions for the R trajectory.
    pub fn with_knots(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    pub fn with_r_prior(mut self, prior: impl RPrior + 'static) -> Self {
        self.r_prior = Arc::new(prior);
        self
    }

    pub fn with_case_likelihood(mut self, likelihood: impl CaseLikelihood + 'static) -> Self {
        self.case_likelihood = Arc::new(likelihood);
        self
    }

    pub fn with_seq_likelihood(mut self, likelihood: impl SeqLikelihood + 'static) -> Self {
        self.seq_likelihood = Arc::new(likelihood);
        self
    }

    pub fn generation(&self) -> &GenerationKernel {
        &self.generation
    }
}

/// Copy of rows `range` of `mat`.
fn take_rows(mat: &Mat<f64>, range: std::ops::Range<usize>) -> Mat<f64> {
    Mat::from_fn(range.len(), mat.ncols(), |t, v| mat[(range.start + t, v)])
}

/// `diff(log(x))` down each column with a leading NaN row.
fn log_growth(mat: &Mat<f64>) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), mat.ncols(), |t, v| {
        if t == 0 {
            f64::NAN
        } else {
            mat[(t, v)].ln() - mat[(t - 1, v)].ln()
        }
    })
}

/// Introductions on the full `seed_l + T + forecast_l` timeline.
///
/// A variant first detected on observation day `d` is seeded on the
/// `seed_l` days ending at `d`, timeline rows `d + 1..=d + seed_l`. A
/// variant that is never detected is seeded as if detected on day 0.
fn seed_introductions(
    first_detection: &[Option<usize>],
    log_i0: &[f64],
    seed_l: usize,
    total_len: usize,
) -> Mat<f64> {
    let mut intros = Mat::<f64>::zeros(total_len, first_detection.len());
    for (v, (first, log_i0)) in first_detection.iter().zip(log_i0).enumerate() {
        let magnitude = (3. * log_i0).exp();
        let first = first.unwrap_or(0);
        for day in first + 1..=first + seed_l {
            intros[(day, v)] = magnitude;
        }
    }
    intros
}

fn record_matrix(handler: &mut dyn Handler, site: &str, mat: &Mat<f64>) -> Result<(), ModelError> {
    handler.deterministic(site, &row_major(mat), &[mat.nrows(), mat.ncols()])
}

impl GenerativeModel for RenewalModel {
    fn generate(
        &self,
        data: &ModelData,
        handler: &mut dyn Handler,
        pred: bool,
    ) -> Result<(), ModelError> {
        let aug = &data.augmentation;
        let features = data.features()?;
        let kernels = data.generation_rev()?;
        let (seed_l, forecast_l) = (aug.seed_l, aug.forecast_l);
        let (num_t, num_v) = (data.num_times(), data.num_variants());
        let total_len = seed_l + num_t + forecast_l;
        let obs = seed_l..seed_l + num_t;

        let r_obs = self.r_prior.model(handler, num_v, features)?;
        if r_obs.nrows() != num_t {
            return Err(ConfigurationError::ShapeMismatch {
                r: r_obs.nrows(),
                intros: num_t,
            }
            .into());
        }
        if forecast_l > 0 {
            let tail = Mat::from_fn(forecast_l, num_v, |_, v| r_obs[(num_t - 1, v)]);
            record_matrix(handler, "R_forecast", &tail)?;
        }
        // Seeding days sit outside the recursion.
        let r_full = Mat::from_fn(total_len, num_v, |t, v| {
            if t < seed_l {
                0.
            } else {
                r_obs[((t - seed_l).min(num_t - 1), v)]
            }
        });

        let log_i0 = handler.sample("logI0", Prior::Normal { loc: 0., scale: 1. }, &[num_v])?;
        let intros = seed_introductions(&data.first_detection(), &log_i0, seed_l, total_len);

        let rho_logits = handler.sample(
            "rho_logits",
            Prior::Normal { loc: 0., scale: 1. },
            &[REPORTING_PARAMS],
        )?;
        let fractions: Vec<f64> = rho_logits.iter().map(|x| (3. * x).exp()).collect();
        let rho_vec = ReportingCycle::from_fractions(&fractions).expand(num_t);
        let mean_rho = rho_vec.iter().sum::<f64>() / num_t as f64;

        let (prev, clipped) = simulate_variants(&intros, &r_full, kernels, aug.delays.as_deref())?;
        if pred && clipped > 0 {
            warn!("{clipped} prevalence entries were clipped during prediction");
        }
        handler.deterministic("num_clipped", &[clipped as f64], &[])?;

        let prev_obs = take_rows(&prev, obs.clone());
        let smooth = Mat::from_fn(num_t, num_v, |t, v| mean_rho * prev_obs[(t, v)]);
        record_matrix(handler, "I_smooth", &smooth)?;
        record_matrix(handler, "r", &log_growth(&prev_obs))?;

        let total_prev: Vec<f64> = (0..total_len)
            .map(|t| (0..num_v).map(|v| prev[(t, v)]).sum())
            .collect();
        let total_smooth: Vec<f64> = total_prev[obs.clone()].iter().map(|p| mean_rho * p).collect();
        handler.deterministic("total_smooth_prev", &total_smooth, &[num_t])?;
        let expected: Vec<f64> = total_prev[obs.clone()]
            .iter()
            .zip(&rho_vec)
            .map(|(p, rho)| p * rho)
            .collect();
        handler.deterministic("EC", &expected, &[num_t])?;

        self.case_likelihood
            .model(handler, data.cases.as_deref(), &expected, pred)?;

        let freq_all = Mat::from_fn(total_len, num_v, |t, v| prev[(t, v)] / total_prev[t]);
        let freq = take_rows(&freq_all, obs);
        record_matrix(handler, "freq", &freq)?;
        self.seq_likelihood
            .model(handler, &data.seq_counts, &data.total_counts, &freq, pred)?;

        let r_ave: Vec<f64> = (0..num_t)
            .map(|t| (0..num_v).map(|v| r_obs[(t, v)] * freq[(t, v)]).sum())
            .collect();
        handler.deterministic("R_ave", &r_ave, &[num_t])?;

        if forecast_l > 0 {
            let tail = seed_l + num_t..total_len;
            record_matrix(handler, "freq_forecast", &take_rows(&freq_all, tail.clone()))?;
            let prev_tail = take_rows(&prev, tail);
            let smooth_tail =
                Mat::from_fn(forecast_l, num_v, |t, v| mean_rho * prev_tail[(t, v)]);
            record_matrix(handler, "I_smooth_forecast", &smooth_tail)?;
            record_matrix(handler, "r_forecast", &log_growth(&smooth_tail))?;
        }
        Ok(())
    }
}

impl ModelSpec for RenewalModel {
    fn augment_data(&self, data: &mut ModelData) -> Result<(), ConfigurationError> {
        let num_t = data.num_times();
        let basis = SplineBasis::new(self.k, self.order)?;
        let kernels = self.generation.reversed(&data.var_names)?;
        let history = self.seed_l + num_t + self.forecast_l;
        if let Some(longest) = kernels.iter().map(|k| k.len()).max() {
            if longest > history {
                return Err(ConfigurationError::KernelTooLong {
                    kernel: longest,
                    history,
                });
            }
        }
        for (name, first) in data.var_names.iter().zip(data.first_detection()) {
            if first.is_none() {
                warn!("variant {name} is never detected, seeding it at the first day");
            }
        }

        let aug = &mut data.augmentation;
        aug.features = Some(basis.matrix(&time_points(num_t)));
        aug.generation_rev = Some(kernels);
        aug.delays = self.delays.clone();
        aug.seed_l = self.seed_l;
        aug.forecast_l = self.forecast_l;
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Managed(Arc::new(self.clone()))
    }
}
