//! Interchangeable model components.
//!
//! Each role exposes a single `model` method that reports its sites to the
//! handler. Any implementation of a role can be plugged into the renewal
//! and spline models.

use std::fmt::Debug;

use faer::Mat;

use crate::distributions::{Likelihood, Observed, Prior};
use crate::error::ConfigurationError;
use crate::trace::{Handler, ModelError};

/// Prior over the reproduction number trajectory.
pub trait RPrior: Debug + Send + Sync {
    /// Returns R as a `time x variant` matrix with one row per row of
    /// `features`.
    fn model(
        &self,
        handler: &mut dyn Handler,
        num_variants: usize,
        features: &Mat<f64>,
    ) -> Result<Mat<f64>, ModelError>;
}

/// Likelihood of daily case counts given expected cases.
pub trait CaseLikelihood: Debug + Send + Sync {
    fn model(
        &self,
        handler: &mut dyn Handler,
        cases: Option<&[f64]>,
        expected: &[f64],
        pred: bool,
    ) -> Result<(), ModelError>;
}

/// Likelihood of sequence counts given variant frequencies.
pub trait SeqLikelihood: Debug + Send + Sync {
    fn model(
        &self,
        handler: &mut dyn Handler,
        seq_counts: &Mat<f64>,
        total_counts: &[f64],
        freq: &Mat<f64>,
        pred: bool,
    ) -> Result<(), ModelError>;
}

fn shape_error(site: &str, expected: Vec<usize>, found: Vec<usize>) -> ModelError {
    ModelError::SiteShape {
        site: site.to_string(),
        expected,
        found,
    }
}

/// Gaussian random walk on the spline coefficients of log R.
///
/// The last variant is the pivot. Every other variant gets its own random
/// walk deviation from the pivot's coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianRandomWalkR {
    pub gam_prior: f64,
    pub gam_delta_prior: f64,
}

impl Default for GaussianRandomWalkR {
    fn default() -> Self {
        GaussianRandomWalkR {
            gam_prior: 0.5,
            gam_delta_prior: 10.,
        }
    }
}

impl RPrior for GaussianRandomWalkR {
    fn model(
        &self,
        handler: &mut dyn Handler,
        num_variants: usize,
        features: &Mat<f64>,
    ) -> Result<Mat<f64>, ModelError> {
        let k = features.ncols();
        let gam = handler.sample(
            "gam",
            Prior::HalfNormal {
                scale: self.gam_prior,
            },
            &[],
        )?[0];
        let beta_0 = handler.sample("beta_0", Prior::Normal { loc: 0., scale: 1. }, &[])?[0];
        let beta_rw = handler.sample("beta_rw", Prior::GaussianRandomWalk { scale: gam }, &[k])?;

        // Coefficients, `k x variant`, row-major by knot.
        let mut beta = Mat::<f64>::from_fn(k, num_variants, |i, _| beta_0 + beta_rw[i]);
        if num_variants > 1 {
            let gam_delta = handler.sample(
                "gam_delta",
                Prior::Exponential {
                    rate: self.gam_delta_prior,
                },
                &[],
            )?[0];
            let delta = handler.sample(
                "delta_rw",
                Prior::GaussianRandomWalk { scale: gam_delta },
                &[num_variants - 1, k],
            )?;
            for v in 0..num_variants - 1 {
                for i in 0..k {
                    beta[(i, v)] += delta[v * k + i];
                }
            }
        }

        let log_r = features * &beta;
        let r = Mat::from_fn(log_r.nrows(), num_variants, |t, v| log_r[(t, v)].exp());
        handler.deterministic("R", &row_major(&r), &[r.nrows(), num_variants])?;
        Ok(r)
    }
}

/// Negative binomial case counts with concentration `1 / raw_alpha^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegBinomCases {
    pub raw_alpha_sd: f64,
}

impl Default for NegBinomCases {
    fn default() -> Self {
        NegBinomCases { raw_alpha_sd: 0.01 }
    }
}

impl CaseLikelihood for NegBinomCases {
    fn model(
        &self,
        handler: &mut dyn Handler,
        cases: Option<&[f64]>,
        expected: &[f64],
        pred: bool,
    ) -> Result<(), ModelError> {
        let raw_alpha = handler.sample(
            "raw_alpha",
            Prior::HalfNormal {
                scale: self.raw_alpha_sd,
            },
            &[],
        )?[0];
        observe_cases(
            handler,
            Likelihood::NegativeBinomial {
                mean: expected,
                concentration: 1. / (raw_alpha * raw_alpha),
            },
            cases,
            pred,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoissonCases;

impl CaseLikelihood for PoissonCases {
    fn model(
        &self,
        handler: &mut dyn Handler,
        cases: Option<&[f64]>,
        expected: &[f64],
        pred: bool,
    ) -> Result<(), ModelError> {
        observe_cases(handler, Likelihood::Poisson { rate: expected }, cases, pred)
    }
}

fn observe_cases(
    handler: &mut dyn Handler,
    likelihood: Likelihood<'_>,
    cases: Option<&[f64]>,
    pred: bool,
) -> Result<(), ModelError> {
    if let Some(cases) = cases {
        if cases.len() != likelihood.shape()[0] {
            return Err(shape_error("cases", likelihood.shape(), vec![cases.len()]));
        }
    }
    let observed = if pred {
        None
    } else {
        cases.map(Observed::Vector)
    };
    handler.observe("cases", likelihood, observed)
}

/// Dirichlet-multinomial sequence counts with overdispersion `xi`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirMultinomialSeq {
    pub xi_prior: f64,
}

impl Default for DirMultinomialSeq {
    fn default() -> Self {
        DirMultinomialSeq { xi_prior: 99. }
    }
}

impl SeqLikelihood for DirMultinomialSeq {
    fn model(
        &self,
        handler: &mut dyn Handler,
        seq_counts: &Mat<f64>,
        total_counts: &[f64],
        freq: &Mat<f64>,
        pred: bool,
    ) -> Result<(), ModelError> {
        let xi = handler.sample(
            "xi",
            Prior::Beta {
                alpha: 1.,
                beta: self.xi_prior,
            },
            &[],
        )?[0];
        let trans_xi = 1. / xi - 1.;
        let concentration = Mat::from_fn(freq.nrows(), freq.ncols(), |t, v| {
            (1e-20 + freq[(t, v)] * trans_xi).clamp(1e-20, 1e20)
        });
        observe_sequences(
            handler,
            Likelihood::DirichletMultinomial {
                concentration: &concentration,
                total_count: total_counts,
            },
            seq_counts,
            pred,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MultinomialSeq;

impl SeqLikelihood for MultinomialSeq {
    fn model(
        &self,
        handler: &mut dyn Handler,
        seq_counts: &Mat<f64>,
        total_counts: &[f64],
        freq: &Mat<f64>,
        pred: bool,
    ) -> Result<(), ModelError> {
        observe_sequences(
            handler,
            Likelihood::Multinomial {
                probs: freq,
                total_count: total_counts,
            },
            seq_counts,
            pred,
        )
    }
}

fn observe_sequences(
    handler: &mut dyn Handler,
    likelihood: Likelihood<'_>,
    seq_counts: &Mat<f64>,
    pred: bool,
) -> Result<(), ModelError> {
    let shape = likelihood.shape();
    if shape != [seq_counts.nrows(), seq_counts.ncols()] {
        return Err(shape_error(
            "seq_counts",
            shape,
            vec![seq_counts.nrows(), seq_counts.ncols()],
        ));
    }
    let observed = if pred {
        None
    } else {
        Some(Observed::Matrix(seq_counts))
    };
    handler.observe("seq_counts", likelihood, observed)
}

/// Flatten a matrix row by row.
pub fn row_major(mat: &Mat<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(mat.nrows() * mat.ncols());
    for t in 0..mat.nrows() {
        for v in 0..mat.ncols() {
            out.push(mat[(t, v)]);
        }
    }
    out
}

pub(crate) fn check_positive(name: &str, value: f64) -> Result<(), ConfigurationError> {
    if value > 0. && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidOption(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

impl GaussianRandomWalkR {
    pub fn new(gam_prior: f64, gam_delta_prior: f64) -> Result<Self, ConfigurationError> {
        check_positive("gam_prior", gam_prior)?;
        check_positive("gam_delta_prior", gam_delta_prior)?;
        Ok(GaussianRandomWalkR {
            gam_prior,
            gam_delta_prior,
        })
    }
}

impl NegBinomCases {
    pub fn new(raw_alpha_sd: f64) -> Result<Self, ConfigurationError> {
        check_positive("raw_alpha_sd", raw_alpha_sd)?;
        Ok(NegBinomCases { raw_alpha_sd })
    }
}

impl DirMultinomialSeq {
    pub fn new(xi_prior: f64) -> Result<Self, ConfigurationError> {
        check_positive("xi_prior", xi_prior)?;
        Ok(DirMultinomialSeq { xi_prior })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{LayoutTracer, PredictiveRecorder};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;

    #[test]
    fn garw_sites_depend_on_variants() {
        let features = Mat::from_fn(5, 3, |t, i| if t % 3 == i { 1. } else { 0. });
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut tracer = LayoutTracer::new(&mut rng);
        let r = GaussianRandomWalkR::default()
            .model(&mut tracer, 1, &features)
            .unwrap();
        assert_eq!((r.nrows(), r.ncols()), (5, 1));
        let (layout, _) = tracer.finish();
        let names: Vec<&str> = layout.sites().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["gam", "beta_0", "beta_rw"]);

        let mut tracer = LayoutTracer::new(&mut rng);
        GaussianRandomWalkR::default()
            .model(&mut tracer, 3, &features)
            .unwrap();
        let (layout, _) = tracer.finish();
        assert_eq!(layout.site("delta_rw").unwrap().shape, vec![2, 3]);
        assert_eq!(layout.dim(), 1 + 1 + 3 + 1 + 6);
    }

    #[test]
    fn pivot_variant_has_no_deviation() {
        let features = Mat::from_fn(2, 2, |t, i| if t == i { 1. } else { 0. });
        let gam = [0.1];
        let beta_0 = [0.5];
        let beta_rw = [0.1, 0.2];
        let gam_delta = [0.1];
        let delta = [0.3, 0.3];
        let subs: BTreeMap<&str, &[f64]> = [
            ("gam", &gam[..]),
            ("beta_0", &beta_0[..]),
            ("beta_rw", &beta_rw[..]),
            ("gam_delta", &gam_delta[..]),
            ("delta_rw", &delta[..]),
        ]
        .into_iter()
        .collect();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut recorder = PredictiveRecorder::new(&mut rng, &subs);
        let r = GaussianRandomWalkR::default()
            .model(&mut recorder, 2, &features)
            .unwrap();
        approx::assert_abs_diff_eq!(r[(0, 1)], 0.6f64.exp(), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(r[(1, 0)], 1.0f64.exp(), epsilon = 1e-12);
        let recorded = recorder.finish();
        assert_eq!(recorded.get("R").unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn case_shape_is_checked() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut tracer = LayoutTracer::new(&mut rng);
        let err = PoissonCases
            .model(&mut tracer, Some(&[1., 2.]), &[1., 2., 3.], false)
            .unwrap_err();
        assert!(matches!(err, ModelError::SiteShape { .. }));
    }

    #[test]
    fn options_validate() {
        assert!(GaussianRandomWalkR::new(0., 1.).is_err());
        assert!(NegBinomCases::new(f64::NAN).is_err());
        assert_eq!(DirMultinomialSeq::new(99.).unwrap(), DirMultinomialSeq::default());
    }
}
