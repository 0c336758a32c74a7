//! Variant incidence as smooth random-walk splines, without a renewal
//! process.

use std::sync::Arc;

use faer::Mat;

use crate::data::ModelData;
use crate::distributions::Prior;
use crate::error::ConfigurationError;
use crate::model::{Backend, GenerativeModel, ModelSpec};
use crate::options::{
    row_major, CaseLikelihood, DirMultinomialSeq, NegBinomCases, SeqLikelihood,
};
use crate::renewal::clip_prevalence;
use crate::reporting::ReportingCycle;
use crate::spline::{time_points, SplineBasis};
use crate::trace::{Handler, ModelError};

/// Days in the reporting cycle, each with its own reporting probability.
const REPORTING_DAYS: usize = 7;

#[derive(Debug, Clone)]
pub struct SplineIncidenceModel {
    k: usize,
    order: usize,
    forecast_l: usize,
    case_likelihood: Arc<dyn CaseLikelihood>,
    seq_likelihood: Arc<dyn SeqLikelihood>,
}

impl SplineIncidenceModel {
    pub fn new(k: usize, forecast_l: usize) -> Self {
        SplineIncidenceModel {
            k,
            order: 4,
            forecast_l,
            case_likelihood: Arc::new(NegBinomCases::default()),
            seq_likelihood: Arc::new(DirMultinomialSeq::default()),
        }
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
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
}

impl GenerativeModel for SplineIncidenceModel {
    fn generate(
        &self,
        data: &ModelData,
        handler: &mut dyn Handler,
        pred: bool,
    ) -> Result<(), ModelError> {
        let features = data.features()?;
        let deriv = data.features_deriv()?;
        let (num_t, num_v) = (data.num_times(), data.num_variants());
        let total_len = features.nrows();
        let k = features.ncols();
        if total_len < num_t || deriv.nrows() != total_len || k < 2 {
            return Err(ConfigurationError::InvalidData(format!(
                "spline features of shape {total_len}x{k} do not cover {num_t} time steps"
            ))
            .into());
        }

        // Baseline trajectory
        let gam = handler.sample("gam", Prior::HalfCauchy { scale: 0.1 }, &[])?[0];
        let beta_rw = handler.sample("beta_rw", Prior::GaussianRandomWalk { scale: gam }, &[k - 1])?;
        let beta_0 = handler.sample("beta_0", Prior::Normal { loc: 0., scale: 10. }, &[])?[0];
        let beta: Vec<f64> = std::iter::once(beta_0)
            .chain(beta_rw.iter().map(|b| beta_0 + b))
            .collect();
        handler.deterministic("beta", &beta, &[k])?;

        // Growth advantages relative to the last variant.
        let mut beta_mat = Mat::from_fn(k, num_v, |i, _| beta[i]);
        if num_v > 1 {
            let gam_delta = handler.sample("gam_delta", Prior::Exponential { rate: 50. }, &[])?[0];
            let delta = handler.sample(
                "delta_rw",
                Prior::GaussianRandomWalk { scale: gam_delta },
                &[num_v - 1, k],
            )?;
            for v in 0..num_v - 1 {
                for i in 0..k {
                    beta_mat[(i, v)] += delta[v * k + i];
                }
            }
        }

        let log_incidence = features * &beta_mat;
        let mut incidence_flat: Vec<f64> = row_major(&log_incidence).iter().map(|x| x.exp()).collect();
        clip_prevalence(&mut incidence_flat);
        let incidence = Mat::from_fn(total_len, num_v, |t, v| incidence_flat[t * num_v + v]);
        let growth = deriv * &beta_mat;

        let rows = |mat: &Mat<f64>, start: usize, len: usize| {
            Mat::from_fn(len, num_v, |t, v| mat[(start + t, v)])
        };
        handler.deterministic("r", &row_major(&rows(&growth, 0, num_t)), &[num_t, num_v])?;

        let rho = handler.sample(
            "rho",
            Prior::Beta { alpha: 5., beta: 5. },
            &[REPORTING_DAYS],
        )?;
        let rho_vec = ReportingCycle::from_weights(&rho).expand(num_t);
        let mean_rho = rho_vec.iter().sum::<f64>() / num_t as f64;

        let smooth = Mat::from_fn(num_t, num_v, |t, v| mean_rho * incidence[(t, v)]);
        handler.deterministic("I_smooth", &row_major(&smooth), &[num_t, num_v])?;

        let totals: Vec<f64> = (0..total_len)
            .map(|t| (0..num_v).map(|v| incidence[(t, v)]).sum())
            .collect();
        let expected: Vec<f64> = (0..num_t).map(|t| totals[t] * rho_vec[t]).collect();
        handler.deterministic("EC", &expected, &[num_t])?;
        self.case_likelihood
            .model(handler, data.cases.as_deref(), &expected, pred)?;

        let freq_all = Mat::from_fn(total_len, num_v, |t, v| incidence[(t, v)] / totals[t]);
        let freq = rows(&freq_all, 0, num_t);
        handler.deterministic("freq", &row_major(&freq), &[num_t, num_v])?;
        self.seq_likelihood
            .model(handler, &data.seq_counts, &data.total_counts, &freq, pred)?;

        let r_ave: Vec<f64> = (0..num_t)
            .map(|t| (0..num_v).map(|v| growth[(t, v)] * freq[(t, v)]).sum())
            .collect();
        handler.deterministic("r_ave", &r_ave, &[num_t])?;

        let forecast_l = total_len - num_t;
        if forecast_l > 0 {
            let shape = [forecast_l, num_v];
            handler.deterministic(
                "freq_forecast",
                &row_major(&rows(&freq_all, num_t, forecast_l)),
                &shape,
            )?;
            let smooth_tail: Vec<f64> = row_major(&rows(&incidence, num_t, forecast_l))
                .into_iter()
                .map(|x| mean_rho * x)
                .collect();
            handler.deterministic("I_smooth_forecast", &smooth_tail, &shape)?;
            handler.deterministic(
                "r_forecast",
                &row_major(&rows(&growth, num_t, forecast_l)),
                &shape,
            )?;
        }
        Ok(())
    }
}

impl ModelSpec for SplineIncidenceModel {
    fn augment_data(&self, data: &mut ModelData) -> Result<(), ConfigurationError> {
        let basis = SplineBasis::new(self.k, self.order)?;
        if self.k < 2 {
            return Err(ConfigurationError::InvalidOption(
                "spline incidence needs at least two basis functions".to_string(),
            ));
        }
        let times = time_points(data.num_times() + self.forecast_l);
        let aug = &mut data.augmentation;
        aug.features = Some(basis.matrix(&times));
        aug.features_deriv = Some(basis.derivative(&times));
        aug.forecast_l = self.forecast_l;
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Managed(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{MultinomialSeq, PoissonCases};
    use crate::trace::{LayoutTracer, PredictiveRecorder};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeMap;

    fn data() -> ModelData {
        let counts = Mat::from_fn(12, 3, |t, v| (t + v) as f64);
        ModelData::new(counts, vec!["a".into(), "b".into(), "c".into()])
            .unwrap()
            .with_cases(vec![20.; 12])
            .unwrap()
    }

    #[test]
    fn forecast_extends_basis() {
        let mut data = data();
        let model = SplineIncidenceModel::new(5, 4)
            .with_case_likelihood(PoissonCases)
            .with_seq_likelihood(MultinomialSeq);
        model.augment_data(&mut data).unwrap();
        assert_eq!(data.features().unwrap().nrows(), 16);

        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut tracer = LayoutTracer::new(&mut rng);
        model.generate(&data, &mut tracer, false).unwrap();
        let (layout, init) = tracer.finish();
        assert_eq!(layout.site("beta_rw").unwrap().shape, vec![4]);
        assert_eq!(layout.site("delta_rw").unwrap().shape, vec![2, 5]);
        assert_eq!(layout.site("rho").unwrap().shape, vec![REPORTING_DAYS]);

        let constrained: Vec<Vec<f64>> = layout
            .sites()
            .iter()
            .map(|site| layout.constrain_site(site, &init))
            .collect();
        let subs: BTreeMap<&str, &[f64]> = layout
            .sites()
            .iter()
            .zip(&constrained)
            .map(|(site, vals)| (site.name.as_str(), &vals[..]))
            .collect();
        let mut recorder = PredictiveRecorder::new(&mut rng, &subs);
        model.generate(&data, &mut recorder, true).unwrap();
        let out = recorder.finish();
        assert_eq!(out.get("freq_forecast").unwrap().shape(), &[4, 3]);
        assert_eq!(out.get("r").unwrap().shape(), &[12, 3]);
        for row in out.get("freq").unwrap().values().chunks(3) {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 1., epsilon = 1e-9);
        }
        let beta = out.get("beta").unwrap().values();
        assert_abs_diff_eq!(beta[0], constrained[2][0]);
    }

    #[test]
    fn missing_derivative_is_reported() {
        let mut data = data();
        data.augmentation.features = Some(Mat::zeros(12, 4));
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut tracer = LayoutTracer::new(&mut rng);
        let err = SplineIncidenceModel::new(4, 0)
            .generate(&data, &mut tracer, false)
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::Configuration(ConfigurationError::MissingAugmentation("features_deriv"))
        ));
    }
}
