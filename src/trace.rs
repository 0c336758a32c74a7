//! Effect handlers for declarative generative models.
//!
//! A model is written once against [`Handler`]. Running it under different
//! handlers discovers its parameters, evaluates its log density, or draws
//! posterior-predictive samples.

use std::collections::BTreeMap;

use rand::Rng;
use thiserror::Error;

use crate::distributions::{DistributionError, Likelihood, Observed, Prior, Support};
use crate::error::ConfigurationError;
use crate::samples::{SampleSet, SiteDraws};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("site {found:?} was visited where {expected:?} was expected")]
    SiteOrder { expected: String, found: String },
    #[error("site {site:?} has shape {found:?}, expected {expected:?}")]
    SiteShape {
        site: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("site {0:?} was visited twice")]
    DuplicateSite(String),
    #[error("position has {found} entries but the model has {expected} latent values")]
    PositionLength { expected: usize, found: usize },
    #[error("site {site:?}")]
    Distribution {
        site: String,
        #[source]
        source: DistributionError,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl ModelError {
    pub(crate) fn at(site: &str) -> impl FnOnce(DistributionError) -> ModelError + '_ {
        move |source| ModelError::Distribution {
            site: site.to_string(),
            source,
        }
    }

    /// A distribution was handed parameters outside its domain, typically
    /// because the position sits in an extreme region.
    pub fn is_domain_error(&self) -> bool {
        matches!(
            self,
            ModelError::Distribution {
                source: DistributionError::InvalidParameters(_),
                ..
            }
        )
    }
}

pub trait Handler {
    /// A latent site. Returns the values the model should continue with.
    fn sample(&mut self, site: &str, prior: Prior, shape: &[usize])
        -> Result<Vec<f64>, ModelError>;

    /// An observation site. `observed` is `None` in prediction mode.
    fn observe(
        &mut self,
        site: &str,
        likelihood: Likelihood<'_>,
        observed: Option<Observed<'_>>,
    ) -> Result<(), ModelError>;

    /// A derived quantity that is recorded but carries no density.
    fn deterministic(&mut self, site: &str, values: &[f64], shape: &[usize])
        -> Result<(), ModelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteLayout {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: usize,
    pub support: Support,
}

impl SiteLayout {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Where each latent site lives in the flat unconstrained position vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterLayout {
    sites: Vec<SiteLayout>,
    dim: usize,
}

impl ParameterLayout {
    /// A single real-valued vector site.
    pub fn flat(name: &str, dim: usize) -> Self {
        Self::real(name, vec![dim])
    }

    /// A single real-valued site of the given shape.
    pub fn real(name: &str, shape: Vec<usize>) -> Self {
        let mut layout = ParameterLayout::default();
        layout.push(name, shape, Support::Real);
        layout
    }

    fn push(&mut self, name: &str, shape: Vec<usize>, support: Support) {
        let site = SiteLayout {
            name: name.to_string(),
            shape,
            offset: self.dim,
            support,
        };
        self.dim += site.size();
        self.sites.push(site);
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn sites(&self) -> &[SiteLayout] {
        &self.sites
    }

    pub fn site(&self, name: &str) -> Option<&SiteLayout> {
        self.sites.iter().find(|s| s.name == name)
    }

    pub fn constrain_site(&self, site: &SiteLayout, position: &[f64]) -> Vec<f64> {
        position[site.offset..site.offset + site.size()]
            .iter()
            .map(|&x| site.support.constrain(x).0)
            .collect()
    }
}

/// Discovers the latent sites of a model and draws an initial point
/// uniformly in `(-2, 2)` on the unconstrained scale.
pub struct LayoutTracer<'a, R: Rng + ?Sized> {
    rng: &'a mut R,
    layout: ParameterLayout,
    init: Vec<f64>,
}

impl<'a, R: Rng + ?Sized> LayoutTracer<'a, R> {
    pub fn new(rng: &'a mut R) -> Self {
        LayoutTracer {
            rng,
            layout: ParameterLayout::default(),
            init: Vec::new(),
        }
    }

    pub fn finish(self) -> (ParameterLayout, Vec<f64>) {
        (self.layout, self.init)
    }
}

impl<R: Rng + ?Sized> Handler for LayoutTracer<'_, R> {
    fn sample(
        &mut self,
        site: &str,
        prior: Prior,
        shape: &[usize],
    ) -> Result<Vec<f64>, ModelError> {
        if self.layout.site(site).is_some() {
            return Err(ModelError::DuplicateSite(site.to_string()));
        }
        let support = prior.support();
        self.layout.push(site, shape.to_vec(), support);
        let size: usize = shape.iter().product();
        let mut values = Vec::with_capacity(size);
        for _ in 0..size {
            let x = self.rng.random_range(-2f64..2f64);
            self.init.push(x);
            values.push(support.constrain(x).0);
        }
        Ok(values)
    }

    fn observe(
        &mut self,
        _site: &str,
        _likelihood: Likelihood<'_>,
        _observed: Option<Observed<'_>>,
    ) -> Result<(), ModelError> {
        Ok(())
    }

    fn deterministic(&mut self, _site: &str, _values: &[f64], _shape: &[usize]) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Accumulates the joint log density at an unconstrained position,
/// including the log Jacobian of the unconstraining transforms.
pub struct DensityEvaluator<'a> {
    layout: &'a ParameterLayout,
    position: &'a [f64],
    next_site: usize,
    logp: f64,
}

impl<'a> DensityEvaluator<'a> {
    pub fn new(layout: &'a ParameterLayout, position: &'a [f64]) -> Result<Self, ModelError> {
        if position.len() != layout.dim() {
            return Err(ModelError::PositionLength {
                expected: layout.dim(),
                found: position.len(),
            });
        }
        Ok(DensityEvaluator {
            layout,
            position,
            next_site: 0,
            logp: 0.,
        })
    }

    pub fn finish(self) -> Result<f64, ModelError> {
        if let Some(site) = self.layout.sites().get(self.next_site) {
            return Err(ModelError::SiteOrder {
                expected: site.name.clone(),
                found: "<end of model>".to_string(),
            });
        }
        Ok(self.logp)
    }
}

impl Handler for DensityEvaluator<'_> {
    fn sample(
        &mut self,
        site: &str,
        prior: Prior,
        shape: &[usize],
    ) -> Result<Vec<f64>, ModelError> {
        let sites = self.layout.sites();
        let layout = sites.get(self.next_site).ok_or_else(|| {
            ModelError::SiteOrder {
                expected: "<end of model>".to_string(),
                found: site.to_string(),
            }
        })?;
        if layout.name != site {
            return Err(ModelError::SiteOrder {
                expected: layout.name.clone(),
                found: site.to_string(),
            });
        }
        if layout.shape != shape {
            return Err(ModelError::SiteShape {
                site: site.to_string(),
                expected: layout.shape.clone(),
                found: shape.to_vec(),
            });
        }
        self.next_site += 1;

        let unconstrained = &self.position[layout.offset..layout.offset + layout.size()];
        let mut values = Vec::with_capacity(unconstrained.len());
        for &x in unconstrained {
            let (y, log_jac) = layout.support.constrain(x);
            self.logp += log_jac;
            values.push(y);
        }
        self.logp += prior.log_prob(&values, shape).map_err(ModelError::at(site))?;
        Ok(values)
    }

    fn observe(
        &mut self,
        site: &str,
        likelihood: Likelihood<'_>,
        observed: Option<Observed<'_>>,
    ) -> Result<(), ModelError> {
        if let Some(observed) = observed {
            self.logp += likelihood.log_prob(observed).map_err(ModelError::at(site))?;
        }
        Ok(())
    }

    fn deterministic(&mut self, _site: &str, _values: &[f64], _shape: &[usize]) -> Result<(), ModelError> {
        Ok(())
    }
}

/// Replays a model conditioned on one posterior draw.
///
/// Latent sites take their values from `substitutes` (constrained scale);
/// latent sites without a substitute are drawn from their prior. Every
/// observation site is resampled and recorded along with all deterministic
/// sites.
pub struct PredictiveRecorder<'a, R: Rng + ?Sized> {
    rng: &'a mut R,
    substitutes: &'a BTreeMap<&'a str, &'a [f64]>,
    recorded: SampleSet,
}

impl<'a, R: Rng + ?Sized> PredictiveRecorder<'a, R> {
    pub fn new(rng: &'a mut R, substitutes: &'a BTreeMap<&'a str, &'a [f64]>) -> Self {
        PredictiveRecorder {
            rng,
            substitutes,
            recorded: SampleSet::new(),
        }
    }

    fn record(&mut self, site: &str, values: &[f64], shape: &[usize]) -> Result<(), ModelError> {
        let mut draws = SiteDraws::new(shape.to_vec());
        if draws.push(values).is_err() {
            return Err(ModelError::SiteShape {
                site: site.to_string(),
                expected: shape.to_vec(),
                found: vec![values.len()],
            });
        }
        self.recorded.insert(site, draws);
        Ok(())
    }

    pub fn finish(self) -> SampleSet {
        self.recorded
    }
}

impl<R: Rng + ?Sized> Handler for PredictiveRecorder<'_, R> {
    fn sample(
        &mut self,
        site: &str,
        prior: Prior,
        shape: &[usize],
    ) -> Result<Vec<f64>, ModelError> {
        if let Some(values) = self.substitutes.get(site) {
            let size: usize = shape.iter().product();
            if values.len() != size {
                return Err(ModelError::SiteShape {
                    site: site.to_string(),
                    expected: shape.to_vec(),
                    found: vec![values.len()],
                });
            }
            return Ok(values.to_vec());
        }
        let values = prior
            .sample(&mut *self.rng, shape)
            .map_err(ModelError::at(site))?;
        self.record(site, &values, shape)?;
        Ok(values)
    }

    fn observe(
        &mut self,
        site: &str,
        likelihood: Likelihood<'_>,
        _observed: Option<Observed<'_>>,
    ) -> Result<(), ModelError> {
        let values = likelihood.sample(&mut *self.rng).map_err(ModelError::at(site))?;
        self.record(site, &values, &likelihood.shape())
    }

    fn deterministic(&mut self, site: &str, values: &[f64], shape: &[usize]) -> Result<(), ModelError> {
        self.record(site, values, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn toy(handler: &mut dyn Handler, observed: Option<&[f64]>) -> Result<(), ModelError> {
        let scale = handler.sample("scale", Prior::HalfNormal { scale: 1. }, &[])?;
        let loc = handler.sample("loc", Prior::Normal { loc: 0., scale: 1. }, &[2])?;
        let rate: Vec<f64> = loc.iter().map(|l| (l * scale[0]).exp()).collect();
        handler.deterministic("rate", &rate, &[2])?;
        handler.observe(
            "counts",
            Likelihood::Poisson { rate: &rate },
            observed.map(Observed::Vector),
        )
    }

    #[test]
    fn tracer_records_layout() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut tracer = LayoutTracer::new(&mut rng);
        toy(&mut tracer, None).unwrap();
        let (layout, init) = tracer.finish();
        assert_eq!(layout.dim(), 3);
        assert_eq!(init.len(), 3);
        assert!(init.iter().all(|x| (-2. ..2.).contains(x)));
        let loc = layout.site("loc").unwrap();
        assert_eq!(loc.offset, 1);
        assert_eq!(layout.sites()[0].support, Support::Positive);
    }

    #[test]
    fn density_includes_jacobian() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut tracer = LayoutTracer::new(&mut rng);
        toy(&mut tracer, None).unwrap();
        let (layout, _) = tracer.finish();

        let position = [0., 0.5, -0.5];
        let mut eval = DensityEvaluator::new(&layout, &position).unwrap();
        toy(&mut eval, Some(&[1., f64::NAN])).unwrap();
        let logp = eval.finish().unwrap();

        let prior = Prior::HalfNormal { scale: 1. }.log_prob(&[1.], &[]).unwrap()
            + Prior::Normal { loc: 0., scale: 1. }
                .log_prob(&[0.5, -0.5], &[2])
                .unwrap();
        let lik = crate::distributions::poisson_lpmf(1., 0.5f64.exp()).unwrap();
        // log|d exp(x)/dx| at x = 0 is 0
        assert_abs_diff_eq!(logp, prior + lik, epsilon = 1e-12);
    }

    #[test]
    fn evaluator_checks_position() {
        let layout = ParameterLayout::flat("x", 2);
        assert!(matches!(
            DensityEvaluator::new(&layout, &[1.]),
            Err(ModelError::PositionLength { .. })
        ));
        let mut eval = DensityEvaluator::new(&layout, &[1., 2.]).unwrap();
        let err = eval
            .sample("y", Prior::Normal { loc: 0., scale: 1. }, &[2])
            .unwrap_err();
        assert!(matches!(err, ModelError::SiteOrder { .. }));
    }

    #[test]
    fn recorder_substitutes_and_resamples() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let scale = [1.];
        let loc = [0.1, 0.2];
        let subs: BTreeMap<&str, &[f64]> = [("scale", &scale[..]), ("loc", &loc[..])]
            .into_iter()
            .collect();
        let mut recorder = PredictiveRecorder::new(&mut rng, &subs);
        toy(&mut recorder, None).unwrap();
        let out = recorder.finish();
        assert!(!out.contains("scale"));
        assert_abs_diff_eq!(out.get("rate").unwrap().values()[1], 0.2f64.exp());
        assert_eq!(out.get("counts").unwrap().shape(), &[2]);
    }
}
