//! Resolve a model's [`Backend`] into an initial point, a log density and
//! a posterior-predictive path.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use thiserror::Error;

use crate::data::ModelData;
use crate::density::{LogDensity, ManagedDensity};
use crate::model::{
    Backend, Capability, CustomBackend, GenerativeModel, InitialPositionSource, LogDensitySource,
};
use crate::samples::{SampleSet, SiteDraws};
use crate::trace::{LayoutTracer, ModelError, PredictiveRecorder};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("the model declares no way to obtain a log density")]
    NoBackend,
    #[error("custom backend lacks capability {0:?}")]
    MissingCapability(Capability),
    #[error("initial position has {found} entries but the log density has dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("no initial point with finite log density after {0} attempts")]
    InitFailed(usize),
    #[error("inconsistent predictive draws: {0}")]
    Samples(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// The starting point of a fit.
pub struct Initialized {
    /// Unconstrained initial position.
    pub position: Box<[f64]>,
    pub log_density: Arc<dyn LogDensity>,
}

impl std::fmt::Debug for Initialized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initialized")
            .field("position", &self.position)
            .field("layout", &self.log_density.layout())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendResolver {
    /// How often the managed backend redraws the initial point when the
    /// log density is not finite there.
    pub max_init_attempts: usize,
}

impl Default for BackendResolver {
    fn default() -> Self {
        BackendResolver {
            max_init_attempts: 100,
        }
    }
}

impl BackendResolver {
    pub fn resolve_init<R: Rng>(
        &self,
        backend: &Backend,
        data: &Arc<ModelData>,
        rng: &mut R,
    ) -> Result<Initialized, ResolveError> {
        match backend {
            Backend::Managed(model) => {
                log::debug!("initializing through the managed backend");
                self.managed_init(model, data, rng)
            }
            Backend::Custom(custom) => {
                log::debug!(
                    "initializing through a custom backend with {:?}",
                    custom.capabilities()
                );
                custom_init(custom, data, rng)
            }
            Backend::Inert => Err(ResolveError::NoBackend),
        }
    }

    fn managed_init<R: Rng>(
        &self,
        model: &Arc<dyn GenerativeModel>,
        data: &Arc<ModelData>,
        rng: &mut R,
    ) -> Result<Initialized, ResolveError> {
        let attempts = self.max_init_attempts.max(1);
        for attempt in 0..attempts {
            let mut tracer = LayoutTracer::new(&mut *rng);
            model.generate(data, &mut tracer, false)?;
            let (layout, init) = tracer.finish();
            let density = ManagedDensity::new(model.clone(), data.clone(), layout);
            let logp = match density.value(&init) {
                Ok(logp) => logp,
                Err(err) if err.is_domain_error() => {
                    log::debug!("initial point rejected: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if logp.is_finite() {
                log::debug!(
                    "initial point with log density {logp:.3} found after {} attempts",
                    attempt + 1
                );
                return Ok(Initialized {
                    position: init.into(),
                    log_density: Arc::new(density),
                });
            }
        }
        Err(ResolveError::InitFailed(attempts))
    }

    /// Posterior-predictive draws for every draw in `samples`, merged with
    /// `samples`. Sites already in `samples` are never replaced.
    pub fn resolve_predict(
        &self,
        backend: &Backend,
        data: &Arc<ModelData>,
        samples: &SampleSet,
        key: u64,
    ) -> Result<SampleSet, ResolveError> {
        let predictive = match backend {
            Backend::Managed(model) => {
                log::debug!(
                    "predicting {} draws through the managed backend",
                    samples.num_draws()
                );
                managed_predict(model.as_ref(), data, samples, key)?
            }
            Backend::Custom(custom) => {
                let predictive = custom
                    .predictive
                    .as_ref()
                    .ok_or(ResolveError::MissingCapability(Capability::PredictiveFn))?;
                let mut rng = ChaCha8Rng::seed_from_u64(key);
                let rng: &mut dyn RngCore = &mut rng;
                predictive(rng, samples, data.as_ref())?
            }
            Backend::Inert => return Err(ResolveError::NoBackend),
        };
        Ok(samples.merge_predictive(predictive))
    }
}

fn custom_init<R: Rng>(
    custom: &CustomBackend,
    data: &Arc<ModelData>,
    rng: &mut R,
) -> Result<Initialized, ResolveError> {
    let log_density = match &custom.log_density {
        Some(LogDensitySource::Provided(density)) => density.clone(),
        Some(LogDensitySource::Generator(generator)) => generator(data.as_ref())?,
        None => return Err(ResolveError::MissingCapability(Capability::LogDensity)),
    };
    let dim = log_density.dim();
    let position = match &custom.initial_position {
        Some(InitialPositionSource::Provided(position)) => position.clone(),
        Some(InitialPositionSource::Generator(generator)) => {
            let rng: &mut dyn RngCore = rng;
            generator(rng, dim)
        }
        None => return Err(ResolveError::MissingCapability(Capability::InitialPosition)),
    };
    if position.len() != dim {
        return Err(ResolveError::DimensionMismatch {
            expected: dim,
            found: position.len(),
        });
    }
    Ok(Initialized {
        position,
        log_density,
    })
}

/// Replay the model once per draw. Draw `i` uses stream `i` of `key`, so
/// the result does not depend on how draws are scheduled.
fn managed_predict(
    model: &dyn GenerativeModel,
    data: &ModelData,
    samples: &SampleSet,
    key: u64,
) -> Result<SampleSet, ResolveError> {
    let num_draws = samples.num_draws();
    if num_draws == 0 {
        return Ok(SampleSet::new());
    }
    let per_draw = (0..num_draws)
        .into_par_iter()
        .map(|idx| {
            let mut rng = ChaCha8Rng::seed_from_u64(key);
            rng.set_stream(idx as u64);
            let substitutes: BTreeMap<&str, &[f64]> = samples.draw(idx);
            let mut recorder = PredictiveRecorder::new(&mut rng, &substitutes);
            model.generate(data, &mut recorder, true)?;
            Ok(recorder.finish())
        })
        .collect::<Result<Vec<SampleSet>, ModelError>>()?;
    stack_draws(per_draw)
}

/// Concatenate single-draw sample sets along the draw axis.
fn stack_draws(per_draw: Vec<SampleSet>) -> Result<SampleSet, ResolveError> {
    let mut stacked = SampleSet::new();
    let Some(first) = per_draw.first() else {
        return Ok(stacked);
    };
    for (name, site) in first.iter() {
        let mut draws = SiteDraws::new(site.shape().to_vec());
        for (idx, set) in per_draw.iter().enumerate() {
            let values = set
                .get(name)
                .and_then(|site| site.draw(0))
                .ok_or_else(|| ResolveError::Samples(format!("draw {idx} has no site {name:?}")))?;
            draws
                .push(values)
                .map_err(|err| ResolveError::Samples(format!("site {name:?}: {err}")))?;
        }
        stacked.insert(name, draws);
    }
    Ok(stacked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::test_densities::NormalDensity;
    use crate::distributions::{Likelihood, Observed, Prior};
    use crate::trace::Handler;
    use faer::Mat;
    use pretty_assertions::assert_eq;

    /// `mu ~ Normal(0, 1)`, counts ~ Poisson(exp(mu)).
    struct PoissonRate;

    impl GenerativeModel for PoissonRate {
        fn generate(
            &self,
            data: &ModelData,
            handler: &mut dyn Handler,
            pred: bool,
        ) -> Result<(), ModelError> {
            let mu = handler.sample("mu", Prior::Normal { loc: 0., scale: 1. }, &[])?[0];
            let rate = vec![mu.exp(); data.num_times()];
            handler.deterministic("rate", &rate, &[data.num_times()])?;
            let cases = data.cases.as_deref();
            let observed = match (pred, cases) {
                (false, Some(cases)) => Some(Observed::Vector(cases)),
                _ => None,
            };
            handler.observe("cases", Likelihood::Poisson { rate: &rate }, observed)
        }
    }

    fn data() -> Arc<ModelData> {
        let counts = Mat::from_fn(4, 1, |_, _| 1.);
        Arc::new(
            ModelData::new(counts, vec!["a".into()])
                .unwrap()
                .with_cases(vec![3., 2., f64::NAN, 4.])
                .unwrap(),
        )
    }

    #[test]
    fn managed_round_trip() {
        let backend = Backend::Managed(Arc::new(PoissonRate));
        let resolver = BackendResolver::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let init = resolver.resolve_init(&backend, &data(), &mut rng).unwrap();
        assert_eq!(init.position.len(), 1);
        assert_eq!(init.log_density.dim(), 1);

        let positions: Vec<Box<[f64]>> = vec![vec![0.1].into(), vec![0.2].into()];
        let samples =
            SampleSet::from_positions(&init.log_density.layout(), &positions).unwrap();
        let out = resolver
            .resolve_predict(&backend, &data(), &samples, 9)
            .unwrap();
        assert_eq!(out.get("mu"), samples.get("mu"));
        assert_eq!(out.get("cases").unwrap().num_draws(), 2);
        assert_eq!(out.get("rate").unwrap().draw(1).unwrap()[0], 0.2f64.exp());

        let again = resolver
            .resolve_predict(&backend, &data(), &samples, 9)
            .unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn inert_backend_is_an_error() {
        let resolver = BackendResolver::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            resolver.resolve_init(&Backend::Inert, &data(), &mut rng),
            Err(ResolveError::NoBackend)
        ));
        assert!(matches!(
            resolver.resolve_predict(&Backend::Inert, &data(), &SampleSet::new(), 0),
            Err(ResolveError::NoBackend)
        ));
    }

    #[test]
    fn custom_backend_capabilities() {
        let resolver = BackendResolver::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let custom = CustomBackend::new()
            .with_log_density(Arc::new(NormalDensity::new(0., 3)))
            .with_initial_position(vec![0.; 2].into());
        let backend = Backend::Custom(Arc::new(custom));
        assert!(matches!(
            resolver.resolve_init(&backend, &data(), &mut rng),
            Err(ResolveError::DimensionMismatch { expected: 3, found: 2 })
        ));
        assert!(matches!(
            resolver.resolve_predict(&backend, &data(), &SampleSet::new(), 0),
            Err(ResolveError::MissingCapability(Capability::PredictiveFn))
        ));

        let no_density = Backend::Custom(Arc::new(CustomBackend::new()));
        assert!(matches!(
            resolver.resolve_init(&no_density, &data(), &mut rng),
            Err(ResolveError::MissingCapability(Capability::LogDensity))
        ));
    }
}
