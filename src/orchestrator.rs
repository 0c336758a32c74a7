//! Warmup and the sequential sampling loop.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::backend::{BackendResolver, ResolveError};
use crate::data::ModelData;
use crate::density::LogDensity;
use crate::kernel::{KernelSettings, NutsSettings, SampleStats, TransitionKernel};
use crate::model::Backend;
use crate::samples::SampleSet;
use crate::trace::ParameterLayout;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("no samples available, call fit first")]
    NotFitted,
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("sampler failed")]
    Sampler(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Trace(#[from] anyhow::Error),
}

fn sampler_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> OrchestratorError {
    OrchestratorError::Sampler(Box::new(err))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    WarmedUp,
    Sampled,
    /// Predictions were drawn at least once.
    Finalized,
}

struct Fitted<K: TransitionKernel> {
    kernel: K,
    layout: ParameterLayout,
    positions: Vec<Box<[f64]>>,
    stats: Vec<K::Stats>,
}

/// Runs one Markov chain for a model and keeps its draws.
///
/// All randomness comes from a single seeded key stream. Every call that
/// needs randomness splits one fresh key off it, so a new orchestrator
/// with the same seed repeats `fit` followed by `predict` exactly.
pub struct Orchestrator<S: KernelSettings = NutsSettings> {
    settings: S,
    resolver: BackendResolver,
    key_stream: ChaCha8Rng,
    phase: Phase,
    fitted: Option<Fitted<S::Kernel>>,
}

impl<S: KernelSettings> Orchestrator<S> {
    pub fn new(settings: S, seed: u64) -> Self {
        Orchestrator {
            settings,
            resolver: BackendResolver::default(),
            key_stream: ChaCha8Rng::seed_from_u64(seed),
            phase: Phase::Uninitialized,
            fitted: None,
        }
    }

    pub fn with_resolver(mut self, resolver: BackendResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn split_key(&mut self) -> u64 {
        self.key_stream.random()
    }

    fn substream(&mut self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.split_key())
    }

    /// Tune a kernel over at least one warmup step.
    #[allow(clippy::type_complexity)]
    pub fn warmup(
        &mut self,
        position: &[f64],
        density: Arc<dyn LogDensity>,
        num_warmup: usize,
    ) -> Result<(S::Kernel, <S::Kernel as TransitionKernel>::State), OrchestratorError> {
        let num_warmup = num_warmup.max(1);
        let mut rng = self.substream();
        let tuned = self
            .settings
            .window_adaptation(&mut rng, density, position, num_warmup as u64)
            .map_err(sampler_error)?;
        self.phase = Phase::WarmedUp;
        Ok(tuned)
    }

    /// Resolve the backend, optionally warm up, then run exactly
    /// `num_samples` transitions. Draw `i` starts from the state left by
    /// draw `i - 1`.
    pub fn fit(
        &mut self,
        backend: &Backend,
        data: &Arc<ModelData>,
        num_warmup: usize,
        num_samples: usize,
    ) -> Result<(), OrchestratorError> {
        self.fitted = None;
        self.phase = Phase::Uninitialized;

        let mut init_rng = self.substream();
        let init = self.resolver.resolve_init(backend, data, &mut init_rng)?;
        let layout = init.log_density.layout();

        let (mut kernel, mut state) = if num_warmup > 0 {
            self.warmup(&init.position, init.log_density, num_warmup)?
        } else {
            log::debug!("no warmup requested, sampling with default tuning");
            let kernel = self.settings.build(init.log_density);
            let state = kernel.init(&init.position).map_err(sampler_error)?;
            (kernel, state)
        };

        let mut positions: Vec<Box<[f64]>> = Vec::with_capacity(num_samples);
        let mut stats = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            let mut rng = self.substream();
            let (next, info) = kernel.step(&mut rng, &state).map_err(sampler_error)?;
            positions.push(kernel.position(&next).into());
            stats.push(info);
            state = next;
        }

        let divergences = stats.iter().filter(|info| info.diverging()).count();
        if divergences > 0 {
            log::warn!("{divergences} of {num_samples} draws ended in a divergence");
        }

        self.fitted = Some(Fitted {
            kernel,
            layout,
            positions,
            stats,
        });
        self.phase = Phase::Sampled;
        Ok(())
    }

    fn fitted(&self) -> Result<&Fitted<S::Kernel>, OrchestratorError> {
        self.fitted.as_ref().ok_or(OrchestratorError::NotFitted)
    }

    /// Constrained draws of every latent site. Empty if `fit` ran with
    /// zero samples.
    pub fn samples(&self) -> Result<SampleSet, OrchestratorError> {
        let fitted = self.fitted()?;
        Ok(SampleSet::from_positions(&fitted.layout, &fitted.positions)?)
    }

    /// Unconstrained sampler positions, one per draw.
    pub fn positions(&self) -> Result<&[Box<[f64]>], OrchestratorError> {
        Ok(&self.fitted()?.positions)
    }

    pub fn infos(&self) -> Result<&[<S::Kernel as TransitionKernel>::Stats], OrchestratorError> {
        Ok(&self.fitted()?.stats)
    }

    pub fn kernel(&self) -> Result<&S::Kernel, OrchestratorError> {
        Ok(&self.fitted()?.kernel)
    }

    /// Posterior-predictive draws merged into the fitted samples.
    pub fn predict(
        &mut self,
        backend: &Backend,
        data: &Arc<ModelData>,
    ) -> Result<SampleSet, OrchestratorError> {
        let samples = self.samples()?;
        let key = self.split_key();
        let predicted = self.resolver.resolve_predict(backend, data, &samples, key)?;
        self.phase = Phase::Finalized;
        Ok(predicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::test_densities::NormalDensity;
    use crate::model::CustomBackend;
    use faer::Mat;
    use pretty_assertions::assert_eq;

    fn data() -> Arc<ModelData> {
        let counts = Mat::from_fn(3, 1, |_, _| 2.);
        Arc::new(ModelData::new(counts, vec!["a".into()]).unwrap())
    }

    fn normal_backend() -> Backend {
        Backend::Custom(Arc::new(
            CustomBackend::new()
                .with_log_density(Arc::new(NormalDensity::new(1., 2)))
                .with_initial_position(vec![0.; 2].into()),
        ))
    }

    #[test]
    fn fit_collects_draws_in_order() {
        let mut orch = Orchestrator::new(NutsSettings::default(), 3);
        assert_eq!(orch.phase(), Phase::Uninitialized);
        assert!(matches!(orch.samples(), Err(OrchestratorError::NotFitted)));

        orch.fit(&normal_backend(), &data(), 100, 300).unwrap();
        assert_eq!(orch.phase(), Phase::Sampled);
        assert_eq!(orch.infos().unwrap().len(), 300);

        let samples = orch.samples().unwrap();
        let position = samples.get("position").unwrap();
        assert_eq!(position.num_draws(), 300);
        let mean = position.mean();
        assert!(mean.iter().all(|m| (m - 1.).abs() < 0.3), "{mean:?}");
    }

    #[test]
    fn zero_samples_give_empty_set() {
        let mut orch = Orchestrator::new(NutsSettings::default(), 0);
        orch.fit(&normal_backend(), &data(), 0, 0).unwrap();
        assert!(orch.samples().unwrap().is_empty());
        assert!(orch.infos().unwrap().is_empty());
    }

    #[test]
    fn same_seed_same_draws() {
        let run = |seed| {
            let mut orch = Orchestrator::new(NutsSettings::default(), seed);
            orch.fit(&normal_backend(), &data(), 20, 20).unwrap();
            orch.positions().unwrap().to_vec()
        };
        assert_eq!(run(5), run(5));
        assert_ne!(run(5), run(6));
    }

    #[test]
    fn predict_without_fit_fails() {
        let mut orch = Orchestrator::new(NutsSettings::default(), 0);
        assert!(matches!(
            orch.predict(&normal_backend(), &data()),
            Err(OrchestratorError::NotFitted)
        ));
    }

    #[test]
    fn inert_backend_is_reported() {
        let mut orch = Orchestrator::new(NutsSettings::default(), 0);
        let err = orch.fit(&Backend::Inert, &data(), 1, 1).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Resolve(ResolveError::NoBackend)
        ));
    }
}
