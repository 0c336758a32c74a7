//! Fit a model end to end: augment the data, sample, predict.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::ResolveError;
use crate::data::ModelData;
use crate::error::ConfigurationError;
use crate::kernel::NutsSettings;
use crate::model::{Capability, ModelSpec};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::samples::SampleSet;

/// Run lengths and the seed of a fit. Counts are signed so that invalid
/// user input can be reported instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceConfig {
    pub num_warmup: i64,
    pub num_samples: i64,
    pub seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            num_warmup: 1000,
            num_samples: 1000,
            seed: 0,
        }
    }
}

impl InferenceConfig {
    /// Warmup and sample counts as unsigned values.
    pub fn validate(&self) -> Result<(usize, usize), ConfigurationError> {
        let check = |name: &'static str, value: i64| {
            usize::try_from(value).map_err(|_| ConfigurationError::Negative { name, value })
        };
        Ok((
            check("num_warmup", self.num_warmup)?,
            check("num_samples", self.num_samples)?,
        ))
    }
}

/// Samples of a fitted model together with the data they were fitted on.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub samples: SampleSet,
    pub data: Arc<ModelData>,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct InferNuts {
    pub config: InferenceConfig,
    pub settings: NutsSettings,
}

impl InferNuts {
    pub fn new(config: InferenceConfig) -> Self {
        InferNuts {
            config,
            settings: NutsSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: NutsSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Posterior and posterior-predictive samples of `model` given `data`.
    ///
    /// A custom model without a predictive function returns the plain
    /// posterior samples.
    pub fn fit<M: ModelSpec + ?Sized>(
        &self,
        model: &M,
        mut data: ModelData,
        name: Option<&str>,
    ) -> Result<Posterior> {
        let (num_warmup, num_samples) = self.config.validate()?;
        model
            .augment_data(&mut data)
            .context("Could not prepare model data")?;
        let data = Arc::new(data);
        let backend = model.backend();

        let mut orchestrator = Orchestrator::new(self.settings, self.config.seed);
        orchestrator
            .fit(&backend, &data, num_warmup, num_samples)
            .context("Sampling failed")?;

        let samples = match orchestrator.predict(&backend, &data) {
            Ok(samples) => samples,
            Err(OrchestratorError::Resolve(ResolveError::MissingCapability(
                Capability::PredictiveFn,
            ))) => {
                log::warn!("model has no predictive function, returning posterior samples only");
                orchestrator.samples()?
            }
            Err(err) => return Err(err).context("Posterior prediction failed"),
        };

        Ok(Posterior {
            samples,
            data,
            name: name.unwrap_or_default().to_string(),
        })
    }
}
