//! Core abstractions for models that can be fitted.
//!
//! A model either describes itself declaratively through
//! [`GenerativeModel`] and lets the managed backend derive its log density,
//! or brings its own pieces through a [`CustomBackend`]. The choice is made
//! when the model is constructed and exposed via [`ModelSpec::backend`].

use std::fmt::Debug;
use std::sync::Arc;

use rand::RngCore;

use crate::data::ModelData;
use crate::density::LogDensity;
use crate::error::ConfigurationError;
use crate::samples::SampleSet;
use crate::trace::{Handler, ModelError};

/// A declarative generative model.
///
/// The model reports every latent variable, observation and derived
/// quantity to `handler`, in the same order on every call. With `pred` set,
/// observations are not conditioned on.
pub trait GenerativeModel: Send + Sync {
    fn generate(
        &self,
        data: &ModelData,
        handler: &mut dyn Handler,
        pred: bool,
    ) -> Result<(), ModelError>;
}

/// A model that can be handed to the inference front end.
pub trait ModelSpec {
    /// Add the model-specific entries to `data`.
    fn augment_data(&self, data: &mut ModelData) -> Result<(), ConfigurationError>;

    /// How the sampler obtains a log density for this model.
    fn backend(&self) -> Backend;
}

/// Capabilities a custom backend can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    LogDensity,
    LogDensityGenerator,
    InitialPosition,
    InitialPositionGenerator,
    PredictiveFn,
}

pub type LogDensityGenerator =
    Box<dyn Fn(&ModelData) -> Result<Arc<dyn LogDensity>, ModelError> + Send + Sync>;
pub type InitialPositionGenerator = Box<dyn Fn(&mut dyn RngCore, usize) -> Box<[f64]> + Send + Sync>;
pub type PredictiveFn = Box<
    dyn Fn(&mut dyn RngCore, &SampleSet, &ModelData) -> Result<SampleSet, ModelError> + Send + Sync,
>;

pub enum LogDensitySource {
    Provided(Arc<dyn LogDensity>),
    /// Built from the (augmented) data at fit time.
    Generator(LogDensityGenerator),
}

pub enum InitialPositionSource {
    Provided(Box<[f64]>),
    Generator(InitialPositionGenerator),
}

/// Pieces supplied by a model that does not go through the managed backend.
#[derive(Default)]
pub struct CustomBackend {
    pub log_density: Option<LogDensitySource>,
    pub initial_position: Option<InitialPositionSource>,
    pub predictive: Option<PredictiveFn>,
}

impl Debug for CustomBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomBackend")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

impl CustomBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_density(mut self, density: Arc<dyn LogDensity>) -> Self {
        self.log_density = Some(LogDensitySource::Provided(density));
        self
    }

    pub fn with_log_density_generator(mut self, generator: LogDensityGenerator) -> Self {
        self.log_density = Some(LogDensitySource::Generator(generator));
        self
    }

    pub fn with_initial_position(mut self, position: Box<[f64]>) -> Self {
        self.initial_position = Some(InitialPositionSource::Provided(position));
        self
    }

    pub fn with_initial_position_generator(mut self, generator: InitialPositionGenerator) -> Self {
        self.initial_position = Some(InitialPositionSource::Generator(generator));
        self
    }

    pub fn with_predictive(mut self, predictive: PredictiveFn) -> Self {
        self.predictive = Some(predictive);
        self
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::with_capacity(3);
        match self.log_density {
            Some(LogDensitySource::Provided(_)) => caps.push(Capability::LogDensity),
            Some(LogDensitySource::Generator(_)) => caps.push(Capability::LogDensityGenerator),
            None => {}
        }
        match self.initial_position {
            Some(InitialPositionSource::Provided(_)) => caps.push(Capability::InitialPosition),
            Some(InitialPositionSource::Generator(_)) => {
                caps.push(Capability::InitialPositionGenerator)
            }
            None => {}
        }
        if self.predictive.is_some() {
            caps.push(Capability::PredictiveFn);
        }
        caps
    }
}

#[derive(Clone)]
pub enum Backend {
    /// Derive everything from the generative model.
    Managed(Arc<dyn GenerativeModel>),
    Custom(Arc<CustomBackend>),
    /// No way to obtain a log density. Resolving it is an error.
    Inert,
}

impl Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Managed(_) => f.write_str("Managed"),
            Backend::Custom(custom) => f.debug_tuple("Custom").field(custom).finish(),
            Backend::Inert => f.write_str("Inert"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::test_densities::NormalDensity;
    use pretty_assertions::assert_eq;

    #[test]
    fn declared_capabilities() {
        let custom = CustomBackend::new()
            .with_log_density(Arc::new(NormalDensity::new(0., 2)))
            .with_initial_position_generator(Box::new(
                |_: &mut dyn RngCore, dim: usize| -> Box<[f64]> { vec![0.; dim].into() },
            ));
        assert_eq!(
            custom.capabilities(),
            vec![Capability::LogDensity, Capability::InitialPositionGenerator]
        );
        assert!(CustomBackend::new().capabilities().is_empty());
    }
}
