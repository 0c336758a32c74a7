//! Variant-specific transmission dynamics from case and sequence counts.
//!
//! Models describe themselves through [`ModelSpec`]. The renewal model
//! ([`RenewalModel`]) and the spline incidence model
//! ([`SplineIncidenceModel`]) are declarative and get their log density
//! from the managed backend; [`MultinomialLogisticRegression`] brings its
//! own. [`InferNuts`] fits any of them with the No-U-Turn sampler.

pub(crate) mod adapt_strategy;
pub(crate) mod backend;
pub(crate) mod data;
pub(crate) mod density;
pub mod distributions;
pub(crate) mod error;
pub mod generation;
pub(crate) mod hamiltonian;
pub(crate) mod inference;
pub(crate) mod kernel;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub mod mlr;
pub(crate) mod model;
pub(crate) mod nuts;
pub mod options;
pub(crate) mod orchestrator;
pub mod renewal;
pub(crate) mod renewal_model;
pub mod reporting;
pub(crate) mod samples;
pub mod spline;
pub(crate) mod spline_model;
pub(crate) mod stepsize;
pub mod trace;

pub use adapt_strategy::AdaptOptions;
pub use backend::{BackendResolver, Initialized, ResolveError};
pub use data::{Augmentation, ModelData};
pub use density::{LogDensity, LogpError, ManagedDensity};
pub use error::ConfigurationError;
pub use generation::GenerationKernel;
pub use hamiltonian::DivergenceInfo;
pub use inference::{InferNuts, InferenceConfig, Posterior};
pub use kernel::{
    KernelSettings, NutsKernel, NutsSampleStats, NutsSettings, NutsState, SampleStats,
    TransitionKernel,
};
pub use mass_matrix::DiagAdaptExpSettings;
pub use mlr::{MlrDensity, MultinomialLogisticRegression};
pub use model::{
    Backend, Capability, CustomBackend, GenerativeModel, InitialPositionGenerator,
    InitialPositionSource, LogDensityGenerator, LogDensitySource, ModelSpec, PredictiveFn,
};
pub use nuts::NutsError;
pub use orchestrator::{Orchestrator, OrchestratorError, Phase};
pub use renewal::RenewalSimulator;
pub use renewal_model::{RenewalModel, REPORTING_PARAMS};
pub use reporting::ReportingCycle;
pub use samples::{SampleSet, SiteDraws};
pub use spline::SplineBasis;
pub use spline_model::SplineIncidenceModel;
pub use stepsize::DualAverageOptions;
