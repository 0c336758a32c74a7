//! Log density functions as seen by the sampler.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::Arc;

use finitediff::FiniteDiff;
use thiserror::Error;

use crate::data::ModelData;
use crate::model::GenerativeModel;
use crate::trace::{DensityEvaluator, ModelError, ParameterLayout};

/// Errors that happen when we evaluate the logp and gradient function
#[derive(Error, Debug)]
pub enum LogpError {
    #[error("log density is not finite: {0}")]
    NonFinite(f64),
    #[error("gradient is not finite at index {0}")]
    NonFiniteGradient(usize),
    #[error("model evaluation failed")]
    Model(#[from] ModelError),
}

impl LogpError {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LogpError::NonFinite(_) | LogpError::NonFiniteGradient(_) => true,
            LogpError::Model(err) => err.is_domain_error(),
        }
    }
}

/// An unnormalized log density on an unconstrained real vector space.
pub trait LogDensity: Send + Sync {
    fn dim(&self) -> usize;

    /// Write the gradient into `grad` and return the log density.
    fn logp(&self, position: &[f64], grad: &mut [f64]) -> Result<f64, LogpError>;

    /// How positions map onto named parameters.
    fn layout(&self) -> ParameterLayout {
        ParameterLayout::flat("position", self.dim())
    }
}

/// Log density derived from a declarative generative model. Gradients
/// come from central finite differences.
pub struct ManagedDensity {
    model: Arc<dyn GenerativeModel>,
    data: Arc<ModelData>,
    layout: ParameterLayout,
}

impl Debug for ManagedDensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDensity")
            .field("layout", &self.layout)
            .finish()
    }
}

impl ManagedDensity {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        data: Arc<ModelData>,
        layout: ParameterLayout,
    ) -> Self {
        ManagedDensity {
            model,
            data,
            layout,
        }
    }

    /// Log density without gradient.
    pub fn value(&self, position: &[f64]) -> Result<f64, ModelError> {
        let mut evaluator = DensityEvaluator::new(&self.layout, position)?;
        self.model.generate(&self.data, &mut evaluator, false)?;
        evaluator.finish()
    }
}

impl LogDensity for ManagedDensity {
    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn logp(&self, position: &[f64], grad: &mut [f64]) -> Result<f64, LogpError> {
        let logp = self.value(position)?;
        if !logp.is_finite() {
            return Err(LogpError::NonFinite(logp));
        }

        // The difference closure cannot return errors, keep the first one.
        let failure: RefCell<Option<ModelError>> = RefCell::new(None);
        let func = |x: &Vec<f64>| -> f64 {
            match self.value(x) {
                Ok(val) => val,
                Err(err) => {
                    let mut slot = failure.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    f64::NAN
                }
            }
        };
        let fd_grad = position.to_vec().central_diff(&func);
        if let Some(err) = failure.into_inner() {
            return Err(err.into());
        }
        for (i, (out, val)) in grad.iter_mut().zip(fd_grad).enumerate() {
            if !val.is_finite() {
                return Err(LogpError::NonFiniteGradient(i));
            }
            *out = val;
        }
        Ok(logp)
    }

    fn layout(&self) -> ParameterLayout {
        self.layout.clone()
    }
}
