//! Generation-time distributions.
//!
//! Weights are stored in natural order: `weights[s]` is the probability
//! that the generation interval is `s + 1` days. The renewal recursion
//! consumes them reversed, so that a dot product with the most recent
//! `len` days of incidence gives the force of infection.

use statrs::distribution::{ContinuousCDF, Gamma};

use crate::error::ConfigurationError;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationKernel {
    /// One distribution shared by all variants.
    Shared(Box<[f64]>),
    /// One distribution per named variant.
    PerVariant {
        names: Vec<String>,
        weights: Vec<Box<[f64]>>,
    },
}

fn validate(weights: &[f64]) -> Result<Box<[f64]>, ConfigurationError> {
    if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w < 0.) {
        return Err(ConfigurationError::InvalidWeights);
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.).abs() > WEIGHT_TOLERANCE {
        return Err(ConfigurationError::InvalidWeights);
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

impl GenerationKernel {
    pub fn shared(weights: &[f64]) -> Result<Self, ConfigurationError> {
        Ok(GenerationKernel::Shared(validate(weights)?))
    }

    pub fn per_variant<S: Into<String>>(
        entries: impl IntoIterator<Item = (S, Vec<f64>)>,
    ) -> Result<Self, ConfigurationError> {
        let mut names = Vec::new();
        let mut weights = Vec::new();
        for (name, w) in entries {
            names.push(name.into());
            weights.push(validate(&w)?);
        }
        if names.is_empty() {
            return Err(ConfigurationError::InvalidWeights);
        }
        Ok(GenerationKernel::PerVariant { names, weights })
    }

    /// Discretise a gamma distribution with the given mean and standard
    /// deviation into `length` daily weights.
    pub fn discretised_gamma(mean: f64, sd: f64, length: usize) -> Result<Self, ConfigurationError> {
        Ok(GenerationKernel::Shared(discretise_gamma(mean, sd, length)?))
    }

    /// Mean generation time of the kernel used for `variant`, in days.
    pub fn mean_generation_time(&self, variant: usize) -> Option<f64> {
        let weights = match self {
            GenerationKernel::Shared(w) => w,
            GenerationKernel::PerVariant { weights, .. } => weights.get(variant)?,
        };
        Some(
            weights
                .iter()
                .enumerate()
                .map(|(s, w)| (s + 1) as f64 * w)
                .sum(),
        )
    }

    /// Reversed weights for every variant, in the order given by
    /// `var_names`.
    pub fn reversed(&self, var_names: &[String]) -> Result<Vec<Box<[f64]>>, ConfigurationError> {
        match self {
            GenerationKernel::Shared(w) => {
                let rev: Box<[f64]> = w.iter().rev().copied().collect();
                Ok(vec![rev; var_names.len()])
            }
            GenerationKernel::PerVariant { names, weights } => var_names
                .iter()
                .map(|name| {
                    let idx = names
                        .iter()
                        .position(|n| n == name)
                        .ok_or_else(|| ConfigurationError::MissingVariant(name.clone()))?;
                    Ok(weights[idx].iter().rev().copied().collect())
                })
                .collect(),
        }
    }
}

pub fn discretise_gamma(mean: f64, sd: f64, length: usize) -> Result<Box<[f64]>, ConfigurationError> {
    if !(mean > 0.) || !(sd > 0.) || length == 0 {
        return Err(ConfigurationError::InvalidOption(format!(
            "gamma generation time needs positive mean, sd and length (got {mean}, {sd}, {length})"
        )));
    }
    let shape = (mean / sd).powi(2);
    let rate = mean / (sd * sd);
    let dist =
        Gamma::new(shape, rate).map_err(|e| ConfigurationError::InvalidOption(e.to_string()))?;
    let raw: Vec<f64> = (0..length)
        .map(|s| dist.cdf((s + 1) as f64) - dist.cdf(s as f64))
        .collect();
    let total: f64 = raw.iter().sum();
    if !(total > 0.) {
        return Err(ConfigurationError::InvalidWeights);
    }
    Ok(raw.into_iter().map(|w| w / total).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn shared_weights_sum_to_one() {
        let kernel = GenerationKernel::shared(&[0.4, 0.3, 0.2, 0.1]).unwrap();
        let rev = kernel.reversed(&names(&["a", "b"])).unwrap();
        assert_eq!(rev.len(), 2);
        assert_eq!(&*rev[0], &[0.1, 0.2, 0.3, 0.4]);
        assert_abs_diff_eq!(rev[1].iter().sum::<f64>(), 1., epsilon = 1e-9);
        assert_abs_diff_eq!(kernel.mean_generation_time(0).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_bad_weights() {
        assert_eq!(
            GenerationKernel::shared(&[0.5, 0.2]),
            Err(ConfigurationError::InvalidWeights)
        );
        assert_eq!(
            GenerationKernel::shared(&[1.5, -0.5]),
            Err(ConfigurationError::InvalidWeights)
        );
        assert!(GenerationKernel::shared(&[]).is_err());
    }

    #[test]
    fn per_variant_lookup_follows_data_order() {
        let kernel = GenerationKernel::per_variant([
            ("omicron", vec![0.5, 0.5]),
            ("delta", vec![1.0]),
        ])
        .unwrap();
        let rev = kernel.reversed(&names(&["delta", "omicron"])).unwrap();
        assert_eq!(&*rev[0], &[1.0]);
        assert_eq!(&*rev[1], &[0.5, 0.5]);

        let err = kernel.reversed(&names(&["delta", "alpha"])).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingVariant("alpha".to_string()));
    }

    #[test]
    fn discretised_gamma_is_normalised() {
        let kernel = GenerationKernel::discretised_gamma(5.2, 1.7, 14).unwrap();
        let GenerationKernel::Shared(w) = &kernel else {
            panic!("expected shared kernel");
        };
        assert_eq!(w.len(), 14);
        assert_abs_diff_eq!(w.iter().sum::<f64>(), 1., epsilon = 1e-9);
        let mean = kernel.mean_generation_time(0).unwrap();
        assert!((mean - 5.7).abs() < 0.5, "mean {mean}");
    }
}
