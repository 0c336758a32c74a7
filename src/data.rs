//! Surveillance data handed to the generative models.

use faer::Mat;

use crate::error::ConfigurationError;

/// Model-specific additions made by `ModelSpec::augment_data`.
#[derive(Debug, Clone, Default)]
pub struct Augmentation {
    /// Fixed generation time used to convert growth advantages.
    pub tau: Option<f64>,
    /// Feature matrix, one row per time step.
    pub features: Option<Mat<f64>>,
    /// Time derivative of `features`.
    pub features_deriv: Option<Mat<f64>>,
    /// Reversed generation kernels, one per variant in data order.
    pub generation_rev: Option<Vec<Box<[f64]>>>,
    pub delays: Option<Box<[f64]>>,
    pub seed_l: usize,
    pub forecast_l: usize,
}

#[derive(Debug, Clone)]
pub struct ModelData {
    /// Daily case counts, NaN where missing.
    pub cases: Option<Vec<f64>>,
    /// Sequence counts, `time x variant`, NaN where missing.
    pub seq_counts: Mat<f64>,
    /// Total sequences per day.
    pub total_counts: Vec<f64>,
    pub var_names: Vec<String>,
    pub augmentation: Augmentation,
}

fn check_count(val: f64) -> bool {
    val.is_nan() || (val >= 0. && val.is_finite())
}

impl ModelData {
    /// Build model data from sequence counts. Daily totals are the row
    /// sums, or NaN for rows with a missing entry.
    pub fn new(
        seq_counts: Mat<f64>,
        var_names: Vec<String>,
    ) -> Result<Self, ConfigurationError> {
        if var_names.len() != seq_counts.ncols() {
            return Err(ConfigurationError::InvalidData(format!(
                "{} variant names for {} sequence count columns",
                var_names.len(),
                seq_counts.ncols()
            )));
        }
        if var_names.is_empty() || seq_counts.nrows() == 0 {
            return Err(ConfigurationError::InvalidData(
                "sequence counts must have at least one row and one variant".to_string(),
            ));
        }
        for t in 0..seq_counts.nrows() {
            for v in 0..seq_counts.ncols() {
                if !check_count(seq_counts[(t, v)]) {
                    return Err(ConfigurationError::InvalidData(format!(
                        "invalid sequence count {} at ({t}, {v})",
                        seq_counts[(t, v)]
                    )));
                }
            }
        }
        let total_counts = (0..seq_counts.nrows())
            .map(|t| {
                (0..seq_counts.ncols())
                    .map(|v| seq_counts[(t, v)])
                    .sum::<f64>()
            })
            .collect();
        Ok(ModelData {
            cases: None,
            seq_counts,
            total_counts,
            var_names,
            augmentation: Augmentation::default(),
        })
    }

    pub fn with_cases(mut self, cases: Vec<f64>) -> Result<Self, ConfigurationError> {
        if cases.len() != self.num_times() {
            return Err(ConfigurationError::InvalidData(format!(
                "{} case counts for {} time steps",
                cases.len(),
                self.num_times()
            )));
        }
        if let Some(bad) = cases.iter().find(|&&c| !check_count(c)) {
            return Err(ConfigurationError::InvalidData(format!(
                "invalid case count {bad}"
            )));
        }
        self.cases = Some(cases);
        Ok(self)
    }

    pub fn with_total_counts(mut self, total: Vec<f64>) -> Result<Self, ConfigurationError> {
        if total.len() != self.num_times() {
            return Err(ConfigurationError::InvalidData(format!(
                "{} totals for {} time steps",
                total.len(),
                self.num_times()
            )));
        }
        self.total_counts = total;
        Ok(self)
    }

    pub fn num_times(&self) -> usize {
        self.seq_counts.nrows()
    }

    pub fn num_variants(&self) -> usize {
        self.seq_counts.ncols()
    }

    /// Earliest time index with a nonzero, non-missing sequence count, per
    /// variant.
    pub fn first_detection(&self) -> Vec<Option<usize>> {
        (0..self.num_variants())
            .map(|v| {
                (0..self.num_times()).find(|&t| {
                    let val = self.seq_counts[(t, v)];
                    !val.is_nan() && val != 0.
                })
            })
            .collect()
    }

    pub fn features(&self) -> Result<&Mat<f64>, ConfigurationError> {
        self.augmentation
            .features
            .as_ref()
            .ok_or(ConfigurationError::MissingAugmentation("features"))
    }

    pub fn features_deriv(&self) -> Result<&Mat<f64>, ConfigurationError> {
        self.augmentation
            .features_deriv
            .as_ref()
            .ok_or(ConfigurationError::MissingAugmentation("features_deriv"))
    }

    pub fn generation_rev(&self) -> Result<&[Box<[f64]>], ConfigurationError> {
        self.augmentation
            .generation_rev
            .as_deref()
            .ok_or(ConfigurationError::MissingAugmentation("generation_rev"))
    }

    pub fn tau(&self) -> Result<f64, ConfigurationError> {
        self.augmentation
            .tau
            .ok_or(ConfigurationError::MissingAugmentation("tau"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|v| format!("v{v}")).collect()
    }

    #[test]
    fn totals_propagate_missing_rows() {
        let counts = Mat::from_fn(3, 2, |t, v| if t == 1 && v == 0 { f64::NAN } else { 2. });
        let data = ModelData::new(counts, names(2)).unwrap();
        assert_eq!(data.total_counts[0], 4.);
        assert!(data.total_counts[1].is_nan());
    }

    #[test]
    fn first_detection_skips_missing() {
        let counts = Mat::from_fn(4, 2, |t, v| match (t, v) {
            (0, 1) => f64::NAN,
            (1, 1) => 0.,
            (_, 1) => 3.,
            _ => 1.,
        });
        let data = ModelData::new(counts, names(2)).unwrap();
        assert_eq!(data.first_detection(), vec![Some(0), Some(2)]);

        let never = Mat::from_fn(2, 1, |_, _| 0.);
        let data = ModelData::new(never, names(1)).unwrap();
        assert_eq!(data.first_detection(), vec![None]);
    }

    #[test]
    fn validation() {
        let counts = Mat::from_fn(2, 2, |_, _| 1.);
        assert!(ModelData::new(counts.clone(), names(3)).is_err());
        let negative = Mat::from_fn(2, 1, |_, _| -1.);
        assert!(ModelData::new(negative, names(1)).is_err());
        let data = ModelData::new(counts, names(2)).unwrap();
        assert!(data.clone().with_cases(vec![1.]).is_err());
        assert!(data.clone().with_cases(vec![1., f64::NAN]).is_ok());
        assert_eq!(
            data.features().unwrap_err(),
            ConfigurationError::MissingAugmentation("features")
        );
    }
}
