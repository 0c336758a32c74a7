/// A periodic reporting cycle, e.g. day-of-week under-reporting.
///
/// The cycle is the given fractions followed by an implicit reference
/// entry of one, normalised to sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingCycle {
    weights: Box<[f64]>,
}

impl ReportingCycle {
    pub fn from_fractions(fractions: &[f64]) -> Self {
        let total: f64 = fractions.iter().sum::<f64>() + 1.;
        let weights = fractions
            .iter()
            .chain(std::iter::once(&1.))
            .map(|f| f / total)
            .collect();
        ReportingCycle { weights }
    }

    /// A cycle that uses `weights` as they are, one per day.
    pub fn from_weights(weights: &[f64]) -> Self {
        ReportingCycle {
            weights: weights.into(),
        }
    }

    pub fn period(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Tile the cycle to exactly `length` entries.
    pub fn expand(&self, length: usize) -> Vec<f64> {
        self.weights.iter().copied().cycle().take(length).collect()
    }
}

/// Per-timestep reporting multipliers of length `length`.
pub fn expand(fractions: &[f64], length: usize) -> Vec<f64> {
    ReportingCycle::from_fractions(fractions).expand(length)
}
