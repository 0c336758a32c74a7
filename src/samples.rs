//! Posterior and posterior-predictive draws keyed by site name.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    ArrayRef, Float64Builder, LargeListBuilder, RecordBatch, RecordBatchOptions,
};
use arrow::datatypes::{DataType, Field, Schema};

use crate::trace::ParameterLayout;

/// All draws of a single site. `shape` is the shape of one draw, values
/// are stored draw-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteDraws {
    shape: Vec<usize>,
    values: Vec<f64>,
    num_draws: usize,
}

impl SiteDraws {
    pub fn new(shape: Vec<usize>) -> Self {
        SiteDraws {
            shape,
            values: Vec::new(),
            num_draws: 0,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of values in one draw.
    pub fn draw_len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn num_draws(&self) -> usize {
        self.num_draws
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn push(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.draw_len() {
            bail!(
                "draw with {} values does not match shape {:?}",
                values.len(),
                self.shape
            );
        }
        self.values.extend_from_slice(values);
        self.num_draws += 1;
        Ok(())
    }

    pub fn draw(&self, idx: usize) -> Option<&[f64]> {
        if idx >= self.num_draws {
            return None;
        }
        let len = self.draw_len();
        Some(&self.values[idx * len..(idx + 1) * len])
    }

    /// Elementwise mean over draws, ignoring NaN entries.
    pub fn mean(&self) -> Vec<f64> {
        let len = self.draw_len();
        let mut sums = vec![0f64; len];
        let mut counts = vec![0usize; len];
        for draw in self.values.chunks(len.max(1)) {
            for (i, &val) in draw.iter().enumerate() {
                if !val.is_nan() {
                    sums[i] += val;
                    counts[i] += 1;
                }
            }
        }
        sums.into_iter()
            .zip(counts)
            .map(|(s, n)| if n == 0 { f64::NAN } else { s / n as f64 })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    sites: BTreeMap<String, SiteDraws>,
}

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect constrained draws from unconstrained sampler positions.
    pub fn from_positions(layout: &ParameterLayout, positions: &[Box<[f64]>]) -> Result<Self> {
        let mut samples = SampleSet::new();
        if positions.is_empty() {
            return Ok(samples);
        }
        for site in layout.sites() {
            let mut draws = SiteDraws::new(site.shape.clone());
            for position in positions {
                draws.push(&layout.constrain_site(site, position))?;
            }
            samples.insert(site.name.clone(), draws);
        }
        Ok(samples)
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Number of draws, taken from the first site.
    pub fn num_draws(&self) -> usize {
        self.sites.values().next().map_or(0, SiteDraws::num_draws)
    }

    pub fn get(&self, name: &str) -> Option<&SiteDraws> {
        self.sites.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sites.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, draws: SiteDraws) {
        self.sites.insert(name.into(), draws);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SiteDraws)> {
        self.sites.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The values of every site for draw `idx`.
    pub fn draw(&self, idx: usize) -> BTreeMap<&str, &[f64]> {
        self.sites
            .iter()
            .filter_map(|(name, draws)| Some((name.as_str(), draws.draw(idx)?)))
            .collect()
    }

    /// Posterior mean of a site, ignoring NaN entries.
    pub fn mean(&self, name: &str) -> Option<Vec<f64>> {
        self.sites.get(name).map(SiteDraws::mean)
    }

    /// Union with `predictive`. Keys already present are kept unchanged.
    pub fn merge_predictive(&self, predictive: SampleSet) -> SampleSet {
        let mut merged = self.clone();
        for (name, draws) in predictive.sites {
            merged.sites.entry(name).or_insert(draws);
        }
        merged
    }

    /// One row per draw, one column per site. Scalar sites become float
    /// columns, everything else a flattened list column.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let num_draws = self.num_draws();
        let mut fields = Vec::with_capacity(self.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.len());
        for (name, draws) in self.sites.iter() {
            if draws.num_draws() != num_draws {
                bail!(
                    "site {name} has {} draws, expected {num_draws}",
                    draws.num_draws()
                );
            }
            if draws.shape().is_empty() {
                let mut builder = Float64Builder::with_capacity(num_draws);
                builder.append_slice(draws.values());
                fields.push(Field::new(name, DataType::Float64, false));
                columns.push(Arc::new(builder.finish()));
            } else {
                let item = Field::new("item", DataType::Float64, false);
                let mut builder = LargeListBuilder::new(Float64Builder::with_capacity(
                    draws.values().len(),
                ))
                .with_field(item.clone());
                for idx in 0..num_draws {
                    if let Some(values) = draws.draw(idx) {
                        builder.values().append_slice(values);
                    }
                    builder.append(true);
                }
                fields.push(Field::new_large_list(name, item, false));
                columns.push(Arc::new(builder.finish()));
            }
        }
        let options = RecordBatchOptions::new().with_row_count(Some(num_draws));
        RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
            .context("Could not assemble sample trace")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use pretty_assertions::assert_eq;

    fn site(shape: Vec<usize>, draws: &[&[f64]]) -> SiteDraws {
        let mut out = SiteDraws::new(shape);
        for d in draws {
            out.push(d).unwrap();
        }
        out
    }

    #[test]
    fn push_checks_shape() {
        let mut draws = SiteDraws::new(vec![2, 2]);
        assert!(draws.push(&[1., 2., 3.]).is_err());
        draws.push(&[1., 2., 3., 4.]).unwrap();
        assert_eq!(draws.num_draws(), 1);
        assert_eq!(draws.draw(0), Some(&[1., 2., 3., 4.][..]));
        assert_eq!(draws.draw(1), None);
    }

    #[test]
    fn mean_ignores_nan() {
        let draws = site(vec![2], &[&[f64::NAN, 1.], &[f64::NAN, 3.]]);
        let mean = draws.mean();
        assert!(mean[0].is_nan());
        assert_eq!(mean[1], 2.);
    }

    #[test]
    fn merge_keeps_sampled_keys() {
        let mut sampled = SampleSet::new();
        sampled.insert("a", site(vec![], &[&[1.], &[2.]]));
        let mut pred = SampleSet::new();
        pred.insert("a", site(vec![], &[&[10.], &[20.]]));
        pred.insert("b", site(vec![1], &[&[3.], &[4.]]));

        let merged = sampled.merge_predictive(pred);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("a"), sampled.get("a"));
        assert_eq!(merged.get("b").unwrap().values(), &[3., 4.]);
    }

    #[test]
    fn record_batch_layout() {
        let mut samples = SampleSet::new();
        samples.insert("scalar", site(vec![], &[&[1.], &[2.], &[3.]]));
        samples.insert("vec", site(vec![2], &[&[1., 2.], &[3., 4.], &[5., 6.]]));
        let batch = samples.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.column(1).len(), 3);

        let empty = SampleSet::new().to_record_batch().unwrap();
        assert_eq!(empty.num_rows(), 0);
    }
}
