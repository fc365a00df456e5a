//! Registry of feature and trial-step functions
//!
//! Functions are registered under a name and looked up when the configuration
//! is bound, so an unknown name fails before any extraction runs.
//!
//! # Example
//!
//! ```rust
//! use campaign_etl::registry::{FeatureOutput, FunctionRegistry};
//! use std::collections::BTreeMap;
//!
//! let registry = FunctionRegistry::new()
//!     .with_feature("spike_count", |input| {
//!         let mut fields = BTreeMap::new();
//!         fields.insert("count".to_string(), (input.table.num_rows() as i64).into());
//!         Ok(FeatureOutput::Fields(fields))
//!     })
//!     .with_trial_steps("first_spike", |spikes, _config| {
//!         let first = spikes.iter().copied().fold(f64::INFINITY, f64::min);
//!         Ok(BTreeMap::from([("trial_steps_value".to_string(), first)]))
//!     });
//!
//! assert!(registry.feature("spike_count").is_ok());
//! assert!(registry.feature("missing").is_err());
//! ```

use crate::config::TrialStepsConfig;
use crate::extract::GroupKey;
use crate::repository::Repository;
use crate::table::{column_names, Scalar};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Arguments of a feature function call
#[derive(Debug, Clone, Copy)]
pub struct FeatureInput<'a> {
    /// Repository holding every extracted dataset
    pub repo: &'a Repository,
    /// Key of the group
    pub key: &'a GroupKey,
    /// Spikes of the group, without the key columns
    pub table: &'a RecordBatch,
    /// Parameters of this variant
    pub params: &'a Value,
}

/// One computed field
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    /// Single value
    Scalar(Scalar),
    /// List of numbers, stored as a list column
    List(Vec<f64>),
}

impl From<Scalar> for FeatureValue {
    fn from(v: Scalar) -> Self {
        Self::Scalar(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::Float(v))
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::Int(v))
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        Self::Scalar(Scalar::from(v))
    }
}

impl From<Vec<f64>> for FeatureValue {
    fn from(v: Vec<f64>) -> Self {
        Self::List(v)
    }
}

/// Table returned by a generic feature function
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    batch: RecordBatch,
    index_columns: Vec<String>,
}

impl FeatureFrame {
    /// Table without index columns (the row position is the only index)
    #[must_use]
    pub const fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            index_columns: Vec::new(),
        }
    }

    /// Table whose `index_columns` identify the rows
    ///
    /// # Errors
    /// Returns a configuration error if an index column is not in the table
    pub fn with_index(batch: RecordBatch, index_columns: &[&str]) -> Result<Self> {
        let names = column_names(&batch);
        if let Some(missing) = index_columns.iter().find(|c| !names.iter().any(|n| n == *c)) {
            return Err(Error::Configuration(format!(
                "index column {missing:?} not in {names:?}"
            )));
        }
        Ok(Self {
            batch,
            index_columns: index_columns.iter().map(|c| (*c).to_string()).collect(),
        })
    }

    /// The table
    #[must_use]
    pub const fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Index columns, empty for a positional index
    #[must_use]
    pub fn index_columns(&self) -> &[String] {
        &self.index_columns
    }
}

/// Result of a feature function
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureOutput {
    /// Fields of the group record (`gid` and `neuron_class` features)
    Fields(BTreeMap<String, FeatureValue>),
    /// Named tables (`generic` features)
    Tables(BTreeMap<String, FeatureFrame>),
}

/// A feature function
pub trait FeatureFunction: Send + Sync {
    /// Compute the features of one group
    ///
    /// # Errors
    /// Returns error if the features cannot be computed
    fn invoke(&self, input: &FeatureInput<'_>) -> Result<FeatureOutput>;
}

impl<F> FeatureFunction for F
where
    F: Fn(&FeatureInput<'_>) -> Result<FeatureOutput> + Send + Sync,
{
    fn invoke(&self, input: &FeatureInput<'_>) -> Result<FeatureOutput> {
        self(input)
    }
}

/// A trial-step function: computes `trial_steps_value` from spike times
pub trait TrialStepsFunction: Send + Sync {
    /// Compute the trial steps fields, `trial_steps_value` included
    ///
    /// # Errors
    /// Returns error if the value cannot be computed
    fn invoke(&self, spikes: &[f64], config: &TrialStepsConfig) -> Result<BTreeMap<String, f64>>;
}

impl<F> TrialStepsFunction for F
where
    F: Fn(&[f64], &TrialStepsConfig) -> Result<BTreeMap<String, f64>> + Send + Sync,
{
    fn invoke(&self, spikes: &[f64], config: &TrialStepsConfig) -> Result<BTreeMap<String, f64>> {
        self(spikes, config)
    }
}

/// Named feature and trial-step functions
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    features: HashMap<String, Arc<dyn FeatureFunction>>,
    trial_steps: HashMap<String, Arc<dyn TrialStepsFunction>>,
}

impl FunctionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature closure
    #[must_use]
    pub fn with_feature<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&FeatureInput<'_>) -> Result<FeatureOutput> + Send + Sync + 'static,
    {
        self.features.insert(name.to_string(), Arc::new(function));
        self
    }

    /// Register a trial-step closure
    #[must_use]
    pub fn with_trial_steps<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[f64], &TrialStepsConfig) -> Result<BTreeMap<String, f64>> + Send + Sync + 'static,
    {
        self.trial_steps.insert(name.to_string(), Arc::new(function));
        self
    }

    /// Feature function by name
    ///
    /// # Errors
    /// Returns a configuration error if the name is not registered
    pub fn feature(&self, name: &str) -> Result<Arc<dyn FeatureFunction>> {
        self.features
            .get(name)
            .cloned()
            .ok_or_else(|| Error::function(name, "not registered as a feature function"))
    }

    /// Trial-step function by name
    ///
    /// # Errors
    /// Returns a configuration error if the name is not registered
    pub fn trial_steps(&self, name: &str) -> Result<Arc<dyn TrialStepsFunction>> {
        self.trial_steps
            .get(name)
            .cloned()
            .ok_or_else(|| Error::function(name, "not registered as a trial steps function"))
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut features: Vec<&String> = self.features.keys().collect();
        let mut trial_steps: Vec<&String> = self.trial_steps.keys().collect();
        features.sort();
        trial_steps.sort();
        f.debug_struct("FunctionRegistry")
            .field("features", &features)
            .field("trial_steps", &trial_steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableBuilder;

    #[test]
    fn test_unknown_function_names_the_function() {
        let registry = FunctionRegistry::new();
        let err = registry.feature("pkg.module.missing").err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("pkg.module.missing"));
        assert!(registry.trial_steps("onset").is_err());
    }

    #[test]
    fn test_trial_steps_closure() {
        let registry = FunctionRegistry::new().with_trial_steps("mean", |spikes, config| {
            let mean = spikes.iter().sum::<f64>() / spikes.len() as f64;
            Ok(BTreeMap::from([("trial_steps_value".to_string(), mean + config.initial_offset)]))
        });
        let config: TrialStepsConfig = serde_json::from_value(serde_json::json!({
            "function": "mean",
            "bounds": [0, 10]
        }))
        .unwrap();
        let result = registry.trial_steps("mean").unwrap().invoke(&[1.0, 3.0], &config).unwrap();
        assert!((result["trial_steps_value"] - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frame_index_columns_must_exist() {
        let batch = TableBuilder::new()
            .int64("bin", vec![0, 1])
            .float64("rate", vec![0.5, 1.5])
            .build()
            .unwrap();
        let frame = FeatureFrame::with_index(batch.clone(), &["bin"]).unwrap();
        assert_eq!(frame.index_columns(), ["bin".to_string()]);
        assert!(FeatureFrame::new(batch.clone()).index_columns().is_empty());
        assert!(FeatureFrame::with_index(batch, &["missing"]).is_err());
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = FunctionRegistry::new()
            .with_feature("b", |_| Ok(FeatureOutput::Fields(BTreeMap::new())))
            .with_feature("a", |_| Ok(FeatureOutput::Tables(BTreeMap::new())));
        assert_eq!(
            format!("{registry:?}"),
            r#"FunctionRegistry { features: ["a", "b"], trial_steps: [] }"#
        );
    }
}
