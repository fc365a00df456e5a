//! Feature calculation over the grouped spikes
//!
//! An [`Analyzer`] owns a [`Repository`] and the feature functions bound from
//! the configuration. Functions are resolved when the analyzer is created, so
//! an unknown name fails before anything is extracted.
//!
//! - `gid` features run once per (simulation, circuit, neuron class, window, gid)
//!   and `neuron_class` features once per (simulation, circuit, neuron class,
//!   window). Their fields become one row per group key.
//! - `generic` features run once per neuron class group and return named
//!   tables; the key columns are prepended and tables sharing a name are
//!   concatenated.

use crate::config::{AnalysisConfig, FeatureKind, FeaturesConfig, SimulationCampaign};
use crate::constants::{CIRCUIT_ID, GID, NEURON_CLASS, SIMULATION_ID, WINDOW};
use crate::extract::{Dataset, GroupKey};
use crate::filter::SimulationsFilter;
use crate::logging::Timer;
use crate::registry::{
    FeatureFrame, FeatureFunction, FeatureInput, FeatureOutput, FeatureValue, FunctionRegistry,
};
use crate::repository::Repository;
use crate::source::CampaignSource;
use crate::table::{column, column_names, concat, normalize, scalar_column, Scalar, TableBuilder};
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float64Builder, ListBuilder};
use arrow::record_batch::RecordBatch;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

const GID_KEY: &[&str] = &[SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW, GID];
const NEURON_CLASS_KEY: &[&str] = &[SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW];

/// One parameter set of a feature
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVariant {
    /// Appended to the output names, empty without expansion
    pub suffix: String,
    /// Parameters passed to the function (a JSON object)
    pub params: Value,
}

/// Expand `params_product` and `params_zip` into parameter sets
///
/// The product of the `params_product` lists is combined with each position
/// of the `params_zip` lists. Without either, there is a single variant with
/// the static `params` and no suffix.
///
/// # Errors
/// Returns a configuration error if the zipped lists differ in length, a list
/// is empty, or a parameter is defined more than once
pub fn expand_params(config: &FeaturesConfig) -> Result<Vec<FeatureVariant>> {
    let invalid = |message: String| Error::function(&config.function, message);
    for key in config.params_product.keys().chain(config.params_zip.keys()) {
        if config.params.contains_key(key)
            || (config.params_product.contains_key(key) && config.params_zip.contains_key(key))
        {
            return Err(invalid(format!("parameter {key:?} is defined more than once")));
        }
    }
    if let Some((key, _)) = config
        .params_product
        .iter()
        .chain(&config.params_zip)
        .find(|(_, values)| values.is_empty())
    {
        return Err(invalid(format!("parameter {key:?} has no values")));
    }

    let mut combos: Vec<Vec<(&String, &Value)>> = vec![Vec::new()];
    for (key, values) in &config.params_product {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.push((key, value));
                next.push(extended);
            }
        }
        combos = next;
    }

    let mut lengths = config.params_zip.values().map(Vec::len);
    let zipped: Vec<Vec<(&String, &Value)>> = match lengths.next() {
        None => vec![Vec::new()],
        Some(len) => {
            if lengths.any(|other| other != len) {
                return Err(invalid("params_zip lists must have the same length".into()));
            }
            (0..len)
                .map(|i| config.params_zip.iter().map(|(k, v)| (k, &v[i])).collect())
                .collect()
        }
    };

    let expanded = !config.params_product.is_empty() || !config.params_zip.is_empty();
    let mut variants = Vec::with_capacity(combos.len() * zipped.len());
    for product in &combos {
        for zip in &zipped {
            let mut params: Map<String, Value> = config
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, value) in product.iter().chain(zip) {
                params.insert((*key).clone(), (*value).clone());
            }
            let suffix = if expanded {
                format!("{}{}", config.suffix, variants.len())
            } else {
                String::new()
            };
            variants.push(FeatureVariant {
                suffix,
                params: Value::Object(params),
            });
        }
    }
    Ok(variants)
}

#[derive(Clone)]
struct BoundFeature {
    config: FeaturesConfig,
    function: Arc<dyn FeatureFunction>,
    variants: Vec<FeatureVariant>,
}

impl BoundFeature {
    fn bind(config: &FeaturesConfig, registry: &FunctionRegistry) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            function: registry.feature(&config.function)?,
            variants: expand_params(config)?,
        })
    }

    fn accepts(&self, key: &GroupKey) -> bool {
        let classes = &self.config.neuron_classes;
        let windows = &self.config.windows;
        (classes.is_empty() || classes.iter().any(|c| c == key.neuron_class()))
            && (windows.is_empty() || windows.iter().any(|w| w == key.window()))
    }

    fn output_name(&self) -> String {
        self.config.name.clone().unwrap_or_else(|| match self.config.kind {
            FeatureKind::Gid => "features_by_gid".to_string(),
            _ => "features_by_neuron_class".to_string(),
        })
    }
}

impl fmt::Debug for BoundFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFeature")
            .field("function", &self.config.function)
            .field("kind", &self.config.kind)
            .field("variants", &self.variants.len())
            .finish_non_exhaustive()
    }
}

/// Rows of a grouped feature table, one per group key
struct Records {
    kind: FeatureKind,
    rows: BTreeMap<GroupKey, BTreeMap<String, FeatureValue>>,
    fields: Vec<String>,
}

impl Records {
    const fn new(kind: FeatureKind) -> Self {
        Self {
            kind,
            rows: BTreeMap::new(),
            fields: Vec::new(),
        }
    }

    const fn key_columns(&self) -> &'static [&'static str] {
        match self.kind {
            FeatureKind::Gid => GID_KEY,
            _ => NEURON_CLASS_KEY,
        }
    }

    fn insert(&mut self, key: &GroupKey, values: BTreeMap<String, FeatureValue>) {
        let row = self.rows.entry(key.clone()).or_default();
        for (name, value) in values {
            if !self.fields.contains(&name) {
                self.fields.push(name.clone());
            }
            // later features overwrite fields of the same name
            row.insert(name, value);
        }
    }

    fn to_table(&self) -> Result<RecordBatch> {
        let key_columns = self.key_columns();
        let key_fields: Vec<Vec<(&str, Scalar)>> = self.rows.keys().map(GroupKey::fields).collect();
        let mut builder = TableBuilder::new();
        for (i, name) in key_columns.iter().enumerate() {
            let values: Vec<Scalar> = key_fields.iter().map(|f| f[i].1.clone()).collect();
            builder = builder.scalars(name, &values)?;
        }
        for field in &self.fields {
            if key_columns.contains(&field.as_str()) {
                return Err(Error::Configuration(format!(
                    "feature {field:?} has the name of a key column"
                )));
            }
            let values: Vec<Option<&FeatureValue>> =
                self.rows.values().map(|row| row.get(field)).collect();
            builder = builder.column(field, feature_column(field, &values)?);
        }
        builder.build()
    }
}

/// Build a column from feature values; lists become a list of Float64
///
/// # Errors
/// Returns a configuration error if lists are mixed with scalars, or scalars
/// of incompatible kinds are mixed
pub fn feature_column(name: &str, values: &[Option<&FeatureValue>]) -> Result<ArrayRef> {
    let is_list = values.iter().flatten().any(|v| matches!(v, FeatureValue::List(_)));
    if !is_list {
        let scalars: Vec<Scalar> = values
            .iter()
            .map(|v| match v {
                Some(FeatureValue::Scalar(s)) => s.clone(),
                _ => Scalar::Null,
            })
            .collect();
        return scalar_column(name, &scalars);
    }
    let mut builder = ListBuilder::new(Float64Builder::new());
    for value in values {
        match value {
            Some(FeatureValue::List(items)) => {
                builder.values().append_slice(items);
                builder.append(true);
            }
            None | Some(FeatureValue::Scalar(Scalar::Null)) => builder.append_null(),
            Some(FeatureValue::Scalar(_)) => {
                return Err(Error::Configuration(format!(
                    "column {name:?} mixes lists and scalars"
                )))
            }
        }
    }
    Ok(Arc::new(builder.finish()))
}

/// Prepend the key columns to a generic feature table
///
/// Index columns follow the key columns; a positional index is dropped.
///
/// # Errors
/// Returns a configuration error if the table already has a key column
pub fn attach_key(key: &GroupKey, frame: &FeatureFrame) -> Result<RecordBatch> {
    let batch = frame.batch();
    let names = column_names(batch);
    let mut builder = TableBuilder::new();
    for (name, value) in key.fields() {
        if names.iter().any(|c| c == name) {
            return Err(Error::Configuration(format!(
                "table already has the key column {name:?}"
            )));
        }
        builder = builder.scalars(name, &vec![value; batch.num_rows()])?;
    }
    for index in frame.index_columns() {
        builder = builder.column(index, Arc::clone(column(batch, index)?));
    }
    for (name, array) in names.iter().zip(batch.columns()) {
        if !frame.index_columns().contains(name) {
            builder = builder.column(name, Arc::clone(array));
        }
    }
    builder.build()
}

/// Runs the configured features over an extracted repository
pub struct Analyzer {
    config: AnalysisConfig,
    repo: Repository,
    features: Vec<BoundFeature>,
}

impl Analyzer {
    /// Load the campaign named by the configuration and open the repository
    ///
    /// # Errors
    /// Returns error if the campaign cannot be loaded, a function is not
    /// registered, or the repository cannot be opened
    pub fn new(
        config: AnalysisConfig,
        source: Arc<dyn CampaignSource>,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        let campaign = SimulationCampaign::load(&config.simulation_campaign)?;
        Self::with_campaign(config, campaign, source, registry)
    }

    /// Open the repository for an already loaded campaign
    ///
    /// # Errors
    /// Returns a configuration error if a feature or trial steps function is
    /// not registered or a feature has invalid parameters, or the repository
    /// error
    pub fn with_campaign(
        config: AnalysisConfig,
        campaign: SimulationCampaign,
        source: Arc<dyn CampaignSource>,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        for steps in config.extraction.trial_steps.values() {
            registry.trial_steps(&steps.function)?;
        }
        let features = config
            .features
            .iter()
            .map(|fc| BoundFeature::bind(fc, &registry))
            .collect::<Result<Vec<_>>>()?;
        let repo = Repository::builder(campaign, config.extraction.clone(), source)
            .registry(registry)
            .filter(config.simulations_filter.clone())
            .clear_cache(config.clear_cache)
            .open(&config.output)?;
        Ok(Self {
            config,
            repo,
            features,
        })
    }

    /// Extract every dataset of the repository
    ///
    /// # Errors
    /// Returns the extraction error
    pub fn extract_repo(&mut self) -> Result<()> {
        self.repo.extract_all()
    }

    /// New analyzer restricted by `simulations_filter_in_memory`
    ///
    /// # Errors
    /// Returns the extraction or filter error
    pub fn apply_filter(&mut self) -> Result<Self> {
        let filter = self.config.simulations_filter_in_memory.clone();
        self.with_filter(&filter)
    }

    /// New analyzer restricted by `filter`; this one is not modified
    ///
    /// # Errors
    /// Returns the extraction or filter error
    pub fn with_filter(&mut self, filter: &SimulationsFilter) -> Result<Self> {
        Ok(Self {
            config: self.config.clone(),
            repo: self.repo.apply_filter(filter)?,
            features: self.features.clone(),
        })
    }

    /// Compute every configured feature
    ///
    /// # Errors
    /// Returns a configuration error naming the function when it returns the
    /// wrong kind of output or tables that cannot be merged, or the function's
    /// own error
    pub fn calculate_features(&mut self) -> Result<BTreeMap<String, RecordBatch>> {
        self.repo.extract_all()?;
        let spikes = self.repo.spikes()?;
        let needs = |wanted: fn(FeatureKind) -> bool| {
            self.features.iter().any(|f| wanted(f.config.kind))
        };
        let by_gid: Vec<(GroupKey, RecordBatch)> = if needs(|k| k == FeatureKind::Gid) {
            spikes
                .grouped_by_gid()?
                .into_iter()
                .map(|(k, t)| (GroupKey::Gid(k), t))
                .collect()
        } else {
            Vec::new()
        };
        let by_neuron_class: Vec<(GroupKey, RecordBatch)> = if needs(|k| k != FeatureKind::Gid) {
            spikes
                .grouped_by_neuron_class()?
                .into_iter()
                .map(|(k, t)| (GroupKey::NeuronClass(k), t))
                .collect()
        } else {
            Vec::new()
        };

        let mut grouped: BTreeMap<String, Records> = BTreeMap::new();
        let mut generic: BTreeMap<String, Vec<RecordBatch>> = BTreeMap::new();
        for feature in &self.features {
            let kind = feature.config.kind;
            let function_name = feature.config.function.as_str();
            let groups = if kind == FeatureKind::Gid { &by_gid } else { &by_neuron_class };
            for variant in &feature.variants {
                let mut timer = Timer::start();
                let mut calls = 0;
                for (key, table) in groups.iter().filter(|(k, _)| feature.accepts(k)) {
                    let input = FeatureInput {
                        repo: &self.repo,
                        key,
                        table,
                        params: &variant.params,
                    };
                    calls += 1;
                    match (kind, feature.function.invoke(&input)?) {
                        (FeatureKind::Generic, FeatureOutput::Tables(tables)) => {
                            for (name, frame) in tables {
                                let batch = attach_key(key, &frame)
                                    .map_err(|e| Error::function(function_name, e))?;
                                generic
                                    .entry(format!("{name}{}", variant.suffix))
                                    .or_default()
                                    .push(batch);
                            }
                        }
                        (FeatureKind::Generic, FeatureOutput::Fields(_)) => {
                            return Err(Error::function(
                                function_name,
                                "a generic feature must return named tables",
                            ));
                        }
                        (_, FeatureOutput::Fields(fields)) => {
                            let name = format!("{}{}", feature.output_name(), variant.suffix);
                            let records = grouped
                                .entry(name.clone())
                                .or_insert_with(|| Records::new(kind));
                            if records.kind != kind {
                                return Err(Error::function(
                                    function_name,
                                    format!("{name:?} is produced by features of different kinds"),
                                ));
                            }
                            records.insert(key, fields);
                        }
                        (_, FeatureOutput::Tables(_)) => {
                            return Err(Error::function(
                                function_name,
                                "a gid or neuron_class feature must return fields",
                            ));
                        }
                    }
                }
                info!(
                    function = function_name,
                    suffix = %variant.suffix,
                    groups = calls,
                    elapsed = timer.lap(),
                    "Calculated features"
                );
            }
        }

        let mut result = BTreeMap::new();
        for (name, records) in grouped {
            let table = records.to_table()?;
            result.insert(name, table);
        }
        for (name, batches) in generic {
            if result.contains_key(&name) {
                return Err(Error::Configuration(format!(
                    "feature table {name:?} is produced by features of different kinds"
                )));
            }
            let table = concat(&batches)
                .and_then(|t| normalize(&t))
                .map_err(|e| Error::Configuration(format!("feature table {name:?}: {e}")))?;
            result.insert(name, table);
        }
        Ok(result)
    }

    /// Parameter sets of every configured feature, by function name
    #[must_use]
    pub fn variants(&self) -> Vec<(&str, &[FeatureVariant])> {
        self.features
            .iter()
            .map(|f| (f.config.function.as_str(), f.variants.as_slice()))
            .collect()
    }

    /// The repository
    #[must_use]
    pub const fn repo(&self) -> &Repository {
        &self.repo
    }

    /// The configuration
    #[must_use]
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Number of spikes available to the features, if extracted
    #[must_use]
    pub fn spike_count(&self) -> Option<usize> {
        self.repo.spikes().ok().map(Dataset::len)
    }
}

impl fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer")
            .field("repo", &self.repo)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::NeuronClassKey;
    use serde_json::json;

    fn features(value: Value) -> FeaturesConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_expand_without_lists_is_a_single_unsuffixed_variant() {
        let config = features(json!({"type": "gid", "function": "f", "params": {"a": 1}}));
        let variants = expand_params(&config).unwrap();
        assert_eq!(
            variants,
            vec![FeatureVariant {
                suffix: String::new(),
                params: json!({"a": 1})
            }]
        );
    }

    #[test]
    fn test_expand_product_and_zip() {
        let config = features(json!({
            "type": "neuron_class",
            "function": "f",
            "params": {"fixed": true},
            "params_product": {"a": [1, 2], "b": ["x", "y"]},
            "params_zip": {"c": [10, 20], "d": [0.1, 0.2]}
        }));
        let variants = expand_params(&config).unwrap();
        assert_eq!(variants.len(), 8);
        assert_eq!(variants[0].suffix, "_0");
        assert_eq!(variants[7].suffix, "_7");
        assert_eq!(variants[0].params, json!({"fixed": true, "a": 1, "b": "x", "c": 10, "d": 0.1}));
        assert_eq!(variants[1].params, json!({"fixed": true, "a": 1, "b": "x", "c": 20, "d": 0.2}));
        assert_eq!(variants[7].params, json!({"fixed": true, "a": 2, "b": "y", "c": 20, "d": 0.2}));
    }

    #[test]
    fn test_expand_rejects_uneven_zip_and_duplicates() {
        let uneven = features(json!({
            "type": "gid", "function": "f", "params_zip": {"a": [1, 2], "b": [1]}
        }));
        let err = expand_params(&uneven).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("\"f\""));

        let duplicate = features(json!({
            "type": "gid", "function": "f", "params": {"a": 0}, "params_product": {"a": [1]}
        }));
        assert!(expand_params(&duplicate).is_err());
    }

    #[test]
    fn test_feature_column_lists_and_nulls() {
        let list = FeatureValue::List(vec![1.0, 2.0]);
        let column = feature_column("psth", &[Some(&list), None]).unwrap();
        assert_eq!(column.len(), 2);
        assert!(column.is_null(1));

        let scalar = FeatureValue::from(1.0);
        assert!(feature_column("mixed", &[Some(&list), Some(&scalar)]).is_err());
    }

    #[test]
    fn test_attach_key_prepends_key_and_index() {
        let key = GroupKey::NeuronClass(NeuronClassKey {
            simulation_id: 1,
            circuit_id: 0,
            neuron_class: "L5".into(),
            window: "w1".into(),
        });
        let batch = TableBuilder::new()
            .float64("value", vec![0.5, 0.7])
            .int64("bin", vec![0, 1])
            .build()
            .unwrap();
        let frame = FeatureFrame::with_index(batch, &["bin"]).unwrap();
        let table = attach_key(&key, &frame).unwrap();
        assert_eq!(
            column_names(&table),
            vec![SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW, "bin", "value"]
        );
        assert_eq!(crate::table::i16_values(&table, SIMULATION_ID).unwrap(), vec![1, 1]);
    }
}
