//! Typed configuration: simulation campaign, extraction, features, analysis
//!
//! All configuration is JSON. Path-valued fields are typed `PathBuf`s; relative
//! paths are resolved against the directory of the file they were read from.

use crate::checksum::checksum_json;
use crate::constants::{COLUMNS, SIMULATION_ID, SIMULATION_PATH};
use crate::filter::SimulationsFilter;
use crate::table::{Scalar, TableBuilder};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Read and parse a JSON file
///
/// # Errors
/// Returns error if the file cannot be read or parsed
pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let bytes = std::fs::read(path.as_ref())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Make `path` absolute, relative to `base` when needed (symlinks untouched)
///
/// # Errors
/// Returns error if the current directory is needed and unavailable
pub fn resolve_path(base: &Path, path: &Path) -> Result<PathBuf> {
    let joined = base.join(path);
    if joined.is_absolute() {
        Ok(joined)
    } else {
        Ok(std::env::current_dir()?.join(joined))
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

/// One simulation of a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignSimulation {
    /// Location of the simulation results
    pub simulation_path: PathBuf,
    /// Parameter values of this run
    #[serde(default)]
    pub conditions: BTreeMap<String, Scalar>,
}

/// Simulation campaign: parameterized simulation runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationCampaign {
    /// Campaign name
    pub name: String,
    /// Free-form campaign attributes
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
    /// Simulations, in campaign order (the position is the `simulation_id`)
    pub simulations: Vec<CampaignSimulation>,
}

impl SimulationCampaign {
    /// Load from a JSON file, resolving relative simulation paths
    ///
    /// # Errors
    /// Returns error if the file cannot be read or the campaign is invalid
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut campaign: Self = load_json(path.as_ref())?;
        let base = parent_dir(path.as_ref());
        for sim in &mut campaign.simulations {
            sim.simulation_path = resolve_path(base, &sim.simulation_path)?;
        }
        campaign.validate()?;
        Ok(campaign)
    }

    /// Check condition names and campaign size
    ///
    /// # Errors
    /// Returns a configuration error for reserved condition names or too many simulations
    pub fn validate(&self) -> Result<()> {
        if i16::try_from(self.simulations.len()).is_err() {
            return Err(Error::Configuration(format!(
                "campaign {:?} has {} simulations, more than supported",
                self.name,
                self.simulations.len()
            )));
        }
        // conditions share the simulations table with the dataset columns
        let reserved = self
            .condition_names()
            .into_iter()
            .find(|name| COLUMNS.contains(&name.as_str()));
        if let Some(name) = reserved {
            return Err(Error::Configuration(format!("condition name {name:?} is reserved")));
        }
        Ok(())
    }

    /// Number of simulations
    #[must_use]
    pub fn len(&self) -> usize {
        self.simulations.len()
    }

    /// True if the campaign has no simulations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.simulations.is_empty()
    }

    /// Sorted union of the condition names
    #[must_use]
    pub fn condition_names(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .simulations
            .iter()
            .flat_map(|s| s.conditions.keys())
            .collect();
        names.into_iter().cloned().collect()
    }

    /// Content checksum of the campaign
    ///
    /// # Errors
    /// Returns error if the campaign cannot be serialized
    pub fn checksum(&self) -> Result<String> {
        checksum_json(self)
    }

    /// Table with `simulation_id`, `simulation_path` and one column per condition
    ///
    /// # Errors
    /// Returns error if a condition mixes incompatible value kinds
    pub fn to_table(&self) -> Result<RecordBatch> {
        self.validate()?;
        let ids = (0..self.simulations.len())
            .map(|i| {
                i16::try_from(i)
                    .map_err(|_| Error::Configuration("too many simulations".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        let paths = self
            .simulations
            .iter()
            .map(|s| s.simulation_path.to_string_lossy().into_owned())
            .collect();
        let mut builder = TableBuilder::new()
            .int16(SIMULATION_ID, ids)
            .utf8(SIMULATION_PATH, paths);
        for name in self.condition_names() {
            let values: Vec<Scalar> = self
                .simulations
                .iter()
                .map(|s| s.conditions.get(&name).cloned().unwrap_or(Scalar::Null))
                .collect();
            builder = builder.scalars(&name, &values)?;
        }
        builder.build()
    }
}

/// Simulation report to extract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Report type, e.g. `spikes`
    #[serde(rename = "type")]
    pub kind: String,
    /// Report name
    #[serde(default)]
    pub name: String,
}

/// Cell property query passed to the source adapter
pub type NeuronQuery = BTreeMap<String, Value>;

/// Definition of a neuron class
///
/// Accepts either `{"$query": {...}, "$target": ..}` or the flat form where every
/// key not starting with `$` is a query term.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Value>")]
pub struct NeuronClassConfig {
    /// Cell property query
    #[serde(rename = "$query")]
    pub query: NeuronQuery,
    /// Target overriding the extraction target
    #[serde(rename = "$target", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Maximum number of neurons, sampled
    #[serde(rename = "$limit", skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Explicit gids intersected with the query result
    #[serde(rename = "$gids", skip_serializing_if = "Option::is_none")]
    pub gids: Option<Vec<i64>>,
}

impl TryFrom<BTreeMap<String, Value>> for NeuronClassConfig {
    type Error = String;

    fn try_from(mut values: BTreeMap<String, Value>) -> std::result::Result<Self, String> {
        fn parse<T: DeserializeOwned>(key: &str, v: Value) -> std::result::Result<T, String> {
            serde_json::from_value(v).map_err(|e| format!("invalid {key}: {e}"))
        }
        let mut config = Self::default();
        if let Some(q) = values.remove("$query") {
            config.query = parse("$query", q)?;
        }
        if let Some(v) = values.remove("$target") {
            config.target = parse("$target", v)?;
        }
        if let Some(v) = values.remove("$limit") {
            config.limit = parse("$limit", v)?;
        }
        if let Some(v) = values.remove("$gids") {
            config.gids = parse("$gids", v)?;
        }
        for (key, value) in values {
            if key.starts_with('$') {
                return Err(format!("unknown neuron class option {key:?}"));
            }
            config.query.insert(key, value);
        }
        Ok(config)
    }
}

const fn one() -> usize {
    1
}

/// Time window repeated over trials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    /// Offset of the first trial
    #[serde(default)]
    pub initial_offset: f64,
    /// Window bounds relative to the trial offset
    pub bounds: (f64, f64),
    /// Offset increment between trials
    #[serde(default)]
    pub t_step: f64,
    /// Number of trials
    #[serde(default = "one")]
    pub n_trials: usize,
    /// Constant added to every trial offset
    #[serde(default)]
    pub trial_steps_value: f64,
    /// Trial steps whose computed value is added to every trial offset
    #[serde(default)]
    pub trial_steps_label: String,
    /// Free-form window type
    #[serde(default)]
    pub window_type: String,
}

/// Trial steps computed by a registered function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialStepsConfig {
    /// Registered function name
    pub function: String,
    /// Offset of the spikes passed to the function
    #[serde(default)]
    pub initial_offset: f64,
    /// Time bounds of the spikes passed to the function
    pub bounds: (f64, f64),
    /// Additional parameters forwarded to the function
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

/// What to extract from each simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    /// Report to read
    pub report: ReportConfig,
    /// Neuron classes by label
    #[serde(default)]
    pub neuron_classes: BTreeMap<String, NeuronClassConfig>,
    /// Default neuron limit
    #[serde(default)]
    pub limit: Option<usize>,
    /// Default target
    #[serde(default)]
    pub target: Option<String>,
    /// Windows by label
    #[serde(default)]
    pub windows: BTreeMap<String, WindowConfig>,
    /// Trial steps by label
    #[serde(default)]
    pub trial_steps: BTreeMap<String, TrialStepsConfig>,
    /// Seed of the neuron sampling
    #[serde(default)]
    pub seed: u64,
}

impl ExtractionConfig {
    /// Check window and trial steps definitions
    ///
    /// # Errors
    /// Returns a configuration error describing the first invalid entry
    pub fn validate(&self) -> Result<()> {
        for (name, w) in &self.windows {
            if w.n_trials == 0 {
                return Err(Error::Configuration(format!(
                    "window {name:?}: n_trials must be positive"
                )));
            }
            if !(w.bounds.0 <= w.bounds.1) {
                return Err(Error::Configuration(format!(
                    "window {name:?}: t_start {} is after t_stop {}",
                    w.bounds.0, w.bounds.1
                )));
            }
            if w.t_step < 0.0 {
                return Err(Error::Configuration(format!("window {name:?}: negative t_step")));
            }
            if !w.trial_steps_label.is_empty()
                && !self.trial_steps.contains_key(&w.trial_steps_label)
            {
                return Err(Error::Configuration(format!(
                    "window {name:?}: unknown trial_steps_label {:?}",
                    w.trial_steps_label
                )));
            }
        }
        for (name, t) in &self.trial_steps {
            if !(t.bounds.0 <= t.bounds.1) {
                return Err(Error::Configuration(format!(
                    "trial steps {name:?}: t_start {} is after t_stop {}",
                    t.bounds.0, t.bounds.1
                )));
            }
        }
        Ok(())
    }
}

/// Grouping granularity of a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// One record per (simulation, circuit, neuron class, window, gid)
    Gid,
    /// One record per (simulation, circuit, neuron class, window)
    NeuronClass,
    /// Named tables per (simulation, circuit, neuron class, window)
    Generic,
}

/// One feature function and its parameter sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeaturesConfig {
    /// Grouping granularity
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    /// Output table name (grouped kinds), defaults to `features_by_<kind>`
    #[serde(default)]
    pub name: Option<String>,
    /// Registered function name
    pub function: String,
    /// Restrict to these neuron classes (all if empty)
    #[serde(default)]
    pub neuron_classes: Vec<String>,
    /// Restrict to these windows (all if empty)
    #[serde(default)]
    pub windows: Vec<String>,
    /// Static parameters
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Parameters combined as a cartesian product
    #[serde(default)]
    pub params_product: BTreeMap<String, Vec<Value>>,
    /// Parameters combined element-wise
    #[serde(default)]
    pub params_zip: BTreeMap<String, Vec<Value>>,
    /// Separator placed before the variant index in output names
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

fn default_suffix() -> String {
    "_".to_string()
}

/// Complete analysis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Simulation campaign file
    pub simulation_campaign: PathBuf,
    /// Output (cache root) directory
    pub output: PathBuf,
    /// Wipe the cache namespace before extracting
    #[serde(default)]
    pub clear_cache: bool,
    /// Filter applied at extraction time, persisted with the cache
    #[serde(default)]
    pub simulations_filter: SimulationsFilter,
    /// Filter applied in memory by `Analyzer::apply_filter`
    #[serde(default)]
    pub simulations_filter_in_memory: SimulationsFilter,
    /// Extraction definition
    pub extraction: ExtractionConfig,
    /// Feature definitions
    #[serde(default)]
    pub features: Vec<FeaturesConfig>,
}

impl AnalysisConfig {
    /// Load from a JSON file, resolving relative paths against its directory
    ///
    /// # Errors
    /// Returns error if the file cannot be read or the configuration is invalid
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config: Self = load_json(path.as_ref())?;
        let base = parent_dir(path.as_ref());
        config.simulation_campaign = resolve_path(base, &config.simulation_campaign)?;
        config.output = resolve_path(base, &config.output)?;
        config.extraction.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{column_names, i16_values};

    #[test]
    fn test_neuron_class_flat_form() {
        let config: NeuronClassConfig = serde_json::from_str(
            r#"{"layer": [2, 3], "synapse_class": "EXC", "$limit": 10}"#,
        )
        .unwrap();
        assert_eq!(config.query.len(), 2);
        assert_eq!(config.limit, Some(10));
        assert!(config.target.is_none());

        let explicit: NeuronClassConfig =
            serde_json::from_str(
                r#"{"$query": {"layer": 5}, "$target": "hex0", "$limit": 3, "$gids": [1, 2]}"#,
            )
            .unwrap();
        assert_eq!(explicit.query["layer"], serde_json::json!(5));
        assert_eq!(explicit.target.as_deref(), Some("hex0"));
        assert_eq!(explicit.limit, Some(3));
        assert_eq!(explicit.gids, Some(vec![1, 2]));

        let roundtrip: NeuronClassConfig =
            serde_json::from_str(&serde_json::to_string(&explicit).unwrap()).unwrap();
        assert_eq!(roundtrip, explicit);
    }

    #[test]
    fn test_neuron_class_unknown_option() {
        let result: std::result::Result<NeuronClassConfig, _> =
            serde_json::from_str(r#"{"$limits": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_window_defaults_and_validation() {
        let mut extraction: ExtractionConfig = serde_json::from_value(serde_json::json!({
            "report": {"type": "spikes"},
            "windows": {"w1": {"bounds": [0.0, 100.0]}}
        }))
        .unwrap();
        assert_eq!(extraction.windows["w1"].n_trials, 1);
        extraction.validate().unwrap();

        extraction.windows.get_mut("w1").unwrap().bounds = (10.0, 5.0);
        assert!(matches!(extraction.validate(), Err(Error::Configuration(_))));

        extraction.windows.get_mut("w1").unwrap().bounds = (0.0, 5.0);
        extraction.windows.get_mut("w1").unwrap().trial_steps_label = "ts1".into();
        assert!(extraction.validate().unwrap_err().to_string().contains("trial_steps_label"));
    }

    #[test]
    fn test_trial_steps_extra_params() {
        let config: TrialStepsConfig = serde_json::from_str(
            r#"{"function": "onset", "bounds": [-50, 25], "threshold": 0.2}"#,
        )
        .unwrap();
        assert_eq!(config.params["threshold"], serde_json::json!(0.2));
        assert!((config.initial_offset).abs() < f64::EPSILON);
    }

    #[test]
    fn test_campaign_table() {
        let campaign: SimulationCampaign = serde_json::from_value(serde_json::json!({
            "name": "c1",
            "simulations": [
                {"simulation_path": "/a/0", "conditions": {"seed": 1, "ca": 1.0}},
                {"simulation_path": "/a/1", "conditions": {"seed": 2, "ca": 1.1}}
            ]
        }))
        .unwrap();
        let table = campaign.to_table().unwrap();
        assert_eq!(column_names(&table), vec![SIMULATION_ID, SIMULATION_PATH, "ca", "seed"]);
        assert_eq!(i16_values(&table, SIMULATION_ID).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_campaign_reserved_condition() {
        for name in ["circuit_id", "trial", "gid", "time", "count", "window"] {
            let campaign: SimulationCampaign = serde_json::from_value(serde_json::json!({
                "name": "c1",
                "simulations": [{"simulation_path": "/a/0", "conditions": {name: 1}}]
            }))
            .unwrap();
            let err = campaign.validate().unwrap_err();
            assert!(err.to_string().contains(name), "{name}");
            assert!(matches!(campaign.to_table(), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn test_analysis_config_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&serde_json::json!({
                "simulation_campaign": "campaign.json",
                "output": "out",
                "extraction": {"report": {"type": "spikes"}},
                "features": [{"type": "gid", "function": "count"}]
            }))
            .unwrap(),
        )
        .unwrap();

        let config = AnalysisConfig::load(&path).unwrap();
        assert_eq!(config.simulation_campaign, dir.path().join("campaign.json"));
        assert_eq!(config.output, dir.path().join("out"));
        assert_eq!(config.features[0].kind, FeatureKind::Gid);
        assert_eq!(config.features[0].suffix, "_");
        assert!(config.simulations_filter.is_empty());
    }
}
