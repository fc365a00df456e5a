//! Repository: the six datasets of one campaign, cached per configuration
//!
//! A repository extracts its datasets lazily and in dependency order. Each
//! dataset is loaded from the cache when its key matches the configuration and
//! built from the [`CampaignSource`] otherwise.
//!
//! ```rust,no_run
//! use campaign_etl::config::{ExtractionConfig, SimulationCampaign};
//! use campaign_etl::extract::Dataset;
//! use campaign_etl::repository::Repository;
//! use campaign_etl::source::MemorySource;
//! use std::sync::Arc;
//!
//! let campaign = SimulationCampaign::load("campaign.json")?;
//! let extraction: ExtractionConfig = serde_json::from_str(r#"{"report": {"type": "spikes"}}"#)?;
//! let mut repo = Repository::builder(campaign, extraction, Arc::new(MemorySource::new()))
//!     .open("output")?;
//! repo.extract_all()?;
//! println!("{} spikes", repo.spikes()?.table().num_rows());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::cache::{CacheKeys, CacheManager};
use crate::config::{ExtractionConfig, SimulationCampaign};
use crate::constants::SIMULATION_ID;
use crate::extract::{
    self, BuildPolicy, Dataset, DatasetName, ExtractionStatus, FilterContext, NeuronClasses,
    Neurons, Simulations, Spikes, TrialSteps, Windows,
};
use crate::filter::SimulationsFilter;
use crate::logging::Timer;
use crate::registry::FunctionRegistry;
use crate::source::CampaignSource;
use crate::table::{filter_rows, i16_values};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Extracted datasets of a simulation campaign
pub struct Repository {
    campaign: SimulationCampaign,
    extraction: ExtractionConfig,
    source: Arc<dyn CampaignSource>,
    registry: Arc<FunctionRegistry>,
    output: PathBuf,
    cache: CacheManager,
    filter: SimulationsFilter,
    policy: BuildPolicy,
    simulations: Option<Simulations>,
    neurons: Option<Neurons>,
    neuron_classes: Option<NeuronClasses>,
    trial_steps: Option<TrialSteps>,
    windows: Option<Windows>,
    spikes: Option<Spikes>,
    statuses: BTreeMap<DatasetName, ExtractionStatus>,
}

/// Everything needed to reopen a repository in another process
///
/// The reopened repository reads the cache only and never builds from source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    /// Campaign definition
    pub campaign: SimulationCampaign,
    /// Extraction definition
    pub extraction: ExtractionConfig,
    /// Cache root directory
    pub output: PathBuf,
    /// Cache keys computed by the owner
    pub keys: CacheKeys,
    /// Filter of the snapshotted repository
    pub filter: SimulationsFilter,
}

/// Repository builder
pub struct RepositoryBuilder {
    campaign: SimulationCampaign,
    extraction: ExtractionConfig,
    source: Arc<dyn CampaignSource>,
    registry: Arc<FunctionRegistry>,
    filter: SimulationsFilter,
    clear_cache: bool,
}

impl RepositoryBuilder {
    /// Functions available to the trial steps extraction
    #[must_use]
    pub fn registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Filter applied to the simulations and persisted with the cache
    #[must_use]
    pub fn filter(mut self, filter: SimulationsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Wipe the cache namespace when opening
    #[must_use]
    pub fn clear_cache(mut self, clear: bool) -> Self {
        self.clear_cache = clear;
        self
    }

    /// Validate the configuration and open the cache under `output`
    ///
    /// # Errors
    /// Returns a configuration error for an invalid campaign or extraction, or
    /// a storage error if the cache cannot be opened
    pub fn open<P: AsRef<Path>>(self, output: P) -> Result<Repository> {
        self.campaign.validate()?;
        self.extraction.validate()?;
        let keys = CacheKeys::from_config(&self.campaign, &self.extraction)?;
        let cache =
            CacheManager::open(output.as_ref(), keys, self.filter.clone(), self.clear_cache)?;
        info!(
            path = %cache.root().display(),
            simulations = self.campaign.len(),
            "Opened repository"
        );
        Ok(Repository {
            campaign: self.campaign,
            extraction: self.extraction,
            source: self.source,
            registry: self.registry,
            output: output.as_ref().to_path_buf(),
            cache,
            filter: self.filter,
            policy: BuildPolicy::CacheOrBuild,
            simulations: None,
            neurons: None,
            neuron_classes: None,
            trial_steps: None,
            windows: None,
            spikes: None,
            statuses: BTreeMap::new(),
        })
    }
}

fn require<'a, D>(slot: Option<&'a D>, name: DatasetName) -> Result<&'a D> {
    slot.ok_or_else(|| Error::Precondition(format!("{name} has not been extracted")))
}

fn context<'a>(
    simulations: Option<&'a Simulations>,
    filter: &SimulationsFilter,
) -> Result<(&'a Simulations, FilterContext)> {
    let sims = require(simulations, DatasetName::Simulations)?;
    Ok((sims, FilterContext::with_simulations(filter.clone(), sims)?))
}

fn derive<D: Dataset>(parent: &D, ctx: &FilterContext) -> Result<(D, ExtractionStatus)> {
    let dataset = D::from_cached(parent.table().clone(), ctx)?;
    let status = if dataset.len() == parent.len() {
        ExtractionStatus::Cached
    } else {
        ExtractionStatus::Modified
    };
    Ok((dataset, status))
}

impl Repository {
    /// Start building a repository
    #[must_use]
    pub fn builder(
        campaign: SimulationCampaign,
        extraction: ExtractionConfig,
        source: Arc<dyn CampaignSource>,
    ) -> RepositoryBuilder {
        RepositoryBuilder {
            campaign,
            extraction,
            source,
            registry: Arc::new(FunctionRegistry::new()),
            filter: SimulationsFilter::new(),
            clear_cache: false,
        }
    }

    /// Reopen a snapshot over its cache, read-only
    ///
    /// Datasets are loaded lazily; a dataset missing from the cache is a
    /// precondition error.
    ///
    /// # Errors
    /// Returns a configuration error if the snapshot keys don't match its
    /// configuration
    pub fn from_snapshot(
        snapshot: RepositorySnapshot,
        source: Arc<dyn CampaignSource>,
        registry: Arc<FunctionRegistry>,
    ) -> Result<Self> {
        let keys = CacheKeys::from_config(&snapshot.campaign, &snapshot.extraction)?;
        if keys != snapshot.keys {
            return Err(Error::Configuration(
                "snapshot cache keys don't match its configuration".into(),
            ));
        }
        let cache = CacheManager::open_readonly(&snapshot.output, keys, snapshot.filter.clone());
        Ok(Self {
            campaign: snapshot.campaign,
            extraction: snapshot.extraction,
            source,
            registry,
            output: snapshot.output,
            cache,
            filter: snapshot.filter,
            policy: BuildPolicy::CacheOnly,
            simulations: None,
            neurons: None,
            neuron_classes: None,
            trial_steps: None,
            windows: None,
            spikes: None,
            statuses: BTreeMap::new(),
        })
    }

    /// Extract every dataset not extracted yet
    ///
    /// # Errors
    /// Returns the first extraction error
    pub fn extract_all(&mut self) -> Result<()> {
        let mut timer = Timer::start();
        for name in DatasetName::ALL {
            self.ensure_extracted(name)?;
        }
        info!(elapsed = timer.lap(), "Extraction completed");
        Ok(())
    }

    /// Extract a dataset and its upstream datasets, if not done yet
    ///
    /// # Errors
    /// Returns the extraction error of this dataset or an upstream one
    pub fn ensure_extracted(&mut self, name: DatasetName) -> Result<()> {
        if self.statuses.contains_key(&name) {
            return Ok(());
        }
        for upstream in name.upstream() {
            self.ensure_extracted(*upstream)?;
        }
        self.extract_dataset(name)
    }

    fn extract_dataset(&mut self, name: DatasetName) -> Result<()> {
        let Self {
            ref campaign,
            ref extraction,
            ref source,
            ref registry,
            ref mut cache,
            ref filter,
            policy,
            ref mut simulations,
            ref mut neurons,
            ref mut neuron_classes,
            ref mut trial_steps,
            ref mut windows,
            ref mut spikes,
            ref mut statuses,
            ..
        } = *self;
        let source = source.as_ref();
        let status = match name {
            DatasetName::Simulations => {
                let ctx = FilterContext::new(filter.clone());
                // emptiness is checked by the build against the filtered campaign
                let (dataset, status) = extract::extract(cache, &ctx, policy, 0, || {
                    Simulations::extract(campaign, filter, source)
                })?;
                *simulations = Some(dataset);
                status
            }
            DatasetName::Neurons => {
                let (sims, ctx) = context(simulations.as_ref(), filter)?;
                let upstream = if extraction.neuron_classes.is_empty() { 0 } else { sims.len() };
                let (dataset, status) = extract::extract(cache, &ctx, policy, upstream, || {
                    Neurons::extract(sims, extraction, source)
                })?;
                *neurons = Some(dataset);
                status
            }
            DatasetName::NeuronClasses => {
                let (_, ctx) = context(simulations.as_ref(), filter)?;
                let selected = require(neurons.as_ref(), DatasetName::Neurons)?;
                let (dataset, status) = extract::extract(cache, &ctx, policy, selected.len(), || {
                    NeuronClasses::extract(selected, extraction)
                })?;
                *neuron_classes = Some(dataset);
                status
            }
            DatasetName::TrialSteps => {
                let (sims, ctx) = context(simulations.as_ref(), filter)?;
                let (dataset, status) = extract::extract(cache, &ctx, policy, sims.len(), || {
                    TrialSteps::extract(sims, extraction, source, registry)
                })?;
                *trial_steps = Some(dataset);
                status
            }
            DatasetName::Windows => {
                let (sims, ctx) = context(simulations.as_ref(), filter)?;
                let steps = require(trial_steps.as_ref(), DatasetName::TrialSteps)?;
                let upstream = if extraction.windows.is_empty() { 0 } else { sims.len() };
                let (dataset, status) = extract::extract(cache, &ctx, policy, upstream, || {
                    Windows::extract(sims, steps, extraction)
                })?;
                *windows = Some(dataset);
                status
            }
            DatasetName::Spikes => {
                let (sims, ctx) = context(simulations.as_ref(), filter)?;
                let selected = require(neurons.as_ref(), DatasetName::Neurons)?;
                let trials = require(windows.as_ref(), DatasetName::Windows)?;
                let (dataset, status) = extract::extract(cache, &ctx, policy, selected.len(), || {
                    Spikes::extract(sims, selected, trials, source)
                })?;
                *spikes = Some(dataset);
                status
            }
        };
        statuses.insert(name, status);
        Ok(())
    }

    /// True if every dataset has been extracted
    #[must_use]
    pub fn is_extracted(&self) -> bool {
        DatasetName::ALL.iter().all(|name| self.statuses.contains_key(name))
    }

    /// Fail unless every dataset has been extracted
    ///
    /// # Errors
    /// Returns a precondition error listing the missing datasets
    pub fn check_extractions(&self) -> Result<()> {
        let missing: Vec<&str> = DatasetName::ALL
            .iter()
            .filter(|name| !self.statuses.contains_key(name))
            .map(|name| name.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Precondition(format!(
                "Some datasets have not been extracted: {}",
                missing.join(", ")
            )))
        }
    }

    /// How a dataset was obtained, if extracted
    #[must_use]
    pub fn status(&self, name: DatasetName) -> Option<ExtractionStatus> {
        self.statuses.get(&name).copied()
    }

    /// Status of every extracted dataset
    #[must_use]
    pub const fn statuses(&self) -> &BTreeMap<DatasetName, ExtractionStatus> {
        &self.statuses
    }

    /// Simulations dataset
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn simulations(&self) -> Result<&Simulations> {
        require(self.simulations.as_ref(), DatasetName::Simulations)
    }

    /// Neurons dataset
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn neurons(&self) -> Result<&Neurons> {
        require(self.neurons.as_ref(), DatasetName::Neurons)
    }

    /// Neuron classes dataset
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn neuron_classes(&self) -> Result<&NeuronClasses> {
        require(self.neuron_classes.as_ref(), DatasetName::NeuronClasses)
    }

    /// Trial steps dataset
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn trial_steps(&self) -> Result<&TrialSteps> {
        require(self.trial_steps.as_ref(), DatasetName::TrialSteps)
    }

    /// Windows dataset
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn windows(&self) -> Result<&Windows> {
        require(self.windows.as_ref(), DatasetName::Windows)
    }

    /// Spikes dataset
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn spikes(&self) -> Result<&Spikes> {
        require(self.spikes.as_ref(), DatasetName::Spikes)
    }

    /// Table of a dataset by name
    ///
    /// # Errors
    /// Returns a precondition error if it has not been extracted
    pub fn table(&self, name: DatasetName) -> Result<&RecordBatch> {
        Ok(match name {
            DatasetName::Simulations => self.simulations()?.table(),
            DatasetName::Neurons => self.neurons()?.table(),
            DatasetName::NeuronClasses => self.neuron_classes()?.table(),
            DatasetName::TrialSteps => self.trial_steps()?.table(),
            DatasetName::Windows => self.windows()?.table(),
            DatasetName::Spikes => self.spikes()?.table(),
        })
    }

    /// Campaign entries accepted by the filter but not extracted
    ///
    /// These are the incomplete simulations, with the campaign columns and
    /// their circuit when it can be resolved.
    ///
    /// # Errors
    /// Returns a precondition error if simulations have not been extracted
    pub fn missing_simulations(&self) -> Result<RecordBatch> {
        let extracted: BTreeSet<i16> = self.simulations()?.simulation_ids()?.into_iter().collect();
        let (table, _) = Simulations::campaign_table(&self.campaign, self.source.as_ref())?;
        let selected = self.filter.apply(&table)?;
        let mask = i16_values(&selected, SIMULATION_ID)?
            .iter()
            .map(|id| !extracted.contains(id))
            .collect();
        filter_rows(&selected, mask)
    }

    /// New repository restricted by `filter`, in addition to the current one
    ///
    /// The datasets are derived in memory from the current ones, which are
    /// extracted first if needed. The new repository shares the cache
    /// read-only and never writes to it. This repository is not modified.
    ///
    /// # Errors
    /// Returns the extraction error, or an error if `filter` references an
    /// unknown column
    pub fn apply_filter(&mut self, filter: &SimulationsFilter) -> Result<Self> {
        self.extract_all()?;
        let mut timer = Timer::start();
        let combined = self.filter.and(filter);
        let (sims, sims_status) =
            derive(self.simulations()?, &FilterContext::new(combined.clone()))?;
        let ctx = FilterContext::with_simulations(combined.clone(), &sims)?;
        let (neurons, neurons_status) = derive(self.neurons()?, &ctx)?;
        let (neuron_classes, classes_status) = derive(self.neuron_classes()?, &ctx)?;
        let (trial_steps, steps_status) = derive(self.trial_steps()?, &ctx)?;
        let (windows, windows_status) = derive(self.windows()?, &ctx)?;
        let (spikes, spikes_status) = derive(self.spikes()?, &ctx)?;
        info!(
            simulations = sims.len(),
            spikes = spikes.len(),
            elapsed = timer.lap(),
            "Filtered repository"
        );
        Ok(Self {
            campaign: self.campaign.clone(),
            extraction: self.extraction.clone(),
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            output: self.output.clone(),
            cache: self.cache.to_readonly(),
            filter: combined,
            policy: BuildPolicy::CacheOnly,
            simulations: Some(sims),
            neurons: Some(neurons),
            neuron_classes: Some(neuron_classes),
            trial_steps: Some(trial_steps),
            windows: Some(windows),
            spikes: Some(spikes),
            statuses: BTreeMap::from([
                (DatasetName::Simulations, sims_status),
                (DatasetName::Neurons, neurons_status),
                (DatasetName::NeuronClasses, classes_status),
                (DatasetName::TrialSteps, steps_status),
                (DatasetName::Windows, windows_status),
                (DatasetName::Spikes, spikes_status),
            ]),
        })
    }

    /// Serializable handle for reopening this repository elsewhere
    ///
    /// Everything is extracted first so the cache holds every dataset.
    ///
    /// # Errors
    /// Returns the extraction error
    pub fn snapshot(&mut self) -> Result<RepositorySnapshot> {
        self.extract_all()?;
        Ok(RepositorySnapshot {
            campaign: self.campaign.clone(),
            extraction: self.extraction.clone(),
            output: self.output.clone(),
            keys: self.cache.keys().clone(),
            filter: self.filter.clone(),
        })
    }

    /// Campaign definition
    #[must_use]
    pub const fn campaign(&self) -> &SimulationCampaign {
        &self.campaign
    }

    /// Extraction definition
    #[must_use]
    pub const fn extraction(&self) -> &ExtractionConfig {
        &self.extraction
    }

    /// Effective simulations filter
    #[must_use]
    pub const fn filter(&self) -> &SimulationsFilter {
        &self.filter
    }

    /// Cache manager
    #[must_use]
    pub const fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Registered functions
    #[must_use]
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("campaign", &self.campaign.name)
            .field("cache", &self.cache.root())
            .field("readonly", &self.cache.is_readonly())
            .field("filter", &self.filter)
            .field("statuses", &self.statuses)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use tempfile::TempDir;

    fn repository(dir: &TempDir) -> Repository {
        let campaign: SimulationCampaign = serde_json::from_value(serde_json::json!({
            "name": "c",
            "simulations": [{"simulation_path": "/s/0"}]
        }))
        .unwrap();
        let extraction: ExtractionConfig =
            serde_json::from_value(serde_json::json!({"report": {"type": "spikes"}})).unwrap();
        let source = MemorySource::new().with_simulation("/s/0", "/c", vec![]);
        Repository::builder(campaign, extraction, Arc::new(source))
            .open(dir.path())
            .unwrap()
    }

    #[test]
    fn test_accessors_before_extraction_fail() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        let err = repo.spikes().unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("extract_all()"));
        assert!(!repo.is_extracted());
        assert!(repo.check_extractions().unwrap_err().to_string().contains("neuron_classes"));
    }

    #[test]
    fn test_ensure_extracted_pulls_upstream_only() {
        let dir = TempDir::new().unwrap();
        let mut repo = repository(&dir);
        repo.ensure_extracted(DatasetName::NeuronClasses).unwrap();
        assert_eq!(repo.status(DatasetName::Simulations), Some(ExtractionStatus::New));
        assert_eq!(repo.status(DatasetName::Neurons), Some(ExtractionStatus::New));
        assert_eq!(repo.status(DatasetName::Windows), None);
        assert!(repo.windows().is_err());
    }

    #[test]
    fn test_debug_names_cache_and_filter() {
        let dir = TempDir::new().unwrap();
        let debug = format!("{:?}", repository(&dir));
        assert!(debug.contains("Repository"));
        assert!(debug.contains("filter"));
    }
}
