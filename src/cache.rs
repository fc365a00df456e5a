//! Cache manager: one Parquet artifact per dataset, namespaced by checksum
//!
//! Layout under the output directory:
//!
//! ```text
//! <output>/<namespace>/checksums.json       sidecar
//! <output>/<namespace>/repo/<dataset>.parquet
//! ```
//!
//! The namespace is the checksum of the simulation campaign. Each dataset has
//! its own key, chaining the checksum of the configuration it depends on with
//! the keys of its upstream datasets, so a change invalidates the affected
//! dataset and everything downstream of it, and nothing else. The sidecar
//! also records the content checksum of every artifact, verified on load.

use crate::checksum::{checksum_file, checksum_json, combine};
use crate::config::{ExtractionConfig, SimulationCampaign};
use crate::extract::DatasetName;
use crate::filter::SimulationsFilter;
use crate::storage::{load_parquet, write_atomic, write_parquet_atomic};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version of the cache layout, stored in the sidecar
pub const CACHE_VERSION: u32 = 1;
/// Sidecar file name
pub const SIDECAR: &str = "checksums.json";
const REPO_DIR: &str = "repo";

/// Namespace and per-dataset keys derived from the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeys {
    /// Checksum of the simulation campaign
    pub namespace: String,
    /// Key of each dataset
    pub datasets: BTreeMap<String, String>,
}

impl CacheKeys {
    /// Compute the keys of all the datasets
    ///
    /// # Errors
    /// Returns error if a configuration cannot be serialized
    pub fn from_config(
        campaign: &SimulationCampaign,
        extraction: &ExtractionConfig,
    ) -> Result<Self> {
        let namespace = campaign.checksum()?;
        let simulations = combine([DatasetName::Simulations.as_str(), namespace.as_str()]);
        let neurons_config = checksum_json(&json!({
            "target": extraction.target,
            "limit": extraction.limit,
            "neuron_classes": extraction.neuron_classes,
            "seed": extraction.seed,
        }))?;
        let neurons = combine([
            DatasetName::Neurons.as_str(),
            simulations.as_str(),
            neurons_config.as_str(),
        ]);
        let neuron_classes = combine([DatasetName::NeuronClasses.as_str(), neurons.as_str()]);
        let trial_steps_config = checksum_json(&json!({
            "trial_steps": extraction.trial_steps,
            "target": extraction.target,
            "limit": extraction.limit,
            "seed": extraction.seed,
        }))?;
        let trial_steps = combine([
            DatasetName::TrialSteps.as_str(),
            simulations.as_str(),
            trial_steps_config.as_str(),
        ]);
        let windows_config = checksum_json(&extraction.windows)?;
        let windows = combine([
            DatasetName::Windows.as_str(),
            simulations.as_str(),
            trial_steps.as_str(),
            windows_config.as_str(),
        ]);
        let report_config = checksum_json(&extraction.report)?;
        let spikes = combine([
            DatasetName::Spikes.as_str(),
            neurons.as_str(),
            windows.as_str(),
            report_config.as_str(),
        ]);

        let datasets = [
            (DatasetName::Simulations, simulations),
            (DatasetName::Neurons, neurons),
            (DatasetName::NeuronClasses, neuron_classes),
            (DatasetName::TrialSteps, trial_steps),
            (DatasetName::Windows, windows),
            (DatasetName::Spikes, spikes),
        ]
        .into_iter()
        .map(|(name, key)| (name.as_str().to_string(), key))
        .collect();
        Ok(Self { namespace, datasets })
    }

    /// Key of a dataset
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.datasets.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    version: u32,
    namespace: String,
    created_at: DateTime<Utc>,
    simulations_filter: SimulationsFilter,
    datasets: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
}

/// Reads and writes the cached datasets of one namespace
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
    keys: CacheKeys,
    filter: SimulationsFilter,
    stored: BTreeMap<String, String>,
    files: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    readonly: bool,
}

impl CacheManager {
    /// Open the namespace for reading and writing
    ///
    /// Invalid content is removed: the whole namespace when the sidecar is
    /// missing, unreadable, from another layout version, or when `filter` is not
    /// narrower than the filter the tables were extracted with; single
    /// artifacts when their key is stale. With `clear` the namespace is wiped.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be cleaned or written
    pub fn open<P: AsRef<Path>>(
        output: P,
        keys: CacheKeys,
        filter: SimulationsFilter,
        clear: bool,
    ) -> Result<Self> {
        let root = output.as_ref().join(&keys.namespace);
        let mut manager = Self {
            root,
            keys,
            filter,
            stored: BTreeMap::new(),
            files: BTreeMap::new(),
            created_at: Utc::now(),
            readonly: false,
        };
        if clear {
            info!(path = %manager.root.display(), "Clearing the cache as requested");
            manager.clear()?;
        } else {
            match manager.read_valid_sidecar() {
                Ok(Some(sidecar)) => manager.keep_valid_datasets(&sidecar)?,
                Ok(None) => manager.clear()?,
                Err(e) => {
                    warn!(
                        path = %manager.root.display(),
                        error = %e,
                        "Invalidating the whole cache"
                    );
                    manager.clear()?;
                }
            }
        }
        manager.write_sidecar()?;
        Ok(manager)
    }

    /// Open the namespace for reading only; stale or invalid entries are misses
    #[must_use]
    pub fn open_readonly<P: AsRef<Path>>(
        output: P,
        keys: CacheKeys,
        filter: SimulationsFilter,
    ) -> Self {
        let root = output.as_ref().join(&keys.namespace);
        let mut manager = Self {
            root,
            keys,
            filter,
            stored: BTreeMap::new(),
            files: BTreeMap::new(),
            created_at: Utc::now(),
            readonly: true,
        };
        match manager.read_valid_sidecar() {
            Ok(Some(sidecar)) => manager.adopt(&sidecar),
            Ok(None) => debug!(path = %manager.root.display(), "No cache to read"),
            Err(e) => warn!(path = %manager.root.display(), error = %e, "Ignoring invalid cache"),
        }
        manager
    }

    /// Read-only copy of this manager
    #[must_use]
    pub fn to_readonly(&self) -> Self {
        Self {
            readonly: true,
            ..self.clone()
        }
    }

    /// True if [`Self::dump`] is forbidden
    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Directory of the namespace
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys in use
    #[must_use]
    pub const fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// Filter the cached tables satisfy
    #[must_use]
    pub const fn filter(&self) -> &SimulationsFilter {
        &self.filter
    }

    /// Creation time of the namespace
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Path of the artifact of a dataset
    #[must_use]
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(REPO_DIR).join(format!("{name}.parquet"))
    }

    /// True if a valid artifact is recorded for the dataset
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.keys.get(name).is_some_and(|key| {
            self.stored.get(name).map(String::as_str) == Some(key)
                && self.artifact_path(name).exists()
        })
    }

    /// Cached table of a dataset, `None` on a miss
    ///
    /// Unreadable artifacts, and artifacts whose content checksum differs from
    /// the recorded one, are logged and reported as misses.
    #[must_use]
    pub fn load(&self, name: &str) -> Option<RecordBatch> {
        if !self.contains(name) {
            debug!(dataset = name, "Cache miss");
            return None;
        }
        let path = self.artifact_path(name);
        match checksum_file(&path) {
            Ok(digest) if self.files.get(name) == Some(&digest) => {}
            Ok(_) => {
                warn!(dataset = name, "Ignoring cache artifact with a mismatching checksum");
                return None;
            }
            Err(e) => {
                warn!(dataset = name, error = %e, "Ignoring unreadable cache artifact");
                return None;
            }
        }
        match load_parquet(&path) {
            Ok(batch) => Some(batch),
            Err(e) => {
                warn!(dataset = name, error = %e, "Ignoring unreadable cache artifact");
                None
            }
        }
    }

    /// Persist the table of a dataset and record its key
    ///
    /// # Errors
    /// Returns [`Error::ReadOnlyCache`] on a read-only manager, or a storage
    /// error if the files cannot be written
    pub fn dump(&mut self, name: &str, batch: &RecordBatch) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnlyCache(name.to_string()));
        }
        let key = self
            .keys
            .get(name)
            .ok_or_else(|| Error::StorageError(format!("No cache key for {name}")))?
            .to_string();
        let path = self.artifact_path(name);
        write_parquet_atomic(&path, batch)?;
        self.files.insert(name.to_string(), checksum_file(&path)?);
        self.stored.insert(name.to_string(), key);
        self.write_sidecar()?;
        debug!(dataset = name, rows = batch.num_rows(), "Dumped to cache");
        Ok(())
    }

    /// Remove every artifact of the namespace
    ///
    /// # Errors
    /// Returns error on a read-only manager or if the directory cannot be removed
    pub fn clear(&mut self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnlyCache(self.root.display().to_string()));
        }
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        self.stored.clear();
        self.files.clear();
        self.created_at = Utc::now();
        Ok(())
    }

    fn read_valid_sidecar(&self) -> Result<Option<Sidecar>> {
        let path = self.root.join(SIDECAR);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let sidecar: Sidecar = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CacheInvalid(format!("unreadable {SIDECAR}: {e}")))?;
        if sidecar.version != CACHE_VERSION {
            return Err(Error::CacheInvalid(format!(
                "version {} instead of {CACHE_VERSION}",
                sidecar.version
            )));
        }
        if sidecar.namespace != self.keys.namespace {
            return Err(Error::CacheInvalid(format!(
                "namespace {} instead of {}",
                sidecar.namespace, self.keys.namespace
            )));
        }
        if !self.filter.is_subfilter_of(&sidecar.simulations_filter) {
            return Err(Error::CacheInvalid(format!(
                "filter {} is not narrower than the cached filter {}",
                serde_json::to_string(&self.filter)?,
                serde_json::to_string(&sidecar.simulations_filter)?
            )));
        }
        Ok(Some(sidecar))
    }

    fn matching_entries(&self, sidecar: &Sidecar) -> BTreeMap<String, String> {
        sidecar
            .datasets
            .iter()
            .filter(|(name, key)| self.keys.get(name) == Some(key.as_str()))
            .map(|(name, key)| (name.clone(), key.clone()))
            .collect()
    }

    fn adopt(&mut self, sidecar: &Sidecar) {
        self.created_at = sidecar.created_at;
        self.stored = self.matching_entries(sidecar);
        self.files = sidecar
            .files
            .iter()
            .filter(|(name, _)| self.stored.contains_key(*name))
            .map(|(name, digest)| (name.clone(), digest.clone()))
            .collect();
    }

    fn keep_valid_datasets(&mut self, sidecar: &Sidecar) -> Result<()> {
        self.adopt(sidecar);
        for name in self.keys.datasets.keys() {
            if self.stored.contains_key(name) {
                continue;
            }
            let path = self.artifact_path(name);
            if path.exists() {
                warn!(dataset = %name, "Removing stale cache artifact");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn write_sidecar(&self) -> Result<()> {
        let sidecar = Sidecar {
            version: CACHE_VERSION,
            namespace: self.keys.namespace.clone(),
            created_at: self.created_at,
            simulations_filter: self.filter.clone(),
            datasets: self.stored.clone(),
            files: self.files.clone(),
        };
        write_atomic(self.root.join(SIDECAR), &serde_json::to_vec_pretty(&sidecar)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{GID, SIMULATION_ID};
    use crate::table::TableBuilder;

    fn keys() -> CacheKeys {
        let campaign: SimulationCampaign = serde_json::from_value(json!({
            "name": "test",
            "simulations": [{"simulation_path": "/sim/0"}]
        }))
        .unwrap();
        let extraction: ExtractionConfig = serde_json::from_value(json!({
            "report": {"type": "spikes"},
            "windows": {"w1": {"bounds": [0.0, 100.0]}}
        }))
        .unwrap();
        CacheKeys::from_config(&campaign, &extraction).unwrap()
    }

    fn open(dir: &tempfile::TempDir) -> CacheManager {
        CacheManager::open(dir.path(), keys(), SimulationsFilter::new(), false).unwrap()
    }

    fn batch() -> RecordBatch {
        TableBuilder::new()
            .int64(SIMULATION_ID, vec![0, 0])
            .int64(GID, vec![1, 2])
            .build()
            .unwrap()
    }

    #[test]
    fn test_dump_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open(&dir);
        assert!(cache.load("simulations").is_none());
        cache.dump("simulations", &batch()).unwrap();
        assert_eq!(cache.load("simulations").unwrap(), batch());

        let reopened = open(&dir);
        assert_eq!(reopened.load("simulations").unwrap(), batch());
        assert_eq!(reopened.created_at(), cache.created_at());
    }

    #[test]
    fn test_readonly_dump_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir);
        let mut readonly = cache.to_readonly();
        assert!(readonly.is_readonly());
        assert!(matches!(readonly.dump("simulations", &batch()), Err(Error::ReadOnlyCache(_))));
        assert!(!cache.artifact_path("simulations").exists());
    }

    #[test]
    fn test_stale_key_removes_only_that_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open(&dir);
        cache.dump("simulations", &batch()).unwrap();
        cache.dump("windows", &batch()).unwrap();

        let mut changed = keys();
        changed.datasets.insert("windows".into(), "other".into());
        let reopened =
            CacheManager::open(dir.path(), changed, SimulationsFilter::new(), false).unwrap();
        assert!(reopened.load("simulations").is_some());
        assert!(reopened.load("windows").is_none());
        assert!(!reopened.artifact_path("windows").exists());
    }

    #[test]
    fn test_wider_filter_clears_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let narrow = SimulationsFilter::new().eq("seed", 1);
        let mut cache = CacheManager::open(dir.path(), keys(), narrow.clone(), false).unwrap();
        cache.dump("simulations", &batch()).unwrap();

        let narrower = narrow.clone().eq("ca", 1.0);
        let reopened = CacheManager::open(dir.path(), keys(), narrower, false).unwrap();
        assert!(reopened.load("simulations").is_some());

        let wider = open(&dir);
        assert!(wider.load("simulations").is_none());
        assert!(!wider.artifact_path("simulations").exists());
    }

    #[test]
    fn test_corrupt_sidecar_clears_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open(&dir);
        cache.dump("simulations", &batch()).unwrap();
        std::fs::write(cache.root().join(SIDECAR), b"{not json").unwrap();

        let reopened = open(&dir);
        assert!(reopened.load("simulations").is_none());
        assert!(reopened.root().join(SIDECAR).exists());
    }

    #[test]
    fn test_corrupt_artifact_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open(&dir);
        cache.dump("simulations", &batch()).unwrap();
        std::fs::write(cache.artifact_path("simulations"), b"garbage").unwrap();
        assert!(cache.load("simulations").is_none());
    }

    #[test]
    fn test_replaced_artifact_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open(&dir);
        cache.dump("simulations", &batch()).unwrap();
        let recorded = checksum_file(cache.artifact_path("simulations")).unwrap();
        let sidecar: Sidecar =
            serde_json::from_slice(&std::fs::read(cache.root().join(SIDECAR)).unwrap()).unwrap();
        assert_eq!(sidecar.files.get("simulations"), Some(&recorded));

        let other = TableBuilder::new().int64(SIMULATION_ID, vec![7]).build().unwrap();
        write_parquet_atomic(cache.artifact_path("simulations"), &other).unwrap();
        assert!(cache.load("simulations").is_none());
        assert!(open(&dir).load("simulations").is_none());
    }

    #[test]
    fn test_clear_cache_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open(&dir);
        cache.dump("simulations", &batch()).unwrap();
        let cleared =
            CacheManager::open(dir.path(), keys(), SimulationsFilter::new(), true).unwrap();
        assert!(cleared.load("simulations").is_none());
    }

    #[test]
    fn test_open_readonly_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let readonly = CacheManager::open_readonly(dir.path(), keys(), SimulationsFilter::new());
        assert!(readonly.load("simulations").is_none());
        assert!(!readonly.root().exists());
    }

    #[test]
    fn test_window_change_keeps_upstream_keys() {
        let base = keys();
        let campaign: SimulationCampaign = serde_json::from_value(json!({
            "name": "test",
            "simulations": [{"simulation_path": "/sim/0"}]
        }))
        .unwrap();
        let extraction: ExtractionConfig = serde_json::from_value(json!({
            "report": {"type": "spikes"},
            "windows": {"w1": {"bounds": [0.0, 200.0]}}
        }))
        .unwrap();
        let changed = CacheKeys::from_config(&campaign, &extraction).unwrap();
        assert_eq!(changed.namespace, base.namespace);
        for name in ["simulations", "neurons", "neuron_classes", "trial_steps"] {
            assert_eq!(changed.get(name), base.get(name), "{name}");
        }
        for name in ["windows", "spikes"] {
            assert_ne!(changed.get(name), base.get(name), "{name}");
        }
    }
}
