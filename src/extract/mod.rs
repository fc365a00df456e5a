//! Extraction of the six campaign datasets
//!
//! Every dataset wraps one normalized `RecordBatch` and has two construction
//! paths: a fresh build from upstream datasets (an inherent `extract` function
//! on each type) and a reconstruction from a cached table
//! ([`Dataset::from_cached`]). Both end in [`Dataset::from_table`], which checks
//! the declared columns and applies the canonical column types.

mod neuron_classes;
mod neurons;
mod simulations;
mod spikes;
mod trial_steps;
mod windows;

pub use neuron_classes::NeuronClasses;
pub use neurons::{sample_gids, Neurons};
pub use simulations::{SimulationRow, Simulations};
pub use spikes::{GidKey, GroupKey, NeuronClassKey, Spikes};
pub use trial_steps::TrialSteps;
pub use windows::{WindowRow, Windows};

use crate::cache::CacheManager;
use crate::constants::{CIRCUIT_ID, SIMULATION_ID};
use crate::filter::SimulationsFilter;
use crate::logging::Timer;
use crate::table::{column_names, filter_rows, i16_values, normalize};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

/// Names of the datasets, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetName {
    /// One row per simulation
    Simulations,
    /// One row per selected neuron
    Neurons,
    /// One row per (circuit, neuron class)
    NeuronClasses,
    /// One row per (simulation, trial steps label)
    TrialSteps,
    /// One row per (simulation, window, trial)
    Windows,
    /// One row per spike
    Spikes,
}

impl DatasetName {
    /// All datasets, upstream first
    pub const ALL: [Self; 6] = [
        Self::Simulations,
        Self::Neurons,
        Self::NeuronClasses,
        Self::TrialSteps,
        Self::Windows,
        Self::Spikes,
    ];

    /// Name used for cache artifacts and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simulations => "simulations",
            Self::Neurons => "neurons",
            Self::NeuronClasses => "neuron_classes",
            Self::TrialSteps => "trial_steps",
            Self::Windows => "windows",
            Self::Spikes => "spikes",
        }
    }

    /// Datasets read by the fresh build of this one
    #[must_use]
    pub const fn upstream(self) -> &'static [Self] {
        match self {
            Self::Simulations => &[],
            Self::Neurons | Self::TrialSteps => &[Self::Simulations],
            Self::NeuronClasses => &[Self::Neurons],
            Self::Windows => &[Self::Simulations, Self::TrialSteps],
            Self::Spikes => &[Self::Simulations, Self::Neurons, Self::Windows],
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dataset was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Built from source
    New,
    /// Loaded from the cache unchanged
    Cached,
    /// Loaded from the cache and reduced by the current filter
    Modified,
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Cached => "cached",
            Self::Modified => "modified",
        })
    }
}

/// Constraints used to re-derive datasets from cached tables
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    /// Filter applied to the simulations
    pub filter: SimulationsFilter,
    /// Surviving simulations, known once simulations are extracted
    pub simulation_ids: Option<BTreeSet<i16>>,
    /// Circuits of the surviving simulations
    pub circuit_ids: Option<BTreeSet<i16>>,
}

impl FilterContext {
    /// Context with a filter only
    #[must_use]
    pub fn new(filter: SimulationsFilter) -> Self {
        Self {
            filter,
            simulation_ids: None,
            circuit_ids: None,
        }
    }

    /// Context restricted to the given simulations
    ///
    /// # Errors
    /// Returns error if the table lacks the id columns
    pub fn with_simulations(filter: SimulationsFilter, simulations: &Simulations) -> Result<Self> {
        let table = simulations.table();
        Ok(Self {
            filter,
            simulation_ids: Some(i16_values(table, SIMULATION_ID)?.into_iter().collect()),
            circuit_ids: Some(i16_values(table, CIRCUIT_ID)?.into_iter().collect()),
        })
    }
}

/// Keep the rows whose `column` value is in `ids`; no-op when `ids` is `None`
///
/// # Errors
/// Returns error if the column is missing or holds nulls
pub fn restrict(
    table: &RecordBatch,
    column: &str,
    ids: Option<&BTreeSet<i16>>,
) -> Result<RecordBatch> {
    let Some(ids) = ids else {
        return Ok(table.clone());
    };
    let mask = i16_values(table, column)?
        .iter()
        .map(|id| ids.contains(id))
        .collect();
    filter_rows(table, mask)
}

/// A validated, normalized dataset
pub trait Dataset: Sized {
    /// Dataset name
    const NAME: DatasetName;
    /// Declared columns
    const COLUMNS: &'static [&'static str];
    /// Accept columns not in [`Self::COLUMNS`]
    const ALLOW_EXTRA_COLUMNS: bool = false;
    /// Declared columns that may be absent
    const ALLOW_MISSING_COLUMNS: &'static [&'static str] = &[];
    /// Accept zero rows from a fresh build over non-empty upstream data
    const ALLOW_EMPTY: bool = false;

    /// Wrap a table already validated and normalized
    fn wrap(table: RecordBatch) -> Self;

    /// The underlying table
    fn table(&self) -> &RecordBatch;

    /// Number of rows
    fn len(&self) -> usize {
        self.table().num_rows()
    }

    /// True if the dataset has no rows
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate the columns and normalize the types
    ///
    /// # Errors
    /// Returns a schema error if the columns don't match the declaration
    fn from_table(table: RecordBatch) -> Result<Self> {
        validate_columns::<Self>(&table)?;
        Ok(Self::wrap(normalize(&table)?))
    }

    /// Rebuild from a cached table, keeping only the rows allowed by `ctx`
    ///
    /// # Errors
    /// Returns error if the table is invalid or cannot be filtered
    fn from_cached(table: RecordBatch, ctx: &FilterContext) -> Result<Self> {
        validate_columns::<Self>(&table)?;
        Self::from_table(restrict(&table, SIMULATION_ID, ctx.simulation_ids.as_ref())?)
    }
}

fn validate_columns<D: Dataset>(table: &RecordBatch) -> Result<()> {
    let actual: BTreeSet<String> = column_names(table).into_iter().collect();
    let missing: Vec<&str> = D::COLUMNS
        .iter()
        .copied()
        .filter(|c| !actual.contains(*c) && !D::ALLOW_MISSING_COLUMNS.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(Error::schema(
            D::NAME.as_str(),
            format!("Expected columns not present: {missing:?}"),
        ));
    }
    if !D::ALLOW_EXTRA_COLUMNS {
        let extra: Vec<&String> = actual
            .iter()
            .filter(|c| !D::COLUMNS.contains(&c.as_str()))
            .collect();
        if !extra.is_empty() {
            return Err(Error::schema(
                D::NAME.as_str(),
                format!("Additional columns not allowed: {extra:?}"),
            ));
        }
    }
    Ok(())
}

/// Where a fresh build may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPolicy {
    /// Load from the cache, build from source on a miss
    CacheOrBuild,
    /// Load from the cache only; a miss is a precondition error
    CacheOnly,
}

/// Load a dataset from the cache or build it, then persist it if it changed
///
/// A cached table that no longer matches the dataset columns counts as a miss.
/// `upstream_rows` is the size of the data the fresh build derives from; a
/// fresh build producing no rows from non-empty upstream data is rejected
/// unless the dataset allows it.
///
/// # Errors
/// Returns the build error, a data integrity error for unexpected empty
/// results, or a storage error if the dataset cannot be persisted
pub fn extract<D, F>(
    cache: &mut CacheManager,
    ctx: &FilterContext,
    policy: BuildPolicy,
    upstream_rows: usize,
    build: F,
) -> Result<(D, ExtractionStatus)>
where
    D: Dataset,
    F: FnOnce() -> Result<D>,
{
    let mut timer = Timer::start();
    let name = D::NAME.as_str();
    let cached = cache.load(name).and_then(|table| {
        let initial_len = table.num_rows();
        match D::from_cached(table, ctx) {
            Ok(dataset) => Some((dataset, initial_len)),
            Err(e) => {
                warn!(dataset = name, error = %e, "Malformed cached dataset, rebuilding");
                None
            }
        }
    });
    let (dataset, status) = match cached {
        Some((dataset, initial_len)) => {
            // only the row count is compared
            let status = if dataset.len() == initial_len {
                ExtractionStatus::Cached
            } else {
                ExtractionStatus::Modified
            };
            (dataset, status)
        }
        None if policy == BuildPolicy::CacheOnly => {
            return Err(Error::Precondition(format!(
                "{name} is not available in the cache {}",
                cache.root().display()
            )));
        }
        None => {
            let dataset = build()?;
            if dataset.is_empty() && upstream_rows > 0 && !D::ALLOW_EMPTY {
                return Err(Error::DataIntegrity(format!(
                    "{name} is empty, but {upstream_rows} upstream rows were available"
                )));
            }
            (dataset, ExtractionStatus::New)
        }
    };
    match status {
        ExtractionStatus::Cached => {}
        // filtered views over a read-only cache stay in memory
        ExtractionStatus::Modified if cache.is_readonly() => {
            debug!(dataset = name, "Not persisting filtered dataset to a read-only cache");
        }
        _ => cache.dump(name, dataset.table())?,
    }
    info!(
        dataset = name,
        %status,
        rows = dataset.len(),
        elapsed = timer.lap(),
        "Extracted {name}"
    );
    Ok((dataset, status))
}
