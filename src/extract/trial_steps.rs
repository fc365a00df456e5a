//! Trial steps dataset: per-simulation values computed by registered functions

use super::neurons::sample_gids;
use super::{Dataset, DatasetName, Simulations};
use crate::config::{ExtractionConfig, NeuronQuery};
use crate::constants::{CIRCUIT_ID, SIMULATION_ID, TRIAL_STEPS_LABEL, TRIAL_STEPS_VALUE};
use crate::registry::FunctionRegistry;
use crate::source::CampaignSource;
use crate::table::{f64_values, i16_values, str_values, TableBuilder};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Computed trial steps values
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSteps {
    table: RecordBatch,
}

impl Dataset for TrialSteps {
    const NAME: DatasetName = DatasetName::TrialSteps;
    const COLUMNS: &'static [&'static str] =
        &[SIMULATION_ID, CIRCUIT_ID, TRIAL_STEPS_LABEL, TRIAL_STEPS_VALUE];
    // extra fields returned by the functions are kept
    const ALLOW_EXTRA_COLUMNS: bool = true;
    const ALLOW_EMPTY: bool = true;

    fn wrap(table: RecordBatch) -> Self {
        Self { table }
    }

    fn table(&self) -> &RecordBatch {
        &self.table
    }
}

struct Record {
    simulation_id: i16,
    circuit_id: i16,
    label: String,
    value: f64,
    extra: BTreeMap<String, f64>,
}

impl TrialSteps {
    /// Run each trial steps function on the spikes of each simulation
    ///
    /// Spike times passed to the function are relative to `initial_offset`.
    ///
    /// # Errors
    /// Returns a configuration error if a function is unknown or doesn't return
    /// `trial_steps_value`, or the source error if spikes cannot be loaded
    pub fn extract(
        simulations: &Simulations,
        extraction: &ExtractionConfig,
        source: &dyn CampaignSource,
        registry: &FunctionRegistry,
    ) -> Result<Self> {
        let rows = simulations.rows()?;
        let mut records = Vec::new();
        for (label, config) in &extraction.trial_steps {
            let function = registry.trial_steps(&config.function)?;
            let (t_start, t_stop) = config.bounds;
            for row in &rows {
                info!(
                    trial_steps_label = %label,
                    simulation_id = row.simulation_id,
                    circuit_id = row.circuit_id,
                    "Processing trial steps"
                );
                let gids = source.select_gids(
                    &row.circuit_path,
                    extraction.target.as_deref(),
                    &NeuronQuery::new(),
                )?;
                let gids = sample_gids(gids, extraction.limit, extraction.seed, row.circuit_id);
                let times: Vec<f64> = source
                    .load_spikes(
                        &row.simulation_path,
                        &gids,
                        config.initial_offset + t_start,
                        config.initial_offset + t_stop,
                    )?
                    .into_iter()
                    .map(|s| s.time - config.initial_offset)
                    .collect();
                let mut result = function.invoke(&times, config)?;
                let value = result.remove(TRIAL_STEPS_VALUE).ok_or_else(|| {
                    Error::function(
                        &config.function,
                        format!("the returned fields must contain {TRIAL_STEPS_VALUE:?}"),
                    )
                })?;
                info!(trial_steps_value = value, spikes = times.len(), "Computed trial steps");
                records.push(Record {
                    simulation_id: row.simulation_id,
                    circuit_id: row.circuit_id,
                    label: label.clone(),
                    value,
                    extra: result,
                });
            }
        }
        Self::from_table(Self::to_table(&records)?)
    }

    fn to_table(records: &[Record]) -> Result<RecordBatch> {
        let extra_names: BTreeSet<&String> = records.iter().flat_map(|r| r.extra.keys()).collect();
        let mut builder = TableBuilder::new()
            .int16(SIMULATION_ID, records.iter().map(|r| r.simulation_id).collect())
            .int16(CIRCUIT_ID, records.iter().map(|r| r.circuit_id).collect())
            .utf8(TRIAL_STEPS_LABEL, records.iter().map(|r| r.label.clone()).collect())
            .float64(TRIAL_STEPS_VALUE, records.iter().map(|r| r.value).collect());
        for name in extra_names {
            let values = records.iter().map(|r| r.extra.get(name).copied()).collect();
            builder = builder.opt_float64(name, values);
        }
        builder.build()
    }

    /// Value of a label for a simulation
    ///
    /// # Errors
    /// Returns error if a column is invalid
    pub fn value(&self, simulation_id: i16, label: &str) -> Result<Option<f64>> {
        let sims = i16_values(&self.table, SIMULATION_ID)?;
        let labels = str_values(&self.table, TRIAL_STEPS_LABEL)?;
        let values = f64_values(&self.table, TRIAL_STEPS_VALUE)?;
        Ok(sims
            .into_iter()
            .zip(labels)
            .zip(values)
            .find(|((s, l), _)| *s == simulation_id && l == label)
            .map(|(_, v)| v))
    }
}
