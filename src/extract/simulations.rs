//! Simulations dataset

use super::{Dataset, DatasetName, FilterContext};
use crate::config::SimulationCampaign;
use crate::constants::{CIRCUIT_ID, CIRCUIT_PATH, SIMULATION_ID, SIMULATION_PATH};
use crate::filter::SimulationsFilter;
use crate::source::CampaignSource;
use crate::table::{column_names, filter_rows, i16_values, str_values, TableBuilder};
use crate::{Error, Result};
use arrow::array::{Int16Array, StringArray};
use arrow::record_batch::RecordBatch;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// One extracted simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationRow {
    /// Position in the campaign
    pub simulation_id: i16,
    /// Circuit id
    pub circuit_id: i16,
    /// Simulation results location
    pub simulation_path: PathBuf,
    /// Circuit location
    pub circuit_path: PathBuf,
}

/// Complete simulations accepted by the filter, with their circuit
#[derive(Debug, Clone, PartialEq)]
pub struct Simulations {
    table: RecordBatch,
}

impl Dataset for Simulations {
    const NAME: DatasetName = DatasetName::Simulations;
    const COLUMNS: &'static [&'static str] =
        &[SIMULATION_ID, CIRCUIT_ID, SIMULATION_PATH, CIRCUIT_PATH];
    const ALLOW_EXTRA_COLUMNS: bool = true;

    fn wrap(table: RecordBatch) -> Self {
        Self { table }
    }

    fn table(&self) -> &RecordBatch {
        &self.table
    }

    fn from_cached(table: RecordBatch, ctx: &FilterContext) -> Result<Self> {
        Self::from_table(ctx.filter.apply(&table)?)
    }
}

impl Simulations {
    /// Build from the campaign: assign circuit ids, apply the filter, drop
    /// incomplete simulations
    ///
    /// Circuit ids follow the first appearance of each circuit in the whole
    /// campaign, so they don't depend on the filter.
    ///
    /// # Errors
    /// Returns error if the campaign is invalid, the filter references unknown
    /// columns, a complete simulation cannot be opened, or every simulation
    /// accepted by the filter is incomplete
    pub fn extract(
        campaign: &SimulationCampaign,
        filter: &SimulationsFilter,
        source: &dyn CampaignSource,
    ) -> Result<Self> {
        let (table, complete) = Self::campaign_table(campaign, source)?;
        let mut mask = filter.mask(&table)?;
        let selected = mask.iter().filter(|keep| **keep).count();
        let entries = mask.iter_mut().zip(&complete).zip(&campaign.simulations);
        for ((keep, is_complete), sim) in entries {
            if *keep && !is_complete {
                warn!(path = %sim.simulation_path.display(), "Ignoring incomplete simulation");
                *keep = false;
            }
        }
        if selected > 0 && !mask.iter().any(|keep| *keep) {
            return Err(Error::DataIntegrity(format!(
                "all the {selected} selected simulations are incomplete"
            )));
        }
        Self::from_table(filter_rows(&table, mask)?)
    }

    /// Every campaign entry with its circuit, and whether it is complete
    ///
    /// Circuit columns are null for incomplete simulations whose circuit
    /// cannot be resolved.
    pub(crate) fn campaign_table(
        campaign: &SimulationCampaign,
        source: &dyn CampaignSource,
    ) -> Result<(RecordBatch, Vec<bool>)> {
        let campaign_table = campaign.to_table()?;
        let mut circuits: Vec<PathBuf> = Vec::new();
        let mut circuit_ids = Vec::with_capacity(campaign.len());
        let mut circuit_paths = Vec::with_capacity(campaign.len());
        let mut complete = Vec::with_capacity(campaign.len());
        for sim in &campaign.simulations {
            let is_complete = source.is_complete(&sim.simulation_path);
            let circuit = match source.circuit_path(&sim.simulation_path) {
                Ok(path) => Some(path),
                Err(e) if !is_complete => {
                    debug!(
                        path = %sim.simulation_path.display(),
                        error = %e,
                        "No circuit for incomplete simulation"
                    );
                    None
                }
                Err(e) => return Err(e),
            };
            let id = match circuit {
                Some(ref path) => {
                    let pos = circuits.iter().position(|c| c == path).unwrap_or_else(|| {
                        circuits.push(path.clone());
                        circuits.len() - 1
                    });
                    let id = i16::try_from(pos)
                        .map_err(|_| Error::Configuration("too many circuits".into()))?;
                    Some(id)
                }
                None => None,
            };
            circuit_ids.push(id);
            circuit_paths.push(circuit.map(|p| p.to_string_lossy().into_owned()));
            complete.push(is_complete);
        }

        let mut builder = TableBuilder::new()
            .column(SIMULATION_ID, Arc::clone(campaign_table.column(0)))
            .column(CIRCUIT_ID, Arc::new(Int16Array::from(circuit_ids)))
            .column(SIMULATION_PATH, Arc::clone(campaign_table.column(1)))
            .column(CIRCUIT_PATH, Arc::new(StringArray::from(circuit_paths)));
        for (name, column) in column_names(&campaign_table)
            .iter()
            .zip(campaign_table.columns())
            .skip(2)
        {
            builder = builder.column(name, Arc::clone(column));
        }
        Ok((builder.build()?, complete))
    }

    /// Simulation ids, in table order
    ///
    /// # Errors
    /// Returns error if the column is invalid
    pub fn simulation_ids(&self) -> Result<Vec<i16>> {
        i16_values(&self.table, SIMULATION_ID)
    }

    /// Rows with their typed paths
    ///
    /// # Errors
    /// Returns error if a column is invalid or holds nulls
    pub fn rows(&self) -> Result<Vec<SimulationRow>> {
        let sim_ids = i16_values(&self.table, SIMULATION_ID)?;
        let circuit_ids = i16_values(&self.table, CIRCUIT_ID)?;
        let sim_paths = str_values(&self.table, SIMULATION_PATH)?;
        let circuit_paths = str_values(&self.table, CIRCUIT_PATH)?;
        Ok(sim_ids
            .into_iter()
            .zip(circuit_ids)
            .zip(sim_paths.into_iter().zip(circuit_paths))
            .map(|((simulation_id, circuit_id), (sim, circuit))| SimulationRow {
                simulation_id,
                circuit_id,
                simulation_path: PathBuf::from(sim),
                circuit_path: PathBuf::from(circuit),
            })
            .collect())
    }
}
