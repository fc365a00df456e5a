//! Neurons dataset

use super::simulations::SimulationRow;
use super::{Dataset, DatasetName, Simulations};
use crate::config::{ExtractionConfig, NeuronClassConfig};
use crate::constants::{CIRCUIT_ID, GID, NEURON_CLASS, NEURON_CLASS_INDEX, SIMULATION_ID};
use crate::source::CampaignSource;
use crate::table::{i16_values, i64_values, str_values, TableBuilder};
use crate::Result;
use arrow::array::Int16Array;
use arrow::record_batch::RecordBatch;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Sample at most `limit` gids, reproducibly for a given seed and circuit
///
/// The result is sorted.
#[must_use]
pub fn sample_gids(gids: Vec<i64>, limit: Option<usize>, seed: u64, circuit_id: i16) -> Vec<i64> {
    match limit {
        Some(limit) if gids.len() > limit => {
            let circuit = u64::try_from(circuit_id).unwrap_or_default();
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(circuit));
            let mut sampled: Vec<i64> = gids.choose_multiple(&mut rng, limit).copied().collect();
            sampled.sort_unstable();
            sampled
        }
        _ => gids,
    }
}

/// Gids of one neuron class in one circuit
///
/// # Errors
/// Returns error if the source cannot select the cells
pub fn select_class_gids(
    source: &dyn CampaignSource,
    circuit_path: &Path,
    circuit_id: i16,
    class: &NeuronClassConfig,
    extraction: &ExtractionConfig,
) -> Result<Vec<i64>> {
    let target = class.target.as_deref().or(extraction.target.as_deref());
    let mut gids = source.select_gids(circuit_path, target, &class.query)?;
    if let Some(explicit) = &class.gids {
        let explicit: BTreeSet<i64> = explicit.iter().copied().collect();
        gids.retain(|gid| explicit.contains(gid));
    }
    let total = gids.len();
    let gids = sample_gids(gids, class.limit.or(extraction.limit), extraction.seed, circuit_id);
    debug!(circuit_id, selected = gids.len(), total, "Selected gids");
    Ok(gids)
}

/// Selected neurons of every simulation, by neuron class
#[derive(Debug, Clone, PartialEq)]
pub struct Neurons {
    table: RecordBatch,
}

impl Dataset for Neurons {
    const NAME: DatasetName = DatasetName::Neurons;
    const COLUMNS: &'static [&'static str] =
        &[SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, GID, NEURON_CLASS_INDEX];

    fn wrap(table: RecordBatch) -> Self {
        Self { table }
    }

    fn table(&self) -> &RecordBatch {
        &self.table
    }
}

impl Neurons {
    /// Select the neurons of each class in the circuit of each simulation
    ///
    /// The selection runs once per circuit and is shared by the simulations
    /// using it.
    ///
    /// # Errors
    /// Returns error if the source cannot select the cells
    pub fn extract(
        simulations: &Simulations,
        extraction: &ExtractionConfig,
        source: &dyn CampaignSource,
    ) -> Result<Self> {
        let mut by_circuit: BTreeMap<i16, Vec<(&str, Vec<i64>)>> = BTreeMap::new();
        let mut sim_ids = Vec::new();
        let mut circuit_ids = Vec::new();
        let mut classes = Vec::new();
        let mut gids = Vec::new();
        let mut indices = Vec::new();
        for SimulationRow {
            simulation_id,
            circuit_id,
            circuit_path,
            ..
        } in simulations.rows()?
        {
            if !by_circuit.contains_key(&circuit_id) {
                let selection = extraction
                    .neuron_classes
                    .iter()
                    .map(|(label, class)| {
                        select_class_gids(source, &circuit_path, circuit_id, class, extraction)
                            .map(|gids| (label.as_str(), gids))
                    })
                    .collect::<Result<Vec<_>>>()?;
                by_circuit.insert(circuit_id, selection);
            }
            for (label, class_gids) in by_circuit.get(&circuit_id).into_iter().flatten() {
                for (index, gid) in class_gids.iter().enumerate() {
                    sim_ids.push(simulation_id);
                    circuit_ids.push(circuit_id);
                    classes.push((*label).to_string());
                    gids.push(*gid);
                    indices.push(i64::try_from(index).unwrap_or(i64::MAX));
                }
            }
        }
        let table = TableBuilder::new()
            .column(SIMULATION_ID, Arc::new(Int16Array::from(sim_ids)))
            .column(CIRCUIT_ID, Arc::new(Int16Array::from(circuit_ids)))
            .utf8(NEURON_CLASS, classes)
            .int64(GID, gids)
            .int64(NEURON_CLASS_INDEX, indices)
            .build()?;
        Self::from_table(table)
    }

    /// Gids by neuron class for each simulation
    ///
    /// # Errors
    /// Returns error if a column is invalid
    pub fn by_simulation(&self) -> Result<BTreeMap<i16, BTreeMap<String, Vec<i64>>>> {
        let sim_ids = i16_values(&self.table, SIMULATION_ID)?;
        let classes = str_values(&self.table, NEURON_CLASS)?;
        let gids = i64_values(&self.table, GID)?;
        let mut result: BTreeMap<i16, BTreeMap<String, Vec<i64>>> = BTreeMap::new();
        for ((sim, class), gid) in sim_ids.into_iter().zip(classes).zip(gids) {
            result.entry(sim).or_default().entry(class).or_default().push(gid);
        }
        Ok(result)
    }
}
