//! Neuron classes dataset: per-circuit summary of the selected neurons

use super::{restrict, Dataset, DatasetName, FilterContext, Neurons};
use crate::config::ExtractionConfig;
use crate::constants::{CIRCUIT_ID, COUNT, GID, LIMIT, NEURON_CLASS, QUERY, TARGET};
use crate::table::{i16_values, i64_values, str_values, TableBuilder};
use crate::Result;
use arrow::array::Int16Array;
use arrow::record_batch::RecordBatch;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Number of neurons and definition of each neuron class, by circuit
#[derive(Debug, Clone, PartialEq)]
pub struct NeuronClasses {
    table: RecordBatch,
}

impl Dataset for NeuronClasses {
    const NAME: DatasetName = DatasetName::NeuronClasses;
    const COLUMNS: &'static [&'static str] =
        &[CIRCUIT_ID, NEURON_CLASS, COUNT, LIMIT, TARGET, QUERY];

    fn wrap(table: RecordBatch) -> Self {
        Self { table }
    }

    fn table(&self) -> &RecordBatch {
        &self.table
    }

    fn from_cached(table: RecordBatch, ctx: &FilterContext) -> Result<Self> {
        Self::from_table(restrict(&table, CIRCUIT_ID, ctx.circuit_ids.as_ref())?)
    }
}

impl NeuronClasses {
    /// Summarize the neurons: one row per (circuit, neuron class) present
    ///
    /// # Errors
    /// Returns error if the neurons table is invalid or a query cannot be encoded
    pub fn extract(neurons: &Neurons, extraction: &ExtractionConfig) -> Result<Self> {
        let table = neurons.table();
        let circuits = i16_values(table, CIRCUIT_ID)?;
        let classes = str_values(table, NEURON_CLASS)?;
        let gids = i64_values(table, GID)?;
        let mut distinct: BTreeMap<(i16, &str), BTreeSet<i64>> = BTreeMap::new();
        for ((circuit, class), gid) in circuits.into_iter().zip(&classes).zip(gids) {
            distinct.entry((circuit, class.as_str())).or_default().insert(gid);
        }

        let mut circuit_ids = Vec::new();
        let mut labels = Vec::new();
        let mut counts = Vec::new();
        let mut limits = Vec::new();
        let mut targets = Vec::new();
        let mut queries = Vec::new();
        let circuit_set: BTreeSet<i16> = distinct.keys().map(|(c, _)| *c).collect();
        for circuit in circuit_set {
            for (label, class) in &extraction.neuron_classes {
                let Some(class_gids) = distinct.get(&(circuit, label.as_str())) else {
                    continue;
                };
                circuit_ids.push(circuit);
                labels.push(label.clone());
                counts.push(i64::try_from(class_gids.len()).unwrap_or(i64::MAX));
                limits.push(
                    class
                        .limit
                        .or(extraction.limit)
                        .map(|l| i64::try_from(l).unwrap_or(i64::MAX)),
                );
                targets.push(class.target.clone().or_else(|| extraction.target.clone()));
                queries.push(serde_json::to_string(&class.query)?);
            }
        }
        let table = TableBuilder::new()
            .column(CIRCUIT_ID, Arc::new(Int16Array::from(circuit_ids)))
            .utf8(NEURON_CLASS, labels)
            .int64(COUNT, counts)
            .opt_int64(LIMIT, limits)
            .opt_utf8(TARGET, targets)
            .utf8(QUERY, queries)
            .build()?;
        Self::from_table(table)
    }

    /// Number of neurons of a class in a circuit
    ///
    /// # Errors
    /// Returns error if a column is invalid
    pub fn count(&self, circuit_id: i16, neuron_class: &str) -> Result<Option<i64>> {
        let circuits = i16_values(&self.table, CIRCUIT_ID)?;
        let classes = str_values(&self.table, NEURON_CLASS)?;
        let counts = i64_values(&self.table, COUNT)?;
        Ok(circuits
            .into_iter()
            .zip(classes)
            .zip(counts)
            .find(|((c, n), _)| *c == circuit_id && n == neuron_class)
            .map(|(_, count)| count))
    }
}
