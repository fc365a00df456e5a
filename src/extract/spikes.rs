//! Spikes dataset and its groupings

use super::{Dataset, DatasetName, Neurons, Simulations, Windows};
use crate::constants::{CIRCUIT_ID, GID, NEURON_CLASS, SIMULATION_ID, TIME, TRIAL, WINDOW};
use crate::source::CampaignSource;
use crate::table::{
    drop_columns, i16_values, i64_values, str_values, take_rows, Scalar, TableBuilder,
};
use crate::{Error, Result};
use arrow::array::Int16Array;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Key of a (simulation, circuit, neuron class, window) group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NeuronClassKey {
    /// Simulation id
    pub simulation_id: i16,
    /// Circuit id
    pub circuit_id: i16,
    /// Neuron class label
    pub neuron_class: String,
    /// Window label
    pub window: String,
}

/// Key of a (simulation, circuit, neuron class, window, gid) group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GidKey {
    /// Simulation id
    pub simulation_id: i16,
    /// Circuit id
    pub circuit_id: i16,
    /// Neuron class label
    pub neuron_class: String,
    /// Window label
    pub window: String,
    /// Neuron id
    pub gid: i64,
}

/// Key of any group passed to a feature function
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum GroupKey {
    /// Per-gid group
    Gid(GidKey),
    /// Per-neuron-class group
    NeuronClass(NeuronClassKey),
}

impl GroupKey {
    /// Neuron class label
    #[must_use]
    pub fn neuron_class(&self) -> &str {
        match self {
            Self::Gid(k) => &k.neuron_class,
            Self::NeuronClass(k) => &k.neuron_class,
        }
    }

    /// Window label
    #[must_use]
    pub fn window(&self) -> &str {
        match self {
            Self::Gid(k) => &k.window,
            Self::NeuronClass(k) => &k.window,
        }
    }

    /// Key fields as `(column, value)` pairs, in column order
    #[must_use]
    pub fn fields(&self) -> Vec<(&'static str, Scalar)> {
        let (simulation_id, circuit_id, neuron_class, window, gid) = match self {
            Self::Gid(k) => {
                (k.simulation_id, k.circuit_id, &k.neuron_class, &k.window, Some(k.gid))
            }
            Self::NeuronClass(k) => {
                (k.simulation_id, k.circuit_id, &k.neuron_class, &k.window, None)
            }
        };
        let mut fields = vec![
            (SIMULATION_ID, Scalar::from(simulation_id)),
            (CIRCUIT_ID, Scalar::from(circuit_id)),
            (NEURON_CLASS, Scalar::from(neuron_class.as_str())),
            (WINDOW, Scalar::from(window.as_str())),
        ];
        if let Some(gid) = gid {
            fields.push((GID, Scalar::from(gid)));
        }
        fields
    }
}

/// Spike times of the selected neurons in every window trial
#[derive(Debug, Clone, PartialEq)]
pub struct Spikes {
    table: RecordBatch,
}

impl Dataset for Spikes {
    const NAME: DatasetName = DatasetName::Spikes;
    const COLUMNS: &'static [&'static str] =
        &[SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW, TRIAL, GID, TIME];
    // a quiet population is not an error
    const ALLOW_EMPTY: bool = true;

    fn wrap(table: RecordBatch) -> Self {
        Self { table }
    }

    fn table(&self) -> &RecordBatch {
        &self.table
    }
}

#[derive(Default)]
struct Columns {
    sim_ids: Vec<i16>,
    circuit_ids: Vec<i16>,
    classes: Vec<String>,
    windows: Vec<String>,
    trials: Vec<i16>,
    gids: Vec<i64>,
    times: Vec<f64>,
}

impl Spikes {
    /// Load the spikes of each window trial for the selected neurons
    ///
    /// Spikes are read once per trial for all the neuron classes, kept in
    /// `[offset + t_start, offset + t_stop)`, and stored relative to the offset.
    ///
    /// # Errors
    /// Returns a data integrity error if the source returns a gid that was not
    /// requested, or the source error if spikes cannot be loaded
    pub fn extract(
        simulations: &Simulations,
        neurons: &Neurons,
        windows: &Windows,
        source: &dyn CampaignSource,
    ) -> Result<Self> {
        let neurons_by_sim = neurons.by_simulation()?;
        let windows_by_sim = windows.by_simulation()?;
        let mut out = Columns::default();
        for row in simulations.rows()? {
            let Some(classes) = neurons_by_sim.get(&row.simulation_id) else {
                continue;
            };
            let mut gid_classes: FxHashMap<i64, Vec<&str>> = FxHashMap::default();
            for (class, gids) in classes {
                for gid in gids {
                    gid_classes.entry(*gid).or_default().push(class.as_str());
                }
            }
            let mut all_gids: Vec<i64> = gid_classes.keys().copied().collect();
            all_gids.sort_unstable();

            for w in windows_by_sim.get(&row.simulation_id).into_iter().flatten() {
                let events = source.load_spikes(
                    &row.simulation_path,
                    &all_gids,
                    w.offset + w.t_start,
                    w.offset + w.t_stop,
                )?;
                debug!(
                    simulation_id = row.simulation_id,
                    window = %w.window,
                    trial = w.trial,
                    spikes = events.len(),
                    "Loaded spikes"
                );
                let mut by_class: BTreeMap<&str, Vec<(i64, f64)>> = BTreeMap::new();
                for event in events {
                    let owners = gid_classes.get(&event.gid).ok_or_else(|| {
                        Error::DataIntegrity(format!(
                            "simulation {}: spike of unexpected gid {}",
                            row.simulation_id, event.gid
                        ))
                    })?;
                    for class in owners {
                        by_class
                            .entry(*class)
                            .or_default()
                            .push((event.gid, event.time - w.offset));
                    }
                }
                for (class, events) in by_class {
                    for (gid, time) in events {
                        out.sim_ids.push(row.simulation_id);
                        out.circuit_ids.push(row.circuit_id);
                        out.classes.push(class.to_string());
                        out.windows.push(w.window.clone());
                        out.trials.push(w.trial);
                        out.gids.push(gid);
                        out.times.push(time);
                    }
                }
            }
        }
        let table = TableBuilder::new()
            .column(SIMULATION_ID, Arc::new(Int16Array::from(out.sim_ids)))
            .column(CIRCUIT_ID, Arc::new(Int16Array::from(out.circuit_ids)))
            .utf8(NEURON_CLASS, out.classes)
            .utf8(WINDOW, out.windows)
            .column(TRIAL, Arc::new(Int16Array::from(out.trials)))
            .int64(GID, out.gids)
            .float64(TIME, out.times)
            .build()?;
        Self::from_table(table)
    }

    /// Groups by (simulation, circuit, neuron class, window), sorted by key
    ///
    /// Group tables hold `trial`, `gid` and `time`.
    ///
    /// # Errors
    /// Returns error if a column is invalid
    pub fn grouped_by_neuron_class(&self) -> Result<Vec<(NeuronClassKey, RecordBatch)>> {
        let t = &self.table;
        let (sims, circuits) = (i16_values(t, SIMULATION_ID)?, i16_values(t, CIRCUIT_ID)?);
        let (classes, windows) = (str_values(t, NEURON_CLASS)?, str_values(t, WINDOW)?);
        let keys = (0..t.num_rows()).map(|i| NeuronClassKey {
            simulation_id: sims[i],
            circuit_id: circuits[i],
            neuron_class: classes[i].clone(),
            window: windows[i].clone(),
        });
        self.groups(keys, &[SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW])
    }

    /// Groups by (simulation, circuit, neuron class, window, gid), sorted by key
    ///
    /// Only gids with at least one spike have a group. Group tables hold
    /// `trial` and `time`.
    ///
    /// # Errors
    /// Returns error if a column is invalid
    pub fn grouped_by_gid(&self) -> Result<Vec<(GidKey, RecordBatch)>> {
        let t = &self.table;
        let (sims, circuits) = (i16_values(t, SIMULATION_ID)?, i16_values(t, CIRCUIT_ID)?);
        let (classes, windows) = (str_values(t, NEURON_CLASS)?, str_values(t, WINDOW)?);
        let gids = i64_values(t, GID)?;
        let keys = (0..t.num_rows()).map(|i| GidKey {
            simulation_id: sims[i],
            circuit_id: circuits[i],
            neuron_class: classes[i].clone(),
            window: windows[i].clone(),
            gid: gids[i],
        });
        self.groups(keys, &[SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW, GID])
    }

    fn groups<K, I>(&self, keys: I, key_columns: &[&str]) -> Result<Vec<(K, RecordBatch)>>
    where
        K: Hash + Eq + Ord,
        I: Iterator<Item = K>,
    {
        let mut index: FxHashMap<K, Vec<u32>> = FxHashMap::default();
        for (row, key) in keys.enumerate() {
            let row = u32::try_from(row)
                .map_err(|_| Error::StorageError("Too many spikes to group".to_string()))?;
            index.entry(key).or_default().push(row);
        }
        let mut groups: Vec<(K, Vec<u32>)> = index.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        let values = drop_columns(&self.table, key_columns)?;
        groups
            .into_iter()
            .map(|(key, rows)| Ok((key, take_rows(&values, &rows)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractionConfig, SimulationCampaign};
    use crate::extract::TrialSteps;
    use crate::filter::SimulationsFilter;
    use crate::registry::FunctionRegistry;
    use crate::source::{Cell, MemorySource, SpikeEvent};
    use crate::table::{column_names, f64_values};

    fn extraction() -> ExtractionConfig {
        serde_json::from_value(serde_json::json!({
            "report": {"type": "spikes"},
            "neuron_classes": {"all": {}, "odd": {"$gids": [1, 3]}},
            "windows": {
                "w1": {"initial_offset": 10, "bounds": [0, 20], "t_step": 100, "n_trials": 2}
            }
        }))
        .unwrap()
    }

    fn source() -> MemorySource {
        MemorySource::new()
            .with_circuit("/c", vec![Cell::new(1), Cell::new(2), Cell::new(3)])
            .with_simulation(
                "/s/0",
                "/c",
                vec![
                    SpikeEvent::new(5.0, 1),
                    SpikeEvent::new(12.0, 1),
                    SpikeEvent::new(15.0, 2),
                    SpikeEvent::new(30.0, 3),
                    SpikeEvent::new(111.0, 3),
                ],
            )
    }

    fn spikes(source: &MemorySource) -> Spikes {
        let campaign: SimulationCampaign = serde_json::from_value(serde_json::json!({
            "name": "c",
            "simulations": [{"simulation_path": "/s/0"}]
        }))
        .unwrap();
        let config = extraction();
        let sims = Simulations::extract(&campaign, &SimulationsFilter::new(), source).unwrap();
        let neurons = Neurons::extract(&sims, &config, source).unwrap();
        let steps = TrialSteps::extract(&sims, &config, source, &FunctionRegistry::new()).unwrap();
        let windows = Windows::extract(&sims, &steps, &config).unwrap();
        Spikes::extract(&sims, &neurons, &windows, source).unwrap()
    }

    #[test]
    fn test_extract_splits_by_class_and_trial() {
        let spikes = spikes(&source());
        // trial 0 [10, 30): gids 1, 2 -> "all" x2, "odd" x1; trial 1 [110, 130): gid 3 -> both
        assert_eq!(spikes.len(), 5);
        let times = f64_values(spikes.table(), TIME).unwrap();
        assert_eq!(times, vec![2.0, 5.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_grouped_by_neuron_class() {
        let groups = spikes(&source()).grouped_by_neuron_class().unwrap();
        let sizes: Vec<(&str, usize)> = groups
            .iter()
            .map(|(k, t)| (k.neuron_class.as_str(), t.num_rows()))
            .collect();
        assert_eq!(sizes, vec![("all", 3), ("odd", 2)]);
        assert_eq!(column_names(&groups[0].1), vec![TRIAL, GID, TIME]);
    }

    #[test]
    fn test_grouped_by_gid() {
        let groups = spikes(&source()).grouped_by_gid().unwrap();
        let keys: Vec<(&str, i64)> = groups
            .iter()
            .map(|(k, _)| (k.neuron_class.as_str(), k.gid))
            .collect();
        assert_eq!(keys, vec![("all", 1), ("all", 2), ("all", 3), ("odd", 1), ("odd", 3)]);
        assert_eq!(column_names(&groups[0].1), vec![TRIAL, TIME]);
    }

    #[test]
    fn test_unexpected_gid_is_integrity_error() {
        struct Leaky(MemorySource);
        impl CampaignSource for Leaky {
            fn is_complete(&self, p: &std::path::Path) -> bool {
                self.0.is_complete(p)
            }
            fn circuit_path(&self, p: &std::path::Path) -> Result<std::path::PathBuf> {
                self.0.circuit_path(p)
            }
            fn select_gids(
                &self,
                c: &std::path::Path,
                t: Option<&str>,
                q: &crate::config::NeuronQuery,
            ) -> Result<Vec<i64>> {
                self.0.select_gids(c, t, q)
            }
            fn load_spikes(
                &self,
                _: &std::path::Path,
                _: &[i64],
                t_start: f64,
                _: f64,
            ) -> Result<Vec<SpikeEvent>> {
                Ok(vec![SpikeEvent::new(t_start, 99)])
            }
        }
        let source = Leaky(source());
        let campaign: SimulationCampaign = serde_json::from_value(serde_json::json!({
            "name": "c",
            "simulations": [{"simulation_path": "/s/0"}]
        }))
        .unwrap();
        let config = extraction();
        let sims = Simulations::extract(&campaign, &SimulationsFilter::new(), &source).unwrap();
        let neurons = Neurons::extract(&sims, &config, &source).unwrap();
        let steps =
            TrialSteps::extract(&sims, &config, &source, &FunctionRegistry::new()).unwrap();
        let windows = Windows::extract(&sims, &steps, &config).unwrap();
        let err = Spikes::extract(&sims, &neurons, &windows, &source).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
    }

    #[test]
    fn test_group_key_fields() {
        let key = GroupKey::Gid(GidKey {
            simulation_id: 1,
            circuit_id: 0,
            neuron_class: "L5".into(),
            window: "w1".into(),
            gid: 42,
        });
        let names: Vec<&str> = key.fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec![SIMULATION_ID, CIRCUIT_ID, NEURON_CLASS, WINDOW, GID]);
        assert_eq!(key.window(), "w1");
    }
}
