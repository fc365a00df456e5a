//! In-memory source, for tests and demos.

use super::{CampaignSource, SpikeEvent};
use crate::config::NeuronQuery;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// A cell with properties and target memberships
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    gid: i64,
    properties: BTreeMap<String, Value>,
    targets: BTreeSet<String>,
}

impl Cell {
    /// Cell without properties
    #[must_use]
    pub fn new(gid: i64) -> Self {
        Self {
            gid,
            properties: BTreeMap::new(),
            targets: BTreeSet::new(),
        }
    }

    /// Set a property
    #[must_use]
    pub fn property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// Add the cell to a target
    #[must_use]
    pub fn target(mut self, name: &str) -> Self {
        self.targets.insert(name.to_string());
        self
    }

    fn matches(&self, target: Option<&str>, query: &NeuronQuery) -> bool {
        if let Some(t) = target {
            if !self.targets.contains(t) {
                return false;
            }
        }
        query.iter().all(|(key, expected)| {
            self.properties.get(key).is_some_and(|actual| match expected {
                Value::Array(options) => options.contains(actual),
                other => other == actual,
            })
        })
    }
}

#[derive(Debug, Clone)]
struct SimulationEntry {
    circuit_path: PathBuf,
    spikes: Option<Vec<SpikeEvent>>,
}

/// Source backed by in-memory circuits and spike lists
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    circuits: HashMap<PathBuf, Vec<Cell>>,
    simulations: HashMap<PathBuf, SimulationEntry>,
}

impl MemorySource {
    /// Create an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a circuit
    #[must_use]
    pub fn with_circuit(mut self, path: impl Into<PathBuf>, cells: Vec<Cell>) -> Self {
        self.circuits.insert(path.into(), cells);
        self
    }

    /// Register a completed simulation and its spikes
    #[must_use]
    pub fn with_simulation(
        mut self,
        path: impl Into<PathBuf>,
        circuit_path: impl Into<PathBuf>,
        mut spikes: Vec<SpikeEvent>,
    ) -> Self {
        spikes.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.gid.cmp(&b.gid)));
        self.simulations.insert(
            path.into(),
            SimulationEntry {
                circuit_path: circuit_path.into(),
                spikes: Some(spikes),
            },
        );
        self
    }

    /// Register a simulation whose results are missing
    #[must_use]
    pub fn with_incomplete_simulation(
        mut self,
        path: impl Into<PathBuf>,
        circuit_path: impl Into<PathBuf>,
    ) -> Self {
        self.simulations.insert(
            path.into(),
            SimulationEntry {
                circuit_path: circuit_path.into(),
                spikes: None,
            },
        );
        self
    }

    fn simulation(&self, path: &Path) -> Result<&SimulationEntry> {
        self.simulations
            .get(path)
            .ok_or_else(|| Error::StorageError(format!("Unknown simulation: {}", path.display())))
    }
}

impl CampaignSource for MemorySource {
    fn is_complete(&self, simulation_path: &Path) -> bool {
        self.simulations
            .get(simulation_path)
            .is_some_and(|s| s.spikes.is_some())
    }

    fn circuit_path(&self, simulation_path: &Path) -> Result<PathBuf> {
        Ok(self.simulation(simulation_path)?.circuit_path.clone())
    }

    fn select_gids(
        &self,
        circuit_path: &Path,
        target: Option<&str>,
        query: &NeuronQuery,
    ) -> Result<Vec<i64>> {
        let cells = self.circuits.get(circuit_path).ok_or_else(|| {
            Error::StorageError(format!("Unknown circuit: {}", circuit_path.display()))
        })?;
        let mut gids: Vec<i64> = cells
            .iter()
            .filter(|c| c.matches(target, query))
            .map(|c| c.gid)
            .collect();
        gids.sort_unstable();
        gids.dedup();
        Ok(gids)
    }

    fn load_spikes(
        &self,
        simulation_path: &Path,
        gids: &[i64],
        t_start: f64,
        t_stop: f64,
    ) -> Result<Vec<SpikeEvent>> {
        let spikes = self
            .simulation(simulation_path)?
            .spikes
            .as_ref()
            .ok_or_else(|| {
                Error::StorageError(format!("Missing spikes: {}", simulation_path.display()))
            })?;
        let wanted: BTreeSet<i64> = gids.iter().copied().collect();
        Ok(spikes
            .iter()
            .filter(|s| s.time >= t_start && s.time < t_stop && wanted.contains(&s.gid))
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemorySource {
        let cells = (1..=6)
            .map(|gid| {
                let cell = Cell::new(gid)
                    .property("layer", if gid <= 3 { 2 } else { 5 })
                    .property("synapse_class", if gid % 2 == 0 { "EXC" } else { "INH" });
                if gid > 1 {
                    cell.target("hex0")
                } else {
                    cell
                }
            })
            .collect();
        MemorySource::new()
            .with_circuit("/c", cells)
            .with_simulation(
                "/s0",
                "/c",
                vec![SpikeEvent::new(5.0, 2), SpikeEvent::new(1.0, 4), SpikeEvent::new(9.9, 2)],
            )
            .with_incomplete_simulation("/s1", "/c")
    }

    #[test]
    fn test_select_gids_query_and_target() {
        let src = source();
        let mut query = NeuronQuery::new();
        query.insert("layer".into(), serde_json::json!(5));
        assert_eq!(src.select_gids(Path::new("/c"), None, &query).unwrap(), vec![4, 5, 6]);

        query.insert("synapse_class".into(), serde_json::json!(["EXC"]));
        assert_eq!(src.select_gids(Path::new("/c"), None, &query).unwrap(), vec![4, 6]);

        let all = NeuronQuery::new();
        assert_eq!(
            src.select_gids(Path::new("/c"), Some("hex0"), &all).unwrap(),
            vec![2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn test_load_spikes_half_open_interval() {
        let src = source();
        let spikes = src.load_spikes(Path::new("/s0"), &[2, 4], 1.0, 9.9).unwrap();
        assert_eq!(spikes, vec![SpikeEvent::new(1.0, 4), SpikeEvent::new(5.0, 2)]);
    }

    #[test]
    fn test_incomplete_simulation() {
        let src = source();
        assert!(src.is_complete(Path::new("/s0")));
        assert!(!src.is_complete(Path::new("/s1")));
        assert!(!src.is_complete(Path::new("/s2")));
        assert_eq!(src.circuit_path(Path::new("/s1")).unwrap(), PathBuf::from("/c"));
        assert!(src.load_spikes(Path::new("/s1"), &[1], 0.0, 1.0).is_err());
    }
}
