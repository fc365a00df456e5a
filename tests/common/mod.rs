//! Shared fixtures: a three-simulation campaign over one ten-cell circuit
//!
//! Simulations 0 and 1 are complete with five spikes each inside the
//! `[0, 100)` window; simulation 2 is incomplete.

#![allow(dead_code)]

use campaign_etl::config::{AnalysisConfig, ExtractionConfig, SimulationCampaign};
use campaign_etl::filter::SimulationsFilter;
use campaign_etl::repository::Repository;
use campaign_etl::source::{Cell, MemorySource, SpikeEvent};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

pub fn campaign() -> SimulationCampaign {
    serde_json::from_value(json!({
        "name": "fixture",
        "attrs": {"circuit_config": "/circuit"},
        "simulations": [
            {"simulation_path": "/sim/0", "conditions": {"seed": 1, "ca": 1.0}},
            {"simulation_path": "/sim/1", "conditions": {"seed": 2, "ca": 1.1}},
            {"simulation_path": "/sim/2", "conditions": {"seed": 3, "ca": 1.2}}
        ]
    }))
    .unwrap()
}

pub fn source() -> MemorySource {
    let cells = (1..=10)
        .map(|gid| {
            let layer = if gid <= 5 { 2 } else { 5 };
            Cell::new(gid).property("layer", layer).target("hex0")
        })
        .collect();
    MemorySource::new()
        .with_circuit("/circuit", cells)
        .with_simulation(
            "/sim/0",
            "/circuit",
            vec![
                SpikeEvent::new(5.0, 1),
                SpikeEvent::new(15.0, 2),
                SpikeEvent::new(25.0, 6),
                SpikeEvent::new(35.0, 7),
                SpikeEvent::new(45.0, 8),
                SpikeEvent::new(150.0, 1),
            ],
        )
        .with_simulation(
            "/sim/1",
            "/circuit",
            vec![
                SpikeEvent::new(10.0, 3),
                SpikeEvent::new(20.0, 4),
                SpikeEvent::new(30.0, 9),
                SpikeEvent::new(40.0, 10),
                SpikeEvent::new(50.0, 1),
            ],
        )
        .with_incomplete_simulation("/sim/2", "/circuit")
}

pub fn extraction_json(window_stop: f64) -> Value {
    json!({
        "report": {"type": "spikes"},
        "neuron_classes": {
            "L2": {"layer": 2},
            "L5": {"layer": 5}
        },
        "target": "hex0",
        "windows": {
            "w1": {"bounds": [0.0, window_stop], "window_type": "spontaneous"}
        }
    })
}

pub fn extraction(window_stop: f64) -> ExtractionConfig {
    serde_json::from_value(extraction_json(window_stop)).unwrap()
}

pub fn open(dir: &Path, window_stop: f64, filter: SimulationsFilter) -> Repository {
    Repository::builder(campaign(), extraction(window_stop), Arc::new(source()))
        .filter(filter)
        .open(dir)
        .unwrap()
}

pub fn repository(dir: &Path) -> Repository {
    open(dir, 100.0, SimulationsFilter::new())
}

pub fn analysis_config(dir: &Path, features: Value, in_memory_filter: Value) -> AnalysisConfig {
    serde_json::from_value(json!({
        "simulation_campaign": dir.join("campaign.json"),
        "output": dir.join("output"),
        "simulations_filter_in_memory": in_memory_filter,
        "extraction": extraction_json(100.0),
        "features": features
    }))
    .unwrap()
}
