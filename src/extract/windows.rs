//! Windows dataset: time bounds of every trial of every window

use super::{Dataset, DatasetName, Simulations, TrialSteps};
use crate::config::{ExtractionConfig, WindowConfig};
use crate::constants::{
    CIRCUIT_ID, DURATION, OFFSET, SIMULATION_ID, TRIAL, T_START, T_STOP, WINDOW, WINDOW_TYPE,
};
use crate::table::{f64_values, i16_values, str_values, TableBuilder};
use crate::{Error, Result};
use arrow::array::Int16Array;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One trial of one window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRow {
    /// Window label
    pub window: String,
    /// Trial index
    pub trial: i16,
    /// Absolute time of the trial origin
    pub offset: f64,
    /// Start, relative to the offset
    pub t_start: f64,
    /// Stop, relative to the offset
    pub t_stop: f64,
}

/// Trials of the configured windows, per simulation
#[derive(Debug, Clone, PartialEq)]
pub struct Windows {
    table: RecordBatch,
}

impl Dataset for Windows {
    const NAME: DatasetName = DatasetName::Windows;
    const COLUMNS: &'static [&'static str] = &[
        SIMULATION_ID,
        CIRCUIT_ID,
        WINDOW,
        TRIAL,
        OFFSET,
        T_START,
        T_STOP,
        DURATION,
        WINDOW_TYPE,
    ];

    fn wrap(table: RecordBatch) -> Self {
        Self { table }
    }

    fn table(&self) -> &RecordBatch {
        &self.table
    }
}

fn trial_offset(
    name: &str,
    window: &WindowConfig,
    trial: usize,
    simulation_id: i16,
    trial_steps: &TrialSteps,
) -> Result<f64> {
    let step = if window.trial_steps_label.is_empty() {
        window.trial_steps_value
    } else {
        trial_steps
            .value(simulation_id, &window.trial_steps_label)?
            .ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "window {name:?}: no {:?} trial steps for simulation {simulation_id}",
                    window.trial_steps_label
                ))
            })?
    };
    Ok(window.initial_offset + trial as f64 * window.t_step + step)
}

impl Windows {
    /// Expand the windows for each simulation
    ///
    /// The offset of trial `i` is `initial_offset + i * t_step` plus either the
    /// computed trial steps value of `trial_steps_label` or `trial_steps_value`.
    ///
    /// # Errors
    /// Returns a data integrity error if a window starts before time zero or a
    /// referenced trial steps value is missing
    pub fn extract(
        simulations: &Simulations,
        trial_steps: &TrialSteps,
        extraction: &ExtractionConfig,
    ) -> Result<Self> {
        let mut sim_ids = Vec::new();
        let mut circuit_ids = Vec::new();
        let mut names = Vec::new();
        let mut trials = Vec::new();
        let mut offsets = Vec::new();
        let mut starts = Vec::new();
        let mut stops = Vec::new();
        let mut types = Vec::new();
        for row in simulations.rows()? {
            for (name, window) in &extraction.windows {
                let (t_start, t_stop) = window.bounds;
                for trial in 0..window.n_trials {
                    let offset = trial_offset(name, window, trial, row.simulation_id, trial_steps)?;
                    if offset + t_start < 0.0 || t_start > t_stop {
                        return Err(Error::DataIntegrity(format!(
                            "window {name:?} trial {trial}: invalid bounds [{}, {}]",
                            offset + t_start,
                            offset + t_stop
                        )));
                    }
                    sim_ids.push(row.simulation_id);
                    circuit_ids.push(row.circuit_id);
                    names.push(name.clone());
                    trials.push(i16::try_from(trial).map_err(|_| {
                        Error::Configuration(format!("window {name:?}: too many trials"))
                    })?);
                    offsets.push(offset);
                    starts.push(t_start);
                    stops.push(t_stop);
                    types.push(window.window_type.clone());
                }
            }
        }
        let durations = starts.iter().zip(&stops).map(|(a, b)| b - a).collect();
        let table = TableBuilder::new()
            .column(SIMULATION_ID, Arc::new(Int16Array::from(sim_ids)))
            .column(CIRCUIT_ID, Arc::new(Int16Array::from(circuit_ids)))
            .utf8(WINDOW, names)
            .column(TRIAL, Arc::new(Int16Array::from(trials)))
            .float64(OFFSET, offsets)
            .float64(T_START, starts)
            .float64(T_STOP, stops)
            .float64(DURATION, durations)
            .utf8(WINDOW_TYPE, types)
            .build()?;
        Self::from_table(table)
    }

    /// Trials of each simulation, in table order
    ///
    /// # Errors
    /// Returns error if a column is invalid
    pub fn by_simulation(&self) -> Result<BTreeMap<i16, Vec<WindowRow>>> {
        let t = &self.table;
        let columns = (
            i16_values(t, SIMULATION_ID)?,
            str_values(t, WINDOW)?,
            i16_values(t, TRIAL)?,
            f64_values(t, OFFSET)?,
            f64_values(t, T_START)?,
            f64_values(t, T_STOP)?,
        );
        let (sims, windows, trials, offsets, starts, stops) = columns;
        let mut result: BTreeMap<i16, Vec<WindowRow>> = BTreeMap::new();
        for (i, window) in windows.into_iter().enumerate() {
            result.entry(sims[i]).or_default().push(WindowRow {
                window,
                trial: trials[i],
                offset: offsets[i],
                t_start: starts[i],
                t_stop: stops[i],
            });
        }
        Ok(result)
    }
}
