//! Column names and the canonical column types shared by every dataset

use arrow::datatypes::DataType;

/// Neuron id
pub const GID: &str = "gid";
/// Spike time, relative to the trial offset
pub const TIME: &str = "time";
/// Path of the simulation in the campaign
pub const SIMULATION_PATH: &str = "simulation_path";
/// Simulation id (position in the campaign)
pub const SIMULATION_ID: &str = "simulation_id";
/// Path of the circuit used by the simulation
pub const CIRCUIT_PATH: &str = "circuit_path";
/// Circuit id (first-appearance order of circuits in the campaign)
pub const CIRCUIT_ID: &str = "circuit_id";
/// Neuron class label
pub const NEURON_CLASS: &str = "neuron_class";
/// Incremental gid index inside each neuron class
pub const NEURON_CLASS_INDEX: &str = "neuron_class_index";
/// Window label
pub const WINDOW: &str = "window";
/// Trial index inside a window
pub const TRIAL: &str = "trial";
/// Absolute time of the trial origin
pub const OFFSET: &str = "offset";
/// Window start, relative to the offset
pub const T_START: &str = "t_start";
/// Window stop, relative to the offset
pub const T_STOP: &str = "t_stop";
/// Window duration
pub const DURATION: &str = "duration";
/// Free-form window type
pub const WINDOW_TYPE: &str = "window_type";
/// Number of neurons in a neuron class
pub const COUNT: &str = "count";
/// Neuron limit configured for a neuron class
pub const LIMIT: &str = "limit";
/// Target configured for a neuron class
pub const TARGET: &str = "target";
/// JSON-encoded neuron class query
pub const QUERY: &str = "query";
/// Trial steps label
pub const TRIAL_STEPS_LABEL: &str = "trial_steps_label";
/// Computed trial steps value
pub const TRIAL_STEPS_VALUE: &str = "trial_steps_value";

/// Every column name with a fixed meaning in some dataset
pub const COLUMNS: &[&str] = &[
    GID,
    TIME,
    SIMULATION_PATH,
    SIMULATION_ID,
    CIRCUIT_PATH,
    CIRCUIT_ID,
    NEURON_CLASS,
    NEURON_CLASS_INDEX,
    WINDOW,
    TRIAL,
    OFFSET,
    T_START,
    T_STOP,
    DURATION,
    WINDOW_TYPE,
    COUNT,
    LIMIT,
    TARGET,
    QUERY,
    TRIAL_STEPS_LABEL,
    TRIAL_STEPS_VALUE,
];

/// Dictionary-encoded strings, the "categorical" type
#[must_use]
pub fn categorical() -> DataType {
    DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
}

/// Canonical type for a column name, `None` for columns without one
#[must_use]
pub fn canonical_type(name: &str) -> Option<DataType> {
    let dtype = match name {
        SIMULATION_ID | CIRCUIT_ID | TRIAL => DataType::Int16,
        GID | NEURON_CLASS_INDEX | COUNT => DataType::Int64,
        TIME | T_START | T_STOP | DURATION | OFFSET | TRIAL_STEPS_VALUE => DataType::Float64,
        NEURON_CLASS | WINDOW => categorical(),
        _ => return None,
    };
    Some(dtype)
}
