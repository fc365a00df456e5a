//! Source adapters: access to circuits and simulation results
//!
//! Reading circuit and report files is delegated to a [`CampaignSource`]. The
//! extraction layer only needs the four operations below.
//!
//! # Example
//!
//! ```rust
//! use campaign_etl::source::{CampaignSource, Cell, MemorySource, SpikeEvent};
//! use std::path::Path;
//!
//! # fn main() -> campaign_etl::Result<()> {
//! let source = MemorySource::new()
//!     .with_circuit("/circuit", vec![Cell::new(1).property("layer", 5)])
//!     .with_simulation("/sim/0", "/circuit", vec![SpikeEvent::new(12.5, 1)]);
//!
//! assert!(source.is_complete(Path::new("/sim/0")));
//! let spikes = source.load_spikes(Path::new("/sim/0"), &[1], 0.0, 100.0)?;
//! assert_eq!(spikes.len(), 1);
//! # Ok(())
//! # }
//! ```

mod memory;

pub use memory::{Cell, MemorySource};

use crate::config::NeuronQuery;
use crate::Result;
use std::path::{Path, PathBuf};

/// A single spike
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeEvent {
    /// Absolute spike time
    pub time: f64,
    /// Neuron id
    pub gid: i64,
}

impl SpikeEvent {
    /// Create a spike event
    #[must_use]
    pub const fn new(time: f64, gid: i64) -> Self {
        Self { time, gid }
    }
}

/// Reader of circuits and simulation results
pub trait CampaignSource: Send + Sync {
    /// True if the simulation results are available
    fn is_complete(&self, simulation_path: &Path) -> bool;

    /// Circuit used by the simulation
    ///
    /// # Errors
    /// Returns error if the simulation cannot be opened
    fn circuit_path(&self, simulation_path: &Path) -> Result<PathBuf>;

    /// Gids of the cells matching the target and the property query, sorted
    ///
    /// # Errors
    /// Returns error if the circuit or the target cannot be read
    fn select_gids(
        &self,
        circuit_path: &Path,
        target: Option<&str>,
        query: &NeuronQuery,
    ) -> Result<Vec<i64>>;

    /// Spikes of the given gids in `[t_start, t_stop)`, ordered by time
    ///
    /// # Errors
    /// Returns error if the spike report cannot be read
    fn load_spikes(
        &self,
        simulation_path: &Path,
        gids: &[i64],
        t_start: f64,
        t_stop: f64,
    ) -> Result<Vec<SpikeEvent>>;
}
