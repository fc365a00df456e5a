//! # campaign-etl: cached extraction and features for simulation campaigns
//!
//! campaign-etl extracts six interdependent tables from the results of a
//! simulation campaign (simulations, neurons, neuron classes, trial steps,
//! windows, spikes), caches them as Parquet files keyed by configuration
//! checksums, and runs registered feature functions over the grouped spikes.
//!
//! ## Design
//!
//! - **One `RecordBatch` per dataset**, normalized to canonical column types on
//!   every construction path so cached and fresh tables compare equal
//! - **Chained cache keys**: changing a window invalidates windows and spikes,
//!   not the neuron selection
//! - **Filter-aware reuse**: tables cached under a looser filter are re-filtered
//!   in memory, never reused when the filter was relaxed
//! - **Read-only handoff**: [`repository::RepositorySnapshot`] reopens a
//!   repository elsewhere from the cache alone
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use campaign_etl::config::AnalysisConfig;
//! use campaign_etl::features::Analyzer;
//! use campaign_etl::registry::{FeatureOutput, FunctionRegistry};
//! use campaign_etl::source::MemorySource;
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! campaign_etl::logging::init("info");
//! let config = AnalysisConfig::load("analysis.json")?;
//! let registry = FunctionRegistry::new().with_feature("count", |input| {
//!     let count = i64::try_from(input.table.num_rows()).unwrap_or(i64::MAX);
//!     Ok(FeatureOutput::Fields(BTreeMap::from([("count".to_string(), count.into())])))
//! });
//! let mut analyzer = Analyzer::new(config, Arc::new(MemorySource::new()), Arc::new(registry))?;
//! for (name, table) in analyzer.calculate_features()? {
//!     println!("{name}: {} rows", table.num_rows());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod checksum;
pub mod config;
pub mod constants;
pub mod error;
pub mod extract;
pub mod features;
pub mod filter;
pub mod logging;
pub mod registry;
pub mod repository;
pub mod source;
pub mod storage;
pub mod table;

pub use error::{Error, Result};
