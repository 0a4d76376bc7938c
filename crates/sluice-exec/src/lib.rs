//! Execution layer for the sluice dataflow engine.
//!
//! - [`EagerExecutor`] - single-threaded incremental executor with a
//!   persistent per-socket value cache and per-run named storage
//! - [`TreeExecutor`] - the strategy trait the host programs against
//! - [`NodeSystem`] - lifecycle wrapper binding one tree to one executor

mod executor;
mod system;

pub use executor::{EagerExecutor, TreeExecutor};
pub use system::NodeSystem;
