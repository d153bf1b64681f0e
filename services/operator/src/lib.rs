//! ttpair operator library
//!
//! Keeps a replicated active/standby in-memory database pair converged.
//! Each reconciliation pass observes the units of one managed pair, runs a
//! per-unit flow, and lets the decision engine pick the next pair state.
//!
//! ## Modules
//!
//! - `agent`: client for the per-unit management agent
//! - `cluster`: access to managed pair objects and their units
//! - `dispatch`: picks the flow a unit needs this pass
//! - `engine`: failover, recovery and upgrade decisions
//! - `metrics`: Prometheus gauges for pairs and async tasks
//! - `mock`: in-memory collaborators, behind the `testing` feature
//! - `reconciler`: one pass over one pair
//! - `tracker`: long running agent tasks
//! - `worker`: drives passes for every listed pair

pub mod agent;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod flows;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod metrics;
pub mod pool;
pub mod reconciler;
pub mod tracker;
pub mod worker;
