//! Centralized periodic idle detection
//!
//! - `inventory`: where the running fleet comes from
//! - `evaluator`: classify, publish, audit and act for one instance; shared
//!   with the local agent
//! - `fleet`: the bounded-concurrency cycle over every running instance

mod evaluator;
mod fleet;
mod inventory;


pub use evaluator::{Evaluation, Evaluator};
pub use fleet::{CycleReport, FleetConfig, FleetDetector, FleetDetectorBuilder};
pub use inventory::{InstanceInventory, StaticInventory};
