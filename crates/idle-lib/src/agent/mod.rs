//! Local agent running on each instance
//!
//! Detects idleness from local metrics on its own schedule, so an instance
//! the fleet detector cannot reach is still handled. It needs nothing beyond
//! the state store: the profile is cached at bootstrap and overlapping runs
//! are excluded by a lock file.

mod local;
mod lock;


pub use local::{bootstrap_profile, AgentConfig, LocalAgent};
pub use lock::RunLock;
