//! Shared idle state and the claim-before-act protocol
//!
//! The store holds one `IdleRecord` per instance and is the only mutable
//! resource the schedulers share. Writes are last-writer-wins per record;
//! `StateSync` layers the episode protocol on top:
//! - publishing classifications (`idle_since` set once per episode)
//! - claiming the terminal action, with a settle-and-reread race check
//! - forward-only completion and reverting a failed claim

mod file;
mod memory;
mod sync;


pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use sync::{ClaimOutcome, Observation, StateSync, SyncConfig};

use crate::error::IdleResult;
use crate::models::IdleRecord;
use async_trait::async_trait;

/// Key-value facility holding one idle record per instance
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current record, or `None` if the instance was never classified
    async fn load(&self, instance_id: &str) -> IdleResult<Option<IdleRecord>>;

    /// Replace the record for `record.instance_id`
    async fn save(&self, record: &IdleRecord) -> IdleResult<()>;

    /// Every stored record, ordered by instance id
    async fn list(&self) -> IdleResult<Vec<IdleRecord>>;
}
