//! In-process state store

use super::StateStore;
use crate::error::IdleResult;
use crate::models::IdleRecord;
use async_trait::async_trait;
use dashmap::DashMap;

/// State store backed by a concurrent map.
///
/// Used by tests and by single-process deployments where the fleet detector
/// and agents share one runtime.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: DashMap<String, IdleRecord>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, instance_id: &str) -> IdleResult<Option<IdleRecord>> {
        Ok(self.records.get(instance_id).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &IdleRecord) -> IdleResult<()> {
        self.records
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> IdleResult<Vec<IdleRecord>> {
        let mut records: Vec<IdleRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }
}
