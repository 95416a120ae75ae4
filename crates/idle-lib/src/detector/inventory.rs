//! Instance inventory

use crate::error::IdleResult;
use crate::models::{Instance, RunningState};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Source of the instances the fleet detector iterates
#[async_trait]
pub trait InstanceInventory: Send + Sync {
    async fn list(&self) -> IdleResult<Vec<Instance>>;

    async fn get(&self, instance_id: &str) -> IdleResult<Option<Instance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|i| i.id == instance_id || i.name == instance_id))
    }
}

/// Inventory held in memory, loaded from configuration
#[derive(Debug, Default)]
pub struct StaticInventory {
    instances: RwLock<Vec<Instance>>,
}

impl StaticInventory {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self {
            instances: RwLock::new(instances),
        }
    }

    /// Record a lifecycle state reported out of band
    pub async fn set_state(&self, instance_id: &str, state: RunningState) -> bool {
        let mut instances = self.instances.write().await;
        match instances.iter_mut().find(|i| i.id == instance_id) {
            Some(instance) => {
                instance.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn set_reachable(&self, instance_id: &str, reachable: bool) -> bool {
        let mut instances = self.instances.write().await;
        match instances.iter_mut().find(|i| i.id == instance_id) {
            Some(instance) => {
                instance.reachable = reachable;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl InstanceInventory for StaticInventory {
    async fn list(&self) -> IdleResult<Vec<Instance>> {
        Ok(self.instances.read().await.clone())
    }
}
