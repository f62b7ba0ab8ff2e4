//! Instance inventory boundary.
//!
//! Instances belong to an external inventory. The scheduler only reads their
//! placement and writes the transitional task state while it has a migration
//! for them.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MigrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// No operation in progress; the instance is active where it is.
    None,
    Migrating,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::None => write!(f, "none"),
            TaskState::Migrating => write!(f, "migrating"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub host: String,
    pub task_state: TaskState,
}

impl Instance {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            task_state: TaskState::None,
        }
    }
}

#[async_trait]
pub trait InstanceInventory: Send + Sync {
    async fn get_instance(&self, id: &Uuid) -> Result<Option<Instance>>;

    async fn set_task_state(&self, id: &Uuid, task_state: TaskState) -> Result<()>;

    async fn set_host(&self, id: &Uuid, host: &str) -> Result<()>;
}

/// Inventory kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    instances: RwLock<HashMap<Uuid, Instance>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instance: Instance) {
        self.instances.write().await.insert(instance.id, instance);
    }

    /// Create an instance on `host` and return its id.
    pub async fn create(&self, host: &str) -> Uuid {
        let instance = Instance::new(host);
        let id = instance.id;
        self.insert(instance).await;
        id
    }
}

#[async_trait]
impl InstanceInventory for InMemoryInventory {
    async fn get_instance(&self, id: &Uuid) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn set_task_state(&self, id: &Uuid, task_state: TaskState) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or(MigrationError::InstanceNotFound(*id))?;
        instance.task_state = task_state;
        Ok(())
    }

    async fn set_host(&self, id: &Uuid, host: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or(MigrationError::InstanceNotFound(*id))?;
        instance.host = host.to_string();
        Ok(())
    }
}
