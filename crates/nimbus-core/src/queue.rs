//! Durable task queue port.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use nimbus_state::TaskRepository;

use crate::error::CoreResult;

/// Queue carrying instance provisioning tasks.
pub const PROVISION_QUEUE: &str = "provision";
/// Queue carrying pipeline build jobs.
pub const BUILD_QUEUE: &str = "pipeline_build_queue";

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> CoreResult<()>;
    async fn dequeue(&self, queue: &str) -> CoreResult<Option<Vec<u8>>>;
}

/// Serialize `task` as JSON and enqueue it.
pub async fn enqueue_json<T: Serialize + Sync>(queue: &dyn TaskQueue, name: &str, task: &T) -> CoreResult<()> {
    queue.enqueue(name, serde_json::to_vec(task)?).await
}

/// Dequeue the next task and decode it from JSON.
pub async fn dequeue_json<T: DeserializeOwned>(queue: &dyn TaskQueue, name: &str) -> CoreResult<Option<T>> {
    match queue.dequeue(name).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Task queue persisted in the state store.
#[derive(Clone)]
pub struct StoreTaskQueue {
    tasks: Arc<dyn TaskRepository>,
}

impl StoreTaskQueue {
    pub fn new(tasks: Arc<dyn TaskRepository>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl TaskQueue for StoreTaskQueue {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> CoreResult<()> {
        self.tasks.push_task(queue, &payload).await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.tasks.pop_task(queue).await?)
    }
}
