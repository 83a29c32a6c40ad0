//! Queue service.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use nimbus_core::limits::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RETENTION_DAYS, DEFAULT_VISIBILITY_TIMEOUT_SECS};
use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Recorder, RequestContext};
use nimbus_state::{Queue, QueueMessage, QueueRepository};

/// Receive batches are clamped to `1..=MAX_RECEIVE_BATCH`.
pub const MAX_RECEIVE_BATCH: usize = 10;
const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 12 * 60 * 60;
const MAX_RETENTION_DAYS: u32 = 14;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub max_message_size: Option<usize>,
}

pub struct QueueService {
    queues: Arc<dyn QueueRepository>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl QueueService {
    pub fn new(queues: Arc<dyn QueueRepository>, recorder: Recorder, clock: Arc<dyn Clock>) -> Self {
        Self { queues, recorder, clock }
    }

    async fn owned(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Queue> {
        let user_id = ctx.user_id()?;
        self.queues
            .get_queue(id)
            .await?
            .filter(|q| q.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("queue {id}")))
    }

    pub async fn create_queue(&self, ctx: &RequestContext, req: CreateQueueRequest) -> CoreResult<Queue> {
        let name = req.name.trim();
        if name.is_empty() || name.len() > 80 {
            return Err(CoreError::InvalidInput("queue name must be 1-80 characters".into()));
        }
        let visibility_timeout_secs = req.visibility_timeout_secs.unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS);
        if visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
            return Err(CoreError::InvalidInput(format!(
                "visibility timeout must be at most {MAX_VISIBILITY_TIMEOUT_SECS}s"
            )));
        }
        let retention_days = req.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        if !(1..=MAX_RETENTION_DAYS).contains(&retention_days) {
            return Err(CoreError::InvalidInput(format!("retention must be 1-{MAX_RETENTION_DAYS} days")));
        }
        let max_message_size = req.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        if !(1..=DEFAULT_MAX_MESSAGE_SIZE).contains(&max_message_size) {
            return Err(CoreError::InvalidInput(format!(
                "max message size must be 1-{DEFAULT_MAX_MESSAGE_SIZE} bytes"
            )));
        }

        let queue = Queue {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            name: name.to_string(),
            visibility_timeout_secs,
            retention_days,
            max_message_size,
            created_at: self.clock.now(),
        };
        if !self.queues.create_queue(&queue).await? {
            return Err(CoreError::Conflict(format!("queue `{name}` already exists")));
        }
        info!(queue_id = %queue.id, name = %queue.name, "queue created");
        self.recorder
            .audit(
                ctx,
                AuditAction::QueueCreate {
                    queue_id: queue.id,
                    name: queue.name.clone(),
                },
            )
            .await;
        Ok(queue)
    }

    pub async fn get_queue(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Queue> {
        self.owned(ctx, id).await
    }

    pub async fn list_queues(&self, ctx: &RequestContext) -> CoreResult<Vec<Queue>> {
        Ok(self.queues.list_queues(ctx.user_id()?).await?)
    }

    pub async fn delete_queue(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<()> {
        self.owned(ctx, id).await?;
        self.queues.delete_queue(id).await?;
        info!(queue_id = %id, "queue deleted");
        self.recorder.audit(ctx, AuditAction::QueueDelete { queue_id: id }).await;
        Ok(())
    }

    pub async fn send_message(&self, ctx: &RequestContext, queue_id: Uuid, body: String) -> CoreResult<QueueMessage> {
        let queue = self.owned(ctx, queue_id).await?;
        if body.len() > queue.max_message_size {
            return Err(CoreError::InvalidInput(format!(
                "message is {} bytes, queue limit is {}",
                body.len(),
                queue.max_message_size
            )));
        }
        let now = self.clock.now();
        let message = QueueMessage {
            id: Uuid::new_v4(),
            queue_id,
            body,
            receipt_handle: None,
            visible_at: now,
            receive_count: 0,
            created_at: now,
        };
        self.queues.put_message(&message).await?;
        debug!(%queue_id, message_id = %message.id, "message enqueued");
        Ok(message)
    }

    /// Lease up to `max` messages; `max` is clamped to `1..=10`.
    pub async fn receive_messages(&self, ctx: &RequestContext, queue_id: Uuid, max: usize) -> CoreResult<Vec<QueueMessage>> {
        let queue = self.owned(ctx, queue_id).await?;
        let max = max.clamp(1, MAX_RECEIVE_BATCH);
        Ok(self.queues.receive_messages(&queue, max, self.clock.now()).await?)
    }

    pub async fn delete_message(&self, ctx: &RequestContext, queue_id: Uuid, receipt_handle: &str) -> CoreResult<()> {
        self.owned(ctx, queue_id).await?;
        if !self.queues.delete_message(queue_id, receipt_handle).await? {
            return Err(CoreError::not_found("receipt handle"));
        }
        Ok(())
    }

    pub async fn purge_queue(&self, ctx: &RequestContext, queue_id: Uuid) -> CoreResult<u32> {
        self.owned(ctx, queue_id).await?;
        let purged = self.queues.purge_queue(queue_id).await?;
        info!(%queue_id, purged, "queue purged");
        self.recorder
            .audit(ctx, AuditAction::QueuePurge { queue_id, purged })
            .await;
        Ok(purged)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use nimbus_core::ManualClock;
    use nimbus_state::StateStore;

    pub(crate) fn service(store: &Arc<StateStore>, clock: &Arc<ManualClock>) -> QueueService {
        QueueService::new(
            store.clone(),
            Recorder::new(store.clone(), store.clone(), clock.clone()),
            clock.clone(),
        )
    }

    pub(crate) fn named(name: &str) -> CreateQueueRequest {
        CreateQueueRequest {
            name: name.into(),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<ManualClock>, QueueService, RequestContext) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()));
        let service = service(&store, &clock);
        (clock, service, RequestContext::new(Uuid::new_v4(), Uuid::new_v4()))
    }

    #[tokio::test]
    async fn defaults_and_duplicate_names() {
        let (_clock, service, ctx) = setup();
        let q = service.create_queue(&ctx, named("jobs")).await.unwrap();
        assert_eq!(q.visibility_timeout_secs, DEFAULT_VISIBILITY_TIMEOUT_SECS);
        assert_eq!(q.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(matches!(
            service.create_queue(&ctx, named("jobs")).await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_messages() {
        let (_clock, service, ctx) = setup();
        let q = service
            .create_queue(
                &ctx,
                CreateQueueRequest {
                    name: "small".into(),
                    max_message_size: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        service.send_message(&ctx, q.id, "abcd".into()).await.unwrap();
        assert!(matches!(
            service.send_message(&ctx, q.id, "abcde".into()).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn lease_hides_until_timeout_and_delete_removes() {
        let (clock, service, ctx) = setup();
        let q = service.create_queue(&ctx, named("jobs")).await.unwrap();
        service.send_message(&ctx, q.id, "one".into()).await.unwrap();

        let leased = service.receive_messages(&ctx, q.id, 0).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert!(service.receive_messages(&ctx, q.id, 10).await.unwrap().is_empty());

        clock.advance(Duration::seconds(31));
        let again = service.receive_messages(&ctx, q.id, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);

        // The first receipt is stale after re-delivery.
        let stale = leased[0].receipt_handle.clone().unwrap();
        assert!(matches!(
            service.delete_message(&ctx, q.id, &stale).await,
            Err(CoreError::NotFound(_))
        ));
        let fresh = again[0].receipt_handle.clone().unwrap();
        service.delete_message(&ctx, q.id, &fresh).await.unwrap();
        clock.advance(Duration::seconds(31));
        assert!(service.receive_messages(&ctx, q.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_is_clamped_to_ten() {
        let (_clock, service, ctx) = setup();
        let q = service.create_queue(&ctx, named("bulk")).await.unwrap();
        for i in 0..12 {
            service.send_message(&ctx, q.id, format!("m{i}")).await.unwrap();
        }
        assert_eq!(service.receive_messages(&ctx, q.id, 50).await.unwrap().len(), MAX_RECEIVE_BATCH);
        assert_eq!(service.purge_queue(&ctx, q.id).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn queues_are_owner_scoped() {
        let (_clock, service, ctx) = setup();
        let q = service.create_queue(&ctx, named("private")).await.unwrap();
        let other = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(
            service.send_message(&other, q.id, "x".into()).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(service.list_queues(&other).await.unwrap().is_empty());
    }
}
