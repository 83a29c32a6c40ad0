//! Topics, subscriptions and fan-out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, HttpClient, HttpRequest, Recorder, RequestContext};
use nimbus_state::{NotifyMessage, Subscription, SubscriptionProtocol, Topic, TopicRepository};

use crate::queue::QueueService;

/// Timeout for one webhook delivery.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A published message and its in-flight deliveries.
///
/// Dropping it detaches the deliveries; they still run to completion.
pub struct Publication {
    pub message: NotifyMessage,
    deliveries: Vec<JoinHandle<bool>>,
}

impl Publication {
    /// Wait for every delivery and return how many succeeded.
    pub async fn delivered(self) -> usize {
        let mut ok = 0;
        for handle in self.deliveries {
            if matches!(handle.await, Ok(true)) {
                ok += 1;
            }
        }
        ok
    }
}

pub struct TopicService {
    topics: Arc<dyn TopicRepository>,
    queues: Arc<QueueService>,
    http: Arc<dyn HttpClient>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl TopicService {
    pub fn new(
        topics: Arc<dyn TopicRepository>,
        queues: Arc<QueueService>,
        http: Arc<dyn HttpClient>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topics,
            queues,
            http,
            recorder,
            clock,
        }
    }

    async fn owned(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Topic> {
        let user_id = ctx.user_id()?;
        self.topics
            .get_topic(id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("topic {id}")))
    }

    pub async fn create_topic(&self, ctx: &RequestContext, name: &str) -> CoreResult<Topic> {
        let name = name.trim();
        if name.is_empty() || name.len() > 80 {
            return Err(CoreError::InvalidInput("topic name must be 1-80 characters".into()));
        }
        let topic = Topic {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        if !self.topics.create_topic(&topic).await? {
            return Err(CoreError::Conflict(format!("topic `{name}` already exists")));
        }
        info!(topic_id = %topic.id, name = %topic.name, "topic created");
        self.recorder
            .audit(
                ctx,
                AuditAction::TopicCreate {
                    topic_id: topic.id,
                    name: topic.name.clone(),
                },
            )
            .await;
        Ok(topic)
    }

    pub async fn get_topic(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Topic> {
        self.owned(ctx, id).await
    }

    pub async fn list_topics(&self, ctx: &RequestContext) -> CoreResult<Vec<Topic>> {
        Ok(self.topics.list_topics(ctx.user_id()?).await?)
    }

    pub async fn delete_topic(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<()> {
        self.owned(ctx, id).await?;
        self.topics.delete_topic(id).await?;
        info!(topic_id = %id, "topic deleted");
        self.recorder.audit(ctx, AuditAction::TopicDelete { topic_id: id }).await;
        Ok(())
    }

    /// Subscribe an endpoint. Queue endpoints are queue ids owned by the
    /// caller; webhook endpoints are http(s) URLs.
    pub async fn subscribe(
        &self,
        ctx: &RequestContext,
        topic_id: Uuid,
        protocol: SubscriptionProtocol,
        endpoint: &str,
    ) -> CoreResult<Subscription> {
        let topic = self.owned(ctx, topic_id).await?;
        let endpoint = endpoint.trim();
        match protocol {
            SubscriptionProtocol::Queue => {
                let queue_id: Uuid = endpoint
                    .parse()
                    .map_err(|_| CoreError::InvalidInput(format!("`{endpoint}` is not a queue id")))?;
                self.queues.get_queue(ctx, queue_id).await?;
            }
            SubscriptionProtocol::Webhook => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(CoreError::InvalidInput(format!("webhook endpoint `{endpoint}` must be http(s)")));
                }
            }
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            topic_id: topic.id,
            user_id: topic.user_id,
            protocol,
            endpoint: endpoint.to_string(),
            created_at: self.clock.now(),
        };
        self.topics.create_subscription(&subscription).await?;
        let protocol_name = match protocol {
            SubscriptionProtocol::Queue => "queue",
            SubscriptionProtocol::Webhook => "webhook",
        };
        info!(%topic_id, subscription_id = %subscription.id, protocol = protocol_name, "subscription created");
        self.recorder
            .audit(
                ctx,
                AuditAction::Subscribe {
                    subscription_id: subscription.id,
                    topic_id,
                    protocol: protocol_name.to_string(),
                },
            )
            .await;
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, ctx: &RequestContext, topic_id: Uuid, subscription_id: Uuid) -> CoreResult<()> {
        self.owned(ctx, topic_id).await?;
        if !self.topics.delete_subscription(topic_id, subscription_id).await? {
            return Err(CoreError::not_found(format!("subscription {subscription_id}")));
        }
        self.recorder
            .audit(ctx, AuditAction::Unsubscribe { subscription_id, topic_id })
            .await;
        Ok(())
    }

    pub async fn list_subscriptions(&self, ctx: &RequestContext, topic_id: Uuid) -> CoreResult<Vec<Subscription>> {
        self.owned(ctx, topic_id).await?;
        Ok(self.topics.list_subscriptions(topic_id).await?)
    }

    /// Persist the message and fan it out to every subscription in the
    /// background.
    pub async fn publish(&self, ctx: &RequestContext, topic_id: Uuid, body: String) -> CoreResult<Publication> {
        let topic = self.owned(ctx, topic_id).await?;
        let message = NotifyMessage {
            id: Uuid::new_v4(),
            topic_id,
            body,
            created_at: self.clock.now(),
        };
        self.topics.save_notify_message(&message).await?;

        let subscriptions = self.topics.list_subscriptions(topic_id).await?;
        debug!(%topic_id, message_id = %message.id, subscribers = subscriptions.len(), "publishing");
        let owner = RequestContext::for_user(topic.user_id);
        let deliveries = subscriptions
            .into_iter()
            .map(|sub| {
                let queues = self.queues.clone();
                let http = self.http.clone();
                let message = message.clone();
                tokio::spawn(async move { deliver(&owner, &queues, http.as_ref(), &sub, &message).await })
            })
            .collect();

        Ok(Publication { message, deliveries })
    }
}

async fn deliver(
    owner: &RequestContext,
    queues: &QueueService,
    http: &dyn HttpClient,
    sub: &Subscription,
    message: &NotifyMessage,
) -> bool {
    let result = match sub.protocol {
        SubscriptionProtocol::Queue => match sub.endpoint.parse::<Uuid>() {
            Ok(queue_id) => queues
                .send_message(owner, queue_id, message.body.clone())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        },
        SubscriptionProtocol::Webhook => {
            let body = json!({
                "topic_id": message.topic_id,
                "message_id": message.id,
                "body": message.body,
                "published_at": message.created_at,
            })
            .to_string();
            match http
                .send(HttpRequest::post_json(sub.endpoint.clone(), body, WEBHOOK_TIMEOUT))
                .await
            {
                Ok(resp) if resp.status < 300 => Ok(()),
                Ok(resp) => Err(format!("endpoint returned {}", resp.status)),
                Err(e) => Err(e.to_string()),
            }
        }
    };
    match result {
        Ok(()) => {
            debug!(subscription_id = %sub.id, message_id = %message.id, "delivered");
            true
        }
        Err(e) => {
            warn!(subscription_id = %sub.id, message_id = %message.id, error = %e, "delivery dropped");
            false
        }
    }
}
