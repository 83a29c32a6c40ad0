//! Cron, messaging, pipelines, gateway routes, side channels and the
//! durable task queue.

use async_trait::async_trait;
use chrono::Duration;
use redb::ReadableTable;
use uuid::Uuid;

use super::{StateStore, keys_with_prefix, millis, open, read_one, read_prefix, remove_prefix_in, write_one};
use crate::error::StateResult;
use crate::repo::*;
use crate::tables::*;
use crate::types::*;

fn owner_name_key(user_id: UserId, name: &str) -> String {
    format!("{user_id}/{name}")
}

// ── Cron ───────────────────────────────────────────────────────────

#[async_trait]
impl CronRepository for StateStore {
    async fn create_cron_job(&self, job: &CronJob) -> StateResult<()> {
        self.put(CRON_JOBS, &job.id.to_string(), job)
    }

    async fn get_cron_job(&self, id: Uuid) -> StateResult<Option<CronJob>> {
        self.get(CRON_JOBS, &id.to_string())
    }

    async fn list_cron_jobs(&self, user_id: UserId) -> StateResult<Vec<CronJob>> {
        let all: Vec<CronJob> = self.scan(CRON_JOBS, "")?;
        Ok(all.into_iter().filter(|j| j.user_id == user_id).collect())
    }

    async fn modify_cron_job(&self, id: Uuid, edit: Edit<'_, CronJob>) -> StateResult<Option<CronJob>> {
        self.update_if(CRON_JOBS, &id.to_string(), edit)
    }

    async fn delete_cron_job(&self, id: Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let existed = open(txn, CRON_JOBS)?
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            remove_prefix_in(&mut open(txn, CRON_RUNS)?, &prefix)?;
            Ok(existed)
        })
    }

    async fn get_due_cron_jobs(&self, now: Timestamp) -> StateResult<Vec<CronJob>> {
        let all: Vec<CronJob> = self.scan(CRON_JOBS, "")?;
        Ok(all
            .into_iter()
            .filter(|j| j.status == CronStatus::Active && j.next_run_at.is_some_and(|next| next <= now))
            .collect())
    }

    async fn save_cron_run(&self, run: &CronJobRun) -> StateResult<()> {
        self.put(CRON_RUNS, &format!("{}:{}", run.job_id, run.id), run)
    }

    async fn list_cron_runs(&self, job_id: Uuid) -> StateResult<Vec<CronJobRun>> {
        let mut runs: Vec<CronJobRun> = self.scan(CRON_RUNS, &format!("{job_id}:"))?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

// ── Queues ─────────────────────────────────────────────────────────

#[async_trait]
impl QueueRepository for StateStore {
    async fn create_queue(&self, queue: &Queue) -> StateResult<bool> {
        self.insert_indexed(
            QUEUE_NAMES,
            &owner_name_key(queue.user_id, &queue.name),
            QUEUES,
            &queue.id.to_string(),
            queue,
        )
    }

    async fn get_queue(&self, id: Uuid) -> StateResult<Option<Queue>> {
        self.get(QUEUES, &id.to_string())
    }

    async fn list_queues(&self, user_id: UserId) -> StateResult<Vec<Queue>> {
        let all: Vec<Queue> = self.scan(QUEUES, "")?;
        Ok(all.into_iter().filter(|q| q.user_id == user_id).collect())
    }

    async fn delete_queue(&self, id: Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let mut queues = open(txn, QUEUES)?;
            let Some(queue) = read_one::<Queue, _>(&queues, &key)? else {
                return Ok(false);
            };
            queues.remove(key.as_str()).map_err(map_err!(Write))?;
            open(txn, QUEUE_NAMES)?
                .remove(owner_name_key(queue.user_id, &queue.name).as_str())
                .map_err(map_err!(Write))?;
            remove_prefix_in(&mut open(txn, QUEUE_MESSAGES)?, &prefix)?;
            Ok(true)
        })
    }

    async fn put_message(&self, message: &QueueMessage) -> StateResult<()> {
        let key = format!(
            "{}:{:020}:{}",
            message.queue_id,
            millis(&message.created_at),
            message.id
        );
        self.put(QUEUE_MESSAGES, &key, message)
    }

    async fn receive_messages(&self, queue: &Queue, max: usize, now: Timestamp) -> StateResult<Vec<QueueMessage>> {
        let retention_cutoff = now - Duration::days(i64::from(queue.retention_days));
        let visibility = Duration::seconds(queue.visibility_timeout_secs as i64);
        self.write(|txn| {
            let mut table = open(txn, QUEUE_MESSAGES)?;
            let rows: Vec<(String, QueueMessage)> = read_prefix(&table, &format!("{}:", queue.id))?;
            let mut leased = Vec::new();
            for (key, mut message) in rows {
                if message.created_at < retention_cutoff {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    continue;
                }
                if leased.len() >= max || message.visible_at > now {
                    continue;
                }
                message.receipt_handle = Some(Uuid::new_v4().simple().to_string());
                message.visible_at = now + visibility;
                message.receive_count += 1;
                write_one(&mut table, &key, &message)?;
                leased.push(message);
            }
            Ok(leased)
        })
    }

    async fn delete_message(&self, queue_id: Uuid, receipt_handle: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = open(txn, QUEUE_MESSAGES)?;
            let rows: Vec<(String, QueueMessage)> = read_prefix(&table, &format!("{queue_id}:"))?;
            let Some((key, _)) = rows
                .into_iter()
                .find(|(_, m)| m.receipt_handle.as_deref() == Some(receipt_handle))
            else {
                return Ok(false);
            };
            table.remove(key.as_str()).map_err(map_err!(Write))?;
            Ok(true)
        })
    }

    async fn purge_queue(&self, queue_id: Uuid) -> StateResult<u32> {
        self.remove_prefix(QUEUE_MESSAGES, &format!("{queue_id}:"))
    }
}

// ── Topics ─────────────────────────────────────────────────────────

#[async_trait]
impl TopicRepository for StateStore {
    async fn create_topic(&self, topic: &Topic) -> StateResult<bool> {
        self.insert_indexed(
            TOPIC_NAMES,
            &owner_name_key(topic.user_id, &topic.name),
            TOPICS,
            &topic.id.to_string(),
            topic,
        )
    }

    async fn get_topic(&self, id: Uuid) -> StateResult<Option<Topic>> {
        self.get(TOPICS, &id.to_string())
    }

    async fn list_topics(&self, user_id: UserId) -> StateResult<Vec<Topic>> {
        let all: Vec<Topic> = self.scan(TOPICS, "")?;
        Ok(all.into_iter().filter(|t| t.user_id == user_id).collect())
    }

    async fn delete_topic(&self, id: Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let mut topics = open(txn, TOPICS)?;
            let Some(topic) = read_one::<Topic, _>(&topics, &key)? else {
                return Ok(false);
            };
            topics.remove(key.as_str()).map_err(map_err!(Write))?;
            open(txn, TOPIC_NAMES)?
                .remove(owner_name_key(topic.user_id, &topic.name).as_str())
                .map_err(map_err!(Write))?;
            remove_prefix_in(&mut open(txn, SUBSCRIPTIONS)?, &prefix)?;
            Ok(true)
        })
    }

    async fn create_subscription(&self, subscription: &Subscription) -> StateResult<()> {
        self.put(
            SUBSCRIPTIONS,
            &format!("{}:{}", subscription.topic_id, subscription.id),
            subscription,
        )
    }

    async fn list_subscriptions(&self, topic_id: Uuid) -> StateResult<Vec<Subscription>> {
        self.scan(SUBSCRIPTIONS, &format!("{topic_id}:"))
    }

    async fn delete_subscription(&self, topic_id: Uuid, id: Uuid) -> StateResult<bool> {
        self.remove(SUBSCRIPTIONS, &format!("{topic_id}:{id}"))
    }

    async fn save_notify_message(&self, message: &NotifyMessage) -> StateResult<()> {
        self.put(NOTIFY_MESSAGES, &format!("{}:{}", message.topic_id, message.id), message)
    }
}

// ── Pipelines ──────────────────────────────────────────────────────

#[async_trait]
impl PipelineRepository for StateStore {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> StateResult<()> {
        self.put(PIPELINES, &pipeline.id.to_string(), pipeline)
    }

    async fn get_pipeline(&self, id: PipelineId) -> StateResult<Option<Pipeline>> {
        self.get(PIPELINES, &id.to_string())
    }

    async fn list_pipelines(&self, user_id: UserId) -> StateResult<Vec<Pipeline>> {
        let all: Vec<Pipeline> = self.scan(PIPELINES, "")?;
        Ok(all.into_iter().filter(|p| p.user_id == user_id).collect())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> StateResult<()> {
        self.put(PIPELINES, &pipeline.id.to_string(), pipeline)
    }

    async fn delete_pipeline(&self, id: PipelineId) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let existed = open(txn, PIPELINES)?
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            remove_prefix_in(&mut open(txn, BUILDS)?, &prefix)?;
            remove_prefix_in(&mut open(txn, WEBHOOK_DELIVERIES)?, &prefix)?;
            Ok(existed)
        })
    }

    async fn create_build(&self, build: &Build) -> StateResult<()> {
        self.put(BUILDS, &format!("{}:{}", build.pipeline_id, build.id), build)
    }

    async fn get_build(&self, pipeline_id: PipelineId, id: BuildId) -> StateResult<Option<Build>> {
        self.get(BUILDS, &format!("{pipeline_id}:{id}"))
    }

    async fn update_build(&self, build: &Build) -> StateResult<()> {
        self.put(BUILDS, &format!("{}:{}", build.pipeline_id, build.id), build)
    }

    async fn list_builds(&self, pipeline_id: PipelineId) -> StateResult<Vec<Build>> {
        let mut builds: Vec<Build> = self.scan(BUILDS, &format!("{pipeline_id}:"))?;
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(builds)
    }

    async fn reserve_webhook_delivery(&self, delivery: &WebhookDelivery) -> StateResult<bool> {
        self.insert_new(WEBHOOK_DELIVERIES, &delivery_key(delivery), delivery)
    }

    async fn release_webhook_delivery(&self, delivery: &WebhookDelivery) -> StateResult<bool> {
        self.remove(WEBHOOK_DELIVERIES, &delivery_key(delivery))
    }
}

fn delivery_key(delivery: &WebhookDelivery) -> String {
    format!(
        "{}:{}:{}:{}",
        delivery.pipeline_id, delivery.provider, delivery.event, delivery.delivery_id
    )
}

// ── Gateway routes ─────────────────────────────────────────────────

#[async_trait]
impl GatewayRepository for StateStore {
    async fn create_route(&self, route: &GatewayRoute) -> StateResult<()> {
        self.put(GATEWAY_ROUTES, &route.id.to_string(), route)
    }

    async fn get_route(&self, id: Uuid) -> StateResult<Option<GatewayRoute>> {
        self.get(GATEWAY_ROUTES, &id.to_string())
    }

    async fn delete_route(&self, id: Uuid) -> StateResult<bool> {
        self.remove(GATEWAY_ROUTES, &id.to_string())
    }

    async fn list_routes(&self) -> StateResult<Vec<GatewayRoute>> {
        let mut routes: Vec<GatewayRoute> = self.scan(GATEWAY_ROUTES, "")?;
        routes.sort_by_key(|r| r.created_at);
        Ok(routes)
    }
}

// ── Audit and events ───────────────────────────────────────────────

#[async_trait]
impl AuditRepository for StateStore {
    async fn append_audit_log(&self, entry: &AuditLog) -> StateResult<()> {
        let key = format!("{:020}:{}", millis(&entry.created_at), entry.id);
        self.put(AUDIT_LOGS, &key, entry)
    }

    async fn list_audit_logs(&self, user_id: Option<UserId>, limit: usize) -> StateResult<Vec<AuditLog>> {
        let all: Vec<AuditLog> = self.scan(AUDIT_LOGS, "")?;
        Ok(all
            .into_iter()
            .rev()
            .filter(|entry| user_id.is_none() || entry.user_id == user_id)
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl EventRepository for StateStore {
    async fn append_event(&self, event: &Event) -> StateResult<()> {
        let key = format!("{:020}:{}", millis(&event.created_at), event.id);
        self.put(EVENTS, &key, event)
    }

    async fn list_events(&self, limit: usize) -> StateResult<Vec<Event>> {
        let all: Vec<Event> = self.scan(EVENTS, "")?;
        Ok(all.into_iter().rev().take(limit).collect())
    }
}

// ── Data keys ──────────────────────────────────────────────────────

#[async_trait]
impl DataKeyRepository for StateStore {
    async fn put_data_key(&self, key: &SealedDataKey) -> StateResult<()> {
        self.put(DATA_KEYS, &key.bucket, key)
    }

    async fn get_data_key(&self, bucket: &str) -> StateResult<Option<SealedDataKey>> {
        self.get(DATA_KEYS, bucket)
    }
}

// ── Durable tasks ──────────────────────────────────────────────────

/// Task rows hold the raw payload bytes rather than JSON.
#[async_trait]
impl TaskRepository for StateStore {
    async fn push_task(&self, queue: &str, payload: &[u8]) -> StateResult<()> {
        let prefix = format!("{queue}:");
        self.write(|txn| {
            let mut table = open(txn, TASKS)?;
            let next = keys_with_prefix(&table, &prefix)?
                .last()
                .and_then(|key| key[prefix.len()..].parse::<u64>().ok())
                .map_or(0, |seq| seq + 1);
            table
                .insert(format!("{prefix}{next:020}").as_str(), payload)
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    async fn pop_task(&self, queue: &str) -> StateResult<Option<Vec<u8>>> {
        let prefix = format!("{queue}:");
        self.write(|txn| {
            let mut table = open(txn, TASKS)?;
            let Some(key) = keys_with_prefix(&table, &prefix)?.into_iter().next() else {
                return Ok(None);
            };
            let payload = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            table.remove(key.as_str()).map_err(map_err!(Write))?;
            Ok(payload)
        })
    }
}
