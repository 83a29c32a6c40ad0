//! Repository ports.
//!
//! Services depend on the narrowest trait they need rather than on the
//! concrete store. Every method is async so that a networked store can be
//! dropped in without touching callers. `StateStore` implements all of
//! them.
//!
//! Methods that enforce a uniqueness constraint return `Ok(false)` on
//! collision rather than an error; the service layer turns that into the
//! appropriate user-facing kind.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StateResult;
use crate::types::*;

/// In-place edit applied to the stored row inside one write transaction.
/// Returns whether the edited row should be written back.
pub type Edit<'a, T> = &'a (dyn Fn(&mut T) -> bool + Send + Sync);

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user. `false` if the email is already registered.
    async fn create_user(&self, user: &User) -> StateResult<bool>;
    async fn get_user(&self, id: UserId) -> StateResult<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> StateResult<Option<User>>;
    async fn update_user(&self, user: &User) -> StateResult<()>;
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Insert a tenant. `false` if the slug is taken.
    async fn create_tenant(&self, tenant: &Tenant) -> StateResult<bool>;
    async fn get_tenant(&self, id: TenantId) -> StateResult<Option<Tenant>>;
    /// Atomically add `delta` to the tenant's usage if every counter stays
    /// within its limit. `false` (and no change) otherwise.
    async fn reserve_usage(&self, id: TenantId, delta: ResourceCounts) -> StateResult<bool>;
    /// Atomically subtract `delta` from usage, saturating at zero.
    async fn release_usage(&self, id: TenantId, delta: ResourceCounts) -> StateResult<()>;
    /// Remove the tenant and free its slug.
    async fn delete_tenant(&self, id: TenantId) -> StateResult<bool>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Insert a key. `false` if the opaque key already exists.
    async fn create_api_key(&self, key: &ApiKey) -> StateResult<bool>;
    async fn get_api_key(&self, key: &str) -> StateResult<Option<ApiKey>>;
    async fn delete_api_key(&self, key: &str) -> StateResult<bool>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// Insert a role. `false` if the name is taken.
    async fn create_role(&self, role: &Role) -> StateResult<bool>;
    async fn get_role(&self, id: Uuid) -> StateResult<Option<Role>>;
    async fn get_role_by_name(&self, name: &str) -> StateResult<Option<Role>>;
    async fn list_roles(&self) -> StateResult<Vec<Role>>;
    async fn update_role(&self, role: &Role) -> StateResult<()>;
    async fn delete_role(&self, id: Uuid) -> StateResult<bool>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn create_policy(&self, policy: &Policy) -> StateResult<()>;
    async fn get_policy(&self, id: PolicyId) -> StateResult<Option<Policy>>;
    async fn list_policies(&self, tenant_id: TenantId) -> StateResult<Vec<Policy>>;
    /// Delete a policy and every attachment referencing it.
    async fn delete_policy(&self, id: PolicyId) -> StateResult<bool>;
    async fn attach_policy(&self, tenant_id: TenantId, user_id: UserId, policy_id: PolicyId) -> StateResult<()>;
    async fn detach_policy(&self, tenant_id: TenantId, user_id: UserId, policy_id: PolicyId) -> StateResult<bool>;
    async fn list_attached_policies(&self, tenant_id: TenantId, user_id: UserId) -> StateResult<Vec<Policy>>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn put_instance_type(&self, instance_type: &InstanceType) -> StateResult<()>;
    async fn get_instance_type(&self, id: &str) -> StateResult<Option<InstanceType>>;
    async fn list_instance_types(&self) -> StateResult<Vec<InstanceType>>;
    async fn create_instance(&self, instance: &Instance) -> StateResult<()>;
    async fn get_instance(&self, id: InstanceId) -> StateResult<Option<Instance>>;
    /// Conditional read-modify-write. Returns the row as stored afterwards,
    /// `None` if it no longer exists.
    async fn modify_instance(&self, id: InstanceId, edit: Edit<'_, Instance>) -> StateResult<Option<Instance>>;
    /// Remove the row and return it as it was stored at removal.
    async fn delete_instance(&self, id: InstanceId) -> StateResult<Option<Instance>>;
    async fn list_instances(&self, user_id: UserId) -> StateResult<Vec<Instance>>;
}

#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn create_volume(&self, volume: &Volume) -> StateResult<()>;
    async fn get_volume(&self, id: Uuid) -> StateResult<Option<Volume>>;
    async fn update_volume(&self, volume: &Volume) -> StateResult<()>;
    async fn list_volumes_for_instance(&self, instance_id: InstanceId) -> StateResult<Vec<Volume>>;
}

#[async_trait]
pub trait MetricRepository: Send + Sync {
    async fn record_cpu_sample(&self, sample: &CpuSample) -> StateResult<()>;
    /// Mean CPU across all samples of `instance_ids` recorded at or after
    /// `since`. `None` when there are no samples.
    async fn get_average_cpu(&self, instance_ids: &[InstanceId], since: Timestamp) -> StateResult<Option<f64>>;
}

#[async_trait]
pub trait ScalingRepository: Send + Sync {
    /// Insert a group. `false` if its idempotency key is already used by
    /// the same user.
    async fn create_group(&self, group: &ScalingGroup) -> StateResult<bool>;
    async fn get_group(&self, id: GroupId) -> StateResult<Option<ScalingGroup>>;
    async fn get_group_by_idempotency_key(&self, user_id: UserId, key: &str) -> StateResult<Option<ScalingGroup>>;
    async fn list_groups(&self) -> StateResult<Vec<ScalingGroup>>;
    async fn list_groups_for_user(&self, user_id: UserId) -> StateResult<Vec<ScalingGroup>>;
    async fn update_group(&self, group: &ScalingGroup) -> StateResult<()>;
    /// Conditional read-modify-write of the stored group. `None` if it is
    /// gone.
    async fn modify_group(&self, id: GroupId, edit: Edit<'_, ScalingGroup>) -> StateResult<Option<ScalingGroup>>;
    /// Hard-delete a group with its policies, memberships and idempotency
    /// index entry.
    async fn delete_group(&self, id: GroupId) -> StateResult<bool>;
    async fn count_groups_by_vpc(&self, vpc_id: VpcId) -> StateResult<u32>;
    async fn add_group_instance(&self, group_id: GroupId, instance_id: InstanceId) -> StateResult<()>;
    async fn remove_group_instance(&self, group_id: GroupId, instance_id: InstanceId) -> StateResult<bool>;
    /// Members in join order.
    async fn get_group_instances(&self, group_id: GroupId) -> StateResult<Vec<InstanceId>>;
    /// Batched membership lookup for the reconciler hot path.
    async fn get_all_group_instances(&self, group_ids: &[GroupId]) -> StateResult<HashMap<GroupId, Vec<InstanceId>>>;
    async fn create_scaling_policy(&self, policy: &ScalingPolicy) -> StateResult<()>;
    async fn get_scaling_policies(&self, group_id: GroupId) -> StateResult<Vec<ScalingPolicy>>;
    async fn get_all_scaling_policies(&self, group_ids: &[GroupId]) -> StateResult<HashMap<GroupId, Vec<ScalingPolicy>>>;
    async fn update_scaling_policy(&self, policy: &ScalingPolicy) -> StateResult<()>;
    async fn delete_scaling_policy(&self, group_id: GroupId, policy_id: PolicyId) -> StateResult<bool>;
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn create_deployment(&self, deployment: &Deployment) -> StateResult<()>;
    async fn get_deployment(&self, id: DeploymentId) -> StateResult<Option<Deployment>>;
    async fn list_deployments(&self) -> StateResult<Vec<Deployment>>;
    async fn list_deployments_for_user(&self, user_id: UserId) -> StateResult<Vec<Deployment>>;
    async fn modify_deployment(
        &self,
        id: DeploymentId,
        edit: Edit<'_, Deployment>,
    ) -> StateResult<Option<Deployment>>;
    async fn delete_deployment(&self, id: DeploymentId) -> StateResult<bool>;
    async fn add_deployment_container(&self, id: DeploymentId, instance_id: InstanceId) -> StateResult<()>;
    async fn remove_deployment_container(&self, id: DeploymentId, instance_id: InstanceId) -> StateResult<bool>;
    /// Containers in join order.
    async fn get_deployment_containers(&self, id: DeploymentId) -> StateResult<Vec<InstanceId>>;
}

#[async_trait]
pub trait LoadBalancerRepository: Send + Sync {
    async fn create_lb(&self, lb: &LoadBalancer) -> StateResult<()>;
    async fn get_lb(&self, id: LoadBalancerId) -> StateResult<Option<LoadBalancer>>;
    async fn list_lbs(&self, user_id: UserId) -> StateResult<Vec<LoadBalancer>>;
    async fn list_lbs_by_status(&self, status: LbStatus) -> StateResult<Vec<LoadBalancer>>;
    async fn modify_lb(&self, id: LoadBalancerId, edit: Edit<'_, LoadBalancer>) -> StateResult<Option<LoadBalancer>>;
    /// Hard-delete a load balancer and its targets.
    async fn delete_lb(&self, id: LoadBalancerId) -> StateResult<bool>;
    /// Insert a target. `false` if `(lb_id, instance_id)` already exists.
    async fn add_lb_target(&self, target: &LbTarget) -> StateResult<bool>;
    async fn remove_lb_target(&self, lb_id: LoadBalancerId, instance_id: InstanceId) -> StateResult<bool>;
    async fn list_lb_targets(&self, lb_id: LoadBalancerId) -> StateResult<Vec<LbTarget>>;
    /// Edit a target only while it is still registered.
    async fn modify_lb_target(
        &self,
        lb_id: LoadBalancerId,
        instance_id: InstanceId,
        edit: Edit<'_, LbTarget>,
    ) -> StateResult<Option<LbTarget>>;
}

#[async_trait]
pub trait DnsRepository: Send + Sync {
    /// Insert a zone. `false` if the VPC already has a zone of that name.
    async fn create_zone(&self, zone: &DnsZone) -> StateResult<bool>;
    async fn get_zone(&self, id: ZoneId) -> StateResult<Option<DnsZone>>;
    async fn get_zone_by_vpc(&self, vpc_id: VpcId) -> StateResult<Option<DnsZone>>;
    async fn list_zones(&self, user_id: UserId) -> StateResult<Vec<DnsZone>>;
    /// Delete a zone and all of its records.
    async fn delete_zone(&self, id: ZoneId) -> StateResult<bool>;
    /// Insert a record. `false` if a single-valued record with the same
    /// `(zone, name, type)` exists.
    async fn create_record(&self, record: &DnsRecord) -> StateResult<bool>;
    async fn get_record(&self, zone_id: ZoneId, id: Uuid) -> StateResult<Option<DnsRecord>>;
    async fn delete_record(&self, zone_id: ZoneId, id: Uuid) -> StateResult<bool>;
    async fn list_records(&self, zone_id: ZoneId) -> StateResult<Vec<DnsRecord>>;
    async fn list_records_for_instance(&self, instance_id: InstanceId) -> StateResult<Vec<DnsRecord>>;
}

#[async_trait]
pub trait CronRepository: Send + Sync {
    async fn create_cron_job(&self, job: &CronJob) -> StateResult<()>;
    async fn get_cron_job(&self, id: Uuid) -> StateResult<Option<CronJob>>;
    async fn list_cron_jobs(&self, user_id: UserId) -> StateResult<Vec<CronJob>>;
    async fn modify_cron_job(&self, id: Uuid, edit: Edit<'_, CronJob>) -> StateResult<Option<CronJob>>;
    async fn delete_cron_job(&self, id: Uuid) -> StateResult<bool>;
    /// Active jobs with `next_run_at <= now`.
    async fn get_due_cron_jobs(&self, now: Timestamp) -> StateResult<Vec<CronJob>>;
    async fn save_cron_run(&self, run: &CronJobRun) -> StateResult<()>;
    async fn list_cron_runs(&self, job_id: Uuid) -> StateResult<Vec<CronJobRun>>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Insert a queue. `false` if the owner already has a queue of that name.
    async fn create_queue(&self, queue: &Queue) -> StateResult<bool>;
    async fn get_queue(&self, id: Uuid) -> StateResult<Option<Queue>>;
    async fn list_queues(&self, user_id: UserId) -> StateResult<Vec<Queue>>;
    async fn delete_queue(&self, id: Uuid) -> StateResult<bool>;
    async fn put_message(&self, message: &QueueMessage) -> StateResult<()>;
    /// Lease up to `max` visible messages: each gets a fresh receipt handle
    /// and becomes invisible until `now + visibility_timeout`. Messages
    /// older than the queue's retention are dropped.
    async fn receive_messages(&self, queue: &Queue, max: usize, now: Timestamp) -> StateResult<Vec<QueueMessage>>;
    async fn delete_message(&self, queue_id: Uuid, receipt_handle: &str) -> StateResult<bool>;
    async fn purge_queue(&self, queue_id: Uuid) -> StateResult<u32>;
}

#[async_trait]
pub trait TopicRepository: Send + Sync {
    /// Insert a topic. `false` if the owner already has a topic of that name.
    async fn create_topic(&self, topic: &Topic) -> StateResult<bool>;
    async fn get_topic(&self, id: Uuid) -> StateResult<Option<Topic>>;
    async fn list_topics(&self, user_id: UserId) -> StateResult<Vec<Topic>>;
    async fn delete_topic(&self, id: Uuid) -> StateResult<bool>;
    async fn create_subscription(&self, subscription: &Subscription) -> StateResult<()>;
    async fn list_subscriptions(&self, topic_id: Uuid) -> StateResult<Vec<Subscription>>;
    async fn delete_subscription(&self, topic_id: Uuid, id: Uuid) -> StateResult<bool>;
    async fn save_notify_message(&self, message: &NotifyMessage) -> StateResult<()>;
}

#[async_trait]
pub trait PipelineRepository: Send + Sync {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> StateResult<()>;
    async fn get_pipeline(&self, id: PipelineId) -> StateResult<Option<Pipeline>>;
    async fn list_pipelines(&self, user_id: UserId) -> StateResult<Vec<Pipeline>>;
    async fn update_pipeline(&self, pipeline: &Pipeline) -> StateResult<()>;
    async fn delete_pipeline(&self, id: PipelineId) -> StateResult<bool>;
    async fn create_build(&self, build: &Build) -> StateResult<()>;
    async fn get_build(&self, pipeline_id: PipelineId, id: BuildId) -> StateResult<Option<Build>>;
    async fn update_build(&self, build: &Build) -> StateResult<()>;
    async fn list_builds(&self, pipeline_id: PipelineId) -> StateResult<Vec<Build>>;
    /// Atomically reserve a delivery. `false` if it was already reserved.
    async fn reserve_webhook_delivery(&self, delivery: &WebhookDelivery) -> StateResult<bool>;
    /// Drop a reservation so a redelivery is admitted again.
    async fn release_webhook_delivery(&self, delivery: &WebhookDelivery) -> StateResult<bool>;
}

#[async_trait]
pub trait GatewayRepository: Send + Sync {
    async fn create_route(&self, route: &GatewayRoute) -> StateResult<()>;
    async fn get_route(&self, id: Uuid) -> StateResult<Option<GatewayRoute>>;
    async fn delete_route(&self, id: Uuid) -> StateResult<bool>;
    /// Every route, oldest first.
    async fn list_routes(&self) -> StateResult<Vec<GatewayRoute>>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append_audit_log(&self, entry: &AuditLog) -> StateResult<()>;
    /// Most recent entries first.
    async fn list_audit_logs(&self, user_id: Option<UserId>, limit: usize) -> StateResult<Vec<AuditLog>>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn append_event(&self, event: &Event) -> StateResult<()>;
    /// Most recent events first.
    async fn list_events(&self, limit: usize) -> StateResult<Vec<Event>>;
}

#[async_trait]
pub trait DataKeyRepository: Send + Sync {
    async fn put_data_key(&self, key: &SealedDataKey) -> StateResult<()>;
    async fn get_data_key(&self, bucket: &str) -> StateResult<Option<SealedDataKey>>;
}

/// Durable FIFO task queues.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn push_task(&self, queue: &str, payload: &[u8]) -> StateResult<()>;
    /// Remove and return the oldest task of `queue`.
    async fn pop_task(&self, queue: &str) -> StateResult<Option<Vec<u8>>>;
}
