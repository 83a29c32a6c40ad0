//! Domain types for the Nimbus state store.
//!
//! These are the declared and observed state of every logical resource.
//! All types serialize to/from JSON for storage in redb tables. Optional
//! references (`vpc_id`, `load_balancer_id`, ...) are `Option`s; there
//! are no pointer graphs, back-references live in join tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock timestamp used across every entity.
pub type Timestamp = DateTime<Utc>;

pub type UserId = Uuid;
pub type TenantId = Uuid;
pub type InstanceId = Uuid;
pub type VpcId = Uuid;
pub type GroupId = Uuid;
pub type PolicyId = Uuid;
pub type DeploymentId = Uuid;
pub type LoadBalancerId = Uuid;
pub type ZoneId = Uuid;
pub type PipelineId = Uuid;
pub type BuildId = Uuid;

// ── Identity ──────────────────────────────────────────────────────

/// A registered user. `role` names a built-in or custom role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: Timestamp,
}

/// Per-resource counters used both as limits and as current usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceCounts {
    pub instances: u32,
    pub vcpus: u32,
    pub memory_mb: u64,
}

impl ResourceCounts {
    /// `self + delta` if every component stays within `limit`.
    pub fn checked_add_within(&self, delta: &ResourceCounts, limit: &ResourceCounts) -> Option<Self> {
        let next = ResourceCounts {
            instances: self.instances.checked_add(delta.instances)?,
            vcpus: self.vcpus.checked_add(delta.vcpus)?,
            memory_mb: self.memory_mb.checked_add(delta.memory_mb)?,
        };
        (next.instances <= limit.instances
            && next.vcpus <= limit.vcpus
            && next.memory_mb <= limit.memory_mb)
            .then_some(next)
    }

    /// Component-wise saturating subtraction.
    pub fn saturating_sub(&self, delta: &ResourceCounts) -> Self {
        ResourceCounts {
            instances: self.instances.saturating_sub(delta.instances),
            vcpus: self.vcpus.saturating_sub(delta.vcpus),
            memory_mb: self.memory_mb.saturating_sub(delta.memory_mb),
        }
    }
}

/// Quota limits and current usage of a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TenantQuota {
    pub limits: ResourceCounts,
    pub usage: ResourceCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub name: String,
    pub owner_id: UserId,
    pub quota: TenantQuota,
    pub created_at: Timestamp,
}

/// Opaque credential issued at login. Never re-issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub key: String,
    pub name: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// One IAM statement. Actions and resources are each disjunctive lists
/// of patterns (`*`, `prefix*`, or exact).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statement {
    pub effect: Effect,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: PolicyId,
    pub tenant_id: TenantId,
    pub name: String,
    pub statements: Vec<Statement>,
    pub created_at: Timestamp,
}

// ── Compute ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceType {
    /// Type name, e.g. `basic-2`.
    pub id: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u32,
}

impl InstanceType {
    /// Quota footprint of one instance of this type.
    pub fn footprint(&self) -> ResourceCounts {
        ResourceCounts {
            instances: 1,
            vcpus: self.vcpus,
            memory_mb: self.memory_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopped,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub name: String,
    pub image: String,
    /// Canonical port map, `host:container[,host:container...]`.
    pub ports: String,
    pub status: InstanceStatus,
    pub vpc_id: Option<VpcId>,
    pub container_id: Option<String>,
    pub instance_type: String,
    pub private_ip: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    Available,
    InUse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub size_gb: u32,
    pub status: VolumeStatus,
    pub instance_id: Option<InstanceId>,
    pub mount_path: Option<String>,
    pub created_at: Timestamp,
}

/// One CPU utilisation sample reported for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuSample {
    pub instance_id: InstanceId,
    pub cpu_percent: f64,
    pub recorded_at: Timestamp,
}

// ── Auto-scaling ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Active,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingGroup {
    pub id: GroupId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub name: String,
    pub vpc_id: VpcId,
    pub load_balancer_id: Option<LoadBalancerId>,
    pub image: String,
    pub ports: String,
    pub instance_type: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub desired_count: u32,
    /// Cached membership count; the join table is authoritative.
    pub current_count: u32,
    pub status: GroupStatus,
    pub failure_count: u32,
    pub last_failure_at: Option<Timestamp>,
    pub idempotency_key: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub id: PolicyId,
    pub group_id: GroupId,
    pub name: String,
    pub metric_type: String,
    pub target_value: f64,
    pub scale_out_step: u32,
    pub scale_in_step: u32,
    pub cooldown_sec: u64,
    pub last_scaled_at: Option<Timestamp>,
}

/// Join row between a parent (group or deployment) and an instance.
/// `seq` records join order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub parent_id: Uuid,
    pub instance_id: InstanceId,
    pub seq: u64,
}

// ── Deployments ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Scaling,
    Ready,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub name: String,
    pub image: String,
    pub replicas: u32,
    pub current_count: u32,
    pub ports: String,
    pub status: DeploymentStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ── Load balancing ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbStatus {
    Creating,
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbAlgorithm {
    RoundRobin,
    LeastConn,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancer {
    pub id: LoadBalancerId,
    pub user_id: UserId,
    pub name: String,
    pub vpc_id: VpcId,
    pub port: u16,
    pub algorithm: LbAlgorithm,
    pub status: LbStatus,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LbTarget {
    pub lb_id: LoadBalancerId,
    pub instance_id: InstanceId,
    pub port: u16,
    pub weight: u32,
    pub health: TargetHealth,
}

// ── DNS ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsZone {
    pub id: ZoneId,
    pub user_id: UserId,
    pub vpc_id: VpcId,
    pub name: String,
    /// Identifier of the zone on the DNS backend.
    pub backend_id: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Srv,
    Ns,
}

impl RecordType {
    /// Whether several records may share `(zone, name, type)`.
    pub fn allows_multiple(&self) -> bool {
        !matches!(self, RecordType::Cname)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Srv => "SRV",
            RecordType::Ns => "NS",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    pub id: Uuid,
    pub zone_id: ZoneId,
    pub name: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: u32,
    pub priority: Option<u16>,
    /// Set for records managed by instance registration.
    pub instance_id: Option<InstanceId>,
    pub created_at: Timestamp,
}

// ── Cron ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub schedule: String,
    pub target_url: String,
    pub target_method: String,
    pub target_payload: Option<String>,
    pub status: CronStatus,
    pub last_run_at: Option<Timestamp>,
    /// `None` iff the job is paused.
    pub next_run_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub status_code: Option<u16>,
    pub response: String,
    pub duration_ms: u64,
    pub started_at: Timestamp,
}

// ── Messaging ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Queue {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub visibility_timeout_secs: u64,
    pub retention_days: u32,
    pub max_message_size: usize,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub body: String,
    /// Lease token handed out by the most recent receive.
    pub receipt_handle: Option<String>,
    /// The message is invisible to receivers until this instant.
    pub visible_at: Timestamp,
    pub receive_count: u32,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionProtocol {
    /// Endpoint is a queue id owned by the topic owner.
    Queue,
    /// Endpoint is an HTTP(S) URL receiving a JSON POST.
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub user_id: UserId,
    pub protocol: SubscriptionProtocol,
    pub endpoint: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyMessage {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub body: String,
    pub created_at: Timestamp,
}

// ── Pipelines ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub id: PipelineId,
    pub user_id: UserId,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub build_image: String,
    pub steps: Vec<String>,
    pub webhook_secret: Option<String>,
    pub status: PipelineStatus,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub id: BuildId,
    pub pipeline_id: PipelineId,
    pub user_id: UserId,
    pub commit_hash: String,
    pub trigger_type: TriggerType,
    pub status: BuildStatus,
    pub logs: String,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// Payload enqueued on `pipeline_build_queue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildJob {
    pub build_id: BuildId,
    pub pipeline_id: PipelineId,
    pub user_id: UserId,
}

/// Dedup key for webhook admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookDelivery {
    pub pipeline_id: PipelineId,
    pub provider: String,
    pub event: String,
    pub delivery_id: String,
    pub received_at: Timestamp,
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayRoute {
    pub id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub path_prefix: String,
    pub target_url: String,
    pub strip_prefix: bool,
    /// Rewrite the `Host` header to the upstream authority.
    pub rewrite_host: bool,
    pub created_at: Timestamp,
}

// ── Side channels ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub action: String,
    pub resource_id: String,
    pub resource_type: String,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

/// A data key sealed under the master key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealedDataKey {
    pub bucket: String,
    /// `nonce || ciphertext` of the 32-byte data key.
    pub sealed: Vec<u8>,
    pub created_at: Timestamp,
}
