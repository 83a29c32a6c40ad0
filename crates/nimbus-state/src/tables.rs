//! redb table definitions for the Nimbus state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Join and index tables use composite keys so that a prefix scan
//! over `{parent_id}:` returns every child row.

use redb::TableDefinition;

/// Every table shares the same key/value shape.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

// ── Identity ───────────────────────────────────────────────────────

/// Users keyed by `{user_id}`.
pub const USERS: JsonTable = TableDefinition::new("users");
/// Unique email index: `{email}` → user id.
pub const USER_EMAILS: JsonTable = TableDefinition::new("user_emails");
/// Tenants keyed by `{tenant_id}`.
pub const TENANTS: JsonTable = TableDefinition::new("tenants");
/// Unique slug index: `{slug}` → tenant id.
pub const TENANT_SLUGS: JsonTable = TableDefinition::new("tenant_slugs");
/// API keys keyed by the opaque key itself (exact-match lookup).
pub const API_KEYS: JsonTable = TableDefinition::new("api_keys");
/// Roles keyed by `{role_id}`.
pub const ROLES: JsonTable = TableDefinition::new("roles");
/// Policies keyed by `{policy_id}`.
pub const POLICIES: JsonTable = TableDefinition::new("policies");
/// Policy attachments keyed by `{tenant_id}:{user_id}:{policy_id}`.
pub const POLICY_ATTACHMENTS: JsonTable = TableDefinition::new("policy_attachments");

// ── Compute ────────────────────────────────────────────────────────

/// Instance types keyed by type name.
pub const INSTANCE_TYPES: JsonTable = TableDefinition::new("instance_types");
/// Instances keyed by `{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");
/// Volumes keyed by `{volume_id}`.
pub const VOLUMES: JsonTable = TableDefinition::new("volumes");
/// CPU samples keyed by `{instance_id}:{unix_millis:020}:{sample_id}`.
pub const CPU_SAMPLES: JsonTable = TableDefinition::new("cpu_samples");

// ── Reconciled resources ───────────────────────────────────────────

/// Scaling groups keyed by `{group_id}`.
pub const SCALING_GROUPS: JsonTable = TableDefinition::new("scaling_groups");
/// Idempotency index: `{user_id}/{key}` → group id.
pub const GROUP_IDEMPOTENCY: JsonTable = TableDefinition::new("group_idempotency");
/// Group membership keyed by `{group_id}:{instance_id}`.
pub const GROUP_MEMBERS: JsonTable = TableDefinition::new("group_members");
/// Scaling policies keyed by `{group_id}:{policy_id}`.
pub const SCALING_POLICIES: JsonTable = TableDefinition::new("scaling_policies");
/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");
/// Deployment membership keyed by `{deployment_id}:{instance_id}`.
pub const DEPLOYMENT_MEMBERS: JsonTable = TableDefinition::new("deployment_members");
/// Load balancers keyed by `{lb_id}`.
pub const LOAD_BALANCERS: JsonTable = TableDefinition::new("load_balancers");
/// Load-balancer targets keyed by `{lb_id}:{instance_id}`.
pub const LB_TARGETS: JsonTable = TableDefinition::new("lb_targets");

// ── DNS ────────────────────────────────────────────────────────────

/// Zones keyed by `{zone_id}`.
pub const DNS_ZONES: JsonTable = TableDefinition::new("dns_zones");
/// Unique zone index: `{vpc_id}/{name}` → zone id.
pub const DNS_ZONE_NAMES: JsonTable = TableDefinition::new("dns_zone_names");
/// Records keyed by `{zone_id}:{record_id}`.
pub const DNS_RECORDS: JsonTable = TableDefinition::new("dns_records");

// ── Scheduling, messaging, pipelines ───────────────────────────────

/// Cron jobs keyed by `{job_id}`.
pub const CRON_JOBS: JsonTable = TableDefinition::new("cron_jobs");
/// Cron runs keyed by `{job_id}:{run_id}`.
pub const CRON_RUNS: JsonTable = TableDefinition::new("cron_runs");
/// Queues keyed by `{queue_id}`.
pub const QUEUES: JsonTable = TableDefinition::new("queues");
/// Unique queue-name index: `{user_id}/{name}` → queue id.
pub const QUEUE_NAMES: JsonTable = TableDefinition::new("queue_names");
/// Queue messages keyed by `{queue_id}:{unix_millis:020}:{message_id}`.
pub const QUEUE_MESSAGES: JsonTable = TableDefinition::new("queue_messages");
/// Topics keyed by `{topic_id}`.
pub const TOPICS: JsonTable = TableDefinition::new("topics");
/// Unique topic-name index: `{user_id}/{name}` → topic id.
pub const TOPIC_NAMES: JsonTable = TableDefinition::new("topic_names");
/// Subscriptions keyed by `{topic_id}:{subscription_id}`.
pub const SUBSCRIPTIONS: JsonTable = TableDefinition::new("subscriptions");
/// Published messages keyed by `{topic_id}:{message_id}`.
pub const NOTIFY_MESSAGES: JsonTable = TableDefinition::new("notify_messages");
/// Pipelines keyed by `{pipeline_id}`.
pub const PIPELINES: JsonTable = TableDefinition::new("pipelines");
/// Builds keyed by `{pipeline_id}:{build_id}`.
pub const BUILDS: JsonTable = TableDefinition::new("builds");
/// Webhook delivery reservations keyed by
/// `{pipeline_id}:{provider}:{event}:{delivery_id}`.
pub const WEBHOOK_DELIVERIES: JsonTable = TableDefinition::new("webhook_deliveries");
/// Gateway routes keyed by `{route_id}`.
pub const GATEWAY_ROUTES: JsonTable = TableDefinition::new("gateway_routes");

// ── Side channels and infrastructure ───────────────────────────────

/// Audit log keyed by `{unix_millis:020}:{id}`.
pub const AUDIT_LOGS: JsonTable = TableDefinition::new("audit_logs");
/// Domain events keyed by `{unix_millis:020}:{id}`.
pub const EVENTS: JsonTable = TableDefinition::new("events");
/// Durable task queue keyed by `{queue_name}:{seq:020}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");
/// Sealed per-bucket data keys keyed by bucket name.
pub const DATA_KEYS: JsonTable = TableDefinition::new("data_keys");

/// All tables, for creation at open time.
pub const ALL_TABLES: &[JsonTable] = &[
    USERS,
    USER_EMAILS,
    TENANTS,
    TENANT_SLUGS,
    API_KEYS,
    ROLES,
    POLICIES,
    POLICY_ATTACHMENTS,
    INSTANCE_TYPES,
    INSTANCES,
    VOLUMES,
    CPU_SAMPLES,
    SCALING_GROUPS,
    GROUP_IDEMPOTENCY,
    GROUP_MEMBERS,
    SCALING_POLICIES,
    DEPLOYMENTS,
    DEPLOYMENT_MEMBERS,
    LOAD_BALANCERS,
    LB_TARGETS,
    DNS_ZONES,
    DNS_ZONE_NAMES,
    DNS_RECORDS,
    CRON_JOBS,
    CRON_RUNS,
    QUEUES,
    QUEUE_NAMES,
    QUEUE_MESSAGES,
    TOPICS,
    TOPIC_NAMES,
    SUBSCRIPTIONS,
    NOTIFY_MESSAGES,
    PIPELINES,
    BUILDS,
    WEBHOOK_DELIVERIES,
    GATEWAY_ROUTES,
    AUDIT_LOGS,
    EVENTS,
    TASKS,
    DATA_KEYS,
];
