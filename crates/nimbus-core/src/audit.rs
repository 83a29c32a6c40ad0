//! Audit log and domain-event side channels.
//!
//! Services record after the primary mutation succeeded. A failing sink is
//! logged and otherwise ignored; it never fails the caller.
//!
//! Audit details keep the wire shape `{string -> any}`, but each action has
//! its own typed variant, so a caller cannot emit `instance.launch` without
//! the fields that action carries.

use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use nimbus_state::{
    AuditLog, AuditRepository, BuildId, DeploymentId, Event, EventRepository, GroupId, InstanceId,
    LoadBalancerId, PipelineId, PolicyId, UserId, ZoneId,
};

use crate::clock::Clock;
use crate::context::RequestContext;

/// Declares [`AuditAction`] together with its action string, resource type
/// and the field that identifies the resource.
macro_rules! audit_actions {
    ($(
        $variant:ident => ($action:literal, $resource:literal, $id:ident) {
            $($field:ident : $ty:ty),* $(,)?
        }
    ),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(untagged)]
        pub enum AuditAction {
            $( $variant { $($field: $ty),* } ),*
        }

        impl AuditAction {
            /// Dot-qualified action name, e.g. `instance.launch`.
            pub fn action(&self) -> &'static str {
                match self {
                    $( AuditAction::$variant { .. } => $action ),*
                }
            }

            pub fn resource_type(&self) -> &'static str {
                match self {
                    $( AuditAction::$variant { .. } => $resource ),*
                }
            }

            pub fn resource_id(&self) -> String {
                match self {
                    $( AuditAction::$variant { $id, .. } => $id.to_string() ),*
                }
            }
        }
    };
}

audit_actions! {
    UserRegister => ("user.register", "user", user_id) { user_id: UserId, email: String },
    UserLogin => ("user.login", "user", user_id) { user_id: UserId, email: String },

    RoleCreate => ("rbac.role_create", "role", role_id) { role_id: Uuid, name: String },
    RoleUpdate => ("rbac.role_update", "role", role_id) { role_id: Uuid, name: String },
    RoleDelete => ("rbac.role_delete", "role", role_id) { role_id: Uuid },
    RoleBind => ("rbac.role_bind", "user", user_id) { user_id: UserId, role: String },
    IamPolicyCreate => ("iam.policy_create", "policy", policy_id) { policy_id: PolicyId, name: String },
    IamPolicyDelete => ("iam.policy_delete", "policy", policy_id) { policy_id: PolicyId },
    IamPolicyAttach => ("iam.policy_attach", "policy", policy_id) { policy_id: PolicyId, user_id: UserId },
    IamPolicyDetach => ("iam.policy_detach", "policy", policy_id) { policy_id: PolicyId, user_id: UserId },

    InstanceLaunch => ("instance.launch", "instance", instance_id) {
        instance_id: InstanceId,
        name: String,
        image: String,
        instance_type: String,
    },
    InstanceStart => ("instance.start", "instance", instance_id) { instance_id: InstanceId },
    InstanceStop => ("instance.stop", "instance", instance_id) { instance_id: InstanceId },
    InstanceTerminate => ("instance.terminate", "instance", instance_id) { instance_id: InstanceId },

    GroupCreate => ("asg.group_create", "scaling_group", group_id) { group_id: GroupId, name: String },
    GroupUpdate => ("asg.group_update", "scaling_group", group_id) { group_id: GroupId, desired_count: u32 },
    GroupDelete => ("asg.group_delete", "scaling_group", group_id) { group_id: GroupId },
    PolicyCreate => ("asg.policy_create", "scaling_policy", policy_id) { policy_id: PolicyId, group_id: GroupId },
    PolicyDelete => ("asg.policy_delete", "scaling_policy", policy_id) { policy_id: PolicyId, group_id: GroupId },

    DeploymentCreate => ("deployment.create", "deployment", deployment_id) {
        deployment_id: DeploymentId,
        name: String,
        replicas: u32,
    },
    DeploymentScale => ("deployment.scale", "deployment", deployment_id) { deployment_id: DeploymentId, replicas: u32 },
    DeploymentDelete => ("deployment.delete", "deployment", deployment_id) { deployment_id: DeploymentId },

    LbCreate => ("lb.create", "load_balancer", lb_id) { lb_id: LoadBalancerId, name: String },
    LbDelete => ("lb.delete", "load_balancer", lb_id) { lb_id: LoadBalancerId },
    LbTargetAdd => ("lb.target_add", "load_balancer", lb_id) { lb_id: LoadBalancerId, instance_id: InstanceId },
    LbTargetRemove => ("lb.target_remove", "load_balancer", lb_id) { lb_id: LoadBalancerId, instance_id: InstanceId },

    ZoneCreate => ("dns.zone_create", "dns_zone", zone_id) { zone_id: ZoneId, name: String },
    ZoneDelete => ("dns.zone_delete", "dns_zone", zone_id) { zone_id: ZoneId },
    RecordCreate => ("dns.record_create", "dns_record", record_id) {
        record_id: Uuid,
        zone_id: ZoneId,
        name: String,
        record_type: String,
    },
    RecordDelete => ("dns.record_delete", "dns_record", record_id) { record_id: Uuid, zone_id: ZoneId },

    CronCreate => ("cron.job_create", "cron_job", job_id) { job_id: Uuid, name: String, schedule: String },
    CronPause => ("cron.job_pause", "cron_job", job_id) { job_id: Uuid },
    CronResume => ("cron.job_resume", "cron_job", job_id) { job_id: Uuid },
    CronDelete => ("cron.job_delete", "cron_job", job_id) { job_id: Uuid },

    QueueCreate => ("queue.create", "queue", queue_id) { queue_id: Uuid, name: String },
    QueueDelete => ("queue.delete", "queue", queue_id) { queue_id: Uuid },
    QueuePurge => ("queue.purge", "queue", queue_id) { queue_id: Uuid, purged: u32 },
    TopicCreate => ("notify.topic_create", "topic", topic_id) { topic_id: Uuid, name: String },
    TopicDelete => ("notify.topic_delete", "topic", topic_id) { topic_id: Uuid },
    Subscribe => ("notify.subscribe", "subscription", subscription_id) {
        subscription_id: Uuid,
        topic_id: Uuid,
        protocol: String,
    },
    Unsubscribe => ("notify.unsubscribe", "subscription", subscription_id) { subscription_id: Uuid, topic_id: Uuid },

    PipelineCreate => ("pipeline.create", "pipeline", pipeline_id) { pipeline_id: PipelineId, name: String },
    PipelineDelete => ("pipeline.delete", "pipeline", pipeline_id) { pipeline_id: PipelineId },
    BuildTrigger => ("pipeline.build_trigger", "build", build_id) {
        build_id: BuildId,
        pipeline_id: PipelineId,
        trigger: String,
        commit: String,
    },

    RouteCreate => ("gateway.route_create", "gateway_route", route_id) { route_id: Uuid, path_prefix: String },
    RouteDelete => ("gateway.route_delete", "gateway_route", route_id) { route_id: Uuid },

    DataKeyRotate => ("crypto.key_rotate", "bucket", bucket) { bucket: String },
}

impl AuditAction {
    /// The action's fields as the audit `details` map.
    pub fn details(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Writes audit entries and domain events, swallowing sink failures.
#[derive(Clone)]
pub struct Recorder {
    audit: Arc<dyn AuditRepository>,
    events: Arc<dyn EventRepository>,
    clock: Arc<dyn Clock>,
}

impl Recorder {
    pub fn new(audit: Arc<dyn AuditRepository>, events: Arc<dyn EventRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { audit, events, clock }
    }

    pub async fn audit(&self, ctx: &RequestContext, action: AuditAction) {
        let entry = AuditLog {
            id: Uuid::new_v4(),
            user_id: ctx.user_id().ok(),
            action: action.action().to_string(),
            resource_type: action.resource_type().to_string(),
            resource_id: action.resource_id(),
            details: action.details(),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.audit.append_audit_log(&entry).await {
            warn!(action = %entry.action, resource_id = %entry.resource_id, error = %e, "audit sink failed");
        }
    }

    pub async fn event(&self, action: &str, resource_type: &str, resource_id: impl Display + Send, metadata: Value) {
        let event = Event {
            id: Uuid::new_v4(),
            action: action.to_string(),
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
            metadata,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.events.append_event(&event).await {
            warn!(action = %event.action, resource_id = %event.resource_id, error = %e, "event sink failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use nimbus_state::{StateError, StateResult, StateStore, StoreOp};
    use serde_json::json;

    struct BrokenSink;

    #[async_trait]
    impl AuditRepository for BrokenSink {
        async fn append_audit_log(&self, _entry: &AuditLog) -> StateResult<()> {
            Err(StateError::storage(StoreOp::Write, "disk full"))
        }
        async fn list_audit_logs(&self, _user: Option<UserId>, _limit: usize) -> StateResult<Vec<AuditLog>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl EventRepository for BrokenSink {
        async fn append_event(&self, _event: &Event) -> StateResult<()> {
            Err(StateError::storage(StoreOp::Write, "disk full"))
        }
        async fn list_events(&self, _limit: usize) -> StateResult<Vec<Event>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn typed_action_shape() {
        let id = Uuid::new_v4();
        let action = AuditAction::InstanceLaunch {
            instance_id: id,
            name: "web".into(),
            image: "nginx".into(),
            instance_type: "basic-1".into(),
        };
        assert_eq!(action.action(), "instance.launch");
        assert_eq!(action.resource_type(), "instance");
        assert_eq!(action.resource_id(), id.to_string());
        assert_eq!(action.details().get("image"), Some(&json!("nginx")));
    }

    #[tokio::test]
    async fn recorder_writes_entries() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let recorder = Recorder::new(store.clone(), store.clone(), Arc::new(SystemClock));
        let user = Uuid::new_v4();
        let ctx = RequestContext::new(user, Uuid::new_v4());

        recorder
            .audit(&ctx, AuditAction::GroupDelete { group_id: Uuid::new_v4() })
            .await;
        recorder
            .event("asg.group_deleted", "scaling_group", Uuid::new_v4(), json!({}))
            .await;

        let logs = store.list_audit_logs(Some(user), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "asg.group_delete");
        assert_eq!(store.list_events(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let sink = Arc::new(BrokenSink);
        let recorder = Recorder::new(sink.clone(), sink, Arc::new(SystemClock));
        let ctx = RequestContext::anonymous();
        recorder
            .audit(&ctx, AuditAction::QueueDelete { queue_id: Uuid::new_v4() })
            .await;
        recorder.event("queue.deleted", "queue", "q", json!(null)).await;
    }
}
