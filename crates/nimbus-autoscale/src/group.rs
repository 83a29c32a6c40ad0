//! Scaling-group and scaling-policy management.
//!
//! Groups are declarative: this service only records what the user wants.
//! The [`Autoscaler`](crate::Autoscaler) makes it so.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use nimbus_core::authz::permissions;
use nimbus_core::portmap::{format_ports, parse_ports};
use nimbus_core::{AuditAction, Authorizer, Clock, CoreError, CoreResult, Limits, Recorder, RequestContext, require_permission};
use nimbus_state::{
    GroupId, GroupStatus, InstanceRepository, LoadBalancerId, PolicyId, ScalingGroup, ScalingPolicy, ScalingRepository,
    VpcId,
};

use crate::policy::CPU_METRIC;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub vpc_id: VpcId,
    pub image: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub desired_count: u32,
    #[serde(default)]
    pub load_balancer_id: Option<LoadBalancerId>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_instance_type() -> String {
    "basic-1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePolicyRequest {
    pub name: String,
    #[serde(default = "default_metric")]
    pub metric_type: String,
    pub target_value: f64,
    pub scale_out_step: u32,
    pub scale_in_step: u32,
    pub cooldown_sec: u64,
}

fn default_metric() -> String {
    CPU_METRIC.to_string()
}

fn group_arn(id: GroupId) -> String {
    format!("arn:nimbus:asg:{id}")
}

pub struct ScalingGroupService {
    groups: Arc<dyn ScalingRepository>,
    instances: Arc<dyn InstanceRepository>,
    authz: Arc<dyn Authorizer>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
    limits: Limits,
}

impl ScalingGroupService {
    pub fn new(
        groups: Arc<dyn ScalingRepository>,
        instances: Arc<dyn InstanceRepository>,
        authz: Arc<dyn Authorizer>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
        limits: Limits,
    ) -> Self {
        Self {
            groups,
            instances,
            authz,
            recorder,
            clock,
            limits,
        }
    }

    async fn owned(&self, ctx: &RequestContext, id: GroupId) -> CoreResult<ScalingGroup> {
        let user_id = ctx.user_id()?;
        self.groups
            .get_group(id)
            .await?
            .filter(|g| g.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("scaling group {id}")))
    }

    fn check_bounds(&self, min: u32, desired: u32, max: u32) -> CoreResult<()> {
        let hard = self.limits.scaling_hard_limit;
        if min > desired || desired > max || max > hard {
            return Err(CoreError::InvalidInput(format!(
                "need min <= desired <= max <= {hard}, got {min}/{desired}/{max}"
            )));
        }
        Ok(())
    }

    /// Create a group, or return the existing one for a repeated
    /// idempotency key.
    pub async fn create_group(&self, ctx: &RequestContext, req: CreateGroupRequest) -> CoreResult<ScalingGroup> {
        let user_id = ctx.user_id()?;
        let tenant_id = ctx.tenant_id()?;
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_CREATE, "*").await?;

        if let Some(key) = req.idempotency_key.as_deref()
            && let Some(existing) = self.groups.get_group_by_idempotency_key(user_id, key).await?
        {
            info!(group_id = %existing.id, idempotency_key = %key, "returning existing scaling group");
            return Ok(existing);
        }

        let name = req.name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("group name is required".into()));
        }
        if req.image.trim().is_empty() {
            return Err(CoreError::InvalidInput("image is required".into()));
        }
        self.check_bounds(req.min_instances, req.desired_count, req.max_instances)?;
        let ports = format_ports(&parse_ports(&req.ports, self.limits.max_ports_per_instance)?);
        if self.instances.get_instance_type(&req.instance_type).await?.is_none() {
            return Err(CoreError::InvalidInput(format!("unknown instance type {:?}", req.instance_type)));
        }

        let in_vpc = self.groups.count_groups_by_vpc(req.vpc_id).await?;
        if in_vpc >= self.limits.groups_per_vpc {
            return Err(CoreError::ResourceLimitExceeded(format!(
                "vpc {} already has {in_vpc} scaling groups",
                req.vpc_id
            )));
        }

        let now = self.clock.now();
        let group = ScalingGroup {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            name: name.to_string(),
            vpc_id: req.vpc_id,
            load_balancer_id: req.load_balancer_id,
            image: req.image.trim().to_string(),
            ports,
            instance_type: req.instance_type,
            min_instances: req.min_instances,
            max_instances: req.max_instances,
            desired_count: req.desired_count,
            current_count: 0,
            status: GroupStatus::Active,
            failure_count: 0,
            last_failure_at: None,
            idempotency_key: req.idempotency_key,
            created_at: now,
            updated_at: now,
        };

        if !self.groups.create_group(&group).await? {
            // Lost a race on the idempotency key.
            let key = group.idempotency_key.as_deref().unwrap_or_default();
            return self
                .groups
                .get_group_by_idempotency_key(user_id, key)
                .await?
                .ok_or_else(|| CoreError::Conflict(format!("idempotency key {key:?} in use")));
        }

        info!(group_id = %group.id, name = %group.name, desired = group.desired_count, "scaling group created");
        self.recorder
            .audit(
                ctx,
                AuditAction::GroupCreate {
                    group_id: group.id,
                    name: group.name.clone(),
                },
            )
            .await;
        Ok(group)
    }

    pub async fn get_group(&self, ctx: &RequestContext, id: GroupId) -> CoreResult<ScalingGroup> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_READ, &group_arn(id)).await?;
        self.owned(ctx, id).await
    }

    pub async fn list_groups(&self, ctx: &RequestContext) -> CoreResult<Vec<ScalingGroup>> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_READ, "*").await?;
        Ok(self.groups.list_groups_for_user(ctx.user_id()?).await?)
    }

    pub async fn set_desired(&self, ctx: &RequestContext, id: GroupId, desired: u32) -> CoreResult<ScalingGroup> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_UPDATE, &group_arn(id)).await?;
        let group = self.owned(ctx, id).await?;
        if group.status == GroupStatus::Deleting {
            return Err(CoreError::InvalidState(format!("scaling group {id} is being deleted")));
        }
        self.check_bounds(group.min_instances, desired, group.max_instances)?;
        let now = self.clock.now();
        let group = self
            .groups
            .modify_group(id, &|row: &mut ScalingGroup| {
                if row.status == GroupStatus::Deleting {
                    return false;
                }
                row.desired_count = desired;
                row.updated_at = now;
                true
            })
            .await?
            .ok_or_else(|| CoreError::not_found(format!("scaling group {id}")))?;
        if group.status == GroupStatus::Deleting {
            return Err(CoreError::InvalidState(format!("scaling group {id} is being deleted")));
        }
        info!(group_id = %id, desired, "desired count set");
        self.recorder
            .audit(ctx, AuditAction::GroupUpdate { group_id: id, desired_count: desired })
            .await;
        Ok(group)
    }

    /// Mark the group DELETING. Members are drained and the row removed by
    /// the reconciler.
    pub async fn delete_group(&self, ctx: &RequestContext, id: GroupId) -> CoreResult<()> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_DELETE, &group_arn(id)).await?;
        let group = self.owned(ctx, id).await?;
        if group.status == GroupStatus::Deleting {
            return Ok(());
        }
        let now = self.clock.now();
        self.groups
            .modify_group(id, &|row: &mut ScalingGroup| {
                row.status = GroupStatus::Deleting;
                row.desired_count = 0;
                row.min_instances = 0;
                row.updated_at = now;
                true
            })
            .await?;
        info!(group_id = %id, "scaling group marked for deletion");
        self.recorder.audit(ctx, AuditAction::GroupDelete { group_id: id }).await;
        Ok(())
    }

    pub async fn create_policy(
        &self,
        ctx: &RequestContext,
        group_id: GroupId,
        req: CreatePolicyRequest,
    ) -> CoreResult<ScalingPolicy> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_UPDATE, &group_arn(group_id)).await?;
        let group = self.owned(ctx, group_id).await?;
        if group.status == GroupStatus::Deleting {
            return Err(CoreError::InvalidState(format!("scaling group {group_id} is being deleted")));
        }
        if req.metric_type != CPU_METRIC {
            return Err(CoreError::InvalidInput(format!("unsupported metric {:?}", req.metric_type)));
        }
        if !(req.target_value > 0.0 && req.target_value <= 100.0) {
            return Err(CoreError::InvalidInput("cpu target must be in (0, 100]".into()));
        }
        if req.scale_out_step == 0 || req.scale_in_step == 0 {
            return Err(CoreError::InvalidInput("scaling steps must be at least 1".into()));
        }
        if req.cooldown_sec < self.limits.min_cooldown_secs {
            return Err(CoreError::InvalidInput(format!(
                "cooldown must be at least {}s",
                self.limits.min_cooldown_secs
            )));
        }

        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            group_id,
            name: req.name,
            metric_type: req.metric_type,
            target_value: req.target_value,
            scale_out_step: req.scale_out_step,
            scale_in_step: req.scale_in_step,
            cooldown_sec: req.cooldown_sec,
            last_scaled_at: None,
        };
        self.groups.create_scaling_policy(&policy).await?;
        info!(group_id = %group_id, policy_id = %policy.id, target = policy.target_value, "scaling policy created");
        self.recorder
            .audit(
                ctx,
                AuditAction::PolicyCreate {
                    policy_id: policy.id,
                    group_id,
                },
            )
            .await;
        Ok(policy)
    }

    pub async fn list_policies(&self, ctx: &RequestContext, group_id: GroupId) -> CoreResult<Vec<ScalingPolicy>> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_READ, &group_arn(group_id)).await?;
        self.owned(ctx, group_id).await?;
        Ok(self.groups.get_scaling_policies(group_id).await?)
    }

    pub async fn delete_policy(&self, ctx: &RequestContext, group_id: GroupId, policy_id: PolicyId) -> CoreResult<()> {
        require_permission(self.authz.as_ref(), ctx, permissions::ASG_UPDATE, &group_arn(group_id)).await?;
        self.owned(ctx, group_id).await?;
        if !self.groups.delete_scaling_policy(group_id, policy_id).await? {
            return Err(CoreError::not_found(format!("scaling policy {policy_id}")));
        }
        self.recorder
            .audit(ctx, AuditAction::PolicyDelete { policy_id, group_id })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::SystemClock;
    use nimbus_core::sim::StaticAuthorizer;
    use nimbus_state::{InstanceType, StateStore};

    async fn service() -> (Arc<StateStore>, ScalingGroupService, RequestContext) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store
            .put_instance_type(&InstanceType {
                id: "basic-1".into(),
                vcpus: 1,
                memory_mb: 1024,
                disk_gb: 20,
            })
            .await
            .unwrap();
        let clock = Arc::new(SystemClock);
        let service = ScalingGroupService::new(
            store.clone(),
            store.clone(),
            Arc::new(StaticAuthorizer::allow_all()),
            Recorder::new(store.clone(), store.clone(), clock.clone()),
            clock,
            Limits::default(),
        );
        (store, service, RequestContext::new(Uuid::new_v4(), Uuid::new_v4()))
    }

    fn request(name: &str, vpc_id: VpcId) -> CreateGroupRequest {
        CreateGroupRequest {
            name: name.into(),
            vpc_id,
            image: "nginx:1.27".into(),
            ports: "8080:80".into(),
            instance_type: "basic-1".into(),
            min_instances: 1,
            max_instances: 5,
            desired_count: 2,
            load_balancer_id: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn idempotency_key_returns_first_group() {
        let (store, service, ctx) = service().await;
        let vpc = Uuid::new_v4();

        let mut first = request("A", vpc);
        first.idempotency_key = Some("K".into());
        let g1 = service.create_group(&ctx, first).await.unwrap();

        let mut second = request("B", vpc);
        second.idempotency_key = Some("K".into());
        let again = service.create_group(&ctx, second).await.unwrap();

        assert_eq!(again, g1);
        assert_eq!(again.name, "A");
        assert_eq!(store.list_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bounds_are_validated() {
        let (_store, service, ctx) = service().await;
        let vpc = Uuid::new_v4();

        let mut inverted = request("a", vpc);
        inverted.min_instances = 3;
        assert!(matches!(service.create_group(&ctx, inverted).await, Err(CoreError::InvalidInput(_))));

        let mut huge = request("b", vpc);
        huge.max_instances = 21;
        assert!(matches!(service.create_group(&ctx, huge).await, Err(CoreError::InvalidInput(_))));

        let mut bad_ports = request("c", vpc);
        bad_ports.ports = "http".into();
        assert!(matches!(service.create_group(&ctx, bad_ports).await, Err(CoreError::InvalidPortFormat(_))));
    }

    #[tokio::test]
    async fn per_vpc_limit() {
        let (_store, service, ctx) = service().await;
        let vpc = Uuid::new_v4();
        for i in 0..5 {
            service.create_group(&ctx, request(&format!("g{i}"), vpc)).await.unwrap();
        }
        let err = service.create_group(&ctx, request("g5", vpc)).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceLimitExceeded(_)));
        // Another VPC is unaffected.
        service.create_group(&ctx, request("other", Uuid::new_v4())).await.unwrap();
    }

    #[tokio::test]
    async fn delete_marks_group_deleting() {
        let (store, service, ctx) = service().await;
        let group = service.create_group(&ctx, request("web", Uuid::new_v4())).await.unwrap();
        service.delete_group(&ctx, group.id).await.unwrap();

        let row = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(row.status, GroupStatus::Deleting);
        assert_eq!((row.min_instances, row.desired_count), (0, 0));
        assert!(matches!(service.set_desired(&ctx, group.id, 1).await, Err(CoreError::InvalidState(_))));
        // Repeat delete is a no-op.
        service.delete_group(&ctx, group.id).await.unwrap();
    }

    #[tokio::test]
    async fn groups_are_owner_scoped() {
        let (_store, service, ctx) = service().await;
        let group = service.create_group(&ctx, request("web", Uuid::new_v4())).await.unwrap();
        let other = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(service.get_group(&other, group.id).await, Err(CoreError::NotFound(_))));
        assert!(matches!(service.delete_group(&other, group.id).await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn policy_validation() {
        let (_store, service, ctx) = service().await;
        let group = service.create_group(&ctx, request("web", Uuid::new_v4())).await.unwrap();
        let base = CreatePolicyRequest {
            name: "cpu-high".into(),
            metric_type: CPU_METRIC.into(),
            target_value: 70.0,
            scale_out_step: 2,
            scale_in_step: 1,
            cooldown_sec: 300,
        };

        let mut short = base.clone();
        short.cooldown_sec = 30;
        assert!(matches!(service.create_policy(&ctx, group.id, short).await, Err(CoreError::InvalidInput(_))));

        let mut rps = base.clone();
        rps.metric_type = "rps".into();
        assert!(matches!(service.create_policy(&ctx, group.id, rps).await, Err(CoreError::InvalidInput(_))));

        let policy = service.create_policy(&ctx, group.id, base).await.unwrap();
        assert_eq!(service.list_policies(&ctx, group.id).await.unwrap(), vec![policy.clone()]);
        service.delete_policy(&ctx, group.id, policy.id).await.unwrap();
        assert!(service.list_policies(&ctx, group.id).await.unwrap().is_empty());
    }
}
