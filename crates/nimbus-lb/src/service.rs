//! Load-balancer and target management.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Recorder, RequestContext, TargetRegistry};
use nimbus_state::{
    InstanceId, InstanceRepository, LbAlgorithm, LbStatus, LbTarget, LoadBalancer, LoadBalancerId,
    LoadBalancerRepository, TargetHealth, VpcId,
};

pub struct LoadBalancerService {
    lbs: Arc<dyn LoadBalancerRepository>,
    instances: Arc<dyn InstanceRepository>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl LoadBalancerService {
    pub fn new(
        lbs: Arc<dyn LoadBalancerRepository>,
        instances: Arc<dyn InstanceRepository>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lbs,
            instances,
            recorder,
            clock,
        }
    }

    async fn owned(&self, ctx: &RequestContext, id: LoadBalancerId) -> CoreResult<LoadBalancer> {
        let user_id = ctx.user_id()?;
        self.lbs
            .get_lb(id)
            .await?
            .filter(|lb| lb.user_id == user_id && lb.status != LbStatus::Deleted)
            .ok_or_else(|| CoreError::not_found(format!("load balancer {id}")))
    }

    pub async fn create_lb(
        &self,
        ctx: &RequestContext,
        name: &str,
        vpc_id: VpcId,
        port: u16,
        algorithm: LbAlgorithm,
    ) -> CoreResult<LoadBalancer> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("load balancer name is required".into()));
        }
        if port == 0 {
            return Err(CoreError::InvalidInput("listener port must be 1-65535".into()));
        }
        let lb = LoadBalancer {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            name: name.to_string(),
            vpc_id,
            port,
            algorithm,
            status: LbStatus::Creating,
            created_at: self.clock.now(),
        };
        self.lbs.create_lb(&lb).await?;
        info!(lb_id = %lb.id, port, ?algorithm, "load balancer created");
        self.recorder
            .audit(
                ctx,
                AuditAction::LbCreate {
                    lb_id: lb.id,
                    name: lb.name.clone(),
                },
            )
            .await;
        Ok(lb)
    }

    pub async fn get_lb(&self, ctx: &RequestContext, id: LoadBalancerId) -> CoreResult<LoadBalancer> {
        self.owned(ctx, id).await
    }

    pub async fn list_lbs(&self, ctx: &RequestContext) -> CoreResult<Vec<LoadBalancer>> {
        let all = self.lbs.list_lbs(ctx.user_id()?).await?;
        Ok(all.into_iter().filter(|lb| lb.status != LbStatus::Deleted).collect())
    }

    /// Mark DELETED; the reconciler removes the proxy and the row.
    pub async fn delete_lb(&self, ctx: &RequestContext, id: LoadBalancerId) -> CoreResult<()> {
        self.owned(ctx, id).await?;
        self.lbs
            .modify_lb(id, &|row: &mut LoadBalancer| {
                row.status = LbStatus::Deleted;
                true
            })
            .await?;
        info!(lb_id = %id, "load balancer marked deleted");
        self.recorder.audit(ctx, AuditAction::LbDelete { lb_id: id }).await;
        Ok(())
    }

    pub async fn add_target(
        &self,
        ctx: &RequestContext,
        lb_id: LoadBalancerId,
        instance_id: InstanceId,
        port: u16,
        weight: u32,
    ) -> CoreResult<LbTarget> {
        self.owned(ctx, lb_id).await?;
        let user_id = ctx.user_id()?;
        if self
            .instances
            .get_instance(instance_id)
            .await?
            .filter(|i| i.user_id == user_id)
            .is_none()
        {
            return Err(CoreError::not_found(format!("instance {instance_id}")));
        }
        if port == 0 {
            return Err(CoreError::InvalidInput("target port must be 1-65535".into()));
        }

        let target = LbTarget {
            lb_id,
            instance_id,
            port,
            weight: weight.max(1),
            health: TargetHealth::Healthy,
        };
        if !self.lbs.add_lb_target(&target).await? {
            return Err(CoreError::Conflict(format!("instance {instance_id} is already a target of {lb_id}")));
        }
        info!(%lb_id, %instance_id, port, "target added");
        self.recorder
            .audit(ctx, AuditAction::LbTargetAdd { lb_id, instance_id })
            .await;
        Ok(target)
    }

    pub async fn remove_target(&self, ctx: &RequestContext, lb_id: LoadBalancerId, instance_id: InstanceId) -> CoreResult<()> {
        self.owned(ctx, lb_id).await?;
        if !self.lbs.remove_lb_target(lb_id, instance_id).await? {
            return Err(CoreError::not_found(format!("target {instance_id}")));
        }
        info!(%lb_id, %instance_id, "target removed");
        self.recorder
            .audit(ctx, AuditAction::LbTargetRemove { lb_id, instance_id })
            .await;
        Ok(())
    }

    pub async fn list_targets(&self, ctx: &RequestContext, lb_id: LoadBalancerId) -> CoreResult<Vec<LbTarget>> {
        self.owned(ctx, lb_id).await?;
        Ok(self.lbs.list_lb_targets(lb_id).await?)
    }
}

#[async_trait]
impl TargetRegistry for LoadBalancerService {
    async fn attach_target(
        &self,
        ctx: &RequestContext,
        lb_id: LoadBalancerId,
        instance_id: InstanceId,
        port: u16,
    ) -> CoreResult<()> {
        match self.add_target(ctx, lb_id, instance_id, port, 1).await {
            Ok(_) => Ok(()),
            Err(CoreError::Conflict(_)) => {
                debug!(%lb_id, %instance_id, "target already attached");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn detach_target(&self, ctx: &RequestContext, lb_id: LoadBalancerId, instance_id: InstanceId) -> CoreResult<()> {
        match self.remove_target(ctx, lb_id, instance_id).await {
            Ok(()) | Err(CoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_core::SystemClock;
    use nimbus_state::{Instance, InstanceStatus, StateStore};

    pub(crate) fn service(store: &Arc<StateStore>) -> LoadBalancerService {
        let clock = Arc::new(SystemClock);
        LoadBalancerService::new(
            store.clone(),
            store.clone(),
            Recorder::new(store.clone(), store.clone(), clock.clone()),
            clock,
        )
    }

    pub(crate) async fn seed_instance(store: &StateStore, ctx: &RequestContext, container_id: Option<&str>) -> Instance {
        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4(),
            user_id: ctx.user_id().unwrap(),
            tenant_id: ctx.tenant_id().unwrap(),
            name: "web".into(),
            image: "nginx".into(),
            ports: "0:80".into(),
            status: InstanceStatus::Running,
            vpc_id: None,
            container_id: container_id.map(str::to_string),
            instance_type: "basic-1".into(),
            private_ip: None,
            created_at: now,
            updated_at: now,
        };
        store.create_instance(&instance).await.unwrap();
        instance
    }

    #[tokio::test]
    async fn target_lifecycle() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let service = service(&store);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        let lb = service
            .create_lb(&ctx, "front", Uuid::new_v4(), 80, LbAlgorithm::RoundRobin)
            .await
            .unwrap();
        assert_eq!(lb.status, LbStatus::Creating);

        let instance = seed_instance(&store, &ctx, Some("c1")).await;
        service.add_target(&ctx, lb.id, instance.id, 80, 0).await.unwrap();
        let err = service.add_target(&ctx, lb.id, instance.id, 80, 1).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let targets = service.list_targets(&ctx, lb.id).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].weight, 1);

        service.remove_target(&ctx, lb.id, instance.id).await.unwrap();
        assert!(service.list_targets(&ctx, lb.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registry_calls_are_idempotent() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let service = service(&store);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        let lb = service
            .create_lb(&ctx, "front", Uuid::new_v4(), 80, LbAlgorithm::LeastConn)
            .await
            .unwrap();
        let instance = seed_instance(&store, &ctx, None).await;

        service.attach_target(&ctx, lb.id, instance.id, 80).await.unwrap();
        service.attach_target(&ctx, lb.id, instance.id, 80).await.unwrap();
        service.detach_target(&ctx, lb.id, instance.id).await.unwrap();
        service.detach_target(&ctx, lb.id, instance.id).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_lb_is_hidden() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let service = service(&store);
        let ctx = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        let lb = service
            .create_lb(&ctx, "front", Uuid::new_v4(), 80, LbAlgorithm::RoundRobin)
            .await
            .unwrap();
        service.delete_lb(&ctx, lb.id).await.unwrap();
        assert!(matches!(service.get_lb(&ctx, lb.id).await, Err(CoreError::NotFound(_))));
        assert!(service.list_lbs(&ctx).await.unwrap().is_empty());
        assert_eq!(store.get_lb(lb.id).await.unwrap().unwrap().status, LbStatus::Deleted);
    }
}
