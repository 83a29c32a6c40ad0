//! Instance admission, start/stop and teardown.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use nimbus_core::authz::permissions;
use nimbus_core::portmap::{format_ports, parse_ports};
use nimbus_core::queue::{PROVISION_QUEUE, enqueue_json};
use nimbus_core::{
    AuditAction, Authorizer, BackendError, Clock, ComputeBackend, CoreError, CoreResult, InstanceLifecycle, LaunchParams,
    Limits, Recorder, RequestContext, TaskQueue, require_permission,
};
use nimbus_state::{
    Instance, InstanceId, InstanceRepository, InstanceStatus, InstanceType, ResourceCounts, TenantRepository,
    VolumeRepository, VolumeStatus,
};

use crate::dns::DnsService;
use crate::provision::ProvisionTask;

/// Instance types available out of the box.
pub const DEFAULT_INSTANCE_TYPES: &[(&str, u32, u64, u32)] = &[
    ("basic-1", 1, 1024, 20),
    ("basic-2", 2, 2048, 40),
    ("standard-4", 4, 8192, 80),
    ("memory-4", 4, 16384, 80),
];

/// Resource string used in authorization checks.
pub fn instance_arn(id: InstanceId) -> String {
    format!("arn:nimbus:instance:{id}")
}

pub struct InstanceService {
    instances: Arc<dyn InstanceRepository>,
    tenants: Arc<dyn TenantRepository>,
    volumes: Arc<dyn VolumeRepository>,
    tasks: Arc<dyn TaskQueue>,
    compute: Arc<dyn ComputeBackend>,
    dns: Arc<DnsService>,
    authz: Arc<dyn Authorizer>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
    limits: Limits,
}

impl InstanceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        tenants: Arc<dyn TenantRepository>,
        volumes: Arc<dyn VolumeRepository>,
        tasks: Arc<dyn TaskQueue>,
        compute: Arc<dyn ComputeBackend>,
        dns: Arc<DnsService>,
        authz: Arc<dyn Authorizer>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
        limits: Limits,
    ) -> Self {
        Self {
            instances,
            tenants,
            volumes,
            tasks,
            compute,
            dns,
            authz,
            recorder,
            clock,
            limits,
        }
    }

    /// Store [`DEFAULT_INSTANCE_TYPES`] if they are missing.
    pub async fn seed_instance_types(&self) -> CoreResult<()> {
        for &(id, vcpus, memory_mb, disk_gb) in DEFAULT_INSTANCE_TYPES {
            if self.instances.get_instance_type(id).await?.is_none() {
                self.instances
                    .put_instance_type(&InstanceType {
                        id: id.to_string(),
                        vcpus,
                        memory_mb,
                        disk_gb,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn list_instance_types(&self) -> CoreResult<Vec<InstanceType>> {
        Ok(self.instances.list_instance_types().await?)
    }

    async fn owned(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<Instance> {
        let user_id = ctx.user_id()?;
        self.instances
            .get_instance(id)
            .await?
            .filter(|i| i.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("instance {id}")))
    }

    /// Admit an instance: reserve quota, persist it as STARTING and queue
    /// provisioning. The returned instance is not running yet.
    pub async fn launch(&self, ctx: &RequestContext, params: LaunchParams) -> CoreResult<Instance> {
        let user_id = ctx.user_id()?;
        let tenant_id = ctx.tenant_id()?;
        require_permission(self.authz.as_ref(), ctx, permissions::INSTANCE_LAUNCH, "*").await?;

        let name = params.name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("instance name is required".into()));
        }
        if params.image.trim().is_empty() {
            return Err(CoreError::InvalidInput("image is required".into()));
        }
        let ports = format_ports(&parse_ports(&params.ports, self.limits.max_ports_per_instance)?);

        let instance_type = self
            .instances
            .get_instance_type(&params.instance_type)
            .await?
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown instance type {:?}", params.instance_type)))?;

        for attachment in &params.volumes {
            let volume = self
                .volumes
                .get_volume(attachment.volume_id)
                .await?
                .filter(|v| v.user_id == user_id)
                .ok_or_else(|| CoreError::InvalidInput(format!("unknown volume {}", attachment.volume_id)))?;
            if volume.status != VolumeStatus::Available {
                return Err(CoreError::InvalidInput(format!("volume {} is in use", volume.id)));
            }
            if !attachment.mount_path.starts_with('/') {
                return Err(CoreError::InvalidInput(format!(
                    "mount path {:?} must be absolute",
                    attachment.mount_path
                )));
            }
        }

        let footprint = instance_type.footprint();
        if !self.tenants.reserve_usage(tenant_id, footprint).await? {
            return Err(CoreError::ResourceLimitExceeded(format!(
                "tenant quota does not admit {} ({} vCPU, {} MB)",
                instance_type.id, instance_type.vcpus, instance_type.memory_mb
            )));
        }

        let now = self.clock.now();
        let instance = Instance {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            name: name.to_string(),
            image: params.image.trim().to_string(),
            ports,
            status: InstanceStatus::Starting,
            vpc_id: params.vpc_id,
            container_id: None,
            instance_type: instance_type.id.clone(),
            private_ip: None,
            created_at: now,
            updated_at: now,
        };

        let task = ProvisionTask {
            instance_id: instance.id,
            volumes: params.volumes,
            user_data: params.user_data,
        };
        let admitted = async {
            self.instances.create_instance(&instance).await?;
            enqueue_json(self.tasks.as_ref(), PROVISION_QUEUE, &task).await
        }
        .await;
        if let Err(e) = admitted {
            warn!(instance_id = %instance.id, error = %e, "launch failed after quota reservation, compensating");
            if let Err(e) = self.instances.delete_instance(instance.id).await {
                warn!(instance_id = %instance.id, error = %e, "failed to remove half-admitted instance");
            }
            self.release(tenant_id, footprint).await;
            return Err(e);
        }

        info!(
            instance_id = %instance.id,
            name = %instance.name,
            instance_type = %instance.instance_type,
            "instance admitted"
        );
        self.recorder
            .audit(
                ctx,
                AuditAction::InstanceLaunch {
                    instance_id: instance.id,
                    name: instance.name.clone(),
                    image: instance.image.clone(),
                    instance_type: instance.instance_type.clone(),
                },
            )
            .await;
        Ok(instance)
    }

    async fn release(&self, tenant_id: nimbus_state::TenantId, footprint: ResourceCounts) {
        if let Err(e) = self.tenants.release_usage(tenant_id, footprint).await {
            warn!(%tenant_id, error = %e, "failed to release tenant usage");
        }
    }

    pub async fn get(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<Instance> {
        require_permission(self.authz.as_ref(), ctx, permissions::INSTANCE_READ, &instance_arn(id)).await?;
        self.owned(ctx, id).await
    }

    pub async fn list(&self, ctx: &RequestContext) -> CoreResult<Vec<Instance>> {
        require_permission(self.authz.as_ref(), ctx, permissions::INSTANCE_READ, "*").await?;
        Ok(self.instances.list_instances(ctx.user_id()?).await?)
    }

    pub async fn logs(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<String> {
        let instance = self.get(ctx, id).await?;
        let Some(container_id) = instance.container_id else {
            return Ok(String::new());
        };
        Ok(self.compute.instance_logs(&container_id).await?)
    }

    pub async fn start(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<Instance> {
        require_permission(self.authz.as_ref(), ctx, permissions::INSTANCE_START, &instance_arn(id)).await?;
        let instance = self.owned(ctx, id).await?;
        let container_id = controllable(&instance)?;
        self.compute.start_instance(&container_id).await?;
        let instance = self.set_status(id, InstanceStatus::Running).await?;
        info!(instance_id = %id, "instance started");
        self.recorder.audit(ctx, AuditAction::InstanceStart { instance_id: id }).await;
        Ok(instance)
    }

    pub async fn stop(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<Instance> {
        require_permission(self.authz.as_ref(), ctx, permissions::INSTANCE_STOP, &instance_arn(id)).await?;
        let instance = self.owned(ctx, id).await?;
        let container_id = controllable(&instance)?;
        self.compute.stop_instance(&container_id).await?;
        let instance = self.set_status(id, InstanceStatus::Stopped).await?;
        info!(instance_id = %id, "instance stopped");
        self.recorder.audit(ctx, AuditAction::InstanceStop { instance_id: id }).await;
        Ok(instance)
    }

    /// Record a start or stop unless the row was terminated meanwhile.
    async fn set_status(&self, id: InstanceId, status: InstanceStatus) -> CoreResult<Instance> {
        let now = self.clock.now();
        let row = self
            .instances
            .modify_instance(id, &|row| {
                if row.status == InstanceStatus::Terminated {
                    return false;
                }
                row.status = status;
                row.updated_at = now;
                true
            })
            .await?
            .ok_or_else(|| CoreError::not_found(format!("instance {id}")))?;
        if row.status != status {
            return Err(CoreError::InvalidState(format!("instance {id} is terminated")));
        }
        Ok(row)
    }

    /// Remove the row, then delete at the backend and clean up everything
    /// else best-effort. Cleanup works from the row as it was removed, so a
    /// container recorded by a concurrent provision is not missed.
    pub async fn terminate(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<()> {
        require_permission(self.authz.as_ref(), ctx, permissions::INSTANCE_TERMINATE, &instance_arn(id)).await?;
        self.owned(ctx, id).await?;
        let instance = self
            .instances
            .delete_instance(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("instance {id}")))?;

        if let Some(container_id) = &instance.container_id {
            match self.compute.delete_instance(container_id).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    // Put the row back so the terminate can be retried.
                    if let Err(restore) = self.instances.create_instance(&instance).await {
                        error!(instance_id = %id, error = %restore, "failed to restore instance after backend error");
                    }
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.dns.unregister_instance(id).await {
            warn!(instance_id = %id, error = %e, "dns cleanup failed");
        }
        match self.volumes.list_volumes_for_instance(id).await {
            Ok(volumes) => {
                for mut volume in volumes {
                    volume.status = VolumeStatus::Available;
                    volume.instance_id = None;
                    volume.mount_path = None;
                    if let Err(e) = self.volumes.update_volume(&volume).await {
                        warn!(instance_id = %id, volume_id = %volume.id, error = %e, "volume release failed");
                    }
                }
            }
            Err(e) => warn!(instance_id = %id, error = %e, "volume lookup failed"),
        }

        // A failed provision has already given the quota back.
        if instance.status != InstanceStatus::Terminated {
            match self.instances.get_instance_type(&instance.instance_type).await {
                Ok(Some(t)) => self.release(instance.tenant_id, t.footprint()).await,
                Ok(None) => warn!(instance_id = %id, instance_type = %instance.instance_type, "unknown type, quota not released"),
                Err(e) => warn!(instance_id = %id, error = %e, "type lookup failed, quota not released"),
            }
        }

        info!(instance_id = %id, "instance terminated");
        self.recorder
            .event("instance.terminated", "instance", id, json!({ "name": instance.name }))
            .await;
        self.recorder
            .audit(ctx, AuditAction::InstanceTerminate { instance_id: id })
            .await;
        Ok(())
    }
}

/// Backend id of an instance that can be started or stopped.
fn controllable(instance: &Instance) -> CoreResult<String> {
    match (instance.status, &instance.container_id) {
        (InstanceStatus::Terminated, _) => Err(CoreError::InvalidState(format!("instance {} is terminated", instance.id))),
        (InstanceStatus::Starting, _) | (_, None) => Err(CoreError::InvalidState(format!(
            "instance {} is still provisioning",
            instance.id
        ))),
        (_, Some(c)) => Ok(c.clone()),
    }
}

#[async_trait]
impl InstanceLifecycle for InstanceService {
    async fn launch(&self, ctx: &RequestContext, params: LaunchParams) -> CoreResult<Instance> {
        InstanceService::launch(self, ctx, params).await
    }

    async fn terminate(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<()> {
        InstanceService::terminate(self, ctx, id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_core::sim::{SimCompute, SimDns, StaticAuthorizer};
    use nimbus_core::{StoreTaskQueue, SystemClock, VolumeAttachment};
    use nimbus_state::{StateStore, Tenant, TenantId, TenantQuota, TaskRepository};
    use rand::{Rng, SeedableRng};

    pub(crate) struct Fixture {
        pub store: Arc<StateStore>,
        pub compute: Arc<SimCompute>,
        pub dns_backend: Arc<SimDns>,
        pub dns: Arc<DnsService>,
        pub authz: Arc<StaticAuthorizer>,
        pub service: InstanceService,
        pub ctx: RequestContext,
    }

    pub(crate) async fn seed_tenant(store: &StateStore, limits: ResourceCounts) -> TenantId {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: format!("t-{}", Uuid::new_v4().simple()),
            name: "tenant".into(),
            owner_id: Uuid::new_v4(),
            quota: TenantQuota {
                limits,
                usage: ResourceCounts::default(),
            },
            created_at: Utc::now(),
        };
        store.create_tenant(&tenant).await.unwrap();
        tenant.id
    }

    pub(crate) async fn fixture(limits: ResourceCounts) -> Fixture {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let compute = Arc::new(SimCompute::new());
        let dns_backend = Arc::new(SimDns::new());
        let clock = Arc::new(SystemClock);
        let recorder = Recorder::new(store.clone(), store.clone(), clock.clone());
        let dns = Arc::new(DnsService::new(store.clone(), dns_backend.clone(), recorder.clone(), clock.clone()));
        let authz = Arc::new(StaticAuthorizer::allow_all());
        let service = InstanceService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(StoreTaskQueue::new(store.clone())),
            compute.clone(),
            dns.clone(),
            authz.clone(),
            recorder,
            clock,
            Limits::default(),
        );
        service.seed_instance_types().await.unwrap();
        let tenant_id = seed_tenant(&store, limits).await;
        let ctx = RequestContext::new(Uuid::new_v4(), tenant_id);
        Fixture {
            store,
            compute,
            dns_backend,
            dns,
            authz,
            service,
            ctx,
        }
    }

    pub(crate) fn generous() -> ResourceCounts {
        ResourceCounts {
            instances: 100,
            vcpus: 400,
            memory_mb: 1 << 20,
        }
    }

    pub(crate) fn params(name: &str) -> LaunchParams {
        LaunchParams {
            name: name.into(),
            image: "nginx:1.27".into(),
            ports: "8080:80".into(),
            instance_type: "basic-1".into(),
            ..Default::default()
        }
    }

    async fn usage(store: &StateStore, tenant_id: TenantId) -> ResourceCounts {
        store.get_tenant(tenant_id).await.unwrap().unwrap().quota.usage
    }

    #[tokio::test]
    async fn launch_reserves_quota_and_queues_provisioning() {
        let f = fixture(generous()).await;
        let instance = f.service.launch(&f.ctx, params("web")).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Starting);
        assert_eq!(instance.ports, "8080:80");

        let used = usage(&f.store, f.ctx.tenant_id().unwrap()).await;
        assert_eq!(used, ResourceCounts { instances: 1, vcpus: 1, memory_mb: 1024 });

        let raw = f.store.pop_task(PROVISION_QUEUE).await.unwrap().unwrap();
        let task: ProvisionTask = serde_json::from_slice(&raw).unwrap();
        assert_eq!(task.instance_id, instance.id);
    }

    #[tokio::test]
    async fn launch_validation() {
        let f = fixture(generous()).await;
        let mut bad_type = params("web");
        bad_type.instance_type = "huge-99".into();
        assert!(matches!(f.service.launch(&f.ctx, bad_type).await, Err(CoreError::InvalidInput(_))));

        let mut bad_ports = params("web");
        bad_ports.ports = "80".into();
        assert!(matches!(f.service.launch(&f.ctx, bad_ports).await, Err(CoreError::InvalidPortFormat(_))));

        let mut bad_volume = params("web");
        bad_volume.volumes = vec![VolumeAttachment {
            volume_id: Uuid::new_v4(),
            mount_path: "/data".into(),
        }];
        assert!(matches!(f.service.launch(&f.ctx, bad_volume).await, Err(CoreError::InvalidInput(_))));

        // Nothing was reserved by the rejected launches.
        assert_eq!(usage(&f.store, f.ctx.tenant_id().unwrap()).await, ResourceCounts::default());
    }

    #[tokio::test]
    async fn quota_exceeded_is_rejected() {
        let f = fixture(ResourceCounts {
            instances: 1,
            vcpus: 4,
            memory_mb: 8192,
        })
        .await;
        f.service.launch(&f.ctx, params("a")).await.unwrap();
        let err = f.service.launch(&f.ctx, params("b")).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceLimitExceeded(_)));
    }

    #[tokio::test]
    async fn launch_requires_permission() {
        let f = fixture(generous()).await;
        f.authz.deny(f.ctx.user_id().unwrap(), permissions::INSTANCE_LAUNCH);
        let err = f.service.launch(&f.ctx, params("web")).await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn start_terminated_instance_is_invalid_state() {
        let f = fixture(generous()).await;
        let instance = f.service.launch(&f.ctx, params("web")).await.unwrap();
        f.store
            .modify_instance(instance.id, &|row| {
                row.status = InstanceStatus::Terminated;
                true
            })
            .await
            .unwrap();
        let err = f.service.start(&f.ctx, instance.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn terminate_releases_quota_and_row() {
        let f = fixture(generous()).await;
        let instance = f.service.launch(&f.ctx, params("web")).await.unwrap();
        f.service.terminate(&f.ctx, instance.id).await.unwrap();

        assert!(f.store.get_instance(instance.id).await.unwrap().is_none());
        assert_eq!(usage(&f.store, f.ctx.tenant_id().unwrap()).await, ResourceCounts::default());
        assert!(matches!(
            f.service.terminate(&f.ctx, instance.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn other_users_instances_are_invisible() {
        let f = fixture(generous()).await;
        let instance = f.service.launch(&f.ctx, params("web")).await.unwrap();
        let stranger = RequestContext::new(Uuid::new_v4(), f.ctx.tenant_id().unwrap());
        assert!(matches!(f.service.get(&stranger, instance.id).await, Err(CoreError::NotFound(_))));
        assert!(f.service.list(&stranger).await.unwrap().is_empty());
    }

    /// Random launch/terminate traces keep tenant usage equal to the sum of
    /// live footprints.
    #[tokio::test]
    async fn usage_matches_live_instances_over_random_trace() {
        let f = fixture(ResourceCounts {
            instances: 6,
            vcpus: 12,
            memory_mb: 24_576,
        })
        .await;
        let tenant_id = f.ctx.tenant_id().unwrap();
        let types = ["basic-1", "basic-2", "standard-4"];
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut live: Vec<(InstanceId, ResourceCounts)> = Vec::new();

        for step in 0..60 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let t = types[rng.gen_range(0..types.len())];
                let mut p = params(&format!("i-{step}"));
                p.instance_type = t.into();
                match f.service.launch(&f.ctx, p).await {
                    Ok(instance) => {
                        let ty = f.store.get_instance_type(t).await.unwrap().unwrap();
                        live.push((instance.id, ty.footprint()));
                    }
                    Err(CoreError::ResourceLimitExceeded(_)) => {}
                    Err(e) => panic!("unexpected launch error: {e}"),
                }
            } else {
                let (id, _) = live.remove(rng.gen_range(0..live.len()));
                f.service.terminate(&f.ctx, id).await.unwrap();
            }

            let expected = live.iter().fold(ResourceCounts::default(), |acc, (_, fp)| ResourceCounts {
                instances: acc.instances + fp.instances,
                vcpus: acc.vcpus + fp.vcpus,
                memory_mb: acc.memory_mb + fp.memory_mb,
            });
            assert_eq!(usage(&f.store, tenant_id).await, expected, "step {step}");
        }
    }
}
