//! Worker side of instance launch.
//!
//! Each task takes a STARTING instance to RUNNING. Backend resources are
//! recorded on an undo list as they are acquired; if a later step fails the
//! list is drained in reverse, the instance is marked TERMINATED and the
//! tenant's quota reservation is given back. Every write to the instance
//! row requires it to still be STARTING; if a terminate got there first the
//! undo list is drained and the quota is left to the terminate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nimbus_core::portmap::parse_ports;
use nimbus_core::queue::{PROVISION_QUEUE, dequeue_json};
use nimbus_core::{
    Clock, ComputeBackend, CoreError, CoreResult, CreateInstanceOptions, Limits, Metrics, Recorder, TaskQueue, UserData,
    VolumeAttachment,
};
use nimbus_state::{
    Instance, InstanceId, InstanceRepository, InstanceStatus, ResourceCounts, TenantRepository, VolumeRepository,
    VolumeStatus,
};

use crate::dns::DnsService;

const PROVISION_METRIC: &str = "nimbus_provision_total";

/// Host directory under which volume data lives.
const VOLUME_ROOT: &str = "/var/lib/nimbus/volumes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionTask {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub volumes: Vec<VolumeAttachment>,
    #[serde(default)]
    pub user_data: Option<UserData>,
}

/// A backend side effect that must be reverted if provisioning fails.
#[derive(Debug)]
enum Undo {
    DeleteContainer(String),
    DetachVolume(Uuid),
    UnregisterDns(InstanceId),
}

pub struct ProvisionWorker {
    instances: Arc<dyn InstanceRepository>,
    tenants: Arc<dyn TenantRepository>,
    volumes: Arc<dyn VolumeRepository>,
    tasks: Arc<dyn TaskQueue>,
    compute: Arc<dyn ComputeBackend>,
    dns: Arc<DnsService>,
    recorder: Recorder,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
    limits: Limits,
}

impl ProvisionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        tenants: Arc<dyn TenantRepository>,
        volumes: Arc<dyn VolumeRepository>,
        tasks: Arc<dyn TaskQueue>,
        compute: Arc<dyn ComputeBackend>,
        dns: Arc<DnsService>,
        recorder: Recorder,
        metrics: Arc<dyn Metrics>,
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
            recorder,
            metrics,
            clock,
            limits,
        }
    }

    /// Take one task off the queue. Returns `false` when the queue is empty.
    pub async fn process_next(&self) -> CoreResult<bool> {
        let Some(task) = dequeue_json::<ProvisionTask>(self.tasks.as_ref(), PROVISION_QUEUE).await? else {
            return Ok(false);
        };
        self.handle(task).await;
        Ok(true)
    }

    /// Drain everything currently queued.
    pub async fn drain(&self) -> CoreResult<usize> {
        let mut handled = 0;
        while self.process_next().await? {
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "provision worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.drain().await {
                        Ok(0) => {}
                        Ok(n) => debug!(tasks = n, "provision tick complete"),
                        Err(e) => error!(error = %e, "provision queue read failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("provision worker shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&self, task: ProvisionTask) {
        let id = task.instance_id;
        let instance = match self.instances.get_instance(id).await {
            Ok(Some(i)) => i,
            Ok(None) => {
                debug!(instance_id = %id, "instance gone before provisioning, skipping");
                return;
            }
            Err(e) => {
                warn!(instance_id = %id, error = %e, "instance lookup failed, dropping task");
                return;
            }
        };
        if instance.status != InstanceStatus::Starting {
            debug!(instance_id = %id, status = ?instance.status, "instance not starting, skipping");
            return;
        }

        let instance_type = match self.instances.get_instance_type(&instance.instance_type).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                let err = CoreError::Internal(format!("unknown instance type {}", instance.instance_type));
                self.fail(instance, None, &err).await;
                return;
            }
            Err(e) => {
                self.fail(instance, None, &CoreError::from(e)).await;
                return;
            }
        };

        let mut undo = Vec::new();
        match self
            .provision(instance.clone(), &task, instance_type.vcpus, instance_type.memory_mb, &mut undo)
            .await
        {
            Ok(None) => {
                info!(instance_id = %id, "instance changed during provisioning, rolling back");
                self.metrics.incr(PROVISION_METRIC, &[("outcome", "superseded")]);
                self.rollback(undo).await;
            }
            Ok(Some(running)) => {
                self.metrics.incr(PROVISION_METRIC, &[("outcome", "success")]);
                info!(
                    instance_id = %id,
                    container_id = running.container_id.as_deref().unwrap_or_default(),
                    private_ip = running.private_ip.as_deref().unwrap_or_default(),
                    "instance running"
                );
            }
            Err(e) => {
                self.rollback(undo).await;
                self.fail(instance, Some(instance_type.footprint()), &e).await;
            }
        }
    }

    /// `Ok(None)` when the row stopped being STARTING part way through.
    async fn provision(
        &self,
        instance: Instance,
        task: &ProvisionTask,
        vcpus: u32,
        memory_mb: u64,
        undo: &mut Vec<Undo>,
    ) -> CoreResult<Option<Instance>> {
        let opts = CreateInstanceOptions {
            name: instance.name.clone(),
            image: instance.image.clone(),
            ports: parse_ports(&instance.ports, self.limits.max_ports_per_instance)?,
            env: vec![
                ("NIMBUS_INSTANCE_ID".to_string(), instance.id.to_string()),
                ("NIMBUS_INSTANCE_NAME".to_string(), instance.name.clone()),
            ],
            cmd: Vec::new(),
            volume_binds: task
                .volumes
                .iter()
                .map(|v| format!("{VOLUME_ROOT}/{}:{}", v.volume_id, v.mount_path))
                .collect(),
            vcpus,
            memory_mb,
            user_data: task.user_data.clone(),
        };

        let container_id = self.compute.create_instance(&opts).await?;
        undo.push(Undo::DeleteContainer(container_id.clone()));
        let now = self.clock.now();
        let recorded = self
            .advance(instance.id, InstanceStatus::Starting, &|row| {
                row.container_id = Some(container_id.clone());
                row.updated_at = now;
            })
            .await?;
        let Some(instance) = recorded else {
            return Ok(None);
        };

        for attachment in &task.volumes {
            let mut volume = self
                .volumes
                .get_volume(attachment.volume_id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("volume {}", attachment.volume_id)))?;
            if volume.status != VolumeStatus::Available {
                return Err(CoreError::InvalidState(format!("volume {} is in use", volume.id)));
            }
            volume.status = VolumeStatus::InUse;
            volume.instance_id = Some(instance.id);
            volume.mount_path = Some(attachment.mount_path.clone());
            self.volumes.update_volume(&volume).await?;
            undo.push(Undo::DetachVolume(volume.id));
        }

        let ip = self.compute.instance_ip(&container_id).await?;
        if self.dns.register_instance(&instance, &ip).await?.is_some() {
            undo.push(Undo::UnregisterDns(instance.id));
        }

        let now = self.clock.now();
        self.advance(instance.id, InstanceStatus::Running, &|row| {
            row.status = InstanceStatus::Running;
            row.private_ip = Some(ip.clone());
            row.updated_at = now;
        })
        .await
    }

    /// Apply `step` only while the row is STARTING. Returns the row if the
    /// step was applied and left it in `reached`.
    async fn advance(
        &self,
        id: InstanceId,
        reached: InstanceStatus,
        step: &(dyn Fn(&mut Instance) + Send + Sync),
    ) -> CoreResult<Option<Instance>> {
        let row = self
            .instances
            .modify_instance(id, &|row| {
                if row.status != InstanceStatus::Starting {
                    return false;
                }
                step(row);
                true
            })
            .await?;
        Ok(row.filter(|r| r.status == reached))
    }

    async fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            info!(?step, "rolling back provisioning step");
            let result: CoreResult<()> = match &step {
                Undo::DeleteContainer(id) => self.compute.delete_instance(id).await.map_err(Into::into),
                Undo::DetachVolume(id) => self.detach_volume(*id).await,
                Undo::UnregisterDns(id) => self.dns.unregister_instance(*id).await,
            };
            if let Err(e) = result {
                warn!(?step, error = %e, "rollback step failed");
            }
        }
    }

    async fn detach_volume(&self, id: Uuid) -> CoreResult<()> {
        let Some(mut volume) = self.volumes.get_volume(id).await? else {
            return Ok(());
        };
        volume.status = VolumeStatus::Available;
        volume.instance_id = None;
        volume.mount_path = None;
        Ok(self.volumes.update_volume(&volume).await?)
    }

    /// Mark the instance TERMINATED and give back its reservation. If the
    /// row is gone or no longer STARTING a terminate owns the quota.
    async fn fail(&self, instance: Instance, footprint: Option<ResourceCounts>, err: &CoreError) {
        warn!(instance_id = %instance.id, error = %err, "provisioning failed");
        self.metrics.incr(PROVISION_METRIC, &[("outcome", "failure")]);

        let now = self.clock.now();
        let applied = AtomicBool::new(false);
        let marked = self
            .instances
            .modify_instance(instance.id, &|row| {
                if row.status != InstanceStatus::Starting {
                    return false;
                }
                row.status = InstanceStatus::Terminated;
                row.container_id = None;
                row.private_ip = None;
                row.updated_at = now;
                applied.store(true, Ordering::Relaxed);
                true
            })
            .await;
        let owns_quota = match marked {
            Ok(_) => applied.load(Ordering::Relaxed),
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "failed to mark instance terminated");
                false
            }
        };

        match footprint {
            Some(delta) if owns_quota => {
                if let Err(e) = self.tenants.release_usage(instance.tenant_id, delta).await {
                    error!(instance_id = %instance.id, error = %e, "failed to release tenant usage");
                }
            }
            Some(_) => debug!(instance_id = %instance.id, "instance changed concurrently, quota left to terminate"),
            None => warn!(instance_id = %instance.id, "footprint unknown, tenant usage not released"),
        }

        self.recorder
            .event(
                "instance.provision_failed",
                "instance",
                instance.id,
                json!({ "error": err.to_string(), "instance_type": instance.instance_type }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{Fixture, fixture, generous, params};
    use nimbus_core::{BackendResult, InstanceStats, Registry, StoreTaskQueue, SystemClock};
    use nimbus_state::{DnsRepository, EventRepository, Volume};

    fn worker(f: &Fixture, compute: Arc<dyn ComputeBackend>, metrics: Arc<Registry>) -> ProvisionWorker {
        let clock = Arc::new(SystemClock);
        ProvisionWorker::new(
            f.store.clone(),
            f.store.clone(),
            f.store.clone(),
            Arc::new(StoreTaskQueue::new(f.store.clone())),
            compute,
            f.dns.clone(),
            Recorder::new(f.store.clone(), f.store.clone(), clock.clone()),
            metrics,
            clock,
            Limits::default(),
        )
    }

    async fn usage(f: &Fixture) -> ResourceCounts {
        f.store
            .get_tenant(f.ctx.tenant_id().unwrap())
            .await
            .unwrap()
            .unwrap()
            .quota
            .usage
    }

    #[tokio::test]
    async fn provisions_to_running_with_dns_record() {
        let f = fixture(generous()).await;
        let metrics = Arc::new(Registry::new());
        let worker = worker(&f, f.compute.clone(), metrics.clone());

        let vpc = Uuid::new_v4();
        f.dns.create_zone(&f.ctx, vpc, "internal").await.unwrap();
        let mut p = params("Web");
        p.vpc_id = Some(vpc);
        let instance = f.service.launch(&f.ctx, p).await.unwrap();

        assert_eq!(worker.drain().await.unwrap(), 1);

        let running = f.store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(running.status, InstanceStatus::Running);
        assert!(running.private_ip.is_some());
        let container = f.compute.container(running.container_id.as_deref().unwrap()).unwrap();
        assert_eq!(container.opts.vcpus, 1);

        let records = f.store.list_records_for_instance(instance.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "web.internal");
        assert_eq!(metrics.counter(PROVISION_METRIC, &[("outcome", "success")]), 1);
    }

    #[tokio::test]
    async fn attaches_requested_volumes() {
        let f = fixture(generous()).await;
        let worker = worker(&f, f.compute.clone(), Arc::new(Registry::new()));
        let volume = Volume {
            id: Uuid::new_v4(),
            user_id: f.ctx.user_id().unwrap(),
            name: "data".into(),
            size_gb: 10,
            status: VolumeStatus::Available,
            instance_id: None,
            mount_path: None,
            created_at: chrono::Utc::now(),
        };
        f.store.create_volume(&volume).await.unwrap();

        let mut p = params("db");
        p.volumes = vec![VolumeAttachment {
            volume_id: volume.id,
            mount_path: "/data".into(),
        }];
        let instance = f.service.launch(&f.ctx, p).await.unwrap();
        worker.drain().await.unwrap();

        let attached = f.store.get_volume(volume.id).await.unwrap().unwrap();
        assert_eq!(attached.status, VolumeStatus::InUse);
        assert_eq!(attached.instance_id, Some(instance.id));

        // Terminate hands the volume back.
        f.service.terminate(&f.ctx, instance.id).await.unwrap();
        let released = f.store.get_volume(volume.id).await.unwrap().unwrap();
        assert_eq!(released.status, VolumeStatus::Available);
    }

    #[tokio::test]
    async fn backend_failure_terminates_and_restores_quota() {
        // One vCPU and 1024 MB of headroom: exactly one basic-1.
        let f = fixture(ResourceCounts {
            instances: 10,
            vcpus: 1,
            memory_mb: 1024,
        })
        .await;
        let metrics = Arc::new(Registry::new());
        let worker = worker(&f, f.compute.clone(), metrics.clone());
        let before = usage(&f).await;

        let instance = f.service.launch(&f.ctx, params("web")).await.unwrap();
        assert_eq!(usage(&f).await.vcpus, 1);

        f.compute.fail_next_creates(1);
        worker.drain().await.unwrap();

        let row = f.store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Terminated);
        assert_eq!(usage(&f).await, before);
        assert_eq!(metrics.counter(PROVISION_METRIC, &[("outcome", "failure")]), 1);

        let events = f.store.list_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.action == "instance.provision_failed"));

        // Terminating the dead row must not release the quota a second time.
        f.service.terminate(&f.ctx, instance.id).await.unwrap();
        assert_eq!(usage(&f).await, before);
    }

    #[tokio::test]
    async fn late_failure_rolls_back_container_and_dns() {
        let f = fixture(generous()).await;
        let worker = worker(&f, f.compute.clone(), Arc::new(Registry::new()));

        let vpc = Uuid::new_v4();
        f.dns.create_zone(&f.ctx, vpc, "internal").await.unwrap();
        let mut p = params("web");
        p.vpc_id = Some(vpc);
        // The volume is taken between admission and provisioning, so the
        // step after container creation fails.
        let volume = Volume {
            id: Uuid::new_v4(),
            user_id: f.ctx.user_id().unwrap(),
            name: "data".into(),
            size_gb: 1,
            status: VolumeStatus::Available,
            instance_id: None,
            mount_path: None,
            created_at: chrono::Utc::now(),
        };
        f.store.create_volume(&volume).await.unwrap();
        p.volumes = vec![VolumeAttachment {
            volume_id: volume.id,
            mount_path: "/data".into(),
        }];
        let instance = f.service.launch(&f.ctx, p).await.unwrap();

        let mut taken = volume.clone();
        taken.status = VolumeStatus::InUse;
        f.store.update_volume(&taken).await.unwrap();

        worker.drain().await.unwrap();

        assert_eq!(f.compute.container_count(), 0);
        assert!(f.store.list_records_for_instance(instance.id).await.unwrap().is_empty());
        let row = f.store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Terminated);
    }

    #[tokio::test]
    async fn skips_instances_no_longer_starting() {
        let f = fixture(generous()).await;
        let worker = worker(&f, f.compute.clone(), Arc::new(Registry::new()));
        let instance = f.service.launch(&f.ctx, params("web")).await.unwrap();
        f.service.terminate(&f.ctx, instance.id).await.unwrap();

        assert_eq!(worker.drain().await.unwrap(), 1);
        assert_eq!(f.compute.container_count(), 0);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Hook {
        Create,
        Ip,
    }

    /// Terminates the first instance it sees at the hooked backend call.
    struct TerminateDuring {
        f: Arc<Fixture>,
        at: Hook,
        fired: AtomicBool,
    }

    impl TerminateDuring {
        async fn maybe_terminate(&self, hook: Hook, instance_id: InstanceId) {
            if self.at == hook && !self.fired.swap(true, Ordering::SeqCst) {
                self.f.service.terminate(&self.f.ctx, instance_id).await.unwrap();
            }
        }
    }

    fn instance_of(opts: &CreateInstanceOptions) -> InstanceId {
        let (_, id) = opts.env.iter().find(|(k, _)| k == "NIMBUS_INSTANCE_ID").unwrap();
        id.parse().unwrap()
    }

    #[async_trait::async_trait]
    impl ComputeBackend for TerminateDuring {
        async fn create_instance(&self, opts: &CreateInstanceOptions) -> BackendResult<String> {
            self.maybe_terminate(Hook::Create, instance_of(opts)).await;
            self.f.compute.create_instance(opts).await
        }
        async fn start_instance(&self, id: &str) -> BackendResult<()> {
            self.f.compute.start_instance(id).await
        }
        async fn stop_instance(&self, id: &str) -> BackendResult<()> {
            self.f.compute.stop_instance(id).await
        }
        async fn delete_instance(&self, id: &str) -> BackendResult<()> {
            self.f.compute.delete_instance(id).await
        }
        async fn exec(&self, id: &str, cmd: &[String]) -> BackendResult<String> {
            self.f.compute.exec(id, cmd).await
        }
        async fn instance_ip(&self, id: &str) -> BackendResult<String> {
            if let Some(container) = self.f.compute.container(id) {
                self.maybe_terminate(Hook::Ip, instance_of(&container.opts)).await;
            }
            self.f.compute.instance_ip(id).await
        }
        async fn instance_logs(&self, id: &str) -> BackendResult<String> {
            self.f.compute.instance_logs(id).await
        }
        async fn instance_stats(&self, id: &str) -> BackendResult<InstanceStats> {
            self.f.compute.instance_stats(id).await
        }
        async fn instance_port(&self, id: &str, container_port: u16) -> BackendResult<u16> {
            self.f.compute.instance_port(id, container_port).await
        }
        async fn ping(&self) -> BackendResult<()> {
            self.f.compute.ping().await
        }
    }

    /// Launches a victim and a bystander, terminates the victim at `at` and
    /// checks nothing of the victim survives and quota was released once.
    async fn terminate_mid_provision(at: Hook) -> Arc<Registry> {
        let f = Arc::new(fixture(generous()).await);
        let metrics = Arc::new(Registry::new());
        let backend = Arc::new(TerminateDuring {
            f: f.clone(),
            at,
            fired: AtomicBool::new(false),
        });
        let worker = worker(&f, backend, metrics.clone());

        let vpc = Uuid::new_v4();
        f.dns.create_zone(&f.ctx, vpc, "internal").await.unwrap();
        let mut p = params("victim");
        p.vpc_id = Some(vpc);
        let victim = f.service.launch(&f.ctx, p).await.unwrap();
        let bystander = f.service.launch(&f.ctx, params("bystander")).await.unwrap();

        assert_eq!(worker.drain().await.unwrap(), 2);

        assert!(f.store.get_instance(victim.id).await.unwrap().is_none());
        assert!(f.store.list_records_for_instance(victim.id).await.unwrap().is_empty());
        let survivor = f.store.get_instance(bystander.id).await.unwrap().unwrap();
        assert_eq!(survivor.status, InstanceStatus::Running);
        assert_eq!(f.compute.container_count(), 1);
        assert_eq!(
            usage(&f).await,
            ResourceCounts {
                instances: 1,
                vcpus: 1,
                memory_mb: 1024
            }
        );
        metrics
    }

    #[tokio::test]
    async fn terminate_during_container_create_rolls_back() {
        let metrics = terminate_mid_provision(Hook::Create).await;
        assert_eq!(metrics.counter(PROVISION_METRIC, &[("outcome", "superseded")]), 1);
        assert_eq!(metrics.counter(PROVISION_METRIC, &[("outcome", "success")]), 1);
    }

    #[tokio::test]
    async fn terminate_after_container_recorded_is_not_resurrected() {
        let metrics = terminate_mid_provision(Hook::Ip).await;
        assert_eq!(metrics.counter(PROVISION_METRIC, &[("outcome", "failure")]), 1);
        assert_eq!(metrics.counter(PROVISION_METRIC, &[("outcome", "success")]), 1);
    }
}
