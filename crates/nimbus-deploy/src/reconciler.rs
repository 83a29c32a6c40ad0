//! Replica reconciler.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nimbus_core::{Clock, CoreError, CoreResult, InstanceLifecycle, LaunchParams, Recorder, RequestContext};
use nimbus_state::{Deployment, DeploymentId, DeploymentRepository, DeploymentStatus, InstanceId};

/// Instance type used for deployment containers.
pub const CONTAINER_INSTANCE_TYPE: &str = "basic-1";

pub struct DeploymentReconciler {
    deployments: Arc<dyn DeploymentRepository>,
    lifecycle: Arc<dyn InstanceLifecycle>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl DeploymentReconciler {
    pub fn new(
        deployments: Arc<dyn DeploymentRepository>,
        lifecycle: Arc<dyn InstanceLifecycle>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            deployments,
            lifecycle,
            recorder,
            clock,
        }
    }

    pub async fn reconcile_all(&self) -> anyhow::Result<usize> {
        let deployments = self.deployments.list_deployments().await?;
        let count = deployments.len();
        for deployment in deployments {
            let id = deployment.id;
            if let Err(e) = self.reconcile(deployment).await {
                warn!(deployment_id = %id, error = %e, "deployment reconcile failed");
            }
        }
        debug!(deployments = count, "deployment tick complete");
        Ok(count)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "deployment reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "deployment tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("deployment reconciler shutting down");
                    break;
                }
            }
        }
    }

    async fn reconcile(&self, mut deployment: Deployment) -> CoreResult<()> {
        let original = deployment.clone();
        let owner = RequestContext::new(deployment.user_id, deployment.tenant_id);
        let mut members = self.deployments.get_deployment_containers(deployment.id).await?;

        if deployment.status == DeploymentStatus::Deleting {
            if members.is_empty() {
                self.deployments.delete_deployment(deployment.id).await?;
                info!(deployment_id = %deployment.id, "deployment deleted");
                self.recorder
                    .event("deployment.deleted", "deployment", deployment.id, json!({ "name": deployment.name }))
                    .await;
                return Ok(());
            }
            let all = members.len();
            self.terminate_oldest(&owner, deployment.id, &mut members, all).await;
            deployment.current_count = members.len() as u32;
            return self.persist(&original, deployment).await;
        }

        let current = members.len() as u32;
        if current < deployment.replicas {
            for _ in current..deployment.replicas {
                let params = LaunchParams {
                    name: format!("{}-{}", deployment.name, &Uuid::new_v4().simple().to_string()[..8]),
                    image: deployment.image.clone(),
                    ports: deployment.ports.clone(),
                    instance_type: CONTAINER_INSTANCE_TYPE.to_string(),
                    ..Default::default()
                };
                match self.lifecycle.launch(&owner, params).await {
                    Ok(instance) => {
                        if let Err(e) = self.deployments.add_deployment_container(deployment.id, instance.id).await {
                            warn!(deployment_id = %deployment.id, instance_id = %instance.id, error = %e, "membership write failed");
                            if let Err(e) = self.lifecycle.terminate(&owner, instance.id).await {
                                error!(instance_id = %instance.id, error = %e, "failed to terminate untracked container");
                            }
                            break;
                        }
                        members.push(instance.id);
                        info!(deployment_id = %deployment.id, instance_id = %instance.id, "container launched");
                    }
                    Err(e) => {
                        warn!(deployment_id = %deployment.id, error = %e, "container launch failed");
                        break;
                    }
                }
            }
        } else if current > deployment.replicas {
            let excess = (current - deployment.replicas) as usize;
            self.terminate_oldest(&owner, deployment.id, &mut members, excess).await;
        }

        deployment.current_count = members.len() as u32;
        deployment.status = if deployment.current_count == deployment.replicas {
            DeploymentStatus::Ready
        } else {
            DeploymentStatus::Scaling
        };
        self.persist(&original, deployment).await
    }

    /// Terminate `count` containers in join order.
    async fn terminate_oldest(
        &self,
        owner: &RequestContext,
        id: DeploymentId,
        members: &mut Vec<InstanceId>,
        count: usize,
    ) {
        for _ in 0..count {
            let Some(&instance_id) = members.first() else {
                return;
            };
            match self.lifecycle.terminate(owner, instance_id).await {
                Ok(()) | Err(CoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(deployment_id = %id, %instance_id, error = %e, "container terminate failed");
                    return;
                }
            }
            if let Err(e) = self.deployments.remove_deployment_container(id, instance_id).await {
                warn!(deployment_id = %id, %instance_id, error = %e, "membership removal failed");
                return;
            }
            members.remove(0);
            info!(deployment_id = %id, %instance_id, "container terminated");
        }
    }

    /// Write back the replica count against the row as stored now, so a
    /// concurrent scale or delete is kept.
    async fn persist(&self, original: &Deployment, deployment: Deployment) -> CoreResult<()> {
        if deployment == *original {
            return Ok(());
        }
        let now = self.clock.now();
        let stored = self
            .deployments
            .modify_deployment(deployment.id, &|row: &mut Deployment| {
                row.current_count = deployment.current_count;
                if row.status != DeploymentStatus::Deleting {
                    row.status = if row.current_count == row.replicas {
                        DeploymentStatus::Ready
                    } else {
                        DeploymentStatus::Scaling
                    };
                }
                row.updated_at = now;
                true
            })
            .await?;
        if stored.is_none() {
            debug!(deployment_id = %deployment.id, "deployment removed during tick");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{CreateDeploymentRequest, DeploymentService};
    use nimbus_core::sim::SimFleet;
    use nimbus_core::{Limits, SystemClock};
    use nimbus_state::StateStore;

    struct Harness {
        store: Arc<StateStore>,
        fleet: Arc<SimFleet>,
        service: DeploymentService,
        reconciler: DeploymentReconciler,
        ctx: RequestContext,
    }

    fn harness() -> Harness {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let fleet = Arc::new(SimFleet::new());
        let clock = Arc::new(SystemClock);
        let recorder = Recorder::new(store.clone(), store.clone(), clock.clone());
        Harness {
            service: DeploymentService::new(store.clone(), recorder.clone(), clock.clone(), Limits::default()),
            reconciler: DeploymentReconciler::new(store.clone(), fleet.clone(), recorder, clock),
            store,
            fleet,
            ctx: RequestContext::new(Uuid::new_v4(), Uuid::new_v4()),
        }
    }

    async fn create(h: &Harness, replicas: u32) -> Deployment {
        h.service
            .create_deployment(
                &h.ctx,
                CreateDeploymentRequest {
                    name: "api".into(),
                    image: "api:1".into(),
                    replicas,
                    ports: "0:8080".into(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn scales_up_to_ready() {
        let h = harness();
        let d = create(&h, 3).await;
        h.reconciler.reconcile_all().await.unwrap();

        let row = h.store.get_deployment(d.id).await.unwrap().unwrap();
        assert_eq!(row.current_count, 3);
        assert_eq!(row.status, DeploymentStatus::Ready);
        let launched = h.fleet.launched();
        assert_eq!(launched.len(), 3);
        assert!(launched.iter().all(|i| i.vpc_id.is_none() && i.instance_type == CONTAINER_INSTANCE_TYPE));
    }

    #[tokio::test]
    async fn launch_failure_stops_the_tick() {
        let h = harness();
        let d = create(&h, 3).await;
        h.fleet.fail_next_launches(1);
        h.reconciler.reconcile_all().await.unwrap();

        let row = h.store.get_deployment(d.id).await.unwrap().unwrap();
        assert_eq!(row.current_count, 0);
        assert_eq!(row.status, DeploymentStatus::Scaling);

        h.reconciler.reconcile_all().await.unwrap();
        let row = h.store.get_deployment(d.id).await.unwrap().unwrap();
        assert_eq!(row.status, DeploymentStatus::Ready);
    }

    #[tokio::test]
    async fn scale_down_removes_oldest_first() {
        let h = harness();
        let d = create(&h, 3).await;
        h.reconciler.reconcile_all().await.unwrap();
        let members = h.store.get_deployment_containers(d.id).await.unwrap();

        h.service.scale_deployment(&h.ctx, d.id, 1).await.unwrap();
        h.reconciler.reconcile_all().await.unwrap();

        assert_eq!(h.fleet.terminated(), vec![members[0], members[1]]);
        assert_eq!(h.store.get_deployment_containers(d.id).await.unwrap(), vec![members[2]]);
    }

    /// Marks the deployment DELETING the moment a container is launched.
    struct DeletedWhileLaunching {
        store: Arc<StateStore>,
        fleet: Arc<SimFleet>,
        deployment_id: DeploymentId,
    }

    #[async_trait::async_trait]
    impl InstanceLifecycle for DeletedWhileLaunching {
        async fn launch(&self, ctx: &RequestContext, params: LaunchParams) -> CoreResult<nimbus_state::Instance> {
            self.store
                .modify_deployment(self.deployment_id, &|d: &mut Deployment| {
                    d.status = DeploymentStatus::Deleting;
                    d.replicas = 0;
                    true
                })
                .await?;
            self.fleet.launch(ctx, params).await
        }

        async fn terminate(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<()> {
            self.fleet.terminate(ctx, id).await
        }
    }

    #[tokio::test]
    async fn delete_during_tick_is_not_reverted() {
        let h = harness();
        let d = create(&h, 2).await;
        let clock = Arc::new(SystemClock);
        let reconciler = DeploymentReconciler::new(
            h.store.clone(),
            Arc::new(DeletedWhileLaunching {
                store: h.store.clone(),
                fleet: h.fleet.clone(),
                deployment_id: d.id,
            }),
            Recorder::new(h.store.clone(), h.store.clone(), clock.clone()),
            clock,
        );

        reconciler.reconcile_all().await.unwrap();
        let row = h.store.get_deployment(d.id).await.unwrap().unwrap();
        assert_eq!(row.status, DeploymentStatus::Deleting);
        assert_eq!((row.replicas, row.current_count), (0, 2));

        reconciler.reconcile_all().await.unwrap();
        assert_eq!(h.fleet.terminated().len(), 2);
        reconciler.reconcile_all().await.unwrap();
        assert!(h.store.get_deployment(d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_drains_then_removes_row() {
        let h = harness();
        let d = create(&h, 2).await;
        h.reconciler.reconcile_all().await.unwrap();
        h.service.delete_deployment(&h.ctx, d.id).await.unwrap();

        h.reconciler.reconcile_all().await.unwrap();
        assert_eq!(h.fleet.terminated().len(), 2);
        assert!(h.store.get_deployment(d.id).await.unwrap().is_some());

        h.reconciler.reconcile_all().await.unwrap();
        assert!(h.store.get_deployment(d.id).await.unwrap().is_none());
    }
}
