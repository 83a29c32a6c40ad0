//! Proxy and target-health reconciler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use nimbus_core::{BackendError, ComputeBackend, CoreError, CoreResult, LbProxy};
use nimbus_state::{InstanceRepository, InstanceStatus, LbStatus, LbTarget, LoadBalancer, LoadBalancerRepository, TargetHealth};

use crate::probe::{HealthProbe, ProbeResult};

pub struct LbReconciler {
    lbs: Arc<dyn LoadBalancerRepository>,
    instances: Arc<dyn InstanceRepository>,
    compute: Arc<dyn ComputeBackend>,
    proxy: Arc<dyn LbProxy>,
    prober: Arc<dyn HealthProbe>,
    probe_host: String,
}

impl LbReconciler {
    pub fn new(
        lbs: Arc<dyn LoadBalancerRepository>,
        instances: Arc<dyn InstanceRepository>,
        compute: Arc<dyn ComputeBackend>,
        proxy: Arc<dyn LbProxy>,
        prober: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            lbs,
            instances,
            compute,
            proxy,
            prober,
            probe_host: "127.0.0.1".to_string(),
        }
    }

    /// Host that published target ports are reachable on.
    pub fn with_probe_host(mut self, host: impl Into<String>) -> Self {
        self.probe_host = host.into();
        self
    }

    pub async fn reconcile_all(&self) -> anyhow::Result<()> {
        for lb in self.lbs.list_lbs_by_status(LbStatus::Creating).await? {
            let id = lb.id;
            if let Err(e) = self.activate(lb).await {
                warn!(lb_id = %id, error = %e, "proxy deployment failed, will retry");
            }
        }

        for lb in self.lbs.list_lbs_by_status(LbStatus::Deleted).await? {
            if let Err(e) = self.proxy.remove_proxy(lb.id).await {
                warn!(lb_id = %lb.id, error = %e, "proxy removal failed");
            }
            match self.lbs.delete_lb(lb.id).await {
                Ok(_) => info!(lb_id = %lb.id, "load balancer removed"),
                Err(e) => warn!(lb_id = %lb.id, error = %e, "load balancer removal failed, will retry"),
            }
        }

        for lb in self.lbs.list_lbs_by_status(LbStatus::Active).await? {
            let targets = match self.lbs.list_lb_targets(lb.id).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(lb_id = %lb.id, error = %e, "target listing failed");
                    continue;
                }
            };
            if let Err(e) = self.proxy.update_proxy_config(&lb, &targets).await {
                warn!(lb_id = %lb.id, error = %e, "proxy config refresh failed");
            }
            for target in targets {
                if let Err(e) = self.check_target(target).await {
                    warn!(lb_id = %lb.id, error = %e, "target health check failed");
                }
            }
        }
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "load balancer reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "load balancer tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("load balancer reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Deploy the proxy and flip CREATING to ACTIVE. A load balancer
    /// deleted meanwhile keeps its status; the deleted sweep removes the
    /// proxy.
    async fn activate(&self, lb: LoadBalancer) -> CoreResult<()> {
        let targets = self.lbs.list_lb_targets(lb.id).await?;
        self.proxy.deploy_proxy(&lb, &targets).await?;
        let stored = self
            .lbs
            .modify_lb(lb.id, &|row: &mut LoadBalancer| {
                if row.status != LbStatus::Creating {
                    return false;
                }
                row.status = LbStatus::Active;
                true
            })
            .await?;
        match stored {
            Some(row) if row.status == LbStatus::Active => {
                info!(lb_id = %lb.id, targets = targets.len(), "load balancer active");
            }
            Some(row) => debug!(lb_id = %lb.id, status = ?row.status, "load balancer changed while deploying"),
            None => {
                debug!(lb_id = %lb.id, "load balancer removed while deploying");
                if let Err(e) = self.proxy.remove_proxy(lb.id).await {
                    warn!(lb_id = %lb.id, error = %e, "proxy removal failed");
                }
            }
        }
        Ok(())
    }

    async fn check_target(&self, target: LbTarget) -> CoreResult<()> {
        let health = match self.probe_address(&target).await? {
            Some(address) => match self.prober.probe(&address).await {
                ProbeResult::Healthy => TargetHealth::Healthy,
                ProbeResult::Failed => TargetHealth::Unhealthy,
            },
            None => TargetHealth::Unhealthy,
        };
        if health != target.health {
            info!(
                lb_id = %target.lb_id,
                instance_id = %target.instance_id,
                from = ?target.health,
                to = ?health,
                "target health changed"
            );
            // Targets removed during the health check stay removed.
            self.lbs
                .modify_lb_target(target.lb_id, target.instance_id, &|row: &mut LbTarget| {
                    row.health = health;
                    true
                })
                .await?;
        }
        Ok(())
    }

    /// `host:port` the target's published port answers on, or `None` when
    /// the instance or its binding is gone.
    async fn probe_address(&self, target: &LbTarget) -> CoreResult<Option<String>> {
        let Some(instance) = self.instances.get_instance(target.instance_id).await? else {
            return Ok(None);
        };
        if instance.status != InstanceStatus::Running {
            return Ok(None);
        }
        let Some(container_id) = instance.container_id else {
            return Ok(None);
        };
        match self.compute.instance_port(&container_id, target.port).await {
            Ok(host_port) => Ok(Some(format!("{}:{host_port}", self.probe_host))),
            Err(BackendError::NotFound(what)) => {
                debug!(instance_id = %target.instance_id, %what, "target has no published port");
                Ok(None)
            }
            Err(e) => Err(CoreError::from(e)),
        }
    }
}
