//! Assembles every service and reconciler over one state store.
//!
//! ```text
//! StateStore ──► services ──► ApiState ──► REST router
//!      │
//!      └──────► workers (one task each, shared watch shutdown)
//!                 provision · autoscale · deployments · lb · cron · builds
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use nimbus_api::ApiState;
use nimbus_auth::{AuthService, CachedRbac, RbacService};
use nimbus_autoscale::{Autoscaler, ScalingGroupService};
use nimbus_compute::{DnsService, InstanceService, ProvisionWorker, StatsCollector, VolumeService};
use nimbus_core::sim::{SimCompute, SimDns, SimProxy};
use nimbus_core::{
    Clock, ComputeBackend, DnsBackend, HttpClient, LbProxy, MemoryCache, Metrics, Recorder, Registry,
    ReqwestClient, StoreTaskQueue, SystemClock, TaskQueue,
};
use nimbus_cron::{CronDispatcher, CronService};
use nimbus_crypto::{EnvelopeCipher, MasterKey};
use nimbus_deploy::{DeploymentReconciler, DeploymentService};
use nimbus_gateway::{Gateway, RouteService, RouteTable};
use nimbus_lb::{HealthProbe, LbReconciler, LoadBalancerService, TcpProbe};
use nimbus_messaging::{QueueService, TopicService};
use nimbus_pipeline::{BuildDispatcher, PipelineService};
use nimbus_state::StateStore;

use crate::config::{NimbusConfig, WorkerConfig};

/// The external executors the control plane drives.
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub dns: Arc<dyn DnsBackend>,
    pub proxy: Arc<dyn LbProxy>,
    pub http: Arc<dyn HttpClient>,
    pub probe: Arc<dyn HealthProbe>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// In-process compute, DNS and proxy; real HTTP and TCP probes.
    pub fn simulated() -> Self {
        Self {
            compute: Arc::new(SimCompute::new()),
            dns: Arc::new(SimDns::new()),
            proxy: Arc::new(SimProxy::new()),
            http: Arc::new(ReqwestClient::new()),
            probe: Arc::new(TcpProbe::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct ControlPlane {
    pub api: ApiState,
    pub gateway: Arc<Gateway>,
    pub provision: Arc<ProvisionWorker>,
    pub autoscaler: Arc<Autoscaler>,
    pub deployments: Arc<DeploymentReconciler>,
    pub lb: Arc<LbReconciler>,
    pub cron: Arc<CronDispatcher>,
    pub builds: Arc<BuildDispatcher>,
    workers: WorkerConfig,
}

impl ControlPlane {
    pub async fn assemble(store: StateStore, config: &NimbusConfig, backends: Backends) -> anyhow::Result<Self> {
        let store = Arc::new(store);
        let clock = backends.clock.clone();
        let registry = Arc::new(Registry::new());
        let metrics: Arc<dyn Metrics> = registry.clone();
        let recorder = Recorder::new(store.clone(), store.clone(), clock.clone());
        let tasks: Arc<dyn TaskQueue> = Arc::new(StoreTaskQueue::new(store.clone()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let limits = config.limits;

        // ── Identity ───────────────────────────────────────────
        let auth = Arc::new(AuthService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            cache.clone(),
            recorder.clone(),
            metrics.clone(),
            clock.clone(),
            &config.auth,
        )?);
        let rbac = Arc::new(RbacService::new(store.clone(), store.clone(), store.clone(), recorder.clone()));
        let authz = Arc::new(CachedRbac::new(rbac, cache));

        // ── Compute ────────────────────────────────────────────
        let dns = Arc::new(DnsService::new(store.clone(), backends.dns.clone(), recorder.clone(), clock.clone()));
        let instances = Arc::new(InstanceService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            tasks.clone(),
            backends.compute.clone(),
            dns.clone(),
            authz.clone(),
            recorder.clone(),
            clock.clone(),
            limits,
        ));
        instances.seed_instance_types().await?;
        let volumes = Arc::new(VolumeService::new(store.clone(), clock.clone()));
        let provision = Arc::new(ProvisionWorker::new(
            store.clone(),
            store.clone(),
            store.clone(),
            tasks.clone(),
            backends.compute.clone(),
            dns.clone(),
            recorder.clone(),
            metrics.clone(),
            clock.clone(),
            limits,
        ));
        let sampler = Arc::new(StatsCollector::new(
            store.clone(),
            store.clone(),
            backends.compute.clone(),
            clock.clone(),
        ));

        // ── Load balancing and scaling ─────────────────────────
        let lbs = Arc::new(LoadBalancerService::new(store.clone(), store.clone(), recorder.clone(), clock.clone()));
        let lb = Arc::new(LbReconciler::new(
            store.clone(),
            store.clone(),
            backends.compute.clone(),
            backends.proxy.clone(),
            backends.probe.clone(),
        ));
        let groups = Arc::new(ScalingGroupService::new(
            store.clone(),
            store.clone(),
            authz.clone(),
            recorder.clone(),
            clock.clone(),
            limits,
        ));
        let autoscaler = Arc::new(
            Autoscaler::new(
                store.clone(),
                store.clone(),
                instances.clone(),
                recorder.clone(),
                metrics.clone(),
                clock.clone(),
            )
            .with_targets(lbs.clone())
            .with_sampler(sampler),
        );
        let deployment_service = Arc::new(DeploymentService::new(store.clone(), recorder.clone(), clock.clone(), limits));
        let deployments = Arc::new(DeploymentReconciler::new(
            store.clone(),
            instances.clone(),
            recorder.clone(),
            clock.clone(),
        ));

        // ── Platform services ──────────────────────────────────
        let cron_service = Arc::new(CronService::new(store.clone(), recorder.clone(), clock.clone()));
        let cron = Arc::new(CronDispatcher::new(
            store.clone(),
            backends.http.clone(),
            metrics.clone(),
            clock.clone(),
        ));
        let queues = Arc::new(QueueService::new(store.clone(), recorder.clone(), clock.clone()));
        let topics = Arc::new(TopicService::new(
            store.clone(),
            queues.clone(),
            backends.http.clone(),
            recorder.clone(),
            clock.clone(),
        ));
        let pipelines = Arc::new(PipelineService::new(
            store.clone(),
            tasks.clone(),
            recorder.clone(),
            metrics.clone(),
            clock.clone(),
        ));
        let builds = Arc::new(BuildDispatcher::new(
            store.clone(),
            tasks.clone(),
            backends.compute.clone(),
            recorder.clone(),
            clock.clone(),
        ));

        let table = Arc::new(RouteTable::new());
        let routes = Arc::new(RouteService::new(store.clone(), table.clone(), recorder.clone(), clock.clone()));
        let loaded = routes.refresh().await?;
        info!(routes = loaded, "gateway routes loaded");
        let gateway = Arc::new(
            Gateway::new(table).with_timeout(Duration::from_secs(config.server.gateway_timeout_secs.max(1))),
        );

        let master = match config.crypto.master_key_hex.as_deref() {
            Some(hex) => MasterKey::from_hex(hex)?,
            None => {
                warn!("no crypto.master_key_hex configured, bucket keys will not survive a restart");
                MasterKey::generate()
            }
        };
        let cipher = Arc::new(EnvelopeCipher::new(master, store.clone(), recorder, clock));

        let api = ApiState {
            auth,
            iam: authz,
            instances,
            volumes,
            groups,
            deployments: deployment_service,
            lbs,
            dns,
            cron: cron_service,
            queues,
            topics,
            pipelines,
            routes,
            cipher,
            metrics: registry,
        };

        Ok(Self {
            api,
            gateway,
            provision,
            autoscaler,
            deployments,
            lb,
            cron,
            builds,
            workers: config.workers.clone(),
        })
    }

    pub fn router(&self) -> axum::Router {
        nimbus_api::build_router(self.api.clone())
    }

    pub fn gateway_router(&self) -> axum::Router {
        nimbus_api::gateway_router(self.gateway.clone())
    }

    /// Spawn every reconciler. Each exits when `shutdown` flips.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let w = &self.workers;
        let mut handles = Vec::new();

        let provision = self.provision.clone();
        let (interval, rx) = (WorkerConfig::interval(w.provision_interval_secs), shutdown.clone());
        handles.push(tokio::spawn(async move { provision.run(interval, rx).await }));

        let autoscaler = self.autoscaler.clone();
        let (interval, rx) = (WorkerConfig::interval(w.autoscale_interval_secs), shutdown.clone());
        handles.push(tokio::spawn(async move { autoscaler.run(interval, rx).await }));

        let deployments = self.deployments.clone();
        let (interval, rx) = (WorkerConfig::interval(w.deployment_interval_secs), shutdown.clone());
        handles.push(tokio::spawn(async move { deployments.run(interval, rx).await }));

        let lb = self.lb.clone();
        let (interval, rx) = (WorkerConfig::interval(w.lb_interval_secs), shutdown.clone());
        handles.push(tokio::spawn(async move { lb.run(interval, rx).await }));

        let cron = self.cron.clone();
        let (interval, rx) = (WorkerConfig::interval(w.cron_interval_secs), shutdown.clone());
        handles.push(tokio::spawn(async move { cron.run(interval, rx).await }));

        let builds = self.builds.clone();
        let interval = WorkerConfig::interval(w.build_interval_secs);
        handles.push(tokio::spawn(async move { builds.run(interval, shutdown).await }));

        info!(workers = handles.len(), "background workers started");
        handles
    }
}
