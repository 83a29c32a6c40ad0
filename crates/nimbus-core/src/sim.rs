//! In-process backends.
//!
//! The standalone daemon runs against these, and every crate's tests use
//! them as fakes. Each one records what it was asked to do and can be told
//! to fail.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use nimbus_state::{Instance, InstanceId, InstanceStatus, LbTarget, LoadBalancer, LoadBalancerId, UserId};

use crate::authz::Authorizer;
use crate::backend::*;
use crate::context::RequestContext;
use crate::error::{CoreError, CoreResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::lifecycle::{InstanceLifecycle, LaunchParams, TargetRegistry};

/// Take one unit from a failure budget, if any is left.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ── Compute ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimContainer {
    pub opts: CreateInstanceOptions,
    pub running: bool,
    pub ip: String,
    /// container port → host port
    pub bindings: HashMap<u16, u16>,
}

#[derive(Debug, Default)]
pub struct SimCompute {
    containers: Mutex<HashMap<String, SimContainer>>,
    next: AtomicU32,
    fail_creates: AtomicU32,
    failing_commands: Mutex<HashSet<String>>,
    cpu_percent: Mutex<f64>,
}

impl SimCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` creates fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make `exec` fail whenever the joined command equals `cmd`.
    pub fn fail_command(&self, cmd: &str) {
        self.failing_commands
            .lock()
            .expect("commands lock")
            .insert(cmd.to_string());
    }

    pub fn set_cpu(&self, percent: f64) {
        *self.cpu_percent.lock().expect("cpu lock") = percent;
    }

    pub fn container(&self, id: &str) -> Option<SimContainer> {
        self.containers.lock().expect("containers lock").get(id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().expect("containers lock").len()
    }
}

#[async_trait]
impl ComputeBackend for SimCompute {
    async fn create_instance(&self, opts: &CreateInstanceOptions) -> BackendResult<String> {
        if take_failure(&self.fail_creates) {
            return Err(BackendError::Failed(format!("create {} rejected", opts.name)));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let id = format!("sim-{}", Uuid::new_v4().simple());
        let bindings = opts
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let host = if p.host == 0 { 32768 + (n as u16 % 1000) * 10 + i as u16 } else { p.host };
                (p.container, host)
            })
            .collect();
        let container = SimContainer {
            opts: opts.clone(),
            running: true,
            ip: format!("10.0.{}.{}", (n / 250) % 250, n % 250 + 2),
            bindings,
        };
        self.containers
            .lock()
            .expect("containers lock")
            .insert(id.clone(), container);
        Ok(id)
    }

    async fn start_instance(&self, id: &str) -> BackendResult<()> {
        let mut containers = self.containers.lock().expect("containers lock");
        let c = containers
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        c.running = true;
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> BackendResult<()> {
        let mut containers = self.containers.lock().expect("containers lock");
        let c = containers
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        c.running = false;
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> BackendResult<()> {
        self.containers
            .lock()
            .expect("containers lock")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> BackendResult<String> {
        if self.container(id).is_none() {
            return Err(BackendError::NotFound(id.to_string()));
        }
        let joined = cmd.join(" ");
        if self.failing_commands.lock().expect("commands lock").contains(&joined) {
            return Err(BackendError::Failed(format!("`{joined}` exited with status 1")));
        }
        Ok(format!("$ {joined}\n"))
    }

    async fn instance_ip(&self, id: &str) -> BackendResult<String> {
        self.container(id)
            .map(|c| c.ip)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn instance_logs(&self, id: &str) -> BackendResult<String> {
        self.container(id)
            .map(|c| format!("{} started\n", c.opts.name))
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn instance_stats(&self, id: &str) -> BackendResult<InstanceStats> {
        let c = self
            .container(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        Ok(InstanceStats {
            cpu_percent: *self.cpu_percent.lock().expect("cpu lock"),
            memory_bytes: c.opts.memory_mb * 1024 * 1024 / 2,
        })
    }

    async fn instance_port(&self, id: &str, container_port: u16) -> BackendResult<u16> {
        let c = self
            .container(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        c.bindings
            .get(&container_port)
            .copied()
            .ok_or_else(|| BackendError::NotFound(format!("{id} port {container_port}")))
    }

    async fn ping(&self) -> BackendResult<()> {
        Ok(())
    }
}

// ── DNS ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SimDns {
    zones: Mutex<HashMap<String, Vec<RecordSet>>>,
    fail: AtomicBool,
}

impl SimDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn zone_count(&self) -> usize {
        self.zones.lock().expect("zones lock").len()
    }

    fn check(&self) -> BackendResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("dns backend down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DnsBackend for SimDns {
    async fn create_zone(&self, name: &str, _nameservers: &[String]) -> BackendResult<String> {
        self.check()?;
        let id = format!("zone-{name}-{}", Uuid::new_v4().simple());
        self.zones.lock().expect("zones lock").insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn delete_zone(&self, zone_id: &str) -> BackendResult<()> {
        self.check()?;
        self.zones
            .lock()
            .expect("zones lock")
            .remove(zone_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(zone_id.to_string()))
    }

    async fn add_records(&self, zone_id: &str, sets: &[RecordSet]) -> BackendResult<()> {
        self.check()?;
        let mut zones = self.zones.lock().expect("zones lock");
        let zone = zones
            .get_mut(zone_id)
            .ok_or_else(|| BackendError::NotFound(zone_id.to_string()))?;
        for set in sets {
            match zone
                .iter_mut()
                .find(|s| s.name == set.name && s.record_type == set.record_type)
            {
                Some(existing) => existing.records.extend(set.records.iter().cloned()),
                None => zone.push(set.clone()),
            }
        }
        Ok(())
    }

    async fn update_records(&self, zone_id: &str, sets: &[RecordSet]) -> BackendResult<()> {
        self.check()?;
        let mut zones = self.zones.lock().expect("zones lock");
        let zone = zones
            .get_mut(zone_id)
            .ok_or_else(|| BackendError::NotFound(zone_id.to_string()))?;
        for set in sets {
            zone.retain(|s| !(s.name == set.name && s.record_type == set.record_type));
            zone.push(set.clone());
        }
        Ok(())
    }

    async fn delete_records(&self, zone_id: &str, sets: &[RecordSet]) -> BackendResult<()> {
        self.check()?;
        let mut zones = self.zones.lock().expect("zones lock");
        let zone = zones
            .get_mut(zone_id)
            .ok_or_else(|| BackendError::NotFound(zone_id.to_string()))?;
        for set in sets {
            for existing in zone
                .iter_mut()
                .filter(|s| s.name == set.name && s.record_type == set.record_type)
            {
                existing.records.retain(|r| !set.records.contains(r));
            }
            zone.retain(|s| !s.records.is_empty());
        }
        Ok(())
    }

    async fn list_records(&self, zone_id: &str) -> BackendResult<Vec<RecordSet>> {
        self.check()?;
        self.zones
            .lock()
            .expect("zones lock")
            .get(zone_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(zone_id.to_string()))
    }
}

// ── LB proxy ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SimProxy {
    deployed: Mutex<HashMap<LoadBalancerId, Vec<LbTarget>>>,
    updates: AtomicU32,
    fail: AtomicBool,
}

impl SimProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn is_deployed(&self, lb_id: LoadBalancerId) -> bool {
        self.deployed.lock().expect("proxy lock").contains_key(&lb_id)
    }

    pub fn targets(&self, lb_id: LoadBalancerId) -> Vec<LbTarget> {
        self.deployed
            .lock()
            .expect("proxy lock")
            .get(&lb_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_count(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    fn check(&self) -> BackendResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("proxy host down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LbProxy for SimProxy {
    async fn deploy_proxy(&self, lb: &LoadBalancer, targets: &[LbTarget]) -> BackendResult<()> {
        self.check()?;
        self.deployed
            .lock()
            .expect("proxy lock")
            .insert(lb.id, targets.to_vec());
        Ok(())
    }

    async fn update_proxy_config(&self, lb: &LoadBalancer, targets: &[LbTarget]) -> BackendResult<()> {
        self.check()?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.deployed
            .lock()
            .expect("proxy lock")
            .insert(lb.id, targets.to_vec());
        Ok(())
    }

    async fn remove_proxy(&self, lb_id: LoadBalancerId) -> BackendResult<()> {
        self.check()?;
        self.deployed.lock().expect("proxy lock").remove(&lb_id);
        Ok(())
    }
}

// ── Instance lifecycle ─────────────────────────────────────────────

/// Records launches and terminations without touching a store.
#[derive(Debug, Default)]
pub struct SimFleet {
    launched: Mutex<Vec<Instance>>,
    terminated: Mutex<Vec<InstanceId>>,
    fail_launches: AtomicU32,
    fail_terminates: AtomicU32,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_launches(&self, n: u32) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_terminates(&self, n: u32) {
        self.fail_terminates.store(n, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<Instance> {
        self.launched.lock().expect("fleet lock").clone()
    }

    pub fn terminated(&self) -> Vec<InstanceId> {
        self.terminated.lock().expect("fleet lock").clone()
    }
}

#[async_trait]
impl InstanceLifecycle for SimFleet {
    async fn launch(&self, ctx: &RequestContext, params: LaunchParams) -> CoreResult<Instance> {
        if take_failure(&self.fail_launches) {
            return Err(CoreError::Internal("launch rejected".into()));
        }
        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            tenant_id: ctx.tenant_id()?,
            name: params.name,
            image: params.image,
            ports: params.ports,
            status: InstanceStatus::Starting,
            vpc_id: params.vpc_id,
            container_id: None,
            instance_type: params.instance_type,
            private_ip: None,
            created_at: now,
            updated_at: now,
        };
        self.launched.lock().expect("fleet lock").push(instance.clone());
        Ok(instance)
    }

    async fn terminate(&self, _ctx: &RequestContext, id: InstanceId) -> CoreResult<()> {
        if take_failure(&self.fail_terminates) {
            return Err(CoreError::Internal("terminate rejected".into()));
        }
        self.terminated.lock().expect("fleet lock").push(id);
        Ok(())
    }
}

/// Records target attach/detach calls.
#[derive(Debug, Default)]
pub struct SimTargets {
    attached: Mutex<Vec<(LoadBalancerId, InstanceId, u16)>>,
    detached: Mutex<Vec<(LoadBalancerId, InstanceId)>>,
    fail: AtomicBool,
}

impl SimTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attached(&self) -> Vec<(LoadBalancerId, InstanceId, u16)> {
        self.attached.lock().expect("targets lock").clone()
    }

    pub fn detached(&self) -> Vec<(LoadBalancerId, InstanceId)> {
        self.detached.lock().expect("targets lock").clone()
    }
}

#[async_trait]
impl TargetRegistry for SimTargets {
    async fn attach_target(
        &self,
        _ctx: &RequestContext,
        lb_id: LoadBalancerId,
        instance_id: InstanceId,
        port: u16,
    ) -> CoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("target registry down".into()));
        }
        self.attached
            .lock()
            .expect("targets lock")
            .push((lb_id, instance_id, port));
        Ok(())
    }

    async fn detach_target(&self, _ctx: &RequestContext, lb_id: LoadBalancerId, instance_id: InstanceId) -> CoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("target registry down".into()));
        }
        self.detached
            .lock()
            .expect("targets lock")
            .push((lb_id, instance_id));
        Ok(())
    }
}

// ── Authorization ──────────────────────────────────────────────────

/// Allows everything except an explicit deny list of `(user, permission)`.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    denied: Mutex<HashSet<(UserId, String)>>,
}

impl StaticAuthorizer {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny(&self, user_id: UserId, permission: &str) {
        self.denied
            .lock()
            .expect("authz lock")
            .insert((user_id, permission.to_string()));
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn has_permission(&self, user_id: UserId, permission: &str, _resource: &str) -> CoreResult<bool> {
        let denied = self.denied.lock().expect("authz lock");
        Ok(!denied.contains(&(user_id, permission.to_string())))
    }
}

// ── HTTP ───────────────────────────────────────────────────────────

/// Answers every request with a fixed status and records it.
#[derive(Debug)]
pub struct RecordingHttp {
    status: AtomicU32,
    fail: AtomicBool,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingHttp {
    pub fn new(status: u16) -> Self {
        Self {
            status: AtomicU32::new(u32::from(status)),
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(u32::from(status), Ordering::SeqCst);
    }

    /// Make every request fail at the transport level.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Default for RecordingHttp {
    fn default() -> Self {
        Self::new(200)
    }
}

#[async_trait]
impl HttpClient for RecordingHttp {
    async fn send(&self, request: HttpRequest) -> BackendResult<HttpResponse> {
        self.requests.lock().expect("requests lock").push(request);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        let status = self.status.load(Ordering::SeqCst) as u16;
        Ok(HttpResponse {
            status,
            body: format!("status {status}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portmap::PortMapping;

    #[tokio::test]
    async fn compute_assigns_host_ports_for_ephemeral_mappings() {
        let compute = SimCompute::new();
        let opts = CreateInstanceOptions {
            name: "web".into(),
            image: "nginx".into(),
            ports: vec![PortMapping::new(0, 80), PortMapping::new(8443, 443)],
            ..Default::default()
        };
        let id = compute.create_instance(&opts).await.unwrap();
        let http = compute.instance_port(&id, 80).await.unwrap();
        assert!(http >= 32768);
        assert_eq!(compute.instance_port(&id, 443).await.unwrap(), 8443);
    }

    #[tokio::test]
    async fn compute_failure_budget_is_consumed() {
        let compute = SimCompute::new();
        compute.fail_next_creates(1);
        let opts = CreateInstanceOptions::default();
        assert!(compute.create_instance(&opts).await.is_err());
        assert!(compute.create_instance(&opts).await.is_ok());
    }

    #[tokio::test]
    async fn dns_records_merge_and_delete() {
        let dns = SimDns::new();
        let zone = dns.create_zone("internal", &[]).await.unwrap();
        let set = |content: &str| RecordSet {
            name: "web.internal".into(),
            record_type: nimbus_state::RecordType::A,
            ttl: 300,
            records: vec![content.into()],
        };
        dns.add_records(&zone, &[set("10.0.0.2")]).await.unwrap();
        dns.add_records(&zone, &[set("10.0.0.3")]).await.unwrap();
        assert_eq!(dns.list_records(&zone).await.unwrap()[0].records.len(), 2);

        dns.delete_records(&zone, &[set("10.0.0.2"), set("10.0.0.3")]).await.unwrap();
        assert!(dns.list_records(&zone).await.unwrap().is_empty());
    }
}
