//! Ports to the external executors the control plane drives.
//!
//! Concrete runtimes (container engine, DNS server, L4 proxy) live outside
//! the core. Reconcilers and services only see these traits; failures come
//! back as [`BackendError`] and are either compensated or logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use nimbus_state::{LbTarget, LoadBalancer, LoadBalancerId, RecordType};

use crate::portmap::PortMapping;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend object not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call failed: {0}")]
    Failed(String),
}

// ── Compute ────────────────────────────────────────────────────────

/// A file written into the workload before its first start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
}

/// Cloud-init style bootstrap handed to the workload on create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub write_files: Vec<WriteFile>,
    #[serde(default)]
    pub run_commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateInstanceOptions {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    pub cmd: Vec<String>,
    /// Host paths bound into the workload, `source:target`.
    pub volume_binds: Vec<String>,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub user_data: Option<UserData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstanceStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Container/VM runtime.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create and start a workload. Returns the backend's identifier.
    async fn create_instance(&self, opts: &CreateInstanceOptions) -> BackendResult<String>;
    async fn start_instance(&self, id: &str) -> BackendResult<()>;
    async fn stop_instance(&self, id: &str) -> BackendResult<()>;
    async fn delete_instance(&self, id: &str) -> BackendResult<()>;
    /// Run a command inside the workload and return its stdout.
    async fn exec(&self, id: &str, cmd: &[String]) -> BackendResult<String>;
    async fn instance_ip(&self, id: &str) -> BackendResult<String>;
    async fn instance_logs(&self, id: &str) -> BackendResult<String>;
    async fn instance_stats(&self, id: &str) -> BackendResult<InstanceStats>;
    /// Host port bound to `container_port`.
    async fn instance_port(&self, id: &str, container_port: u16) -> BackendResult<u16>;
    async fn ping(&self) -> BackendResult<()>;
}

// ── DNS ────────────────────────────────────────────────────────────

/// Records sharing a name and type, as the DNS backend stores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    pub name: String,
    pub record_type: RecordType,
    pub ttl: u32,
    pub records: Vec<String>,
}

#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Create a zone and return the backend's zone identifier.
    async fn create_zone(&self, name: &str, nameservers: &[String]) -> BackendResult<String>;
    async fn delete_zone(&self, zone_id: &str) -> BackendResult<()>;
    async fn add_records(&self, zone_id: &str, sets: &[RecordSet]) -> BackendResult<()>;
    async fn update_records(&self, zone_id: &str, sets: &[RecordSet]) -> BackendResult<()>;
    async fn delete_records(&self, zone_id: &str, sets: &[RecordSet]) -> BackendResult<()>;
    async fn list_records(&self, zone_id: &str) -> BackendResult<Vec<RecordSet>>;
}

// ── Load-balancer proxy ────────────────────────────────────────────

#[async_trait]
pub trait LbProxy: Send + Sync {
    async fn deploy_proxy(&self, lb: &LoadBalancer, targets: &[LbTarget]) -> BackendResult<()>;
    /// Re-apply the proxy configuration. Must be idempotent.
    async fn update_proxy_config(&self, lb: &LoadBalancer, targets: &[LbTarget]) -> BackendResult<()>;
    async fn remove_proxy(&self, lb_id: LoadBalancerId) -> BackendResult<()>;
}
