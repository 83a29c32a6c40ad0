//! nimbus-core — shared building blocks for every Nimbus service.
//!
//! Services depend on the narrowest capability they need. This crate
//! defines those capabilities and the types that flow through them.
//!
//! # Architecture
//!
//! ```text
//! RequestContext ─── carried by every service call (user, tenant)
//! CoreError ──────── the error taxonomy surfaced to callers
//! Clock ──────────── SystemClock in production, ManualClock in tests
//!
//! Ports (async traits)
//!   ├── ComputeBackend, DnsBackend, LbProxy   ← external executors
//!   ├── TaskQueue, Cache, HttpClient          ← infrastructure
//!   ├── InstanceLifecycle, TargetRegistry     ← used by reconcilers
//!   └── Authorizer                            ← RBAC + IAM decision
//!
//! Side channels
//!   ├── Recorder  → audit log + domain events (errors swallowed)
//!   └── Metrics   → counters/gauges, Prometheus rendering
//! ```
//!
//! [`sim`] holds in-process implementations of the backend ports used by
//! tests and by the standalone daemon.

pub mod audit;
pub mod authz;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod context;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod limits;
pub mod metrics;
pub mod portmap;
pub mod queue;
pub mod sim;

pub use audit::{AuditAction, Recorder};
pub use authz::{Authorizer, require_permission};
pub use backend::{
    BackendError, BackendResult, ComputeBackend, CreateInstanceOptions, DnsBackend, InstanceStats,
    LbProxy, RecordSet, UserData, WriteFile,
};
pub use cache::{Cache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RequestContext;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use lifecycle::{InstanceLifecycle, LaunchParams, TargetRegistry, VolumeAttachment};
pub use limits::Limits;
pub use metrics::{Metrics, NoopMetrics, Registry};
pub use portmap::PortMapping;
pub use queue::{StoreTaskQueue, TaskQueue};
