//! nimbus-lb — load balancers and their targets.
//!
//! # Architecture
//!
//! ```text
//! LoadBalancerService ── create (CREATING) / delete (DELETED) / targets
//!         │                 also the TargetRegistry used by auto-scaling
//!         ▼
//! LbReconciler (tick)
//!   1. CREATING → deploy_proxy        → ACTIVE
//!   2. DELETED  → remove_proxy        → row removed
//!   3. ACTIVE   → update_proxy_config   (idempotent)
//!   4. ACTIVE targets → TCP probe host port (2 s) → health written on change
//! ```

pub mod probe;
pub mod reconciler;
pub mod service;

pub use probe::{HealthProbe, ProbeResult, TcpProbe, tcp_probe};
pub use reconciler::LbReconciler;
pub use service::LoadBalancerService;
