//! nimbus-deploy — replicated container deployments.
//!
//! [`DeploymentService`] records the declared replica count;
//! [`DeploymentReconciler`] launches or terminates containers through the
//! instance lifecycle until the join table matches it.
//!
//! ```text
//! SCALING ──(current == replicas)──► READY
//!    ▲                                 │
//!    └──────────(scale)────────────────┘
//! any ──(delete)──► DELETING ──(no members)──► row removed
//! ```

pub mod reconciler;
pub mod service;

pub use reconciler::DeploymentReconciler;
pub use service::{CreateDeploymentRequest, DeploymentService};
