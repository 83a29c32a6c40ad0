//! nimbus-compute — instances from admission to teardown.
//!
//! # Architecture
//!
//! ```text
//! InstanceService::launch
//!   type lookup → quota reserve → row (STARTING) → enqueue "provision" → audit
//!                                                        │
//! ProvisionWorker (tick) ◄───────────────────────────────┘
//!   create container → attach volumes → DNS A record → RUNNING
//!   on error: undo steps in reverse → TERMINATED → release quota → event
//!
//! InstanceService::terminate
//!   backend delete → DNS unregister → volumes released → row deleted → quota released
//! ```
//!
//! [`DnsService`] owns zones and records and is called by both the
//! provisioning pipeline and terminate. [`StatsCollector`] samples CPU for
//! the auto-scaler.

pub mod dns;
pub mod instance;
pub mod provision;
pub mod stats;
pub mod volume;

pub use dns::DnsService;
pub use instance::{DEFAULT_INSTANCE_TYPES, InstanceService, instance_arn};
pub use provision::{ProvisionTask, ProvisionWorker};
pub use stats::StatsCollector;
pub use volume::VolumeService;
