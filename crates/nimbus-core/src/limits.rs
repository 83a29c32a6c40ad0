//! Platform-wide limits.

use serde::{Deserialize, Serialize};

/// Upper bound on `max_instances` of a scaling group.
pub const HARD_LIMIT: u32 = 20;
/// Scaling groups allowed per VPC.
pub const PER_VPC_LIMIT: u32 = 5;
/// Minimum scaling-policy cooldown, in seconds.
pub const MIN_COOLDOWN_SECS: u64 = 60;
pub const MAX_PORTS_PER_INSTANCE: usize = 10;
/// Consecutive launch failures that trigger scale-out backoff.
pub const FAILURE_BACKOFF_THRESHOLD: u32 = 5;
/// How long scale-out stays suppressed after the last failure, in seconds.
pub const FAILURE_BACKOFF_WINDOW_SECS: i64 = 300;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 262_144;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETENTION_DAYS: u32 = 4;

/// Tunable limits, loaded from the `[limits]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub scaling_hard_limit: u32,
    pub groups_per_vpc: u32,
    pub min_cooldown_secs: u64,
    pub max_ports_per_instance: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            scaling_hard_limit: HARD_LIMIT,
            groups_per_vpc: PER_VPC_LIMIT,
            min_cooldown_secs: MIN_COOLDOWN_SECS,
            max_ports_per_instance: MAX_PORTS_PER_INSTANCE,
        }
    }
}
