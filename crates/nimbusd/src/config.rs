//! Daemon configuration, read from an optional TOML file.
//!
//! ```toml
//! [server]
//! port = 8080
//! gateway_port = 8081
//! data_dir = "/var/lib/nimbus"
//! gateway_timeout_secs = 30
//!
//! [workers]
//! autoscale_interval_secs = 10
//!
//! [auth]
//! lockout_threshold = 5
//!
//! [limits]
//! scaling_hard_limit = 20
//!
//! [crypto]
//! master_key_hex = "…64 hex chars…"
//! ```
//!
//! Every field has a default, so an empty or missing file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use nimbus_auth::AuthConfig;
use nimbus_core::Limits;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub server: ServerConfig,
    pub workers: WorkerConfig,
    pub auth: AuthConfig,
    pub limits: Limits,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub gateway_port: u16,
    pub data_dir: PathBuf,
    /// Upstream deadline for gateway-forwarded requests.
    pub gateway_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            gateway_port: 8081,
            data_dir: PathBuf::from("/var/lib/nimbus"),
            gateway_timeout_secs: 30,
        }
    }
}

/// Tick intervals of the background workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub autoscale_interval_secs: u64,
    pub deployment_interval_secs: u64,
    pub lb_interval_secs: u64,
    pub cron_interval_secs: u64,
    pub provision_interval_secs: u64,
    pub build_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            autoscale_interval_secs: 10,
            deployment_interval_secs: 15,
            lb_interval_secs: 5,
            cron_interval_secs: 10,
            provision_interval_secs: 2,
            build_interval_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub fn interval(secs: u64) -> Duration {
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// 32-byte master key as hex. Unset means a fresh key per process.
    pub master_key_hex: Option<String>,
}

impl NimbusConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parse config {}", path.display()))
    }
}
