//! TCP reachability probe for load-balancer targets.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Default per-probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The port accepted a connection.
    Healthy,
    /// Connection refused, unreachable, or timed out.
    Failed,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// Open a TCP connection to `address` and drop it.
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(error = %e, %address, "tcp probe connection failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self { timeout: PROBE_TIMEOUT }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, address: &str) -> ProbeResult {
        tcp_probe(address, self.timeout).await
    }
}
