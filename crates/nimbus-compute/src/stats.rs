//! CPU sampling for the auto-scaler.

use std::sync::Arc;

use tracing::debug;

use nimbus_core::{BackendError, Clock, ComputeBackend, CoreResult};
use nimbus_state::{CpuSample, InstanceId, InstanceRepository, MetricRepository};

pub struct StatsCollector {
    instances: Arc<dyn InstanceRepository>,
    samples: Arc<dyn MetricRepository>,
    compute: Arc<dyn ComputeBackend>,
    clock: Arc<dyn Clock>,
}

impl StatsCollector {
    pub fn new(
        instances: Arc<dyn InstanceRepository>,
        samples: Arc<dyn MetricRepository>,
        compute: Arc<dyn ComputeBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instances,
            samples,
            compute,
            clock,
        }
    }

    /// Record one CPU sample per instance that has a container. Instances
    /// still provisioning, or already gone at the backend, are skipped.
    /// Returns the number of samples written.
    pub async fn sample(&self, ids: &[InstanceId]) -> CoreResult<usize> {
        let now = self.clock.now();
        let mut written = 0;
        for &id in ids {
            let Some(container_id) = self.instances.get_instance(id).await?.and_then(|i| i.container_id) else {
                continue;
            };
            let stats = match self.compute.instance_stats(&container_id).await {
                Ok(s) => s,
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            self.samples
                .record_cpu_sample(&CpuSample {
                    instance_id: id,
                    cpu_percent: stats.cpu_percent,
                    recorded_at: now,
                })
                .await?;
            written += 1;
        }
        debug!(instances = ids.len(), written, "cpu sampled");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{fixture, generous, params};
    use crate::provision::ProvisionWorker;
    use chrono::Duration;
    use nimbus_core::{Limits, NoopMetrics, Recorder, StoreTaskQueue, SystemClock};

    #[tokio::test]
    async fn samples_running_instances_only() {
        let f = fixture(generous()).await;
        let clock = Arc::new(SystemClock);
        let worker = ProvisionWorker::new(
            f.store.clone(),
            f.store.clone(),
            f.store.clone(),
            Arc::new(StoreTaskQueue::new(f.store.clone())),
            f.compute.clone(),
            f.dns.clone(),
            Recorder::new(f.store.clone(), f.store.clone(), clock.clone()),
            Arc::new(NoopMetrics),
            clock.clone(),
            Limits::default(),
        );
        let running = f.service.launch(&f.ctx, params("a")).await.unwrap();
        worker.drain().await.unwrap();
        let pending = f.service.launch(&f.ctx, params("b")).await.unwrap();

        f.compute.set_cpu(82.5);
        let collector = StatsCollector::new(f.store.clone(), f.store.clone(), f.compute.clone(), clock.clone());
        assert_eq!(collector.sample(&[running.id, pending.id]).await.unwrap(), 1);

        let since = clock.now() - Duration::minutes(1);
        let avg = f.store.get_average_cpu(&[running.id, pending.id], since).await.unwrap();
        assert_eq!(avg, Some(82.5));
    }
}
