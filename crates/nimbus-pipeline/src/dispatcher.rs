//! Build dispatcher: runs queued builds in throwaway containers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use nimbus_core::queue::{BUILD_QUEUE, dequeue_json};
use nimbus_core::{Clock, ComputeBackend, CoreResult, CreateInstanceOptions, Recorder, TaskQueue};
use nimbus_state::{Build, BuildJob, BuildStatus, Pipeline, PipelineRepository};

const BUILD_VCPUS: u32 = 1;
const BUILD_MEMORY_MB: u64 = 2048;
const WORKSPACE: &str = "/workspace";

pub struct BuildDispatcher {
    pipelines: Arc<dyn PipelineRepository>,
    tasks: Arc<dyn TaskQueue>,
    compute: Arc<dyn ComputeBackend>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl BuildDispatcher {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        tasks: Arc<dyn TaskQueue>,
        compute: Arc<dyn ComputeBackend>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipelines,
            tasks,
            compute,
            recorder,
            clock,
        }
    }

    /// Run one queued build. `false` when the queue was empty.
    pub async fn process_next(&self) -> CoreResult<bool> {
        let Some(job) = dequeue_json::<BuildJob>(self.tasks.as_ref(), BUILD_QUEUE).await? else {
            return Ok(false);
        };
        let Some(build) = self.pipelines.get_build(job.pipeline_id, job.build_id).await? else {
            debug!(build_id = %job.build_id, "build vanished before dispatch");
            return Ok(true);
        };
        if build.status != BuildStatus::Queued {
            debug!(build_id = %build.id, status = ?build.status, "build is not queued, skipping");
            return Ok(true);
        }
        let pipeline = self.pipelines.get_pipeline(job.pipeline_id).await?;
        self.execute(build, pipeline).await?;
        Ok(true)
    }

    pub async fn drain(&self) -> CoreResult<usize> {
        let mut n = 0;
        while self.process_next().await? {
            n += 1;
        }
        Ok(n)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "build dispatcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.drain().await {
                        error!(error = %e, "build dispatch failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("build dispatcher shutting down");
                    break;
                }
            }
        }
    }

    async fn execute(&self, mut build: Build, pipeline: Option<Pipeline>) -> CoreResult<()> {
        build.status = BuildStatus::Running;
        build.started_at = Some(self.clock.now());
        self.pipelines.update_build(&build).await?;

        let succeeded = match pipeline {
            Some(pipeline) => self.run_steps(&mut build, &pipeline).await,
            None => {
                build.logs.push_str("pipeline no longer exists\n");
                false
            }
        };

        build.status = if succeeded { BuildStatus::Success } else { BuildStatus::Failed };
        build.finished_at = Some(self.clock.now());
        self.pipelines.update_build(&build).await?;
        info!(build_id = %build.id, status = ?build.status, "build finished");
        self.recorder
            .event(
                "pipeline.build_finished",
                "build",
                build.id,
                json!({ "pipeline_id": build.pipeline_id, "status": build.status }),
            )
            .await;
        Ok(())
    }

    /// Create the build container, run checkout plus every step, and always
    /// remove the container.
    async fn run_steps(&self, build: &mut Build, pipeline: &Pipeline) -> bool {
        let opts = CreateInstanceOptions {
            name: format!("build-{}", &build.id.simple().to_string()[..12]),
            image: pipeline.build_image.clone(),
            env: vec![
                ("NIMBUS_REPO".into(), pipeline.repo_url.clone()),
                ("NIMBUS_BRANCH".into(), pipeline.branch.clone()),
                ("NIMBUS_COMMIT".into(), build.commit_hash.clone()),
            ],
            cmd: vec!["sleep".into(), "infinity".into()],
            vcpus: BUILD_VCPUS,
            memory_mb: BUILD_MEMORY_MB,
            ..Default::default()
        };
        let container_id = match self.compute.create_instance(&opts).await {
            Ok(id) => id,
            Err(e) => {
                warn!(build_id = %build.id, error = %e, "build container create failed");
                build.logs.push_str(&format!("container create failed: {e}\n"));
                return false;
            }
        };

        let checkout = format!(
            "git clone --branch {} {} {WORKSPACE} && cd {WORKSPACE} && git checkout {}",
            pipeline.branch, pipeline.repo_url, build.commit_hash
        );
        let mut ok = true;
        for step in std::iter::once(&checkout).chain(pipeline.steps.iter()) {
            build.logs.push_str(&format!("==> {step}\n"));
            let cmd = vec!["sh".to_string(), "-c".to_string(), step.clone()];
            match self.compute.exec(&container_id, &cmd).await {
                Ok(out) => build.logs.push_str(&out),
                Err(e) => {
                    warn!(build_id = %build.id, %step, error = %e, "build step failed");
                    build.logs.push_str(&format!("step failed: {e}\n"));
                    ok = false;
                    break;
                }
            }
        }

        if let Err(e) = self.compute.delete_instance(&container_id).await {
            warn!(build_id = %build.id, %container_id, error = %e, "build container cleanup failed");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{harness, pipeline};
    use nimbus_core::SystemClock;
    use nimbus_core::sim::SimCompute;

    fn dispatcher(h: &crate::service::tests::Harness, compute: Arc<SimCompute>) -> BuildDispatcher {
        let clock = Arc::new(SystemClock);
        BuildDispatcher::new(
            h.store.clone(),
            h.tasks.clone(),
            compute,
            Recorder::new(h.store.clone(), h.store.clone(), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn successful_build_runs_every_step() {
        let h = harness();
        let compute = Arc::new(SimCompute::new());
        let d = dispatcher(&h, compute.clone());
        let p = pipeline(&h, None).await;
        let build = h.service.trigger_build(&h.ctx, p.id, Some("abc".into())).await.unwrap();

        assert_eq!(d.drain().await.unwrap(), 1);
        let row = h.store.get_build(p.id, build.id).await.unwrap().unwrap();
        assert_eq!(row.status, BuildStatus::Success);
        assert!(row.started_at.is_some() && row.finished_at.is_some());
        assert!(row.logs.contains("git checkout abc"));
        assert!(row.logs.contains("$ sh -c cargo test"));
        assert_eq!(compute.container_count(), 0);
    }

    #[tokio::test]
    async fn failing_step_fails_build_and_cleans_up() {
        let h = harness();
        let compute = Arc::new(SimCompute::new());
        compute.fail_command("sh -c cargo build");
        let d = dispatcher(&h, compute.clone());
        let p = pipeline(&h, None).await;
        let build = h.service.trigger_build(&h.ctx, p.id, None).await.unwrap();

        d.drain().await.unwrap();
        let row = h.store.get_build(p.id, build.id).await.unwrap().unwrap();
        assert_eq!(row.status, BuildStatus::Failed);
        assert!(row.logs.contains("step failed"));
        assert!(!row.logs.contains("==> cargo test"));
        assert_eq!(compute.container_count(), 0);
    }

    #[tokio::test]
    async fn container_failure_fails_build() {
        let h = harness();
        let compute = Arc::new(SimCompute::new());
        compute.fail_next_creates(1);
        let d = dispatcher(&h, compute);
        let p = pipeline(&h, None).await;
        let build = h.service.trigger_build(&h.ctx, p.id, None).await.unwrap();

        d.drain().await.unwrap();
        let row = h.store.get_build(p.id, build.id).await.unwrap().unwrap();
        assert_eq!(row.status, BuildStatus::Failed);
        assert!(row.logs.contains("container create failed"));
    }
}
