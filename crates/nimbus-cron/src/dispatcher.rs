//! Cron dispatcher: fires due jobs and records each run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nimbus_core::{Clock, CoreResult, HttpClient, HttpRequest, Metrics};
use nimbus_state::{CronJob, CronJobRun, CronRepository, CronStatus, RunStatus};

use crate::schedule::Schedule;

/// Hard timeout for one job's HTTP call.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies are truncated to this many bytes in run records.
const MAX_RESPONSE_BYTES: usize = 4096;

#[derive(Clone)]
pub struct CronDispatcher {
    jobs: Arc<dyn CronRepository>,
    http: Arc<dyn HttpClient>,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
}

impl CronDispatcher {
    pub fn new(
        jobs: Arc<dyn CronRepository>,
        http: Arc<dyn HttpClient>,
        metrics: Arc<dyn Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            http,
            metrics,
            clock,
        }
    }

    /// Fire every due job concurrently and wait for all of them.
    /// Returns how many jobs were dispatched.
    pub async fn run_due(&self) -> anyhow::Result<usize> {
        let now = self.clock.now();
        let due = self.jobs.get_due_cron_jobs(now).await?;
        let count = due.len();

        let mut handles = Vec::with_capacity(count);
        for job in due {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let id = job.id;
                if let Err(e) = this.execute(job).await {
                    warn!(job_id = %id, error = %e, "cron run could not be recorded");
                }
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "cron task panicked");
            }
        }
        debug!(jobs = count, "cron tick complete");
        Ok(count)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "cron dispatcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_due().await {
                        error!(error = %e, "cron tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("cron dispatcher shutting down");
                    break;
                }
            }
        }
    }

    async fn execute(&self, job: CronJob) -> CoreResult<()> {
        let started_at = self.clock.now();
        let request = HttpRequest {
            method: job.target_method.clone(),
            url: job.target_url.clone(),
            headers: match job.target_payload {
                Some(_) => vec![("content-type".to_string(), "application/json".to_string())],
                None => Vec::new(),
            },
            body: job.target_payload.clone(),
            timeout: RUN_TIMEOUT,
        };

        let timer = Instant::now();
        let (status, status_code, response) = match self.http.send(request).await {
            Ok(resp) if resp.status < 400 => (RunStatus::Success, Some(resp.status), resp.body),
            Ok(resp) => (RunStatus::Failed, Some(resp.status), resp.body),
            Err(e) => (RunStatus::Failed, None, e.to_string()),
        };
        let duration_ms = timer.elapsed().as_millis() as u64;

        let run = CronJobRun {
            id: Uuid::new_v4(),
            job_id: job.id,
            status,
            status_code,
            response: truncate(response, MAX_RESPONSE_BYTES),
            duration_ms,
            started_at,
        };
        self.jobs.save_cron_run(&run).await?;
        self.metrics.incr(
            "nimbus_cron_runs_total",
            &[("status", if status == RunStatus::Success { "success" } else { "failed" })],
        );
        match status {
            RunStatus::Success => info!(job_id = %job.id, ?status_code, duration_ms, "cron job ran"),
            RunStatus::Failed => warn!(job_id = %job.id, ?status_code, duration_ms, "cron job failed"),
        }

        let next_run = match Schedule::parse(&job.schedule).and_then(|s| s.next_after(started_at)) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "schedule has no next run, pausing job");
                None
            }
        };
        // A pause issued while the call was in flight wins.
        let stored = self
            .jobs
            .modify_cron_job(job.id, &|row: &mut CronJob| {
                row.last_run_at = Some(started_at);
                if row.status == CronStatus::Paused {
                    return true;
                }
                row.next_run_at = next_run;
                if next_run.is_none() {
                    row.status = CronStatus::Paused;
                }
                true
            })
            .await?;
        if stored.is_none() {
            debug!(job_id = %job.id, "cron job deleted during its run");
        }
        Ok(())
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
