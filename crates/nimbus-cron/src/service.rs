//! Cron job CRUD.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Recorder, RequestContext};
use nimbus_state::{CronJob, CronJobRun, CronRepository, CronStatus};

use crate::schedule::Schedule;

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCronJobRequest {
    pub name: String,
    pub schedule: String,
    pub target_url: String,
    #[serde(default = "default_method")]
    pub target_method: String,
    #[serde(default)]
    pub target_payload: Option<String>,
}

pub struct CronService {
    jobs: Arc<dyn CronRepository>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
}

impl CronService {
    pub fn new(jobs: Arc<dyn CronRepository>, recorder: Recorder, clock: Arc<dyn Clock>) -> Self {
        Self { jobs, recorder, clock }
    }

    async fn owned(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<CronJob> {
        let user_id = ctx.user_id()?;
        self.jobs
            .get_cron_job(id)
            .await?
            .filter(|j| j.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("cron job {id}")))
    }

    pub async fn create_job(&self, ctx: &RequestContext, req: CreateCronJobRequest) -> CoreResult<CronJob> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("job name is required".into()));
        }
        let url = req.target_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::InvalidInput(format!("target url `{url}` must be http(s)")));
        }
        let method = req.target_method.trim().to_ascii_uppercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(CoreError::InvalidInput(format!("unsupported method `{method}`")));
        }
        let schedule = Schedule::parse(&req.schedule)?;

        let now = self.clock.now();
        let job = CronJob {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            name: name.to_string(),
            schedule: schedule.expr().to_string(),
            target_url: url.to_string(),
            target_method: method,
            target_payload: req.target_payload,
            status: CronStatus::Active,
            last_run_at: None,
            next_run_at: Some(schedule.next_after(now)?),
            created_at: now,
        };
        self.jobs.create_cron_job(&job).await?;
        info!(job_id = %job.id, schedule = %job.schedule, "cron job created");
        self.recorder
            .audit(
                ctx,
                AuditAction::CronCreate {
                    job_id: job.id,
                    name: job.name.clone(),
                    schedule: job.schedule.clone(),
                },
            )
            .await;
        Ok(job)
    }

    pub async fn get_job(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<CronJob> {
        self.owned(ctx, id).await
    }

    pub async fn list_jobs(&self, ctx: &RequestContext) -> CoreResult<Vec<CronJob>> {
        Ok(self.jobs.list_cron_jobs(ctx.user_id()?).await?)
    }

    pub async fn pause_job(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<CronJob> {
        let job = self.owned(ctx, id).await?;
        if job.status == CronStatus::Paused {
            return Ok(job);
        }
        let job = self
            .jobs
            .modify_cron_job(id, &|row: &mut CronJob| {
                row.status = CronStatus::Paused;
                row.next_run_at = None;
                true
            })
            .await?
            .ok_or_else(|| CoreError::not_found(format!("cron job {id}")))?;
        info!(job_id = %id, "cron job paused");
        self.recorder.audit(ctx, AuditAction::CronPause { job_id: id }).await;
        Ok(job)
    }

    pub async fn resume_job(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<CronJob> {
        let job = self.owned(ctx, id).await?;
        if job.status == CronStatus::Active {
            return Ok(job);
        }
        let next_run = Schedule::parse(&job.schedule)?.next_after(self.clock.now())?;
        let job = self
            .jobs
            .modify_cron_job(id, &|row: &mut CronJob| {
                row.status = CronStatus::Active;
                row.next_run_at = Some(next_run);
                true
            })
            .await?
            .ok_or_else(|| CoreError::not_found(format!("cron job {id}")))?;
        info!(job_id = %id, "cron job resumed");
        self.recorder.audit(ctx, AuditAction::CronResume { job_id: id }).await;
        Ok(job)
    }

    pub async fn delete_job(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<()> {
        self.owned(ctx, id).await?;
        self.jobs.delete_cron_job(id).await?;
        info!(job_id = %id, "cron job deleted");
        self.recorder.audit(ctx, AuditAction::CronDelete { job_id: id }).await;
        Ok(())
    }

    pub async fn list_runs(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Vec<CronJobRun>> {
        self.owned(ctx, id).await?;
        Ok(self.jobs.list_cron_runs(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use nimbus_core::ManualClock;
    use nimbus_state::StateStore;

    fn service() -> (Arc<ManualClock>, CronService, RequestContext) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 30).unwrap()));
        let service = CronService::new(store.clone(), Recorder::new(store.clone(), store, clock.clone()), clock.clone());
        (clock, service, RequestContext::new(Uuid::new_v4(), Uuid::new_v4()))
    }

    fn request(schedule: &str) -> CreateCronJobRequest {
        CreateCronJobRequest {
            name: "ping".into(),
            schedule: schedule.into(),
            target_url: "https://example.com/hook".into(),
            target_method: "post".into(),
            target_payload: Some("{}".into()),
        }
    }

    #[tokio::test]
    async fn create_computes_next_run() {
        let (_clock, service, ctx) = service();
        let job = service.create_job(&ctx, request("*/15 * * * *")).await.unwrap();
        assert_eq!(job.target_method, "POST");
        assert_eq!(job.next_run_at, Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 15, 0).unwrap()));
    }

    #[tokio::test]
    async fn rejects_bad_schedule_and_target() {
        let (_clock, service, ctx) = service();
        let err = service.create_job(&ctx, request("every minute")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        let mut req = request("@hourly");
        req.target_url = "ftp://example.com".into();
        assert!(matches!(service.create_job(&ctx, req).await, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn pause_clears_and_resume_recomputes() {
        let (clock, service, ctx) = service();
        let job = service.create_job(&ctx, request("@hourly")).await.unwrap();

        let paused = service.pause_job(&ctx, job.id).await.unwrap();
        assert_eq!(paused.status, CronStatus::Paused);
        assert_eq!(paused.next_run_at, None);

        clock.advance(Duration::hours(3));
        let resumed = service.resume_job(&ctx, job.id).await.unwrap();
        assert_eq!(resumed.next_run_at, Some(Utc.with_ymd_and_hms(2025, 1, 1, 16, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn jobs_are_owner_scoped() {
        let (_clock, service, ctx) = service();
        let job = service.create_job(&ctx, request("@daily")).await.unwrap();
        let other = RequestContext::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(service.delete_job(&other, job.id).await, Err(CoreError::NotFound(_))));
        service.delete_job(&ctx, job.id).await.unwrap();
        assert!(service.list_jobs(&ctx).await.unwrap().is_empty());
    }
}
