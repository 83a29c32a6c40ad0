//! nimbus-cron — scheduled HTTP jobs.
//!
//! ```text
//! CronService ── create/resume → Schedule::next_after(now) → next_run_at
//!                pause         → next_run_at = None
//!
//! CronDispatcher (every 10 s)
//!   get_due_cron_jobs(now) ──► one task per job
//!                                 HTTP (30 s) → CronJobRun
//!                                 last_run_at = now, next_run_at = next(now)
//! ```

pub mod dispatcher;
pub mod schedule;
pub mod service;

pub use dispatcher::{CronDispatcher, RUN_TIMEOUT};
pub use schedule::{CronError, Schedule};
pub use service::{CreateCronJobRequest, CronService};
