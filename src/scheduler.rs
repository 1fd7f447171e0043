use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDateTime, NaiveTime};
use sqlx::{Connection, PgConnection, PgPool};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archival::ArchivalJob;
use crate::retention::RetentionPurge;
use crate::store::advisory_lock_key;
use crate::{Error, Result};

/// A unit of background work the scheduler can fire.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Stable name; also keys the job's advisory lock.
    fn name(&self) -> &str;
    async fn run(&self) -> Result<()>;
}

#[async_trait]
impl ScheduledJob for ArchivalJob {
    fn name(&self) -> &str {
        "archival"
    }

    async fn run(&self) -> Result<()> {
        let report = self.run_once().await?;
        let failed = report.failed_days();
        if !failed.is_empty() {
            warn!(failed_days = ?failed, "archival finished with failed days");
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for RetentionPurge {
    fn name(&self) -> &str {
        "retention"
    }

    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Once a day at a local wall-clock time.
    DailyAt(NaiveTime),
    Every(Duration),
}

impl Schedule {
    /// Parse `HH:MM` into a daily schedule.
    pub fn parse_daily(raw: &str) -> Result<Self> {
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .map(Schedule::DailyAt)
            .map_err(|_| Error::invalid(format!("`{raw}` is not a time of day (expected HH:MM)")))
    }

    /// First fire time strictly after `now`.
    pub fn next_run_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self {
            Schedule::DailyAt(at) => {
                let today = now.date().and_time(*at);
                if today > now {
                    today
                } else {
                    now.date()
                        .checked_add_days(Days::new(1))
                        .map(|d| d.and_time(*at))
                        .unwrap_or(NaiveDateTime::MAX)
                }
            }
            Schedule::Every(every) => chrono::Duration::from_std(*every)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(NaiveDateTime::MAX),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Another instance held the job's lock.
    Skipped,
}

/// Run `job` only if no other process is running a job of the same name.
///
/// The advisory lock is transaction-scoped and lives on a connection opened
/// outside `pool`, so the job keeps every pooled connection. The lock is
/// released when the guard transaction ends, even if this process dies mid-run.
pub async fn run_guarded(pool: &PgPool, job: &dyn ScheduledJob) -> Result<RunOutcome> {
    let options = pool.connect_options();
    let mut conn = PgConnection::connect_with(&options).await?;
    let mut guard = conn.begin().await?;
    let acquired: bool = sqlx::query_scalar("select pg_try_advisory_xact_lock($1)")
        .bind(advisory_lock_key(job.name()))
        .fetch_one(&mut *guard)
        .await?;
    if !acquired {
        guard.rollback().await?;
        release(conn, job.name()).await;
        info!(job = job.name(), "job already running elsewhere; skipped");
        return Ok(RunOutcome::Skipped);
    }

    let result = job.run().await;
    if let Err(e) = guard.rollback().await {
        warn!(job = job.name(), error = %e, "failed to release job lock");
    }
    release(conn, job.name()).await;
    result.map(|()| RunOutcome::Completed)
}

async fn release(conn: PgConnection, job: &str) {
    if let Err(e) = conn.close().await {
        debug!(job, error = %e, "lock connection closed uncleanly");
    }
}

struct JobRegistration {
    job: Arc<dyn ScheduledJob>,
    schedule: Schedule,
}

pub struct Scheduler {
    pool: PgPool,
    registrations: Vec<JobRegistration>,
}

impl Scheduler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            registrations: Vec::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn ScheduledJob>, schedule: Schedule) {
        self.registrations.push(JobRegistration { job, schedule });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.job.name()).collect()
    }

    /// Fire one registered job now, under its lock.
    pub async fn run_once(&self, name: &str) -> Result<RunOutcome> {
        let reg = self
            .registrations
            .iter()
            .find(|r| r.job.name() == name)
            .ok_or_else(|| Error::NotFound(format!("unknown job `{name}`")))?;
        run_guarded(&self.pool, reg.job.as_ref()).await
    }

    /// Start one task per job; each sleeps until its next fire time.
    pub fn spawn(self) -> SchedulerHandle {
        let handles = self
            .registrations
            .into_iter()
            .map(|reg| {
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    info!(job = reg.job.name(), schedule = ?reg.schedule, "job scheduled");
                    loop {
                        let now = Local::now().naive_local();
                        let next = reg.schedule.next_run_after(now);
                        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await;

                        match run_guarded(&pool, reg.job.as_ref()).await {
                            Ok(RunOutcome::Completed) => {
                                info!(job = reg.job.name(), "job completed")
                            }
                            Ok(RunOutcome::Skipped) => {}
                            Err(e) => error!(job = reg.job.name(), error = %e, "job failed"),
                        }
                    }
                })
            })
            .collect();
        SchedulerHandle { handles }
    }
}

pub struct SchedulerHandle {
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Abort every job task; work already committed stays committed.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
