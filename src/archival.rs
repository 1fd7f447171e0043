use chrono::{Days, Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{Archive, ColdStore};
use crate::counts::{CountKey, Counts, InsertOutcome};
use crate::{Error, Result, metrics};

#[derive(Clone, Debug)]
pub struct ArchivalConfig {
    /// Rows read from the hot store and written to the archive per round trip.
    pub batch_size: i64,
    /// Days whose date is at or before `today - archive_after_days` are migrated.
    pub archive_after_days: u32,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            archive_after_days: 2,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DayOutcome {
    pub day: NaiveDate,
    /// Size of each batch read, in order.
    pub batches: Vec<usize>,
    pub attempted: u64,
    pub affected: u64,
    pub deleted: u64,
    pub error: Option<String>,
}

impl DayOutcome {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ArchivalReport {
    pub days: Vec<DayOutcome>,
}

impl ArchivalReport {
    /// Rows newly written to archives.
    pub fn migrated_rows(&self) -> u64 {
        self.days.iter().map(|d| d.affected).sum()
    }

    pub fn deleted_rows(&self) -> u64 {
        self.days.iter().map(|d| d.deleted).sum()
    }

    pub fn failed_days(&self) -> Vec<NaiveDate> {
        self.days
            .iter()
            .filter(|d| !d.succeeded())
            .map(|d| d.day)
            .collect()
    }
}

/// Moves aggregated rows older than the cutoff into per-day archives, then
/// deletes them from the hot store once the archive is verified.
#[derive(Clone)]
pub struct ArchivalJob {
    counts: Counts,
    cold: ColdStore,
    config: ArchivalConfig,
}

impl ArchivalJob {
    pub fn new(counts: Counts, cold: ColdStore, config: ArchivalConfig) -> Self {
        Self {
            counts,
            cold,
            config,
        }
    }

    pub fn config(&self) -> &ArchivalConfig {
        &self.config
    }

    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        archive_cutoff(today, self.config.archive_after_days)
    }

    pub async fn run_once(&self) -> Result<ArchivalReport> {
        self.run_at(Local::now().date_naive()).await
    }

    #[instrument(skip_all, fields(today = %today, batch = self.config.batch_size))]
    pub async fn run_at(&self, today: NaiveDate) -> Result<ArchivalReport> {
        if self.config.batch_size <= 0 {
            return Err(Error::invalid("archival batch size must be positive"));
        }
        let cutoff = self.cutoff(today);
        let days = self.counts.aggregated_days_before(cutoff).await?;
        info!(cutoff = %cutoff, days = days.len(), "archival run started");

        let mut report = ArchivalReport::default();
        for day in days {
            let mut outcome = DayOutcome::new(day);
            match self.archive_day(day, &mut outcome).await {
                Ok(()) => {
                    metrics::record_day_archived(outcome.affected);
                    if outcome.affected < outcome.attempted {
                        warn!(
                            day = %day,
                            attempted = outcome.attempted,
                            affected = outcome.affected,
                            "archive already held some rows; duplicates skipped"
                        );
                    }
                    info!(
                        day = %day,
                        attempted = outcome.attempted,
                        affected = outcome.affected,
                        deleted = outcome.deleted,
                        "day archived"
                    );
                }
                Err(e) if e.is_hot_store_outage() => {
                    error!(day = %day, error = %e, "hot store unavailable; aborting archival run");
                    metrics::record_archive_failure();
                    return Err(e);
                }
                Err(e) => {
                    warn!(day = %day, error = %e, "day not archived; will retry on next run");
                    metrics::record_archive_failure();
                    outcome.error = Some(e.to_string());
                }
            }
            report.days.push(outcome);
        }

        info!(
            days = report.days.len(),
            migrated = report.migrated_rows(),
            deleted = report.deleted_rows(),
            failed = report.failed_days().len(),
            "archival run finished"
        );
        Ok(report)
    }

    async fn archive_day(&self, day: NaiveDate, outcome: &mut DayOutcome) -> Result<()> {
        let Some((archive, read)) = self.copy_day(day, outcome).await? else {
            return Ok(());
        };
        let verified = verify(&archive, read).await;
        archive.close().await;
        verified?;

        outcome.deleted = self.counts.delete_aggregated(day).await?;
        Ok(())
    }

    /// Copy all of `day`'s rows, opening the archive on the first non-empty
    /// batch. Returns the archive and how many rows were read.
    async fn copy_day(
        &self,
        day: NaiveDate,
        outcome: &mut DayOutcome,
    ) -> Result<Option<(Archive, u64)>> {
        let mut batch = self
            .counts
            .aggregated_batch(day, None, self.config.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(None);
        }
        let archive = self.cold.open(day, true).await?;
        let mut read = 0u64;
        loop {
            let written: InsertOutcome = archive.bulk_insert_counts(&batch).await?;
            debug!(
                day = %day,
                batch = batch.len(),
                attempted = written.attempted,
                affected = written.affected,
                "batch archived"
            );
            outcome.batches.push(batch.len());
            outcome.attempted += written.attempted;
            outcome.affected += written.affected;
            read += batch.len() as u64;

            let after: Option<CountKey> = match batch.last() {
                Some(last) if (batch.len() as i64) >= self.config.batch_size => Some(last.key()),
                _ => break,
            };
            batch = self
                .counts
                .aggregated_batch(day, after.as_ref(), self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
        }
        Ok(Some((archive, read)))
    }
}

/// Latest day eligible for archival given `today`.
pub fn archive_cutoff(today: NaiveDate, archive_after_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(archive_after_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// The archive must hold at least every row read from the hot store.
async fn verify(archive: &Archive, read: u64) -> Result<()> {
    let stored = u64::try_from(archive.count_rows().await?).unwrap_or(0);
    if stored < read {
        return Err(Error::PartialWrite {
            attempted: read,
            affected: stored,
        });
    }
    Ok(())
}
