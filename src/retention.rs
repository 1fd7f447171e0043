//! Rolling-window cleanup of raw high-frequency samples.

use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tracing::{info, instrument};

use crate::counts::{CountPredicate, CountTable, Counts};
use crate::{Result, metrics};

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    /// Raw rows older than this are deleted.
    pub window: Duration,
    /// How often the scheduler fires the purge.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone)]
pub struct RetentionPurge {
    counts: Counts,
    config: RetentionConfig,
}

impl RetentionPurge {
    pub fn new(counts: Counts, config: RetentionConfig) -> Self {
        Self { counts, config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        chrono::Duration::from_std(self.config.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(NaiveDateTime::MIN)
    }

    pub async fn run_once(&self) -> Result<u64> {
        self.run_at(Local::now().naive_local()).await
    }

    /// Delete raw rows strictly older than `now - window`.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn run_at(&self, now: NaiveDateTime) -> Result<u64> {
        let cutoff = self.cutoff(now);
        let deleted = self
            .counts
            .delete_counts(CountTable::Raw, &CountPredicate::OlderThan(cutoff))
            .await?;
        metrics::record_raw_purged(deleted);
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "raw counts purged");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn cutoff_is_window_before_now() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let purge = RetentionPurge::new(Counts::new(pool), RetentionConfig::default());
        assert_eq!(
            purge.cutoff(ts("2024-01-10 08:30:00")),
            ts("2024-01-10 08:00:00")
        );
    }
}
