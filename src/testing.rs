//! Helpers for tests that run against a live hot store.

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{Pool, Postgres};

use crate::counts::{CountRecord, CountTable, Counts};
use crate::schema::{SchemaConfig, SchemaManager};
use crate::{Error, Result};

pub async fn ensure_schema(pool: &Pool<Postgres>) -> Result<()> {
    SchemaManager::new(pool.clone())
        .sync(&SchemaConfig::default())
        .await?;
    Ok(())
}

pub async fn truncate_all(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query("truncate raw_counts, aggregated_counts, spot_master, config")
        .execute(pool)
        .await?;
    Ok(())
}

/// Parse `YYYY-MM-DD HH:MM:SS`.
pub fn ts(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| Error::invalid(format!("bad timestamp `{raw}`: {e}")))
}

pub fn day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| Error::invalid(format!("bad date `{raw}`: {e}")))
}

/// `n` one-minute-apart samples for `day`, spread over as many spots as needed.
pub fn samples_for_day(area: &str, day: NaiveDate, n: usize) -> Vec<CountRecord> {
    const PER_SPOT: usize = 1440;
    (0..n)
        .map(|i| {
            let spot = format!("{:03}", i / PER_SPOT);
            let minute = (i % PER_SPOT) as i64;
            let time = day.and_time(chrono::NaiveTime::MIN) + chrono::Duration::minutes(minute);
            CountRecord::new(area, spot, time, (i % 30) as i32)
        })
        .collect()
}

pub async fn seed(pool: &Pool<Postgres>, table: CountTable, rows: &[CountRecord]) -> Result<u64> {
    let outcome = Counts::new(pool.clone())
        .bulk_insert_counts(table, rows)
        .await?;
    Ok(outcome.affected)
}
