use std::fmt;

use chrono::{Days, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};

use crate::{Error, Result, metrics};

/// Rendering used for timestamps in logs and archive files.
pub const TIME_LAYOUT: &str = "%Y/%m/%d %H:%M:%S";

// 4 binds per row keeps a chunk well under the 65535 bind limit.
const ROWS_PER_STATEMENT: usize = 10_000;

/// Widest area/spot code the stores accept (`character(3)`).
pub const CODE_WIDTH: usize = 3;

/// One occupancy sample. Natural key is (area, spot, time).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CountRecord {
    pub area: String,
    pub spot: String,
    pub time: NaiveDateTime,
    pub count: i32,
}

impl CountRecord {
    pub fn new(
        area: impl Into<String>,
        spot: impl Into<String>,
        time: NaiveDateTime,
        count: i32,
    ) -> Self {
        Self {
            area: area.into(),
            spot: spot.into(),
            time,
            count,
        }
    }

    pub fn key(&self) -> CountKey {
        CountKey {
            area: self.area.clone(),
            spot: self.spot.clone(),
            time: self.time,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.time.date()
    }
}

impl fmt::Display for CountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {} {}",
            self.area,
            self.spot,
            self.time.format(TIME_LAYOUT),
            self.count
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CountKey {
    pub area: String,
    pub spot: String,
    pub time: NaiveDateTime,
}

/// Which hot-store table an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountTable {
    /// High-frequency samples written by ingestion; trimmed by the retention purge.
    Raw,
    /// Rows produced by the aggregation feed; migrated by the archival job.
    Aggregated,
}

impl CountTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            CountTable::Raw => "raw_counts",
            CountTable::Aggregated => "aggregated_counts",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CountQuery {
    pub area: String,
    pub spot: String,
    pub day: Option<NaiveDate>,
    pub order: SortOrder,
    pub limit: Option<i64>,
}

impl CountQuery {
    pub fn new(area: impl Into<String>, spot: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            spot: spot.into(),
            day: None,
            order: SortOrder::Desc,
            limit: None,
        }
    }

    /// Most recent sample only. Callers without a day filter are expected to use this.
    pub fn latest(area: impl Into<String>, spot: impl Into<String>) -> Self {
        Self::new(area, spot).limit(1)
    }

    pub fn on_day(mut self, day: NaiveDate) -> Self {
        self.day = Some(day);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Debug)]
pub enum CountPredicate {
    /// Rows with `time` strictly before the instant.
    OlderThan(NaiveDateTime),
    /// Rows whose calendar date equals the day.
    OnDay(NaiveDate),
    Spot { area: String, spot: String },
}

/// Attempted vs. affected row counts of an idempotent bulk insert.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub attempted: u64,
    pub affected: u64,
    /// Rows refused by a guard before reaching the store.
    pub rejected: u64,
}

impl InsertOutcome {
    /// Rows the store skipped because the natural key already existed.
    pub fn skipped(&self) -> u64 {
        self.attempted
            .saturating_sub(self.affected)
            .saturating_sub(self.rejected)
    }

    pub fn merge(&mut self, other: InsertOutcome) {
        self.attempted += other.attempted;
        self.affected += other.affected;
        self.rejected += other.rejected;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrapeStatus {
    Healthy { rows: i64 },
    Stalled { rows: i64, min_rows: i64 },
}

impl ScrapeStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ScrapeStatus::Healthy { .. })
    }
}

/// Half-open `[start, end)` bounds covering one calendar day.
pub fn day_bounds(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = day.and_time(chrono::NaiveTime::MIN);
    let end = day
        .checked_add_days(Days::new(1))
        .map(|next| next.and_time(chrono::NaiveTime::MIN))
        .unwrap_or(NaiveDateTime::MAX);
    (start, end)
}

pub(crate) fn validate_code(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid(format!("{field} is required")));
    }
    if value.chars().count() > CODE_WIDTH {
        return Err(Error::invalid(format!(
            "{field} `{value}` is longer than {CODE_WIDTH} characters"
        )));
    }
    Ok(())
}

/// Typed access to the hot store's count tables.
#[derive(Clone)]
pub struct Counts {
    pub(crate) pool: PgPool,
}

impl Counts {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append rows, skipping natural-key duplicates. All chunks commit together.
    #[instrument(skip_all, fields(table = table.table_name(), rows = rows.len()))]
    pub async fn bulk_insert_counts(
        &self,
        table: CountTable,
        rows: &[CountRecord],
    ) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        if rows.is_empty() {
            return Ok(outcome);
        }
        for row in rows {
            validate_code("area", &row.area)?;
            validate_code("spot", &row.spot)?;
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Postgres>::new("insert into ");
            qb.push(table.table_name());
            qb.push(" (area, spot, time, count) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.area.trim())
                    .push_bind(row.spot.trim())
                    .push_bind(row.time)
                    .push_bind(row.count);
            });
            qb.push(" on conflict do nothing");
            let affected = qb.build().execute(&mut *tx).await?.rows_affected();
            outcome.attempted += chunk.len() as u64;
            outcome.affected += affected;
        }
        tx.commit().await?;

        metrics::record_rows_ingested(outcome.affected);
        debug!(
            attempted = outcome.attempted,
            affected = outcome.affected,
            "bulk insert finished"
        );
        Ok(outcome)
    }

    pub async fn query_counts(
        &self,
        table: CountTable,
        query: &CountQuery,
    ) -> Result<Vec<CountRecord>> {
        validate_code("area", &query.area)?;
        validate_code("spot", &query.spot)?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "select trim(area) as area, trim(spot) as spot, time, count from ",
        );
        qb.push(table.table_name());
        qb.push(" where area = ");
        qb.push_bind(query.area.trim());
        qb.push(" and spot = ");
        qb.push_bind(query.spot.trim());
        if let Some(day) = query.day {
            let (start, end) = day_bounds(day);
            qb.push(" and time >= ");
            qb.push_bind(start);
            qb.push(" and time < ");
            qb.push_bind(end);
        }
        qb.push(" order by time ");
        qb.push(query.order.as_sql());
        if let Some(limit) = query.limit {
            qb.push(" limit ");
            qb.push_bind(limit);
        }

        let rows: Vec<CountRecord> = qb.build_query_as().fetch_all(&self.pool).await?;
        metrics::record_hot_read();
        Ok(rows)
    }

    pub async fn delete_counts(&self, table: CountTable, predicate: &CountPredicate) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("delete from ");
        qb.push(table.table_name());
        qb.push(" where ");
        match predicate {
            CountPredicate::OlderThan(before) => {
                qb.push("time < ");
                qb.push_bind(*before);
            }
            CountPredicate::OnDay(day) => {
                let (start, end) = day_bounds(*day);
                qb.push("time >= ");
                qb.push_bind(start);
                qb.push(" and time < ");
                qb.push_bind(end);
            }
            CountPredicate::Spot { area, spot } => {
                validate_code("area", area)?;
                validate_code("spot", spot)?;
                qb.push("area = ");
                qb.push_bind(area.trim());
                qb.push(" and spot = ");
                qb.push_bind(spot.trim());
            }
        }
        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(affected)
    }

    /// Delete every aggregated row whose date equals `day`.
    pub async fn delete_aggregated(&self, day: NaiveDate) -> Result<u64> {
        let deleted = self
            .delete_counts(CountTable::Aggregated, &CountPredicate::OnDay(day))
            .await?;
        metrics::record_aggregated_deleted(deleted);
        Ok(deleted)
    }

    /// Distinct days present in the aggregated table on or before `cutoff`, ascending.
    pub async fn aggregated_days_before(&self, cutoff: NaiveDate) -> Result<Vec<NaiveDate>> {
        let (_, end) = day_bounds(cutoff);
        let days: Vec<NaiveDate> = sqlx::query_scalar(
            "select distinct time::date as day from aggregated_counts where time < $1 order by day",
        )
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(days)
    }

    /// One keyset page of a day's aggregated rows, ordered by natural key.
    pub async fn aggregated_batch(
        &self,
        day: NaiveDate,
        after: Option<&CountKey>,
        limit: i64,
    ) -> Result<Vec<CountRecord>> {
        let (start, end) = day_bounds(day);
        let mut qb = QueryBuilder::<Postgres>::new(
            "select trim(area) as area, trim(spot) as spot, time, count from aggregated_counts where time >= ",
        );
        qb.push_bind(start);
        qb.push(" and time < ");
        qb.push_bind(end);
        if let Some(key) = after {
            qb.push(" and (area, spot, time) > (");
            qb.push_bind(key.area.as_str());
            qb.push("::bpchar, ");
            qb.push_bind(key.spot.as_str());
            qb.push("::bpchar, ");
            qb.push_bind(key.time);
            qb.push(")");
        }
        qb.push(" order by area, spot, time limit ");
        qb.push_bind(limit);

        let rows: Vec<CountRecord> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn count_rows(&self, table: CountTable, day: Option<NaiveDate>) -> Result<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("select count(1) from ");
        qb.push(table.table_name());
        if let Some(day) = day {
            let (start, end) = day_bounds(day);
            qb.push(" where time >= ");
            qb.push_bind(start);
            qb.push(" and time < ");
            qb.push_bind(end);
        }
        let n: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(n)
    }

    /// Scraping is considered stalled when the raw table holds fewer than `min_rows` rows.
    pub async fn scrape_status(&self, min_rows: i64) -> Result<ScrapeStatus> {
        let rows = self.count_rows(CountTable::Raw, None).await?;
        if rows < min_rows {
            Ok(ScrapeStatus::Stalled { rows, min_rows })
        } else {
            Ok(ScrapeStatus::Healthy { rows })
        }
    }
}
