//! Cold store: one SQLite file per calendar day.
//!
//! Layout:
//! ```text
//! {data_dir}/2024-01-10.db   counts(area, spot, time, count), primary key (area, spot, time)
//! ```
//! `time` is stored as text in [`TIME_LAYOUT`] so lexical order is time order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use indoc::indoc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, warn};

use crate::counts::{CountRecord, InsertOutcome, SortOrder, TIME_LAYOUT, validate_code};
use crate::{Error, Result, metrics};

const FILE_DATE_LAYOUT: &str = "%Y-%m-%d";

// Stays under SQLite's host-parameter limit on older builds (999).
const ROWS_PER_STATEMENT: usize = 200;

const CREATE_COUNTS_TABLE: &str = indoc! {"
    create table if not exists counts (
        area character(3) not null,
        spot character(3) not null,
        time character(20) not null,
        count integer not null,
        primary key (area, spot, time)
    )
"};

#[derive(Clone, Debug)]
pub struct ColdStore {
    data_dir: PathBuf,
}

impl ColdStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("{}.db", day.format(FILE_DATE_LAYOUT)))
    }

    pub async fn exists(&self, day: NaiveDate) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(day)).await?)
    }

    /// Open the archive for `day`.
    ///
    /// A missing file is created (with its schema) only when `create_if_missing`
    /// is set; otherwise the call fails with [`Error::NotFound`].
    pub async fn open(&self, day: NaiveDate, create_if_missing: bool) -> Result<Archive> {
        let path = self.path_for(day);
        let exists = tokio::fs::try_exists(&path).await?;
        if !exists && !create_if_missing {
            return Err(Error::NotFound(format!(
                "no archive for {} ({})",
                day,
                path.display()
            )));
        }
        if !exists {
            tokio::fs::create_dir_all(&self.data_dir).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(create_if_missing)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| Error::Archive {
                path: path.clone(),
                source,
            })?;

        let archive = Archive { day, path, pool };
        if create_if_missing {
            sqlx::query(CREATE_COUNTS_TABLE)
                .execute(&archive.pool)
                .await
                .map_err(|e| archive.wrap(e))?;
            if !exists {
                debug!(day = %day, path = %archive.path.display(), "archive created");
            }
        }
        Ok(archive)
    }

    /// Days that have an archive file, ascending.
    pub async fn list_days(&self) -> Result<Vec<NaiveDate>> {
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut days = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            if let Some(day) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, FILE_DATE_LAYOUT).ok())
            {
                days.push(day);
            }
        }
        days.sort();
        Ok(days)
    }
}

/// Handle to a single day's archive file.
pub struct Archive {
    day: NaiveDate,
    path: PathBuf,
    pool: SqlitePool,
}

impl Archive {
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wrap(&self, source: sqlx::Error) -> Error {
        Error::Archive {
            path: self.path.clone(),
            source,
        }
    }

    /// Idempotent append. Rows stamped with a different day than the archive's
    /// are refused and reported in [`InsertOutcome::rejected`].
    pub async fn bulk_insert_counts(&self, rows: &[CountRecord]) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        let mut accepted: Vec<&CountRecord> = Vec::with_capacity(rows.len());
        for row in rows {
            outcome.attempted += 1;
            if row.day() != self.day {
                outcome.rejected += 1;
                warn!(archive_day = %self.day, row = %row, "row does not belong to this archive; skipped");
                continue;
            }
            validate_code("area", &row.area)?;
            validate_code("spot", &row.spot)?;
            accepted.push(row);
        }
        if accepted.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await.map_err(|e| self.wrap(e))?;
        for chunk in accepted.chunks(ROWS_PER_STATEMENT) {
            let mut qb =
                QueryBuilder::<Sqlite>::new("insert or ignore into counts (area, spot, time, count) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.area.trim().to_string())
                    .push_bind(row.spot.trim().to_string())
                    .push_bind(row.time.format(TIME_LAYOUT).to_string())
                    .push_bind(row.count);
            });
            let affected = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| self.wrap(e))?
                .rows_affected();
            outcome.affected += affected;
        }
        tx.commit().await.map_err(|e| self.wrap(e))?;
        Ok(outcome)
    }

    pub async fn query_counts(
        &self,
        area: &str,
        spot: &str,
        order: SortOrder,
    ) -> Result<Vec<CountRecord>> {
        validate_code("area", area)?;
        validate_code("spot", spot)?;
        let sql = format!(
            "select area, spot, time, count from counts where area = ? and spot = ? order by time {}",
            order.as_sql()
        );
        let rows: Vec<(String, String, String, i32)> = sqlx::query_as(&sql)
            .bind(area.trim())
            .bind(spot.trim())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.wrap(e))?;

        let mut out = Vec::with_capacity(rows.len());
        for (area, spot, time, count) in rows {
            match NaiveDateTime::parse_from_str(time.trim(), TIME_LAYOUT) {
                Ok(time) => out.push(CountRecord::new(area.trim(), spot.trim(), time, count)),
                Err(err) => {
                    warn!(path = %self.path.display(), time = %time, error = %err, "unparseable archive timestamp; row skipped");
                }
            }
        }
        metrics::record_cold_read();
        Ok(out)
    }

    pub async fn count_rows(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("select count(1) from counts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.wrap(e))?;
        Ok(n)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
