//! Temporally versioned location master.
//!
//! Every (area, spot) has a chain of [`SpotMasterVersion`]s whose
//! `[valid_from, valid_to]` windows never overlap; the one with
//! `valid_to = null` is the open version. A changed name closes the open
//! version and opens a new one, so historical joins keep resolving to the
//! name that was current at the time.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{NaiveDateTime, SubsecRound};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::counts::validate_code;
use crate::{Error, Result, metrics};

const VERSION_COLUMNS: &str = "trim(area) as area, trim(spot) as spot, name, latitude, longitude, description, station, valid_from, valid_to";

type SpotKey = (String, String);
type Snapshot = Arc<BTreeMap<SpotKey, SpotMasterVersion>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpotMasterVersion {
    pub area: String,
    pub spot: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
    /// Nearest-station summary, filled in after the version is opened.
    pub station: String,
    pub valid_from: NaiveDateTime,
    pub valid_to: Option<NaiveDateTime>,
}

impl SpotMasterVersion {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|to| at <= to)
    }

    fn key(&self) -> SpotKey {
        (self.area.clone(), self.spot.clone())
    }

    fn search_text(&self) -> String {
        format!("{}-{},{}{}", self.area, self.spot, self.name, self.station)
    }
}

/// One location as reported by the upstream feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingSpot {
    pub area: String,
    pub spot: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl IncomingSpot {
    pub fn new(
        area: impl Into<String>,
        spot: impl Into<String>,
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            area: area.into(),
            spot: spot.into(),
            name: name.into(),
            latitude,
            longitude,
        }
    }

    fn normalized(&self) -> Result<Self> {
        validate_code("area", &self.area)?;
        validate_code("spot", &self.spot)?;
        Ok(Self {
            area: self.area.trim().to_string(),
            spot: self.spot.trim().to_string(),
            name: self.name.trim().to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }

    fn open_at(&self, valid_from: NaiveDateTime) -> SpotMasterVersion {
        SpotMasterVersion {
            area: self.area.clone(),
            spot: self.spot.clone(),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            description: String::new(),
            station: String::new(),
            valid_from,
            valid_to: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpotFilter {
    pub area: Option<String>,
    pub spot: Option<String>,
    /// Substring searched in `"<area>-<spot>,<name><station>"`.
    pub query: Option<String>,
}

impl SpotFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    pub fn spot(mut self, spot: impl Into<String>) -> Self {
        self.spot = Some(spot.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn matches(&self, version: &SpotMasterVersion) -> bool {
        if let Some(area) = non_blank(&self.area) {
            if version.area != area {
                return false;
            }
        }
        if let Some(spot) = non_blank(&self.spot) {
            if version.spot != spot {
                return false;
            }
        }
        match non_blank(&self.query) {
            Some(q) => version.search_text().contains(q),
            None => true,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Gap between a closed version's `valid_to` and its successor's `valid_from`.
    pub close_offset: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            close_offset: Duration::from_secs(1),
        }
    }
}

impl RegistryConfig {
    fn offset(&self) -> chrono::Duration {
        let secs = self.close_offset.as_secs().max(1);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(1))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub opened: u64,
    pub closed: u64,
    pub unchanged: u64,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.opened > 0 || self.closed > 0
    }
}

#[derive(Debug, Default)]
struct ChangeSet {
    closes: Vec<(SpotMasterVersion, NaiveDateTime)>,
    opens: Vec<SpotMasterVersion>,
    unchanged: u64,
}

/// Diff incoming locations against the open versions.
fn plan_changes(
    open: &BTreeMap<SpotKey, SpotMasterVersion>,
    incoming: BTreeMap<SpotKey, IncomingSpot>,
    now: NaiveDateTime,
    offset: chrono::Duration,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (key, spot) in incoming {
        match open.get(&key) {
            None => changes.opens.push(spot.open_at(now)),
            Some(current) if current.name == spot.name => changes.unchanged += 1,
            Some(current) => {
                // keep windows strictly increasing when `now` repeats
                let effective = now.max(current.valid_from + offset);
                changes.closes.push((current.clone(), effective - offset));
                changes.opens.push(spot.open_at(effective));
            }
        }
    }
    changes
}

/// Owner of the master lifecycle plus an in-process cache of open versions.
pub struct MasterRegistry {
    pool: PgPool,
    config: RegistryConfig,
    cache: RwLock<Snapshot>,
    write_lock: Mutex<()>,
}

impl MasterRegistry {
    pub async fn load(pool: PgPool, config: RegistryConfig) -> Result<Self> {
        let registry = Self {
            pool,
            config,
            cache: RwLock::new(Arc::new(BTreeMap::new())),
            write_lock: Mutex::new(()),
        };
        registry.reload().await?;
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn list_open_versions(&self, filter: &SpotFilter) -> Result<Vec<SpotMasterVersion>> {
        let mut qb = QueryBuilder::<Postgres>::new("select ");
        qb.push(VERSION_COLUMNS);
        qb.push(" from spot_master where valid_to is null");
        if let Some(area) = non_blank(&filter.area) {
            qb.push(" and area = ");
            qb.push_bind(area.to_string());
        }
        if let Some(spot) = non_blank(&filter.spot) {
            qb.push(" and spot = ");
            qb.push_bind(spot.to_string());
        }
        if let Some(q) = non_blank(&filter.query) {
            qb.push(" and strpos(trim(area) || '-' || trim(spot) || ',' || name || station, ");
            qb.push_bind(q.to_string());
            qb.push(") > 0");
        }
        qb.push(" order by area, spot");
        let rows: Vec<SpotMasterVersion> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Reload the cache from the store. Waits for any in-flight reconcile.
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.reload().await
    }

    async fn reload(&self) -> Result<usize> {
        let versions = self.list_open_versions(&SpotFilter::all()).await?;
        let map: BTreeMap<SpotKey, SpotMasterVersion> =
            versions.into_iter().map(|v| (v.key(), v)).collect();
        let n = map.len();
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        debug!(open_versions = n, "master cache reloaded");
        Ok(n)
    }

    fn snapshot(&self) -> Snapshot {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cached(&self, area: &str, spot: &str) -> Option<SpotMasterVersion> {
        self.snapshot()
            .get(&(area.trim().to_string(), spot.trim().to_string()))
            .cloned()
    }

    pub fn cached_all(&self) -> Vec<SpotMasterVersion> {
        self.snapshot().values().cloned().collect()
    }

    pub fn search_cached(&self, filter: &SpotFilter) -> Vec<SpotMasterVersion> {
        self.snapshot()
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect()
    }

    /// Apply an upstream snapshot of locations.
    ///
    /// Unknown locations get a new open version at `now`; renamed ones have
    /// their open version closed and a successor opened. Closes are written
    /// before opens in a single transaction.
    #[instrument(skip_all, fields(incoming = incoming.len()))]
    pub async fn reconcile(
        &self,
        incoming: &[IncomingSpot],
        now: NaiveDateTime,
    ) -> Result<ReconcileOutcome> {
        let now = now.trunc_subsecs(0);
        let mut latest: BTreeMap<SpotKey, IncomingSpot> = BTreeMap::new();
        for spot in incoming {
            let spot = spot.normalized()?;
            latest.insert((spot.area.clone(), spot.spot.clone()), spot);
        }

        let _guard = self.write_lock.lock().await;
        let changes = plan_changes(&self.snapshot(), latest, now, self.config.offset());
        let outcome = ReconcileOutcome {
            opened: changes.opens.len() as u64,
            closed: changes.closes.len() as u64,
            unchanged: changes.unchanged,
        };
        if !outcome.changed() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for (current, valid_to) in &changes.closes {
            let affected = sqlx::query(
                "update spot_master set valid_to = $1 where area = $2 and spot = $3 and valid_from = $4 and valid_to is null",
            )
            .bind(valid_to)
            .bind(&current.area)
            .bind(&current.spot)
            .bind(current.valid_from)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if affected == 0 {
                drop(tx);
                warn!(area = %current.area, spot = %current.spot, "open version changed outside this process; reloading");
                self.reload().await?;
                return Err(Error::NotFound(format!(
                    "open version {}-{} from {} is no longer open",
                    current.area, current.spot, current.valid_from
                )));
            }
            debug!(area = %current.area, spot = %current.spot, valid_to = %valid_to, "version closed");
        }
        for version in &changes.opens {
            let inserted = insert_version(&mut tx, version).await;
            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    drop(tx);
                    warn!(area = %version.area, spot = %version.spot, "version opened outside this process; reloading");
                    self.reload().await?;
                }
                return Err(e);
            }
            debug!(area = %version.area, spot = %version.spot, valid_from = %version.valid_from, name = %version.name, "version opened");
        }
        tx.commit().await?;

        self.reload().await?;
        metrics::record_master_changes(outcome.opened, outcome.closed);
        info!(
            opened = outcome.opened,
            closed = outcome.closed,
            unchanged = outcome.unchanged,
            "master registry reconciled"
        );
        Ok(outcome)
    }

    /// Idempotent write keyed by `(area, spot, valid_from)`.
    pub async fn upsert(&self, version: &SpotMasterVersion) -> Result<()> {
        validate_code("area", &version.area)?;
        validate_code("spot", &version.spot)?;
        if let Some(to) = version.valid_to {
            if to < version.valid_from {
                return Err(Error::invalid(format!(
                    "valid_to {to} precedes valid_from {}",
                    version.valid_from
                )));
            }
        }

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"insert into spot_master (area, spot, name, latitude, longitude, description, station, valid_from, valid_to)
               values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               on conflict (area, spot, valid_from) do update set
                   name = excluded.name,
                   latitude = excluded.latitude,
                   longitude = excluded.longitude,
                   description = excluded.description,
                   station = excluded.station,
                   valid_to = excluded.valid_to"#,
        )
        .bind(version.area.trim())
        .bind(version.spot.trim())
        .bind(&version.name)
        .bind(version.latitude)
        .bind(version.longitude)
        .bind(&version.description)
        .bind(&version.station)
        .bind(version.valid_from)
        .bind(version.valid_to)
        .execute(&self.pool)
        .await?;
        self.reload().await?;
        Ok(())
    }

    /// Every version of a location, oldest first.
    pub async fn history(&self, area: &str, spot: &str) -> Result<Vec<SpotMasterVersion>> {
        validate_code("area", area)?;
        validate_code("spot", spot)?;
        let mut qb = QueryBuilder::<Postgres>::new("select ");
        qb.push(VERSION_COLUMNS);
        qb.push(" from spot_master where area = ");
        qb.push_bind(area.trim());
        qb.push(" and spot = ");
        qb.push_bind(spot.trim());
        qb.push(" order by valid_from");
        let rows: Vec<SpotMasterVersion> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// The version whose window contains `at`.
    pub async fn version_at(
        &self,
        area: &str,
        spot: &str,
        at: NaiveDateTime,
    ) -> Result<Option<SpotMasterVersion>> {
        validate_code("area", area)?;
        validate_code("spot", spot)?;
        let at = at.trunc_subsecs(0);
        let mut qb = QueryBuilder::<Postgres>::new("select ");
        qb.push(VERSION_COLUMNS);
        qb.push(" from spot_master where area = ");
        qb.push_bind(area.trim());
        qb.push(" and spot = ");
        qb.push_bind(spot.trim());
        qb.push(" and valid_from <= ");
        qb.push_bind(at);
        qb.push(" and (valid_to is null or valid_to >= ");
        qb.push_bind(at);
        qb.push(") order by valid_from desc limit 1");
        let row: Option<SpotMasterVersion> =
            qb.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row)
    }

    /// Open versions still waiting for a description and station summary.
    pub async fn pending_station_fill(&self) -> Result<Vec<SpotMasterVersion>> {
        let mut qb = QueryBuilder::<Postgres>::new("select ");
        qb.push(VERSION_COLUMNS);
        qb.push(" from spot_master where valid_to is null and description = '' order by area, spot");
        let rows: Vec<SpotMasterVersion> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn fill_station(
        &self,
        area: &str,
        spot: &str,
        description: &str,
        station: &str,
    ) -> Result<SpotMasterVersion> {
        let filter = SpotFilter::all().area(area).spot(spot);
        let mut open = self
            .list_open_versions(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::NotFound(format!("no open version for {}-{}", area.trim(), spot.trim()))
            })?;
        open.description = description.to_string();
        open.station = station.to_string();
        self.upsert(&open).await?;
        Ok(open)
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    version: &SpotMasterVersion,
) -> Result<()> {
    sqlx::query(
        r#"insert into spot_master (area, spot, name, latitude, longitude, description, station, valid_from, valid_to)
           values ($1, $2, $3, $4, $5, $6, $7, $8, null)"#,
    )
    .bind(&version.area)
    .bind(&version.spot)
    .bind(&version.name)
    .bind(version.latitude)
    .bind(version.longitude)
    .bind(&version.description)
    .bind(&version.station)
    .bind(version.valid_from)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn is_unique_violation(err: &Error) -> bool {
    matches!(err, Error::Db(sqlx::Error::Database(db)) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn open_version(name: &str, from: &str) -> SpotMasterVersion {
        IncomingSpot::new("A01", "S01", name, 35.0, 139.0).open_at(ts(from))
    }

    fn incoming(spots: &[IncomingSpot]) -> BTreeMap<SpotKey, IncomingSpot> {
        spots
            .iter()
            .map(|s| ((s.area.clone(), s.spot.clone()), s.clone()))
            .collect()
    }

    #[test]
    fn rename_closes_one_second_before_the_new_version() {
        let mut open = BTreeMap::new();
        open.insert(
            ("A01".to_string(), "S01".to_string()),
            open_version("Station X", "2024-01-01 00:00:00"),
        );
        let changes = plan_changes(
            &open,
            incoming(&[IncomingSpot::new("A01", "S01", "Station Y", 35.0, 139.0)]),
            ts("2024-01-10 12:00:00"),
            chrono::Duration::seconds(1),
        );
        assert_eq!(changes.closes.len(), 1);
        assert_eq!(changes.closes[0].1, ts("2024-01-10 11:59:59"));
        assert_eq!(changes.opens[0].valid_from, ts("2024-01-10 12:00:00"));
        assert_eq!(changes.opens[0].name, "Station Y");
        assert!(changes.opens[0].description.is_empty());
    }

    #[test]
    fn repeated_now_still_moves_forward() {
        let mut open = BTreeMap::new();
        open.insert(
            ("A01".to_string(), "S01".to_string()),
            open_version("Station Y", "2024-01-10 12:00:00"),
        );
        let changes = plan_changes(
            &open,
            incoming(&[IncomingSpot::new("A01", "S01", "Station Z", 35.0, 139.0)]),
            ts("2024-01-10 12:00:00"),
            chrono::Duration::seconds(1),
        );
        let (closed, valid_to) = &changes.closes[0];
        assert!(*valid_to >= closed.valid_from);
        assert_eq!(*valid_to, ts("2024-01-10 12:00:00"));
        assert_eq!(changes.opens[0].valid_from, ts("2024-01-10 12:00:01"));
    }

    #[test]
    fn same_name_is_unchanged_and_unknown_is_opened() {
        let mut open = BTreeMap::new();
        open.insert(
            ("A01".to_string(), "S01".to_string()),
            open_version("Station X", "2024-01-01 00:00:00"),
        );
        let changes = plan_changes(
            &open,
            incoming(&[
                IncomingSpot::new("A01", "S01", "Station X", 35.0, 139.0),
                IncomingSpot::new("A01", "S02", "Park", 35.1, 139.1),
            ]),
            ts("2024-01-10 12:00:00"),
            chrono::Duration::seconds(1),
        );
        assert_eq!(changes.unchanged, 1);
        assert!(changes.closes.is_empty());
        assert_eq!(changes.opens.len(), 1);
        assert_eq!(changes.opens[0].spot, "S02");
    }

    #[test]
    fn blank_codes_are_rejected() {
        let err = IncomingSpot::new(" ", "S01", "x", 0.0, 0.0)
            .normalized()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let ok = IncomingSpot::new(" A01 ", "S01", " Park ", 0.0, 0.0)
            .normalized()
            .unwrap();
        assert_eq!(ok.area, "A01");
        assert_eq!(ok.name, "Park");
    }

    #[test]
    fn filter_searches_code_name_and_station() {
        let mut v = open_version("Central Park", "2024-01-01 00:00:00");
        v.station = "Shibuya".into();
        assert!(SpotFilter::all().matches(&v));
        assert!(SpotFilter::all().query("A01-S01").matches(&v));
        assert!(SpotFilter::all().query("Park").matches(&v));
        assert!(SpotFilter::all().query("Shibuya").matches(&v));
        assert!(!SpotFilter::all().query("Ueno").matches(&v));
        assert!(SpotFilter::all().area("A01").spot(" ").matches(&v));
        assert!(!SpotFilter::all().area("A02").matches(&v));
    }

    #[test]
    fn window_contains_both_ends() {
        let mut v = open_version("x", "2024-01-01 00:00:00");
        assert!(v.contains(ts("2030-01-01 00:00:00")));
        v.valid_to = Some(ts("2024-01-05 00:00:00"));
        assert!(v.contains(ts("2024-01-05 00:00:00")));
        assert!(!v.contains(ts("2024-01-05 00:00:01")));
        assert!(!v.contains(ts("2023-12-31 23:59:59")));
    }

    #[test]
    fn close_offset_has_a_floor() {
        let config = RegistryConfig {
            close_offset: Duration::from_millis(10),
        };
        assert_eq!(config.offset(), chrono::Duration::seconds(1));
    }
}
