use chrono::{Local, NaiveDate};
use tracing::debug;

use crate::archive::ColdStore;
use crate::counts::{CountQuery, CountRecord, CountTable, Counts, SortOrder, validate_code};
use crate::{Error, Result, WithContext};

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Trailing days (today included) served by the hot store.
    pub recent_window_days: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            recent_window_days: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Recent,
    Historical,
}

/// Hot or cold? Undated and future requests are always recent.
pub fn tier_for(day: Option<NaiveDate>, today: NaiveDate, recent_window_days: u32) -> Tier {
    match day {
        None => Tier::Recent,
        Some(day) => {
            let age = today.signed_duration_since(day).num_days();
            if age < i64::from(recent_window_days) {
                Tier::Recent
            } else {
                Tier::Historical
            }
        }
    }
}

/// Accepts `YYYYMMDD` and `YYYY-MM-DD`.
pub fn parse_day(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| Error::invalid(format!("`{raw}` is not a date (expected YYYYMMDD)")))
}

/// Sends count reads to whichever tier holds the requested day.
#[derive(Clone)]
pub struct QueryRouter {
    counts: Counts,
    cold: ColdStore,
    config: RouterConfig,
}

impl QueryRouter {
    pub fn new(counts: Counts, cold: ColdStore, config: RouterConfig) -> Self {
        Self {
            counts,
            cold,
            config,
        }
    }

    pub fn tier_for(&self, day: Option<NaiveDate>, today: NaiveDate) -> Tier {
        tier_for(day, today, self.config.recent_window_days)
    }

    pub async fn resolve_counts(
        &self,
        area: &str,
        spot: &str,
        date: Option<&str>,
    ) -> Result<Vec<CountRecord>> {
        self.resolve_counts_at(area, spot, date, Local::now().date_naive())
            .await
    }

    /// Same as [`resolve_counts`](Self::resolve_counts) with an explicit "today".
    pub async fn resolve_counts_at(
        &self,
        area: &str,
        spot: &str,
        date: Option<&str>,
        today: NaiveDate,
    ) -> Result<Vec<CountRecord>> {
        validate_code("area", area)?;
        validate_code("spot", spot)?;
        let (area, spot) = (area.trim(), spot.trim());

        let day = match date.map(str::trim).filter(|d| !d.is_empty()) {
            None => {
                let query = CountQuery::latest(area, spot);
                return self.counts.query_counts(CountTable::Aggregated, &query).await;
            }
            Some(raw) => parse_day(raw)?,
        };

        match self.tier_for(Some(day), today) {
            Tier::Recent => {
                debug!(area, spot, day = %day, "routing to hot store");
                let query = CountQuery::new(area, spot)
                    .on_day(day)
                    .order(SortOrder::Desc);
                self.counts.query_counts(CountTable::Aggregated, &query).await
            }
            Tier::Historical => {
                debug!(area, spot, day = %day, "routing to archive");
                let archive = self.cold.open(day, false).await?;
                let rows = archive
                    .query_counts(area, spot, SortOrder::Desc)
                    .await
                    .context(format!("reading archive for {day}"));
                archive.close().await;
                rows
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn today_and_yesterday_are_recent() {
        let today = day("2024-01-10");
        assert_eq!(tier_for(None, today, 2), Tier::Recent);
        assert_eq!(tier_for(Some(today), today, 2), Tier::Recent);
        assert_eq!(tier_for(Some(day("2024-01-09")), today, 2), Tier::Recent);
        assert_eq!(tier_for(Some(day("2024-01-08")), today, 2), Tier::Historical);
        assert_eq!(tier_for(Some(day("2023-12-31")), today, 2), Tier::Historical);
    }

    #[test]
    fn future_dates_are_recent() {
        let today = day("2024-01-10");
        assert_eq!(tier_for(Some(day("2024-01-11")), today, 2), Tier::Recent);
    }

    #[test]
    fn window_is_configurable() {
        let today = day("2024-01-10");
        assert_eq!(tier_for(Some(day("2024-01-08")), today, 3), Tier::Recent);
        assert_eq!(tier_for(Some(day("2024-01-09")), today, 1), Tier::Historical);
    }

    #[test]
    fn parses_compact_and_dashed_dates() {
        assert_eq!(parse_day("20240110").unwrap(), day("2024-01-10"));
        assert_eq!(parse_day(" 2024-01-10 ").unwrap(), day("2024-01-10"));
        assert!(matches!(parse_day("2024/01/10"), Err(Error::InvalidInput(_))));
        assert!(matches!(parse_day("20241310"), Err(Error::InvalidInput(_))));
    }
}
