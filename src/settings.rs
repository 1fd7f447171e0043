//! Process configuration.
//!
//! Sources, later overriding earlier:
//! 1. `dockstore.toml` in the working directory (optional)
//! 2. the file passed to [`Settings::load`] (required when given)
//! 3. `DOCKSTORE__<SECTION>__<KEY>` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::archival::ArchivalConfig;
use crate::registry::RegistryConfig;
use crate::retention::RetentionConfig;
use crate::router::RouterConfig;
use crate::scheduler::Schedule;
use crate::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "dockstore";
pub const CONFIG_ENV_PREFIX: &str = "DOCKSTORE";
pub const LOG_ENV_VAR: &str = "DOCKSTORE_LOG";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub archive: ArchiveSettings,
    pub retention: RetentionSettings,
    pub router: RouterSettings,
    pub registry: RegistrySettings,
    pub health: HealthSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    /// Postgres schema holding the hot store tables.
    pub schema: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_secs: 30,
            schema: "public".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub data_dir: PathBuf,
    /// Local time of the daily archival run, `HH:MM`.
    pub run_at: String,
    pub batch_size: i64,
    pub archive_after_days: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            run_at: "00:00".to_string(),
            batch_size: 5000,
            archive_after_days: 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub interval_minutes: u64,
    pub window_minutes: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
            window_minutes: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub recent_window_days: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            recent_window_days: 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub close_offset_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            close_offset_secs: 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Fewer raw rows than this means scraping has stalled.
    pub min_raw_rows: i64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { min_raw_rows: 1000 }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(Error::invalid("database.max_connections must be at least 1"));
        }
        if self.database.schema.trim().is_empty() {
            return Err(Error::invalid("database.schema must not be empty"));
        }
        if self.archive.batch_size <= 0 {
            return Err(Error::invalid("archive.batch_size must be positive"));
        }
        if self.retention.interval_minutes == 0 || self.retention.window_minutes == 0 {
            return Err(Error::invalid(
                "retention.interval_minutes and retention.window_minutes must be positive",
            ));
        }
        if self.router.recent_window_days == 0 {
            return Err(Error::invalid("router.recent_window_days must be positive"));
        }
        Schedule::parse_daily(&self.archive.run_at)?;
        // the router's tier boundary must be the archival cutoff, or a day is
        // read from a tier that does not hold it
        if self.archive.archive_after_days != self.router.recent_window_days {
            return Err(Error::invalid(format!(
                "archive.archive_after_days ({}) must equal router.recent_window_days ({})",
                self.archive.archive_after_days, self.router.recent_window_days
            )));
        }
        Ok(())
    }

    /// Explicit URL wins, then settings, then `DATABASE_URL`.
    pub fn database_url(&self, explicit: Option<String>) -> Result<String> {
        explicit
            .or_else(|| self.database.url.clone())
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or_else(|| {
                Error::invalid("no database url: pass --database-url, set database.url or DATABASE_URL")
            })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    pub fn archival_config(&self) -> ArchivalConfig {
        ArchivalConfig {
            batch_size: self.archive.batch_size,
            archive_after_days: self.archive.archive_after_days,
        }
    }

    pub fn archive_schedule(&self) -> Result<Schedule> {
        Schedule::parse_daily(&self.archive.run_at)
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            window: Duration::from_secs(self.retention.window_minutes * 60),
            interval: Duration::from_secs(self.retention.interval_minutes * 60),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            recent_window_days: self.router.recent_window_days,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            close_offset: Duration::from_secs(self.registry.close_offset_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.archival_config().batch_size, 5000);
        assert_eq!(settings.retention_config().window, Duration::from_secs(1800));
        assert_eq!(settings.router_config().recent_window_days, 2);
        assert_eq!(
            settings.registry_config().close_offset,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn archiving_inside_the_recent_window_is_rejected() {
        let mut settings = Settings::default();
        settings.archive.archive_after_days = 1;
        assert!(matches!(settings.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn archiving_later_than_the_router_boundary_is_rejected() {
        let mut settings = Settings::default();
        settings.archive.archive_after_days = 5;
        settings.router.recent_window_days = 2;
        assert!(matches!(settings.validate(), Err(Error::InvalidInput(_))));

        settings.router.recent_window_days = 5;
        settings.validate().unwrap();
        let today = chrono::NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let cutoff = crate::archival::archive_cutoff(today, settings.archive.archive_after_days);
        let router = settings.router_config();
        let first_cold = cutoff;
        let last_hot = cutoff.succ_opt().unwrap();
        assert_eq!(
            crate::router::tier_for(Some(first_cold), today, router.recent_window_days),
            crate::router::Tier::Historical
        );
        assert_eq!(
            crate::router::tier_for(Some(last_hot), today, router.recent_window_days),
            crate::router::Tier::Recent
        );
    }

    #[test]
    fn blank_schema_is_rejected() {
        let mut settings = Settings::default();
        settings.database.schema = "  ".into();
        assert!(matches!(settings.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn bad_run_at_is_rejected() {
        let mut settings = Settings::default();
        settings.archive.run_at = "24:61".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[archive]\nbatch_size = 100\nrun_at = \"03:15\"\n\n[router]\nrecent_window_days = 2"
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.archive.batch_size, 100);
        assert_eq!(settings.archive.archive_after_days, 2);
        assert_eq!(
            settings.archive_schedule().unwrap(),
            Schedule::DailyAt(chrono::NaiveTime::from_hms_opt(3, 15, 0).unwrap())
        );
    }

    #[test]
    fn explicit_database_url_wins() {
        let mut settings = Settings::default();
        settings.database.url = Some("postgres://from-settings".into());
        assert_eq!(
            settings
                .database_url(Some("postgres://explicit".into()))
                .unwrap(),
            "postgres://explicit"
        );
        assert_eq!(
            settings.database_url(None).unwrap(),
            "postgres://from-settings"
        );
    }
}
