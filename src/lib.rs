//! dockstore: hot/cold tiered storage for bike-share dock occupancy counts,
//! powered by Postgres and per-day SQLite archives.

pub mod archival;
pub mod archive;
pub mod config_entries;
pub mod counts;
mod error;
pub mod import;
pub mod metrics;
pub mod registry;
pub mod retention;
pub mod router;
pub mod scheduler;
pub mod schema;
pub mod settings;
pub mod store;
pub mod testing;

pub use archival::{ArchivalConfig, ArchivalJob, ArchivalReport, DayOutcome};
pub use archive::{Archive, ColdStore};
pub use config_entries::{ConfigEntries, ConfigEntry};
pub use counts::{
    CountKey, CountPredicate, CountQuery, CountRecord, CountTable, Counts, InsertOutcome,
    ScrapeStatus, SortOrder,
};
pub use error::{Error, ErrorKind, Result, WithContext};
pub use import::{CsvImportOptions, CsvImporter};
pub use registry::{
    IncomingSpot, MasterRegistry, ReconcileOutcome, RegistryConfig, SpotFilter, SpotMasterVersion,
};
pub use retention::{RetentionConfig, RetentionPurge};
pub use router::{QueryRouter, RouterConfig, Tier};
pub use scheduler::{RunOutcome, Schedule, ScheduledJob, Scheduler};
pub use schema::{SchemaConfig, SchemaPlan};
pub use settings::Settings;
pub use store::Store;

pub mod prelude {
    pub use crate::{
        ColdStore, CountRecord, CountTable, MasterRegistry, QueryRouter, Result, Store,
    };
}
