use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::{
    Result,
    config_entries::ConfigEntries,
    counts::Counts,
    registry::{MasterRegistry, RegistryConfig},
    schema::{SchemaConfig, SchemaManager, quote_ident},
};

/// Stable positive key for a Postgres advisory lock derived from a name (FNV-1a).
pub fn advisory_lock_key(name: &str) -> i64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    // Clamp to positive i64 so advisory locks stay within valid range.
    (hash & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

/// Handle to the hot store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    schema: SchemaConfig,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    /// Wrap an existing pool; its connections resolve tables through their own `search_path`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: SchemaConfig::default(),
        }
    }

    pub fn counts(&self) -> Counts {
        Counts::new(self.pool.clone())
    }

    pub fn config_entries(&self) -> ConfigEntries {
        ConfigEntries::new(self.pool.clone())
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    /// Schema the hot store tables live in.
    pub fn schema_config(&self) -> &SchemaConfig {
        &self.schema
    }

    /// Load the master registry and warm its cache.
    pub async fn registry(&self, config: RegistryConfig) -> Result<MasterRegistry> {
        MasterRegistry::load(self.pool.clone(), config).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth {
            ok: one == 1,
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        })
    }
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    schema: SchemaConfig,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            schema: SchemaConfig::default(),
        }
    }

    /// Keep the hot store tables in `schema` instead of `public`.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = SchemaConfig::with_base_schema(schema);
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        let connect = PgConnectOptions::from_str(&self.url)?.options([(
            "search_path",
            quote_ident(self.schema.base_schema.trim()),
        )]);
        let pool = opts.connect_with(connect).await?;
        Ok(Store {
            pool,
            schema: self.schema,
        })
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct PoolHealth {
    pub ok: bool,
    pub size: u32,
    pub idle: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_positive() {
        let a = advisory_lock_key("archival");
        assert_eq!(a, advisory_lock_key("archival"));
        assert_ne!(a, advisory_lock_key("retention"));
        assert!(a >= 0);
        assert!(advisory_lock_key("") >= 0);
    }
}
