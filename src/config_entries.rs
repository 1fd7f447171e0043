use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{Error, Result};

/// Keyed setting, global when `host_id` is empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub host_id: String,
}

impl ConfigEntry {
    pub fn global(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            host_id: String::new(),
        }
    }

    pub fn for_host(
        key: impl Into<String>,
        value: impl Into<String>,
        host_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            host_id: host_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct ConfigEntries {
    pool: PgPool,
}

impl ConfigEntries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Effective settings for `host_id`: global rows overlaid by host-specific ones.
    pub async fn lookup(&self, host_id: &str) -> Result<BTreeMap<String, String>> {
        // '' sorts first, so host rows overwrite globals in the fold below
        let rows: Vec<(String, String)> = sqlx::query_as(
            "select key, value from config where host_id in ('', $1) order by host_id, key",
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn list(&self) -> Result<Vec<ConfigEntry>> {
        let rows = sqlx::query_as::<_, ConfigEntry>(
            "select key, value, host_id from config order by key, host_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set(&self, entry: &ConfigEntry) -> Result<()> {
        if entry.key.trim().is_empty() {
            return Err(Error::invalid("config key is required"));
        }
        sqlx::query(
            r#"insert into config (key, value, host_id) values ($1, $2, $3)
               on conflict (key, host_id) do update set value = excluded.value"#,
        )
        .bind(entry.key.trim())
        .bind(&entry.value)
        .bind(entry.host_id.trim())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str, host_id: &str) -> Result<bool> {
        let affected = sqlx::query("delete from config where key = $1 and host_id = $2")
            .bind(key.trim())
            .bind(host_id.trim())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
