use std::collections::HashSet;

use crate::Result;
use indoc::formatdoc;
use sqlx::PgPool;

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inspect the catalog and list the DDL needed to bring the hot store up to date.
    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.base_schema.trim();
        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let schema_exists = self.existing_schemas().await?.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let (tables, indexes) = if schema_exists {
            (
                self.existing_tables(schema).await?,
                self.existing_indexes(schema).await?,
            )
        } else {
            (HashSet::new(), HashSet::new())
        };

        ensure_table(&mut plan, schema, &tables, "raw_counts", |s| {
            build_counts_table_sql(s, "raw_counts")
        });
        ensure_table(&mut plan, schema, &tables, "aggregated_counts", |s| {
            build_counts_table_sql(s, "aggregated_counts")
        });
        ensure_table(
            &mut plan,
            schema,
            &tables,
            "spot_master",
            build_spot_master_table_sql,
        );
        ensure_table(&mut plan, schema, &tables, "config", build_config_table_sql);

        ensure_index(&mut plan, schema, &indexes, "raw_counts_time_idx", |s| {
            formatdoc!(
                "create index if not exists raw_counts_time_idx on {table} (time)",
                table = qualified_name(s, "raw_counts"),
            )
        });
        ensure_index(
            &mut plan,
            schema,
            &indexes,
            "aggregated_counts_time_idx",
            |s| {
                formatdoc!(
                    "create index if not exists aggregated_counts_time_idx on {table} (time)",
                    table = qualified_name(s, "aggregated_counts"),
                )
            },
        );
        // at most one open version per location
        ensure_index(&mut plan, schema, &indexes, "spot_master_open_idx", |s| {
            formatdoc!(
                "create unique index if not exists spot_master_open_idx on {table} (area, spot) where valid_to is null",
                table = qualified_name(s, "spot_master"),
            )
        });

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub base_schema: String,
}

impl SchemaConfig {
    pub fn with_base_schema(schema: impl Into<String>) -> Self {
        Self {
            base_schema: schema.into(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self::with_base_schema("public")
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_indexes: &HashSet<String>,
    index: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_indexes.contains(index) {
        plan.push_action(
            format!("create index {}", qualified_name(schema, index)),
            build_sql(schema),
        );
    }
}

fn build_counts_table_sql(schema: &str, table: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            area character(3) not null,
            spot character(3) not null,
            time timestamp not null,
            count integer not null,
            primary key (area, spot, time)
        )
        ",
        table = qualified_name(schema, table),
    )
}

fn build_spot_master_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            area character(3) not null,
            spot character(3) not null,
            name text not null,
            latitude double precision not null default 0,
            longitude double precision not null default 0,
            description text not null default '',
            station text not null default '',
            valid_from timestamp not null,
            valid_to timestamp null,
            primary key (area, spot, valid_from),
            check (valid_to is null or valid_to >= valid_from)
        )
        ",
        table = qualified_name(schema, "spot_master"),
    )
}

fn build_config_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            key text not null,
            value text not null,
            host_id text not null default '',
            primary key (key, host_id)
        )
        ",
        table = qualified_name(schema, "config"),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified() {
        assert_eq!(
            qualified_name("public", "raw_counts"),
            "\"public\".\"raw_counts\""
        );
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn missing_tables_are_planned_once() {
        let mut plan = SchemaPlan::default();
        let existing: HashSet<String> = ["config".to_string()].into_iter().collect();
        ensure_table(&mut plan, "public", &existing, "config", build_config_table_sql);
        ensure_table(&mut plan, "public", &existing, "spot_master", build_spot_master_table_sql);
        assert_eq!(plan.actions().len(), 1);
        assert_eq!(
            plan.actions()[0].description(),
            "create table \"public\".\"spot_master\""
        );
        assert!(plan.actions()[0].sql().contains("primary key (area, spot, valid_from)"));
    }

    #[test]
    fn counts_tables_share_a_shape() {
        let raw = build_counts_table_sql("public", "raw_counts");
        let agg = build_counts_table_sql("public", "aggregated_counts");
        assert!(raw.contains("area character(3) not null"));
        assert_eq!(
            raw.replace("raw_counts", "t"),
            agg.replace("aggregated_counts", "t")
        );
    }
}
