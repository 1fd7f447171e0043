use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dockstore::scheduler::run_guarded;
use dockstore::store::advisory_lock_key;
use dockstore::testing::{day, samples_for_day, seed, ts};
use dockstore::{
    ArchivalConfig, ArchivalJob, ColdStore, ConfigEntry, CountPredicate, CountQuery, CountRecord,
    CountTable, CsvImportOptions, CsvImporter, Error, RetentionConfig, RetentionPurge, RunOutcome,
    ScheduledJob, SchemaConfig, Store,
};
use sqlx::postgres::PgPoolOptions;
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

async fn start_postgres() -> Result<(ContainerAsync<GenericImage>, String)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");
    Ok((container, url))
}

async fn start_store() -> Result<(ContainerAsync<GenericImage>, Store)> {
    let (container, url) = start_postgres().await?;
    let store = Store::connect(&url).await?;
    dockstore::testing::ensure_schema(store.pool()).await?;
    Ok((container, store))
}

#[tokio::test]
async fn schema_sync_is_idempotent_and_guards_open_versions() -> Result<()> {
    let (_container, store) = start_store().await?;
    let plan = store.schema().plan(&SchemaConfig::default()).await?;
    assert!(plan.is_empty(), "unexpected actions: {:?}", plan.actions());

    let insert = "insert into spot_master (area, spot, name, valid_from) values ('A01', 'S01', $1, $2)";
    sqlx::query(insert)
        .bind("X")
        .bind(ts("2024-01-01 00:00:00")?)
        .execute(store.pool())
        .await?;
    let second = sqlx::query(insert)
        .bind("Y")
        .bind(ts("2024-01-02 00:00:00")?)
        .execute(store.pool())
        .await;
    assert!(second.is_err());
    Ok(())
}

#[tokio::test]
async fn accessors_use_the_configured_schema() -> Result<()> {
    let (_container, url) = start_postgres().await?;
    let store = Store::builder(url).schema("dock").build().await?;
    let applied = store.schema().sync(store.schema_config()).await?;
    assert!(!applied.is_empty());
    assert!(store.schema().plan(store.schema_config()).await?.is_empty());

    store
        .counts()
        .bulk_insert_counts(
            CountTable::Raw,
            &[CountRecord::new("A01", "S01", ts("2024-01-10 08:00:00")?, 5)],
        )
        .await?;
    assert_eq!(store.counts().count_rows(CountTable::Raw, None).await?, 1);
    store
        .config_entries()
        .set(&ConfigEntry::global("interval", "30"))
        .await?;

    let in_dock: i64 = sqlx::query_scalar("select count(*) from dock.raw_counts")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(in_dock, 1);
    let in_public: bool = sqlx::query_scalar(
        "select exists (select 1 from information_schema.tables where table_schema = 'public' and table_name = 'raw_counts')",
    )
    .fetch_one(store.pool())
    .await?;
    assert!(!in_public);
    Ok(())
}

#[tokio::test]
async fn bulk_insert_skips_duplicates() -> Result<()> {
    let (_container, store) = start_store().await?;
    let counts = store.counts();
    let rows = vec![
        CountRecord::new("A01", "S01", ts("2024-01-10 08:00:00")?, 5),
        CountRecord::new("A01", "S01", ts("2024-01-10 08:05:00")?, 7),
    ];
    let first = counts.bulk_insert_counts(CountTable::Raw, &rows).await?;
    assert_eq!((first.attempted, first.affected), (2, 2));
    let again = counts.bulk_insert_counts(CountTable::Raw, &rows).await?;
    assert_eq!((again.attempted, again.affected), (2, 0));
    assert_eq!(again.skipped(), 2);

    let err = counts
        .bulk_insert_counts(
            CountTable::Raw,
            &[CountRecord::new("A0001", "S01", ts("2024-01-10 08:00:00")?, 1)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let latest = counts
        .query_counts(CountTable::Raw, &CountQuery::latest("A01", "S01"))
        .await?;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].count, 7);

    let removed = counts
        .delete_counts(
            CountTable::Raw,
            &CountPredicate::Spot {
                area: "A01".into(),
                spot: "S01".into(),
            },
        )
        .await?;
    assert_eq!(removed, 2);
    Ok(())
}

#[tokio::test]
async fn aggregated_days_and_keyset_pages() -> Result<()> {
    let (_container, store) = start_store().await?;
    let counts = store.counts();
    let rows = vec![
        CountRecord::new("A01", "S02", ts("2024-01-07 09:00:00")?, 1),
        CountRecord::new("A01", "S01", ts("2024-01-07 10:00:00")?, 2),
        CountRecord::new("A01", "S01", ts("2024-01-07 08:00:00")?, 3),
        CountRecord::new("A01", "S01", ts("2024-01-08 23:59:59")?, 4),
        CountRecord::new("A01", "S01", ts("2024-01-09 00:00:00")?, 5),
    ];
    counts
        .bulk_insert_counts(CountTable::Aggregated, &rows)
        .await?;

    assert_eq!(
        counts.aggregated_days_before(day("2024-01-08")?).await?,
        vec![day("2024-01-07")?, day("2024-01-08")?]
    );

    let first = counts
        .aggregated_batch(day("2024-01-07")?, None, 2)
        .await?;
    assert_eq!(
        first.iter().map(|r| r.count).collect::<Vec<_>>(),
        vec![3, 2]
    );
    let last_key = first.last().map(|r| r.key());
    let rest = counts
        .aggregated_batch(day("2024-01-07")?, last_key.as_ref(), 2)
        .await?;
    assert_eq!(rest.iter().map(|r| r.count).collect::<Vec<_>>(), vec![1]);

    assert_eq!(counts.delete_aggregated(day("2024-01-07")?).await?, 3);
    assert_eq!(counts.count_rows(CountTable::Aggregated, None).await?, 2);
    Ok(())
}

#[tokio::test]
async fn retention_purges_only_old_raw_rows() -> Result<()> {
    let (_container, store) = start_store().await?;
    let counts = store.counts();
    let now = ts("2024-01-10 12:00:00")?;
    let raw = vec![
        CountRecord::new("A01", "S01", ts("2024-01-10 11:20:00")?, 1),
        CountRecord::new("A01", "S01", ts("2024-01-10 11:29:59")?, 2),
        CountRecord::new("A01", "S01", ts("2024-01-10 11:30:00")?, 3),
        CountRecord::new("A01", "S01", ts("2024-01-10 11:50:00")?, 4),
    ];
    counts.bulk_insert_counts(CountTable::Raw, &raw).await?;
    counts
        .bulk_insert_counts(
            CountTable::Aggregated,
            &[CountRecord::new("A01", "S01", ts("2024-01-01 00:00:00")?, 9)],
        )
        .await?;

    let purge = RetentionPurge::new(counts.clone(), RetentionConfig::default());
    assert_eq!(purge.run_at(now).await?, 2);
    assert_eq!(purge.run_at(now).await?, 0);
    assert_eq!(counts.count_rows(CountTable::Raw, None).await?, 2);
    assert_eq!(counts.count_rows(CountTable::Aggregated, None).await?, 1);

    let status = counts.scrape_status(1000).await?;
    assert!(!status.is_healthy());
    assert!(counts.scrape_status(2).await?.is_healthy());
    Ok(())
}

#[tokio::test]
async fn jobs_skip_while_another_instance_holds_the_lock() -> Result<()> {
    let (_container, store) = start_store().await?;
    let purge = RetentionPurge::new(store.counts(), RetentionConfig::default());

    let mut other = store.pool().begin().await?;
    let held: bool = sqlx::query_scalar("select pg_try_advisory_xact_lock($1)")
        .bind(advisory_lock_key("retention"))
        .fetch_one(&mut *other)
        .await?;
    assert!(held);
    assert_eq!(run_guarded(store.pool(), &purge).await?, RunOutcome::Skipped);

    other.rollback().await?;
    assert_eq!(
        run_guarded(store.pool(), &purge).await?,
        RunOutcome::Completed
    );
    Ok(())
}

#[tokio::test]
async fn guarded_jobs_run_on_a_single_connection_pool() -> Result<()> {
    let (_container, store) = start_store().await?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with((*store.pool().connect_options()).clone())
        .await?;
    let single = Store::from_pool(pool);
    let old_day = day("2024-01-05")?;
    seed(
        store.pool(),
        CountTable::Aggregated,
        &samples_for_day("A01", old_day, 10),
    )
    .await?;

    let dir = tempfile::TempDir::new()?;
    let job = ArchivalJob::new(
        single.counts(),
        ColdStore::new(dir.path()),
        ArchivalConfig::default(),
    );
    assert_eq!(run_guarded(single.pool(), &job).await?, RunOutcome::Completed);
    assert_eq!(
        store
            .counts()
            .count_rows(CountTable::Aggregated, Some(old_day))
            .await?,
        0
    );

    let purge = RetentionPurge::new(single.counts(), RetentionConfig::default());
    assert_eq!(
        run_guarded(single.pool(), &purge).await?,
        RunOutcome::Completed
    );
    Ok(())
}

struct Failing;

#[async_trait]
impl ScheduledJob for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self) -> dockstore::Result<()> {
        Err(Error::InvalidInput("upstream rejected the batch".into()))
    }
}

#[tokio::test]
async fn guarded_job_errors_surface_and_release_the_lock() -> Result<()> {
    let (_container, store) = start_store().await?;
    let err = run_guarded(store.pool(), &Failing).await.unwrap_err();
    match err {
        Error::InvalidInput(msg) => assert_eq!(msg, "upstream rejected the batch"),
        other => panic!("unexpected error: {other}"),
    }

    let free: bool = sqlx::query_scalar("select pg_try_advisory_lock($1)")
        .bind(advisory_lock_key("failing"))
        .fetch_one(store.pool())
        .await?;
    assert!(free);
    Ok(())
}

#[tokio::test]
async fn host_entries_override_global_ones() -> Result<()> {
    let (_container, store) = start_store().await?;
    let entries = store.config_entries();
    entries.set(&ConfigEntry::global("scrape_url", "https://a")).await?;
    entries.set(&ConfigEntry::global("interval", "30")).await?;
    entries
        .set(&ConfigEntry::for_host("scrape_url", "https://b", "worker-1"))
        .await?;

    let worker: BTreeMap<String, String> = entries.lookup("worker-1").await?;
    assert_eq!(worker.get("scrape_url").map(String::as_str), Some("https://b"));
    assert_eq!(worker.get("interval").map(String::as_str), Some("30"));

    let other = entries.lookup("worker-2").await?;
    assert_eq!(other.get("scrape_url").map(String::as_str), Some("https://a"));

    entries.set(&ConfigEntry::global("interval", "15")).await?;
    assert_eq!(entries.list().await?.len(), 3);
    assert!(entries.remove("scrape_url", "worker-1").await?);
    assert!(!entries.remove("scrape_url", "worker-1").await?);
    let worker = entries.lookup("worker-1").await?;
    assert_eq!(worker.get("scrape_url").map(String::as_str), Some("https://a"));
    assert_eq!(worker.get("interval").map(String::as_str), Some("15"));
    Ok(())
}

#[tokio::test]
async fn csv_import_loads_aggregated_rows() -> Result<()> {
    let (_container, store) = start_store().await?;
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "2024/01/07 08:00:00,A01,S01,5")?;
    writeln!(file, "2024/01/07 08:05:00,A01,S01,7")?;
    writeln!(file, "2024/01/07 08:05:00,A01")?;
    writeln!(file, "2024/01/07 08:05:00,A01,S02,2")?;
    file.flush()?;

    let importer = CsvImporter::new(
        store.counts(),
        CsvImportOptions {
            batch_size: 2,
            ..Default::default()
        },
    );
    let outcome = importer.import_path(file.path()).await?;
    assert_eq!((outcome.attempted, outcome.affected), (3, 3));
    assert_eq!(
        store
            .counts()
            .count_rows(CountTable::Aggregated, Some(day("2024-01-07")?))
            .await?,
        3
    );

    let bad = "2024/01/07 08:00:00,A01,S01,5\nyesterday,A01,S01,1\n";
    let err = importer.import_reader(bad.as_bytes()).await.unwrap_err();
    match err {
        Error::InvalidInput(msg) => assert!(msg.starts_with("line 2"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}
