use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Hot store
    pub rows_ingested_total: AtomicU64,
    pub hot_reads_total: AtomicU64,
    pub aggregated_deleted_total: AtomicU64,

    // Cold store
    pub cold_reads_total: AtomicU64,

    // Archival
    pub archived_rows_total: AtomicU64,
    pub archived_days_total: AtomicU64,
    pub archive_failures_total: AtomicU64,

    // Retention
    pub raw_purged_total: AtomicU64,

    // Master registry
    pub master_versions_opened_total: AtomicU64,
    pub master_versions_closed_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            rows_ingested_total: AtomicU64::new(0),
            hot_reads_total: AtomicU64::new(0),
            aggregated_deleted_total: AtomicU64::new(0),
            cold_reads_total: AtomicU64::new(0),
            archived_rows_total: AtomicU64::new(0),
            archived_days_total: AtomicU64::new(0),
            archive_failures_total: AtomicU64::new(0),
            raw_purged_total: AtomicU64::new(0),
            master_versions_opened_total: AtomicU64::new(0),
            master_versions_closed_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn record_rows_ingested(n: u64) {
    metrics().rows_ingested_total.fetch_add(n, Ordering::Relaxed);
}

pub fn record_hot_read() {
    metrics().hot_reads_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_aggregated_deleted(n: u64) {
    metrics()
        .aggregated_deleted_total
        .fetch_add(n, Ordering::Relaxed);
}

pub fn record_cold_read() {
    metrics().cold_reads_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_day_archived(rows: u64) {
    let m = metrics();
    m.archived_rows_total.fetch_add(rows, Ordering::Relaxed);
    m.archived_days_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_archive_failure() {
    metrics()
        .archive_failures_total
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_raw_purged(n: u64) {
    metrics().raw_purged_total.fetch_add(n, Ordering::Relaxed);
}

pub fn record_master_changes(opened: u64, closed: u64) {
    let m = metrics();
    m.master_versions_opened_total
        .fetch_add(opened, Ordering::Relaxed);
    m.master_versions_closed_total
        .fetch_add(closed, Ordering::Relaxed);
}

fn counter(s: &mut String, name: &str, value: &AtomicU64) {
    let _ = writeln!(
        s,
        "# TYPE {name} counter\n{name} {}",
        value.load(Ordering::Relaxed)
    );
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // hot store
    counter(&mut s, "dock_rows_ingested_total", &m.rows_ingested_total);
    counter(&mut s, "dock_hot_reads_total", &m.hot_reads_total);
    counter(
        &mut s,
        "dock_aggregated_deleted_total",
        &m.aggregated_deleted_total,
    );
    // cold store
    counter(&mut s, "dock_cold_reads_total", &m.cold_reads_total);
    // archival
    counter(&mut s, "dock_archived_rows_total", &m.archived_rows_total);
    counter(&mut s, "dock_archived_days_total", &m.archived_days_total);
    counter(
        &mut s,
        "dock_archive_failures_total",
        &m.archive_failures_total,
    );
    // retention
    counter(&mut s, "dock_raw_purged_total", &m.raw_purged_total);
    // registry
    counter(
        &mut s,
        "dock_master_versions_opened_total",
        &m.master_versions_opened_total,
    );
    counter(
        &mut s,
        "dock_master_versions_closed_total",
        &m.master_versions_closed_total,
    );
    s
}
