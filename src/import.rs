//! Bulk load of headerless CSV exports into the aggregated table.

use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use tracing::{info, instrument, warn};

use crate::counts::{CountRecord, CountTable, Counts, InsertOutcome, TIME_LAYOUT};
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct CsvImportOptions {
    pub time_column: usize,
    pub area_column: usize,
    pub spot_column: usize,
    pub count_column: usize,
    pub time_format: String,
    pub batch_size: usize,
}

impl Default for CsvImportOptions {
    fn default() -> Self {
        Self {
            time_column: 0,
            area_column: 1,
            spot_column: 2,
            count_column: 3,
            time_format: TIME_LAYOUT.to_string(),
            batch_size: 5000,
        }
    }
}

impl CsvImportOptions {
    fn min_columns(&self) -> usize {
        [
            self.time_column,
            self.area_column,
            self.spot_column,
            self.count_column,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }
}

pub struct CsvImporter {
    counts: Counts,
    options: CsvImportOptions,
}

impl CsvImporter {
    pub fn new(counts: Counts, options: CsvImportOptions) -> Self {
        Self { counts, options }
    }

    pub async fn import_path(&self, path: impl AsRef<Path>) -> Result<InsertOutcome> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        self.import_reader(bytes.as_slice()).await
    }

    #[instrument(skip_all, fields(batch = self.options.batch_size))]
    pub async fn import_reader<R: Read>(&self, input: R) -> Result<InsertOutcome> {
        if self.options.batch_size == 0 {
            return Err(Error::invalid("import batch size must be positive"));
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);

        let mut total = InsertOutcome::default();
        let mut pending: Vec<CountRecord> = Vec::with_capacity(self.options.batch_size);
        let mut short_rows = 0u64;
        for (index, result) in reader.records().enumerate() {
            let line = index + 1;
            let record = result?;
            if record.len() < self.options.min_columns() {
                short_rows += 1;
                continue;
            }
            pending.push(self.parse_record(&record, line)?);
            if pending.len() >= self.options.batch_size {
                let outcome = self
                    .counts
                    .bulk_insert_counts(CountTable::Aggregated, &pending)
                    .await?;
                total.merge(outcome);
                pending.clear();
            }
        }
        if !pending.is_empty() {
            let outcome = self
                .counts
                .bulk_insert_counts(CountTable::Aggregated, &pending)
                .await?;
            total.merge(outcome);
        }

        if short_rows > 0 {
            warn!(short_rows, "rows with missing columns skipped");
        }
        info!(
            attempted = total.attempted,
            affected = total.affected,
            "csv import finished"
        );
        Ok(total)
    }

    fn parse_record(&self, record: &csv::StringRecord, line: usize) -> Result<CountRecord> {
        let field = |idx: usize| record.get(idx).map(str::trim).unwrap_or_default();

        let raw_time = field(self.options.time_column);
        let time = NaiveDateTime::parse_from_str(raw_time, &self.options.time_format)
            .map_err(|e| Error::invalid(format!("line {line}: bad time `{raw_time}`: {e}")))?;
        let raw_count = field(self.options.count_column);
        let count: i32 = raw_count
            .parse()
            .map_err(|e| Error::invalid(format!("line {line}: bad count `{raw_count}`: {e}")))?;

        Ok(CountRecord::new(
            field(self.options.area_column),
            field(self.options.spot_column),
            time,
            count,
        ))
    }
}
