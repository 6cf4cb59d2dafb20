// src/history/mod.rs

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, Int32Array, StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use glob::{glob, Pattern};
use once_cell::sync::Lazy;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, warn};

use crate::schema::SourceFile;

/// One completed source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub year: i32,
    pub url: String,
    pub records: u64,
    pub processed_at: DateTime<Utc>,
}

static SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("year", DataType::Int32, false),
        Field::new("url", DataType::Utf8, false),
        Field::new("records", DataType::UInt64, false),
        Field::new(
            "processed_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
    ]))
});

const EVENT: &str = "processed";

/// Which source files have already been turned into partitions, as a
/// directory of single-row Parquet files.
pub struct History {
    history_dir: PathBuf,
}

impl History {
    /// Open the store at `history_dir`, creating the directory if needed.
    pub fn new(history_dir: impl Into<PathBuf>) -> Result<Self> {
        let history_dir = history_dir.into();
        fs::create_dir_all(&history_dir)
            .with_context(|| format!("creating history directory {:?}", &history_dir))?;
        Ok(Self { history_dir })
    }

    /// Record that `source` was processed into `records` rows.
    /// Writes `payments_<year>_processed_<ts>.parquet`.
    pub fn record_processed(&self, source: &SourceFile, records: u64) -> Result<()> {
        let now = Utc::now();
        let ts = now.timestamp_micros();
        let filename = format!("payments_{}_{}_{}.parquet", source.year, EVENT, ts);
        let path = self.history_dir.join(filename);

        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![source.year])),
            Arc::new(StringArray::from(vec![source.url.clone()])),
            Arc::new(UInt64Array::from(vec![records])),
            Arc::new(TimestampMicrosecondArray::from_iter_values(vec![ts])),
        ];
        let batch = RecordBatch::try_new(SCHEMA.clone(), columns)
            .context("building history record batch")?;

        let file =
            File::create(&path).with_context(|| format!("creating history file {:?}", &path))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, SCHEMA.clone(), Some(props))
            .context("creating Arrow writer for history")?;
        writer.write(&batch).context("writing history batch")?;
        writer.close().context("closing history writer")?;
        debug!(year = source.year, records, "recorded processed source");
        Ok(())
    }

    /// Latest entry per year.
    pub fn load_processed(&self) -> Result<BTreeMap<i32, ProcessedEntry>> {
        let pattern = format!(
            "{}/payments_*_{}_*.parquet",
            Pattern::escape(&self.history_dir.to_string_lossy()),
            EVENT
        );
        let mut latest: BTreeMap<i32, ProcessedEntry> = BTreeMap::new();
        for entry in glob(&pattern)? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "cannot read history entry");
                    continue;
                }
            };
            let rows = match read_entries(&path) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable history file");
                    continue;
                }
            };
            for row in rows {
                match latest.get(&row.year) {
                    Some(prev) if prev.processed_at >= row.processed_at => {}
                    _ => {
                        latest.insert(row.year, row);
                    }
                }
            }
        }
        Ok(latest)
    }

    /// Whether this exact source (same year and URL) has been processed.
    pub fn is_processed(&self, source: &SourceFile) -> Result<bool> {
        Ok(self
            .load_processed()?
            .get(&source.year)
            .is_some_and(|e| e.url == source.url))
    }
}

fn read_entries(path: &std::path::Path) -> Result<Vec<ProcessedEntry>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let col = |i: usize| batch.column(i).as_any();
        let years = col(0)
            .downcast_ref::<Int32Array>()
            .context("year column")?;
        let urls = col(1)
            .downcast_ref::<StringArray>()
            .context("url column")?;
        let records = col(2)
            .downcast_ref::<UInt64Array>()
            .context("records column")?;
        let times = col(3)
            .downcast_ref::<TimestampMicrosecondArray>()
            .context("processed_at column")?;
        for i in 0..batch.num_rows() {
            if years.is_null(i) || urls.is_null(i) {
                continue;
            }
            out.push(ProcessedEntry {
                year: years.value(i),
                url: urls.value(i).to_string(),
                records: records.value(i),
                processed_at: DateTime::from_timestamp_micros(times.value(i)).unwrap_or_default(),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SourceFormat;
    use tempfile::tempdir;

    #[test]
    fn processed_sources_are_remembered_by_url() -> Result<()> {
        let dir = tempdir()?;
        let history = History::new(dir.path().join("history"))?;
        let src = SourceFile::new(2021, "https://example.test/2021.xlsx", SourceFormat::Xlsx);
        assert!(!history.is_processed(&src)?);

        history.record_processed(&src, 42)?;
        assert!(history.is_processed(&src)?);

        let republished = SourceFile::new(2021, "https://example.test/2021_v2.xlsx", SourceFormat::Xlsx);
        assert!(!history.is_processed(&republished)?);

        let entries = history.load_processed()?;
        assert_eq!(entries[&2021].records, 42);
        Ok(())
    }

    #[test]
    fn latest_entry_wins() -> Result<()> {
        let dir = tempdir()?;
        let history = History::new(dir.path())?;
        let old = SourceFile::new(2020, "https://example.test/a.csv", SourceFormat::Csv);
        let new = SourceFile::new(2020, "https://example.test/b.csv", SourceFormat::Csv);
        history.record_processed(&old, 1)?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        history.record_processed(&new, 2)?;
        assert_eq!(history.load_processed()?[&2020].url, new.url);
        Ok(())
    }
}
