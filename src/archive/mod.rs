// src/archive/mod.rs
//! Partitioned Parquet archive: one file per (State FSA Name, Accounting
//! Program Year), replaced atomically.

pub mod batch;
pub mod dedup;
pub mod path;

use glob::{glob, Pattern};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{BrotliLevel, Compression};
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::error::WriteError;
use crate::schema::{build_arrow_schema, Field, PartitionKey, PaymentRecord};
pub use batch::{batch_to_records, records_to_batch};
pub use dedup::dedup_records;
pub use path::{parse_partition_dir, partition_dir, partition_file, PARTITION_FILE};

/// What one `write_year` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YearWriteSummary {
    pub partitions_written: usize,
    pub records_written: usize,
    pub duplicates: usize,
    pub stale_removed: usize,
}

/// A partition file written but not yet renamed into place.
struct StagedPartition {
    tmp: tempfile::NamedTempFile,
    final_path: PathBuf,
    rows: usize,
}

impl StagedPartition {
    fn commit(self) -> Result<PathBuf, WriteError> {
        self.tmp
            .persist(&self.final_path)
            .map_err(|e| WriteError::io(&self.final_path, e.error))?;
        debug!(rows = self.rows, path = %self.final_path.display(), "wrote partition");
        Ok(self.final_path)
    }
}

/// The on-disk archive. Owns everything under `root`.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

/// Fixed writer settings; the output must not vary between runs.
fn writer_properties() -> Result<WriterProperties, WriteError> {
    Ok(WriterProperties::builder()
        .set_compression(Compression::BROTLI(BrotliLevel::try_new(5)?))
        .set_dictionary_enabled(true)
        .set_created_by(concat!("fsapayments ", env!("CARGO_PKG_VERSION")).to_string())
        .build())
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WriteError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| WriteError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_file(&self, key: &PartitionKey) -> PathBuf {
        partition_file(&self.root, key)
    }

    /// Atomically replace one partition with `records`.
    ///
    /// The file is written next to its final location and renamed over it,
    /// so readers see either the old partition or the new one.
    #[tracing::instrument(level = "debug", skip(self, records), fields(state = %key.state_fsa_name, year = key.program_year))]
    pub fn write_partition(
        &self,
        key: &PartitionKey,
        records: &[PaymentRecord],
    ) -> Result<PathBuf, WriteError> {
        self.stage_partition(key, records)?.commit()
    }

    /// Write `records` to a temp file inside the partition directory.
    /// Nothing a reader can see changes until the result is committed;
    /// dropping it deletes the temp file.
    fn stage_partition(
        &self,
        key: &PartitionKey,
        records: &[PaymentRecord],
    ) -> Result<StagedPartition, WriteError> {
        if let Some(stray) = records.iter().find(|r| r.partition_key() != *key) {
            return Err(WriteError::Malformed {
                path: partition_dir(&self.root, key),
                reason: format!(
                    "record for ({}, {}) handed to this partition",
                    stray.state_fsa_name, stray.program_year
                ),
            });
        }

        let dir = partition_dir(&self.root, key);
        fs::create_dir_all(&dir).map_err(|e| WriteError::io(&dir, e))?;

        let batch = records_to_batch(records)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".part-0.")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| WriteError::io(&dir, e))?;
        {
            let mut writer =
                ArrowWriter::try_new(tmp.as_file_mut(), build_arrow_schema(), Some(writer_properties()?))?;
            writer.write(&batch)?;
            writer.close()?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| WriteError::io(tmp.path(), e))?;

        Ok(StagedPartition {
            tmp,
            final_path: dir.join(PARTITION_FILE),
            rows: records.len(),
        })
    }

    /// Replace every partition of `year` with `records`.
    ///
    /// Records are deduplicated first (first seen wins). Every partition is
    /// staged before any is renamed into place, so a failed write leaves
    /// the year as it was. Partitions of the same year whose state no
    /// longer appears are removed; other years are never touched.
    #[tracing::instrument(level = "info", skip(self, records), fields(records = records.len()))]
    pub fn write_year(
        &self,
        year: i32,
        records: Vec<PaymentRecord>,
    ) -> Result<YearWriteSummary, WriteError> {
        let (unique, duplicates) = dedup_records(records);
        if duplicates > 0 {
            info!(year, duplicates, "collapsed duplicate records");
        }

        let mut partitions: BTreeMap<PartitionKey, Vec<PaymentRecord>> = BTreeMap::new();
        for rec in unique {
            if rec.program_year != year {
                return Err(WriteError::Malformed {
                    path: self.root.clone(),
                    reason: format!("record for {} in the {} batch", rec.program_year, year),
                });
            }
            partitions.entry(rec.partition_key()).or_default().push(rec);
        }

        // partitions never share a path, so they can be staged side by side
        let staged: Vec<StagedPartition> = partitions
            .par_iter()
            .map(|(key, recs)| self.stage_partition(key, recs))
            .collect::<Result<_, _>>()?;

        let mut written = Vec::with_capacity(staged.len());
        for part in staged {
            let rows = part.rows;
            part.commit()?;
            written.push(rows);
        }

        let keep: BTreeSet<&PartitionKey> = partitions.keys().collect();
        let mut stale_removed = 0;
        for key in self.list_partitions()? {
            if key.program_year == year && !keep.contains(&key) {
                let dir = partition_dir(&self.root, &key);
                warn!(state = %key.state_fsa_name, year, "removing superseded partition");
                fs::remove_dir_all(&dir).map_err(|e| WriteError::io(&dir, e))?;
                stale_removed += 1;
            }
        }

        let summary = YearWriteSummary {
            partitions_written: written.len(),
            records_written: written.iter().sum(),
            duplicates,
            stale_removed,
        };
        info!(
            year,
            partitions = summary.partitions_written,
            records = summary.records_written,
            "year written"
        );
        Ok(summary)
    }

    /// Every partition currently in the archive, sorted.
    pub fn list_partitions(&self) -> Result<Vec<PartitionKey>, WriteError> {
        let pattern = format!(
            "{}/{}=*/{}=*/{}",
            Pattern::escape(&self.root.to_string_lossy()),
            Pattern::escape(Field::StateFsaName.column_name()),
            Pattern::escape(Field::ProgramYear.column_name()),
            PARTITION_FILE
        );
        let entries = glob(&pattern).map_err(|e| WriteError::Malformed {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;

        let mut keys = BTreeSet::new();
        for entry in entries {
            match entry {
                Ok(file) => match file.parent().and_then(parse_partition_dir) {
                    Some(key) => {
                        keys.insert(key);
                    }
                    None => warn!(path = %file.display(), "ignoring unparseable partition path"),
                },
                Err(e) => warn!(error = %e, "cannot read archive entry"),
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Partitions currently held for one program year.
    pub fn year_partitions(&self, year: i32) -> Result<Vec<PartitionKey>, WriteError> {
        Ok(self
            .list_partitions()?
            .into_iter()
            .filter(|k| k.program_year == year)
            .collect())
    }

    /// Read one partition back as records.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<PaymentRecord>, WriteError> {
        let path = self.partition_file(key);
        let file = File::open(&path).map_err(|e| WriteError::io(&path, e))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut records = Vec::new();
        for batch in reader {
            let batch = batch?;
            let mut rows = batch_to_records(&batch, key, records.len())
                .map_err(|reason| WriteError::Malformed {
                    path: path.clone(),
                    reason,
                })?;
            records.append(&mut rows);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Currency;
    use anyhow::Result;
    use tempfile::tempdir;

    fn rec(state_code: &str, state: &str, year: i32, cents: i128) -> PaymentRecord {
        PaymentRecord {
            state_fsa_code: state_code.into(),
            state_fsa_name: state.into(),
            county_fsa_code: Some("001".into()),
            payee_name: Some("DOE JOHN".into()),
            disbursement_amount: Some(Currency::from_cents(cents)),
            program_description: Some("CONSERVATION RESERVE PROGRAM".into()),
            program_year: year,
            ..Default::default()
        }
    }

    fn key(state: &str, year: i32) -> PartitionKey {
        PartitionKey {
            state_fsa_name: state.into(),
            program_year: year,
        }
    }

    #[test]
    fn rewriting_identical_input_is_byte_identical() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        let batch = vec![rec("30", "Montana", 2024, 100), rec("16", "Idaho", 2024, 250)];

        archive.write_year(2024, batch.clone())?;
        let first = fs::read(archive.partition_file(&key("Montana", 2024)))?;
        archive.write_year(2024, batch)?;
        let second = fs::read(archive.partition_file(&key("Montana", 2024)))?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn writing_a_partition_leaves_its_neighbours_alone() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        archive.write_year(2023, vec![rec("30", "Montana", 2023, 1)])?;
        archive.write_year(2024, vec![rec("16", "Idaho", 2024, 2)])?;
        let mt_2023 = fs::read(archive.partition_file(&key("Montana", 2023)))?;
        let id_2024 = fs::read(archive.partition_file(&key("Idaho", 2024)))?;

        archive.write_partition(&key("Montana", 2024), &[rec("30", "Montana", 2024, 3)])?;

        assert_eq!(fs::read(archive.partition_file(&key("Montana", 2023)))?, mt_2023);
        assert_eq!(fs::read(archive.partition_file(&key("Idaho", 2024)))?, id_2024);
        assert_eq!(archive.list_partitions()?.len(), 3);
        Ok(())
    }

    #[test]
    fn duplicates_collapse_on_write() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        let mut second = rec("30", "Montana", 2023, 100);
        second.row_sequence = 7;
        let summary = archive.write_year(2023, vec![rec("30", "Montana", 2023, 100), second])?;
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.records_written, 1);
        assert_eq!(archive.read_partition(&key("Montana", 2023))?.len(), 1);
        Ok(())
    }

    #[test]
    fn reprocessing_supersedes_the_whole_year() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        archive.write_year(
            2022,
            vec![rec("30", "Montana", 2022, 1), rec("16", "Idaho", 2022, 2)],
        )?;
        archive.write_year(2021, vec![rec("16", "Idaho", 2021, 3)])?;

        let summary = archive.write_year(2022, vec![rec("30", "Montana", 2022, 5)])?;
        assert_eq!(summary.stale_removed, 1);

        let keys = archive.list_partitions()?;
        assert_eq!(keys, vec![key("Idaho", 2021), key("Montana", 2022)]);
        let montana = archive.read_partition(&key("Montana", 2022))?;
        assert_eq!(montana[0].disbursement_amount, Some(Currency::from_cents(5)));
        Ok(())
    }

    #[test]
    fn read_back_restores_partition_columns() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        let original = rec("35", "New Mexico", 2020, -50_000);
        archive.write_year(2020, vec![original.clone()])?;
        let back = archive.read_partition(&key("New Mexico", 2020))?;
        assert_eq!(back, vec![original]);
        Ok(())
    }

    #[test]
    fn misfiled_records_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        let err = archive
            .write_partition(&key("Idaho", 2020), &[rec("30", "Montana", 2020, 1)])
            .unwrap_err();
        assert!(matches!(err, WriteError::Malformed { .. }));
        assert!(archive.write_year(2019, vec![rec("30", "Montana", 2020, 1)]).is_err());
        Ok(())
    }

    #[test]
    fn failed_partition_leaves_the_year_untouched() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        archive.write_year(2023, vec![rec("30", "Montana", 2023, 1)])?;
        let before = fs::read(archive.partition_file(&key("Montana", 2023)))?;

        // a plain file where the Idaho directory belongs makes that
        // partition unwritable
        let blocked = partition_dir(archive.root(), &key("Idaho", 2023));
        if let Some(parent) = blocked.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&blocked, b"in the way")?;

        let result = archive.write_year(
            2023,
            vec![rec("30", "Montana", 2023, 999), rec("16", "Idaho", 2023, 2)],
        );
        assert!(result.is_err());
        assert_eq!(fs::read(archive.partition_file(&key("Montana", 2023)))?, before);
        assert_eq!(archive.year_partitions(2023)?, vec![key("Montana", 2023)]);

        let mt_dir = partition_dir(archive.root(), &key("Montana", 2023));
        assert_eq!(fs::read_dir(mt_dir)?.count(), 1);
        Ok(())
    }

    #[test]
    fn no_temp_files_left_behind() -> Result<()> {
        let dir = tempdir()?;
        let archive = Archive::new(dir.path())?;
        archive.write_year(2023, vec![rec("30", "Montana", 2023, 1)])?;
        let part_dir = partition_dir(archive.root(), &key("Montana", 2023));
        let names: Vec<String> = fs::read_dir(part_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PARTITION_FILE.to_string()]);
        Ok(())
    }
}
