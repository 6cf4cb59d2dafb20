// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::schema::Field;

/// Failure to obtain a source file. Transient; the fetcher retries these.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a readable source file: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("year {year} is not linked from {listing}")]
    NotListed { year: i32, listing: String },

    #[error("giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { .. } | FetchError::Io { .. } | FetchError::Corrupt { .. } => true,
            // 4xx other than throttling will not change on retry
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::NotListed { .. } | FetchError::Exhausted { .. } => false,
        }
    }
}

/// The mapping table does not describe the file. Needs a human to fix the
/// mapping for that year; never retried.
#[derive(Debug, Error)]
pub enum SchemaMismatchError {
    #[error("year {year}: unrecognised column(s) {columns:?}")]
    UnknownColumns { year: i32, columns: Vec<String> },

    #[error("year {year}: required column(s) {columns:?} not present")]
    MissingColumns { year: i32, columns: Vec<String> },

    #[error("year {year}: positional layout needs {expected} columns, file has {found}")]
    TooFewColumns {
        year: i32,
        expected: usize,
        found: usize,
    },

    #[error(
        "year {year}: {skipped} of {candidates} rows failed coercion, above the {threshold} threshold"
    )]
    SkipThresholdExceeded {
        year: i32,
        skipped: usize,
        candidates: usize,
        threshold: f64,
    },

    #[error("year {year}: no layout configured and the first row is not a recognisable header")]
    NoLayout { year: i32 },
}

/// One row could not be coerced into a record. Absorbed and counted.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("row {row}: {field}: {reason} ({value:?})")]
pub struct RowCoercionError {
    pub row: usize,
    pub field: Field,
    pub value: String,
    pub reason: &'static str,
}

/// Failure persisting a partition. Fatal for that year only.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("arrow: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("partition {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// A source with no usable rows would wipe a year that has data.
    #[error("source for {year} has no records; keeping its {existing} partition(s) (use --force to clear them)")]
    EmptyReplacement { year: i32, existing: usize },
}

impl WriteError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WriteError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Anything that aborts one year's processing.
#[derive(Debug, Error)]
pub enum YearError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schema(#[from] SchemaMismatchError),

    #[error(transparent)]
    Write(#[from] WriteError),

    /// The worker running the year died before reporting.
    #[error("year task aborted: {0}")]
    Aborted(String),
}

impl YearError {
    /// Short label used in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            YearError::Fetch(_) => "FetchError",
            YearError::Schema(_) => "SchemaMismatchError",
            YearError::Write(_) => "WriteError",
            YearError::Aborted(_) => "Aborted",
        }
    }
}
