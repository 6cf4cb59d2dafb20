// src/process/raw_table.rs

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate};
use csv::ReaderBuilder;
use std::path::Path;
use tracing::debug;

use crate::error::FetchError;
use crate::schema::SourceFormat;

/// Cells of one source file as strings, in file order. Nothing is
/// interpreted yet, not even the header row.
#[derive(Debug, Default)]
pub struct RawTable {
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn from_rows<I, R, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(Into::into).collect())
                .collect(),
        }
    }

    /// Widest row; positional layouts are checked against this.
    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Read the first worksheet (or the CSV body) of `path`.
///
/// A file the reader cannot make sense of is reported as
/// [`FetchError::Corrupt`]: the usual cause is a truncated or HTML error
/// page saved under a spreadsheet name.
#[tracing::instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
pub fn load_table(path: impl AsRef<Path>, format: SourceFormat) -> Result<RawTable, FetchError> {
    let path = path.as_ref();
    let table = match format {
        SourceFormat::Csv => load_csv(path)?,
        SourceFormat::Xls | SourceFormat::Xlsx => load_workbook(path)?,
    };
    debug!(rows = table.rows.len(), width = table.width(), "loaded raw table");
    Ok(table)
}

fn corrupt(path: &Path, reason: impl ToString) -> FetchError {
    FetchError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn load_csv(path: &Path) -> Result<RawTable, FetchError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| corrupt(path, e))?;

    let mut rows = Vec::new();
    for (idx, result) in rdr.byte_records().enumerate() {
        let record = result.map_err(|e| corrupt(path, format!("record {}: {}", idx, e)))?;
        // older releases are not always valid UTF-8
        rows.push(
            record
                .iter()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect(),
        );
    }
    Ok(RawTable { rows })
}

fn load_workbook(path: &Path) -> Result<RawTable, FetchError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| corrupt(path, e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| corrupt(path, "workbook has no worksheets"))?
        .map_err(|e| corrupt(path, e))?;

    // calamine trims empty leading columns; restore them so positional
    // layouts still line up
    let lead = range.start().map(|(_, col)| col as usize).unwrap_or(0);
    let rows = range
        .rows()
        .map(|row| {
            std::iter::repeat(String::new())
                .take(lead)
                .chain(row.iter().map(cell_to_string))
                .collect()
        })
        .collect();
    Ok(RawTable { rows })
}

/// Render a spreadsheet cell the way it would read in a CSV export.
pub fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => float_to_string(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| float_to_string(dt.as_f64())),
        Data::Error(e) => format!("#{:?}", e),
    }
}

/// Whole numbers print without a fraction so `6.0` becomes `6`. Others
/// are cut to the 15 significant digits a spreadsheet keeps, which drops
/// binary noise such as `0.30000000000000004`.
fn float_to_string(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        return format!("{}", f as i64);
    }
    let shown: f64 = format!("{:.14e}", f).parse().unwrap_or(f);
    format!("{}", shown)
}

/// Spreadsheet serial day number → calendar date (1900 date system).
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !(1.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}
