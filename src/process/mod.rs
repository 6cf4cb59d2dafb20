// src/process/mod.rs
//! Record normalizer: raw spreadsheet rows → canonical [`PaymentRecord`]s.

pub mod convert;
pub mod county;
pub mod heuristics;
pub mod raw_table;
pub mod utils;

use std::collections::BTreeMap;
use std::io;
use tracing::{debug, info, warn};

use crate::error::{FetchError, RowCoercionError, SchemaMismatchError, YearError};
use crate::schema::{states, Field, HeaderLookup, Layout, MappingTable, PaymentRecord, SourceFile};
use convert::{parse_currency, parse_payment_date, pad_code, COUNTY_CODE_WIDTH, STATE_CODE_WIDTH};
use county::CountyLookup;
use heuristics::{classify_header_row, is_blank_row, is_footer_row, HeaderVerdict};
use raw_table::{load_table, RawTable};
use utils::{clean_opt, collapse_whitespace};

/// How many row errors are kept verbatim in the report.
const KEPT_ROW_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutUsed {
    Header,
    Positional,
}

/// Counters for one normalized file. Every row that did not become a
/// record is accounted for in exactly one of the counters.
#[derive(Debug, Clone)]
pub struct NormalizeReport {
    pub year: i32,
    pub layout: Option<LayoutUsed>,
    pub header_rows: usize,
    pub blank_rows: usize,
    pub footer_rows: usize,
    pub skipped_rows: usize,
    pub emitted: usize,
    /// Program names the vocabulary did not recognise, with occurrence counts.
    pub unrecognized_programs: BTreeMap<String, usize>,
    pub county_names_filled: usize,
    pub row_errors: Vec<RowCoercionError>,
}

impl NormalizeReport {
    fn new(year: i32) -> Self {
        Self {
            year,
            layout: None,
            header_rows: 0,
            blank_rows: 0,
            footer_rows: 0,
            skipped_rows: 0,
            emitted: 0,
            unrecognized_programs: BTreeMap::new(),
            county_names_filled: 0,
            row_errors: Vec::new(),
        }
    }

    /// Rows that were neither blank nor footers.
    pub fn candidate_rows(&self) -> usize {
        self.emitted + self.skipped_rows
    }
}

#[derive(Debug)]
pub struct Normalized {
    pub records: Vec<PaymentRecord>,
    pub report: NormalizeReport,
}

/// Column index → canonical field, in column order.
type ColumnPlan = Vec<(usize, Field)>;

pub struct Normalizer<'a> {
    table: &'a MappingTable,
    counties: Option<&'a CountyLookup>,
}

impl<'a> Normalizer<'a> {
    pub fn new(table: &'a MappingTable) -> Self {
        Self {
            table,
            counties: None,
        }
    }

    pub fn with_counties(mut self, counties: &'a CountyLookup) -> Self {
        self.counties = Some(counties);
        self
    }

    /// Read and normalize a fetched source file.
    #[tracing::instrument(level = "info", skip(self, source), fields(year = source.year, format = %source.format))]
    pub fn normalize_source(&self, source: &SourceFile) -> Result<Normalized, YearError> {
        let path = source.local_path.as_ref().ok_or_else(|| FetchError::Io {
            path: source.url.clone().into(),
            source: io::Error::new(io::ErrorKind::NotFound, "source file has not been fetched"),
        })?;
        let raw = load_table(path, source.format)?;
        Ok(self.normalize_table(&raw, source.year)?)
    }

    /// Normalize already-loaded rows declared to belong to `year`.
    pub fn normalize_table(
        &self,
        raw: &RawTable,
        year: i32,
    ) -> Result<Normalized, SchemaMismatchError> {
        let mut report = NormalizeReport::new(year);

        let Some(start) = raw.rows.iter().position(|r| !is_blank_row(r)) else {
            report.blank_rows = raw.rows.len();
            warn!(year, "source file has no content");
            return Ok(Normalized {
                records: Vec::new(),
                report,
            });
        };
        report.blank_rows = start;

        let (used, plan, first_data) = self.plan_columns(raw, start, year)?;
        report.layout = Some(used);
        report.header_rows = first_data - start;
        debug!(year, layout = ?used, columns = plan.len(), "resolved column plan");

        let mut records = Vec::new();
        for (idx, row) in raw.rows.iter().enumerate().skip(first_data) {
            if is_blank_row(row) {
                report.blank_rows += 1;
                continue;
            }
            if is_footer_row(row) {
                report.footer_rows += 1;
                continue;
            }
            match self.coerce_row(&plan, row, idx, year) {
                Ok((record, unknown_program)) => {
                    if let Some(program) = unknown_program {
                        *report.unrecognized_programs.entry(program).or_default() += 1;
                    }
                    records.push(record);
                }
                Err(e) => {
                    debug!(year, error = %e, "skipping row");
                    report.skipped_rows += 1;
                    if report.row_errors.len() < KEPT_ROW_ERRORS {
                        report.row_errors.push(e);
                    }
                }
            }
        }
        report.emitted = records.len();

        let candidates = report.candidate_rows();
        let threshold = self.table.skip_threshold();
        if candidates > 0 && report.skipped_rows as f64 / candidates as f64 > threshold {
            return Err(SchemaMismatchError::SkipThresholdExceeded {
                year,
                skipped: report.skipped_rows,
                candidates,
                threshold,
            });
        }

        if let Some(counties) = self.counties {
            report.county_names_filled = counties.fill_missing(&mut records);
        }

        if !report.unrecognized_programs.is_empty() {
            warn!(
                year,
                distinct = report.unrecognized_programs.len(),
                "program names not in vocabulary; passed through for review"
            );
        }
        info!(
            year,
            emitted = report.emitted,
            skipped = report.skipped_rows,
            blank = report.blank_rows,
            footer = report.footer_rows,
            "normalized source file"
        );
        Ok(Normalized { records, report })
    }

    /// Decide header vs positional mode and build the column plan. Returns
    /// the index of the first data row as well.
    fn plan_columns(
        &self,
        raw: &RawTable,
        start: usize,
        year: i32,
    ) -> Result<(LayoutUsed, ColumnPlan, usize), SchemaMismatchError> {
        let first = &raw.rows[start];
        let layout = self.table.layout_for(year);
        let header_mode = match (classify_header_row(first, self.table), layout) {
            (HeaderVerdict::Header, _) => true,
            (_, Some(Layout::Positional { .. })) => false,
            // a data-looking first row in a header year is still read as a
            // header so the mismatch names the offending cells
            (_, Some(Layout::Header { .. })) => true,
            (_, None) => return Err(SchemaMismatchError::NoLayout { year }),
        };

        if header_mode {
            let plan = self.header_plan(first, year)?;
            Ok((LayoutUsed::Header, plan, start + 1))
        } else {
            let Some(Layout::Positional { columns, .. }) = layout else {
                return Err(SchemaMismatchError::NoLayout { year });
            };
            let expected = columns.keys().max().map_or(0, |max| max + 1);
            let found = raw.width();
            if found < expected {
                return Err(SchemaMismatchError::TooFewColumns {
                    year,
                    expected,
                    found,
                });
            }
            let plan: ColumnPlan = columns.iter().map(|(i, f)| (*i, *f)).collect();
            require_state(&plan, year)?;
            Ok((LayoutUsed::Positional, plan, start))
        }
    }

    fn header_plan(&self, header: &[String], year: i32) -> Result<ColumnPlan, SchemaMismatchError> {
        let mut plan = Vec::new();
        let mut unknown = Vec::new();
        for (idx, cell) in header.iter().enumerate() {
            match self.table.resolve_header(year, cell) {
                HeaderLookup::Field(field) => plan.push((idx, field)),
                HeaderLookup::Ignored => {}
                HeaderLookup::Unknown => unknown.push(cell.trim().to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(SchemaMismatchError::UnknownColumns {
                year,
                columns: unknown,
            });
        }
        require_state(&plan, year)?;
        Ok(plan)
    }

    fn coerce_row(
        &self,
        plan: &ColumnPlan,
        row: &[String],
        idx: usize,
        year: i32,
    ) -> Result<(PaymentRecord, Option<String>), RowCoercionError> {
        // first non-empty column wins when several map to one field
        let mut values: [&str; Field::COUNT] = [""; Field::COUNT];
        for (col, field) in plan {
            let cell = row.get(*col).map(String::as_str).unwrap_or("");
            let slot = &mut values[*field as usize];
            if slot.trim().is_empty() {
                *slot = cell;
            }
        }
        let get = |f: Field| values[f as usize];
        let fail = |field: Field, reason: &'static str| RowCoercionError {
            row: idx,
            field,
            value: get(field).to_string(),
            reason,
        };

        let state_code = pad_code(get(Field::StateFsaCode), STATE_CODE_WIDTH)
            .map_err(|r| fail(Field::StateFsaCode, r))?;
        let state_label = clean_opt(get(Field::StateFsaName));
        let (state_fsa_code, state_fsa_name) = match (state_code, state_label) {
            (Some(code), Some(label)) => match states::by_label(&label) {
                Some(office) if office.code != code => {
                    return Err(fail(Field::StateFsaName, "state code and name disagree"))
                }
                Some(office) => (code, office.name.to_string()),
                None => (code, label),
            },
            (Some(code), None) => {
                let office = states::by_code(&code)
                    .ok_or_else(|| fail(Field::StateFsaCode, "unknown state code"))?;
                (code, office.name.to_string())
            }
            (None, Some(label)) => {
                let office = states::by_label(&label)
                    .ok_or_else(|| fail(Field::StateFsaName, "unknown state"))?;
                (office.code.to_string(), office.name.to_string())
            }
            (None, None) => return Err(fail(Field::StateFsaCode, "missing state")),
        };

        let county_fsa_code = pad_code(get(Field::CountyFsaCode), COUNTY_CODE_WIDTH)
            .map_err(|r| fail(Field::CountyFsaCode, r))?;
        let disbursement_amount = parse_currency(get(Field::DisbursementAmount))
            .map_err(|r| fail(Field::DisbursementAmount, r))?;
        let payment_date = parse_payment_date(get(Field::PaymentDate))
            .map_err(|r| fail(Field::PaymentDate, r))?;

        let mut unknown_program = None;
        let program_description = clean_opt(get(Field::ProgramDescription)).map(|raw| {
            match self.table.canonical_program(&raw) {
                Some(canonical) => canonical.to_string(),
                None => {
                    unknown_program = Some(collapse_whitespace(&raw));
                    raw
                }
            }
        });

        let record = PaymentRecord {
            state_fsa_code,
            state_fsa_name,
            county_fsa_code,
            county_fsa_name: clean_opt(get(Field::CountyFsaName)),
            payee_name: clean_opt(get(Field::PayeeName)),
            address_line: clean_opt(get(Field::AddressLine)),
            delivery_address_line: clean_opt(get(Field::DeliveryAddressLine)),
            city_name: clean_opt(get(Field::CityName)),
            state_abbreviation: clean_opt(get(Field::StateAbbreviation)),
            zip_code: clean_opt(get(Field::ZipCode)),
            delivery_point_bar_code: clean_opt(get(Field::DeliveryPointBarCode)),
            disbursement_amount,
            payment_date,
            program_code: clean_opt(get(Field::ProgramCode)),
            program_description,
            // the in-file year column is not trusted
            program_year: year,
            row_sequence: idx as u64,
        };
        Ok((record, unknown_program))
    }
}

fn require_state(plan: &ColumnPlan, year: i32) -> Result<(), SchemaMismatchError> {
    let has_state = plan
        .iter()
        .any(|(_, f)| matches!(f, Field::StateFsaCode | Field::StateFsaName));
    if has_state {
        Ok(())
    } else {
        Err(SchemaMismatchError::MissingColumns {
            year,
            columns: vec![
                Field::StateFsaCode.column_name().to_string(),
                Field::StateFsaName.column_name().to_string(),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Currency, SourceFormat};
    use anyhow::Result;
    use std::io::Write;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    fn init_test_logging() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,fsapayments::process=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn table(rows: &[&[&str]]) -> RawTable {
        RawTable::from_rows(rows.iter().map(|r| r.iter().copied()))
    }

    #[test]
    fn end_to_end_csv_for_2023() -> Result<()> {
        init_test_logging();
        let mut tmp = tempfile::Builder::new().suffix(".csv").tempfile()?;
        write!(
            tmp,
            "County,State,Program,Amount\nMissoula,MT,LFP,$100.00\n,,, \nTOTAL,,,$100.00\n"
        )?;
        let source = SourceFile::local(2023, tmp.path()).expect("csv source");
        assert_eq!(source.format, SourceFormat::Csv);

        let mapping = MappingTable::embedded()?;
        let out = Normalizer::new(&mapping).normalize_source(&source)?;

        assert_eq!(out.records.len(), 1);
        let rec = &out.records[0];
        assert_eq!(rec.disbursement_amount, Some(Currency::from_cents(10_000)));
        assert_eq!(rec.program_year, 2023);
        assert_eq!(rec.state_fsa_code, "30");
        assert_eq!(rec.state_fsa_name, "Montana");
        assert_eq!(rec.county_fsa_name.as_deref(), Some("Missoula"));
        assert_eq!(
            rec.program_description.as_deref(),
            Some("LIVESTOCK FORAGE DISASTER PROGRAM")
        );
        assert_eq!(out.report.blank_rows, 1);
        assert_eq!(out.report.footer_rows, 1);
        assert_eq!(out.report.skipped_rows, 0);
        assert_eq!(out.report.layout, Some(LayoutUsed::Header));
        Ok(())
    }

    #[test]
    fn unknown_headers_are_all_named() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let raw = table(&[
            &["State FSA Code", "Shoe Size", "Amount", "Favourite Colour"],
            &["30", "9", "1", "red"],
        ]);
        let err = Normalizer::new(&mapping)
            .normalize_table(&raw, 2020)
            .unwrap_err();
        match err {
            SchemaMismatchError::UnknownColumns { year, columns } => {
                assert_eq!(year, 2020);
                assert_eq!(columns, vec!["Shoe Size", "Favourite Colour"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn header_without_state_is_a_mismatch() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let raw = table(&[&["County", "Amount"], &["Missoula", "1"]]);
        let err = Normalizer::new(&mapping)
            .normalize_table(&raw, 2020)
            .unwrap_err();
        assert!(matches!(err, SchemaMismatchError::MissingColumns { .. }));
        Ok(())
    }

    #[test]
    fn positional_years_read_without_header() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let row: Vec<&str> = vec![
            "30", "MONTANA", "63", "Missoula", "DOE JOHN", "", "1 MAIN ST", "MISSOULA", "MT",
            "59801", "", "(25.00)", "06/01/2005", "2481", "crp", "2004", "extra",
        ];
        let raw = table(&[row.as_slice(), &row[..16]]);
        let out = Normalizer::new(&mapping).normalize_table(&raw, 2005)?;
        assert_eq!(out.report.layout, Some(LayoutUsed::Positional));
        // identical rows are not collapsed here; that is the archive's job
        assert_eq!(out.records.len(), 2);
        let rec = &out.records[0];
        assert_eq!(rec.state_fsa_name, "Montana");
        assert_eq!(rec.county_fsa_code.as_deref(), Some("063"));
        assert_eq!(rec.disbursement_amount, Some(Currency::from_cents(-2_500)));
        assert_eq!(
            rec.program_description.as_deref(),
            Some("CONSERVATION RESERVE PROGRAM")
        );
        // declared year wins over the in-file column
        assert_eq!(rec.program_year, 2005);
        assert_eq!(out.records[1].row_sequence, 1);
        Ok(())
    }

    #[test]
    fn positional_with_too_few_columns_fails() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let raw = table(&[&["30", "MONTANA", "63"]]);
        let err = Normalizer::new(&mapping)
            .normalize_table(&raw, 2006)
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaMismatchError::TooFewColumns {
                expected: 16,
                found: 3,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn header_detected_even_in_positional_year() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let raw = table(&[&["State Code", "Payment Amount"], &["16", "$5"]]);
        let out = Normalizer::new(&mapping).normalize_table(&raw, 2004)?;
        assert_eq!(out.report.layout, Some(LayoutUsed::Header));
        assert_eq!(out.records[0].state_fsa_name, "Idaho");
        Ok(())
    }

    #[test]
    fn years_without_layout_need_a_header() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let raw = table(&[&["Missoula", "MT"]]);
        let err = Normalizer::new(&mapping)
            .normalize_table(&raw, 1990)
            .unwrap_err();
        assert!(matches!(err, SchemaMismatchError::NoLayout { year: 1990 }));
        Ok(())
    }

    fn rows_with_bad(total: usize, bad: usize) -> RawTable {
        let mut rows = vec![vec!["State".to_string(), "Amount".to_string()]];
        for i in 0..total {
            let amount = if i < bad {
                "n/a".to_string()
            } else {
                format!("${}.00", i)
            };
            rows.push(vec!["MT".to_string(), amount]);
        }
        RawTable { rows }
    }

    #[test]
    fn skip_threshold_fails_the_file() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let err = Normalizer::new(&mapping)
            .normalize_table(&rows_with_bad(20, 2), 2023)
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaMismatchError::SkipThresholdExceeded {
                skipped: 2,
                candidates: 20,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn bad_rows_under_threshold_are_counted() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let out = Normalizer::new(&mapping).normalize_table(&rows_with_bad(20, 1), 2023)?;
        assert_eq!(out.records.len(), 19);
        assert_eq!(out.report.skipped_rows, 1);
        assert_eq!(out.report.row_errors[0].field, Field::DisbursementAmount);
        assert_eq!(out.report.row_errors[0].row, 1);
        Ok(())
    }

    #[test]
    fn mismatched_state_code_and_name_is_skipped() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let mut rows = vec![
            vec!["State FSA Code".to_string(), "State FSA Name".to_string(), "Amount".to_string()],
            vec!["16".to_string(), "MT".to_string(), "5".to_string()],
        ];
        for _ in 0..20 {
            rows.push(vec!["30".to_string(), "Montana".to_string(), "1".to_string()]);
        }
        rows.push(vec!["16".to_string(), "Idaho".to_string(), "2".to_string()]);
        let out = Normalizer::new(&mapping).normalize_table(&RawTable { rows }, 2023)?;

        assert_eq!(out.report.skipped_rows, 1);
        assert_eq!(out.report.row_errors[0].field, Field::StateFsaName);
        assert_eq!(out.report.row_errors[0].value, "MT");
        assert_eq!(out.records.len(), 21);
        assert!(out.records.iter().all(|r| match r.state_fsa_code.as_str() {
            "30" => r.state_fsa_name == "Montana",
            "16" => r.state_fsa_name == "Idaho",
            _ => false,
        }));
        Ok(())
    }

    #[test]
    fn unknown_programs_pass_through_flagged() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let raw = table(&[
            &["State", "Program"],
            &["ID", "Spud Relief  Pilot"],
            &["ID", "Spud Relief Pilot"],
            &["ID", "nap"],
        ]);
        let out = Normalizer::new(&mapping).normalize_table(&raw, 2021)?;
        assert_eq!(
            out.records[0].program_description.as_deref(),
            Some("Spud Relief  Pilot")
        );
        assert_eq!(
            out.records[2].program_description.as_deref(),
            Some("NONINSURED CROP DISASTER ASSISTANCE PROGRAM")
        );
        assert_eq!(
            out.report.unrecognized_programs.get("Spud Relief Pilot"),
            Some(&2)
        );
        Ok(())
    }

    #[test]
    fn leading_blank_rows_and_county_join() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let counties = CountyLookup::from_reader(
            "state_code,county_code,county_name\n16,1,Ada\n".as_bytes(),
        )?;
        let raw = table(&[
            &["", ""],
            &["State FSA Code", "County FSA Code", "Disbursement Amount"],
            &["16", "1", "1,000"],
        ]);
        let out = Normalizer::new(&mapping)
            .with_counties(&counties)
            .normalize_table(&raw, 2022)?;
        assert_eq!(out.report.blank_rows, 1);
        assert_eq!(out.records[0].county_fsa_code.as_deref(), Some("001"));
        assert_eq!(out.records[0].county_fsa_name.as_deref(), Some("Ada"));
        assert_eq!(out.report.county_names_filled, 1);
        Ok(())
    }

    #[test]
    fn unfetched_source_is_a_fetch_error() -> Result<()> {
        let mapping = MappingTable::embedded()?;
        let source = SourceFile::new(2023, "https://example.test/p.csv", SourceFormat::Csv);
        let err = Normalizer::new(&mapping)
            .normalize_source(&source)
            .unwrap_err();
        assert!(matches!(err, YearError::Fetch(_)));
        Ok(())
    }
}
