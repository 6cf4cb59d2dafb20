// src/schema/types.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A canonical column of the payment archive. The serde names are the
/// column names exactly as they appear in the archive and the mapping file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "State FSA Code")]
    StateFsaCode,
    #[serde(rename = "State FSA Name")]
    StateFsaName,
    #[serde(rename = "County FSA Code")]
    CountyFsaCode,
    #[serde(rename = "County FSA Name")]
    CountyFsaName,
    #[serde(rename = "Formatted Payee Name")]
    PayeeName,
    #[serde(rename = "Address Information Line")]
    AddressLine,
    #[serde(rename = "Delivery Address Line")]
    DeliveryAddressLine,
    #[serde(rename = "City Name")]
    CityName,
    #[serde(rename = "State Abbreviation")]
    StateAbbreviation,
    #[serde(rename = "Zip Code")]
    ZipCode,
    #[serde(rename = "Delivery Point Bar Code")]
    DeliveryPointBarCode,
    #[serde(rename = "Disbursement Amount")]
    DisbursementAmount,
    #[serde(rename = "Payment Date")]
    PaymentDate,
    #[serde(rename = "Accounting Program Code")]
    ProgramCode,
    #[serde(rename = "Accounting Program Description")]
    ProgramDescription,
    #[serde(rename = "Accounting Program Year")]
    ProgramYear,
}

impl Field {
    pub const COUNT: usize = 16;

    /// Every canonical field, in archive column order (partition columns last).
    pub const ALL: [Field; Field::COUNT] = [
        Field::StateFsaCode,
        Field::CountyFsaCode,
        Field::CountyFsaName,
        Field::PayeeName,
        Field::AddressLine,
        Field::DeliveryAddressLine,
        Field::CityName,
        Field::StateAbbreviation,
        Field::ZipCode,
        Field::DeliveryPointBarCode,
        Field::DisbursementAmount,
        Field::PaymentDate,
        Field::ProgramCode,
        Field::ProgramDescription,
        Field::StateFsaName,
        Field::ProgramYear,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Field::StateFsaCode => "State FSA Code",
            Field::StateFsaName => "State FSA Name",
            Field::CountyFsaCode => "County FSA Code",
            Field::CountyFsaName => "County FSA Name",
            Field::PayeeName => "Formatted Payee Name",
            Field::AddressLine => "Address Information Line",
            Field::DeliveryAddressLine => "Delivery Address Line",
            Field::CityName => "City Name",
            Field::StateAbbreviation => "State Abbreviation",
            Field::ZipCode => "Zip Code",
            Field::DeliveryPointBarCode => "Delivery Point Bar Code",
            Field::DisbursementAmount => "Disbursement Amount",
            Field::PaymentDate => "Payment Date",
            Field::ProgramCode => "Accounting Program Code",
            Field::ProgramDescription => "Accounting Program Description",
            Field::ProgramYear => "Accounting Program Year",
        }
    }

    /// Columns encoded in the partition path rather than inside the file.
    pub fn is_partition_column(&self) -> bool {
        matches!(self, Field::StateFsaName | Field::ProgramYear)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// A currency amount held as an exact count of cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Currency(i128);

impl Currency {
    pub const PRECISION: u8 = 18;
    pub const SCALE: i8 = 2;

    pub fn from_cents(cents: i128) -> Self {
        Currency(cents)
    }

    pub fn cents(self) -> i128 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Groups records into independently replaceable archive units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub state_fsa_name: String,
    pub program_year: i32,
}

/// One canonical payment row.
///
/// Equality and hashing cover every canonical field and ignore
/// `row_sequence`, so two rows that differ only in where they sat in the
/// source compare equal.
#[derive(Debug, Clone, Default)]
pub struct PaymentRecord {
    pub state_fsa_code: String,
    pub state_fsa_name: String,
    pub county_fsa_code: Option<String>,
    pub county_fsa_name: Option<String>,
    pub payee_name: Option<String>,
    pub address_line: Option<String>,
    pub delivery_address_line: Option<String>,
    pub city_name: Option<String>,
    pub state_abbreviation: Option<String>,
    pub zip_code: Option<String>,
    pub delivery_point_bar_code: Option<String>,
    pub disbursement_amount: Option<Currency>,
    pub payment_date: Option<NaiveDate>,
    pub program_code: Option<String>,
    pub program_description: Option<String>,
    pub program_year: i32,
    /// Source row index; internal only, never persisted.
    pub row_sequence: u64,
}

type LocationPart<'a> = (
    &'a str,
    &'a str,
    &'a Option<String>,
    &'a Option<String>,
    &'a Option<String>,
    &'a Option<String>,
    &'a Option<String>,
    &'a Option<String>,
);

type PaymentPart<'a> = (
    &'a Option<String>,
    &'a Option<String>,
    &'a Option<String>,
    &'a Option<Currency>,
    &'a Option<NaiveDate>,
    &'a Option<String>,
    &'a Option<String>,
    i32,
);

impl PaymentRecord {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            state_fsa_name: self.state_fsa_name.clone(),
            program_year: self.program_year,
        }
    }

    fn identity(&self) -> (LocationPart<'_>, PaymentPart<'_>) {
        (
            (
                self.state_fsa_code.as_str(),
                self.state_fsa_name.as_str(),
                &self.county_fsa_code,
                &self.county_fsa_name,
                &self.payee_name,
                &self.address_line,
                &self.delivery_address_line,
                &self.city_name,
            ),
            (
                &self.state_abbreviation,
                &self.zip_code,
                &self.delivery_point_bar_code,
                &self.disbursement_amount,
                &self.payment_date,
                &self.program_code,
                &self.program_description,
                self.program_year,
            ),
        )
    }
}

impl PartialEq for PaymentRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for PaymentRecord {}

impl Hash for PaymentRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}
