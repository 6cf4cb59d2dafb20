// src/archive/batch.rs

use arrow::{
    array::{Array, ArrayRef, Date32Array, Decimal128Array, StringArray},
    error::ArrowError,
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use std::sync::Arc;

use crate::schema::{
    arrow::{build_arrow_schema, file_fields},
    Currency, Field, PartitionKey, PaymentRecord,
};

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Optional text columns, by field.
fn text_value(rec: &PaymentRecord, field: Field) -> Option<&str> {
    match field {
        Field::StateFsaCode => Some(rec.state_fsa_code.as_str()),
        Field::StateFsaName => Some(rec.state_fsa_name.as_str()),
        Field::CountyFsaCode => rec.county_fsa_code.as_deref(),
        Field::CountyFsaName => rec.county_fsa_name.as_deref(),
        Field::PayeeName => rec.payee_name.as_deref(),
        Field::AddressLine => rec.address_line.as_deref(),
        Field::DeliveryAddressLine => rec.delivery_address_line.as_deref(),
        Field::CityName => rec.city_name.as_deref(),
        Field::StateAbbreviation => rec.state_abbreviation.as_deref(),
        Field::ZipCode => rec.zip_code.as_deref(),
        Field::DeliveryPointBarCode => rec.delivery_point_bar_code.as_deref(),
        Field::ProgramCode => rec.program_code.as_deref(),
        Field::ProgramDescription => rec.program_description.as_deref(),
        Field::DisbursementAmount | Field::PaymentDate | Field::ProgramYear => None,
    }
}

fn set_text(rec: &mut PaymentRecord, field: Field, value: Option<String>) {
    match field {
        Field::StateFsaCode => rec.state_fsa_code = value.unwrap_or_default(),
        Field::StateFsaName => rec.state_fsa_name = value.unwrap_or_default(),
        Field::CountyFsaCode => rec.county_fsa_code = value,
        Field::CountyFsaName => rec.county_fsa_name = value,
        Field::PayeeName => rec.payee_name = value,
        Field::AddressLine => rec.address_line = value,
        Field::DeliveryAddressLine => rec.delivery_address_line = value,
        Field::CityName => rec.city_name = value,
        Field::StateAbbreviation => rec.state_abbreviation = value,
        Field::ZipCode => rec.zip_code = value,
        Field::DeliveryPointBarCode => rec.delivery_point_bar_code = value,
        Field::ProgramCode => rec.program_code = value,
        Field::ProgramDescription => rec.program_description = value,
        Field::DisbursementAmount | Field::PaymentDate | Field::ProgramYear => {}
    }
}

/// Build one partition file's batch. Partition columns are left out.
pub fn records_to_batch(records: &[PaymentRecord]) -> Result<RecordBatch, ArrowError> {
    let epoch = epoch();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(Field::COUNT);
    for field in file_fields() {
        let array = match field {
            Field::DisbursementAmount => Arc::new(
                records
                    .iter()
                    .map(|r| r.disbursement_amount.map(Currency::cents))
                    .collect::<Decimal128Array>()
                    .with_precision_and_scale(Currency::PRECISION, Currency::SCALE)?,
            ) as ArrayRef,
            Field::PaymentDate => Arc::new(
                records
                    .iter()
                    .map(|r| r.payment_date.map(|d| (d - epoch).num_days() as i32))
                    .collect::<Date32Array>(),
            ) as ArrayRef,
            text => Arc::new(
                records
                    .iter()
                    .map(|r| text_value(r, text))
                    .collect::<StringArray>(),
            ) as ArrayRef,
        };
        columns.push(array);
    }
    RecordBatch::try_new(build_arrow_schema(), columns)
}

fn column<'b, T: 'static>(batch: &'b RecordBatch, field: Field) -> Result<&'b T, String> {
    batch
        .column_by_name(field.column_name())
        .ok_or_else(|| format!("missing column {}", field))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column {} has unexpected type", field))
}

/// Read records back out of a partition batch, restoring the partition
/// columns from `key`. `offset` numbers rows across batches.
pub fn batch_to_records(
    batch: &RecordBatch,
    key: &PartitionKey,
    offset: usize,
) -> Result<Vec<PaymentRecord>, String> {
    let mut records: Vec<PaymentRecord> = (0..batch.num_rows())
        .map(|i| PaymentRecord {
            state_fsa_name: key.state_fsa_name.clone(),
            program_year: key.program_year,
            row_sequence: (offset + i) as u64,
            ..Default::default()
        })
        .collect();

    let epoch = epoch();
    for field in file_fields() {
        match field {
            Field::DisbursementAmount => {
                let arr = column::<Decimal128Array>(batch, field)?;
                for (rec, v) in records.iter_mut().zip(arr.iter()) {
                    rec.disbursement_amount = v.map(Currency::from_cents);
                }
            }
            Field::PaymentDate => {
                let arr = column::<Date32Array>(batch, field)?;
                for (rec, v) in records.iter_mut().zip(arr.iter()) {
                    rec.payment_date = v.and_then(|days| {
                        epoch.checked_add_signed(chrono::Duration::days(i64::from(days)))
                    });
                }
            }
            text => {
                let arr = column::<StringArray>(batch, text)?;
                if text == Field::StateFsaCode && arr.null_count() > 0 {
                    return Err(format!("{} contains nulls", text));
                }
                for (rec, v) in records.iter_mut().zip(arr.iter()) {
                    set_text(rec, text, v.map(str::to_string));
                }
            }
        }
    }
    Ok(records)
}
