// src/schema/arrow.rs

use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema, SchemaRef};
use once_cell::sync::Lazy;
use std::sync::Arc;

use super::types::{Currency, Field};

/// Map a canonical field onto its Arrow type.
///
/// - Disbursement Amount     → Decimal128(18, 2)
/// - Payment Date            → Date32
/// - Accounting Program Year → Int32
/// - everything else         → Utf8 (codes stay strings to keep their zero padding)
pub fn map_to_arrow_type(field: Field) -> DataType {
    match field {
        Field::DisbursementAmount => DataType::Decimal128(Currency::PRECISION, Currency::SCALE),
        Field::PaymentDate => DataType::Date32,
        Field::ProgramYear => DataType::Int32,
        _ => DataType::Utf8,
    }
}

/// Only the state code is mandatory inside a partition file.
fn is_nullable(field: Field) -> bool {
    !matches!(field, Field::StateFsaCode)
}

/// Canonical fields stored inside each partition file, in column order.
pub fn file_fields() -> impl Iterator<Item = Field> {
    Field::ALL.into_iter().filter(|f| !f.is_partition_column())
}

static FILE_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    let fields: Vec<ArrowField> = file_fields()
        .map(|f| ArrowField::new(f.column_name(), map_to_arrow_type(f), is_nullable(f)))
        .collect();
    Arc::new(ArrowSchema::new(fields))
});

/// Schema of a partition file. Partition columns live in the directory path.
pub fn build_arrow_schema() -> SchemaRef {
    FILE_SCHEMA.clone()
}
