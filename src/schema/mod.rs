// src/schema/mod.rs

pub mod arrow;
pub mod mapping;
pub mod source;
pub mod states;
pub mod types;

pub use self::arrow::{build_arrow_schema, map_to_arrow_type};
pub use mapping::{HeaderLookup, Layout, MappingTable};
pub use source::{SourceFile, SourceFormat};
pub use types::{Currency, Field, PartitionKey, PaymentRecord};
