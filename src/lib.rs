// src/lib.rs
//! Yearly FSA farm payment files, normalized into a partitioned Parquet archive.

pub mod archive;
pub mod error;
pub mod fetch;
pub mod history;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod upload;
