use anyhow::{Context, Result};
use clap::Parser;
use fsapayments::{
    archive::Archive,
    schema::{PartitionKey, PaymentRecord},
};
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::{fs::File, path::PathBuf};

/// Print the layout and leading rows of one archive partition.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "archive")]
    archive_dir: PathBuf,

    /// State FSA Name, e.g. "Montana"
    #[arg(long)]
    state: String,

    /// Accounting Program Year
    #[arg(long)]
    year: i32,

    /// Rows to print
    #[arg(long, default_value_t = 10)]
    rows: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let archive = Archive::new(&args.archive_dir)?;
    let key = PartitionKey {
        state_fsa_name: args.state.clone(),
        program_year: args.year,
    };
    let path = archive.partition_file(&key);

    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)?;
    let meta = reader.metadata();
    let file_meta = meta.file_metadata();

    println!("=== Partition: {} / {} ===", key.state_fsa_name, key.program_year);
    println!("File:                 {}", path.display());
    println!(
        "Created by:           {}",
        file_meta.created_by().unwrap_or("<unknown>")
    );
    println!("Total rows:           {}", file_meta.num_rows());
    println!("Number of row groups: {}", meta.num_row_groups());
    println!("File-size on disk:    {} bytes", std::fs::metadata(&path)?.len());
    println!();

    println!("=== Columns ===");
    let first_rg = (meta.num_row_groups() > 0).then(|| meta.row_group(0));
    for (idx, col) in file_meta.schema_descr().columns().iter().enumerate() {
        let logical = col
            .logical_type()
            .as_ref()
            .map_or("<none>".to_string(), |lt| format!("{:?}", lt));
        let compression = first_rg
            .map(|rg| format!("{:?}", rg.column(idx).compression()))
            .unwrap_or_default();
        println!(
            "- {:<30} | Physical: {:<10} | Logical: {:<40} | {}",
            col.name(),
            format!("{:?}", col.physical_type()),
            logical,
            compression
        );
    }
    println!();

    let records = archive.read_partition(&key)?;
    println!("=== First {} of {} rows ===", args.rows.min(records.len()), records.len());
    for rec in records.iter().take(args.rows) {
        println!("{}", describe(rec));
    }
    Ok(())
}

fn describe(rec: &PaymentRecord) -> String {
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    format!(
        "{} {:<3} {:<20} {:<30} {:>14} {:<10} {}",
        rec.state_fsa_code,
        text(&rec.county_fsa_code),
        text(&rec.county_fsa_name),
        text(&rec.payee_name),
        rec.disbursement_amount
            .map(|a| a.to_string())
            .unwrap_or_default(),
        rec.payment_date.map(|d| d.to_string()).unwrap_or_default(),
        text(&rec.program_description),
    )
}
