use anyhow::{Context, Result};
use clap::Parser;
use fsapayments::{
    archive::Archive,
    upload::{sync_archive, FsObjectStore},
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Mirror the partition archive into a bucket directory.
#[derive(Parser, Debug)]
struct Args {
    /// Archive written by `fsapayments`
    #[arg(long)]
    archive_dir: PathBuf,

    /// Directory the bucket is mounted at
    #[arg(long)]
    bucket_dir: PathBuf,

    /// Optional prefix inside bucket
    #[arg(long)]
    prefix: Option<String>,
}

fn main() -> Result<()> {
    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let root = std::fs::canonicalize(&args.archive_dir).with_context(|| {
        format!(
            "failed to canonicalize archive path: {}",
            args.archive_dir.display()
        )
    })?;
    info!(archive = %root.display(), bucket = %args.bucket_dir.display(), prefix = ?args.prefix, "Configuration");

    let archive = Archive::new(&root)?;
    let store = FsObjectStore::new(&args.bucket_dir, args.prefix.clone());
    let summary = sync_archive(&archive, &store)?;

    println!(
        "uploaded {} partition(s), {} unchanged, {} deleted",
        summary.uploaded, summary.unchanged, summary.deleted
    );
    Ok(())
}
