use anyhow::{bail, Context, Result};
use clap::Parser;
use fsapayments::{
    fetch::DEFAULT_LISTING_URL,
    pipeline::{render_summary, resolve_sources, Pipeline, PipelineConfig},
    process::county::CountyLookup,
    schema::{MappingTable, SourceFile},
};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Download the FSA payment files and rebuild the partitioned archive.
#[derive(Parser, Debug)]
#[command(name = "fsapayments", version)]
struct Args {
    /// Program year to process; repeat for several. Default: every listed year.
    #[arg(long = "year")]
    years: Vec<i32>,

    /// Re-download and reprocess even if the source was seen before.
    #[arg(long)]
    force: bool,

    /// Years processed concurrently.
    #[arg(long, default_value_t = 1)]
    jobs: usize,

    #[arg(long, default_value = DEFAULT_LISTING_URL)]
    listing_url: String,

    #[arg(long, default_value = "downloads")]
    cache_dir: PathBuf,

    #[arg(long, default_value = "archive")]
    archive_dir: PathBuf,

    #[arg(long, default_value = "history")]
    history_dir: PathBuf,

    /// YAML mapping table replacing the built-in one.
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// CSV of state_code,county_code,county_name used to fill county names.
    #[arg(long)]
    county_ref: Option<PathBuf>,

    /// Fraction of rows allowed to fail coercion before a year is rejected.
    #[arg(long)]
    skip_threshold: Option<f64>,

    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Local file for a year, as YEAR=PATH; bypasses discovery for that year.
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<SourceFile>,
}

fn parse_source(arg: &str) -> Result<SourceFile, String> {
    let (year, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected YEAR=PATH, got {arg:?}"))?;
    let year: i32 = year
        .trim()
        .parse()
        .map_err(|e| format!("bad year {year:?}: {e}"))?;
    SourceFile::local(year, path.trim())
        .ok_or_else(|| format!("{path:?} is not an .xls, .xlsx or .csv file"))
}

fn load_mapping(args: &Args) -> Result<MappingTable> {
    let table = match &args.mapping {
        Some(path) => MappingTable::load(path)?,
        None => MappingTable::embedded()?,
    };
    Ok(match args.skip_threshold {
        Some(t) if !(0.0..=1.0).contains(&t) => bail!("--skip-threshold must be within 0..=1"),
        Some(t) => table.with_skip_threshold(t),
        None => table,
    })
}

async fn run(args: Args) -> Result<bool> {
    let table = load_mapping(&args)?;
    let counties = args
        .county_ref
        .as_ref()
        .map(|p| CountyLookup::load(p).with_context(|| format!("county reference {}", p.display())))
        .transpose()?;

    let config = PipelineConfig {
        listing_url: args.listing_url,
        cache_dir: args.cache_dir,
        archive_dir: args.archive_dir,
        history_dir: args.history_dir,
        years: args.years,
        local_sources: args.sources,
        force: args.force,
        jobs: args.jobs,
        timeout: Duration::from_secs(args.timeout_secs),
        max_retries: args.max_retries,
    };

    let pipeline = Pipeline::new(&config, table, counties)?;
    let (sources, mut outcomes) = resolve_sources(&config, pipeline.client()).await?;
    info!(years = sources.len(), jobs = config.jobs, "starting");

    outcomes.extend(pipeline.run_all(sources, config.jobs).await);
    outcomes.sort_by_key(|o| o.year);

    print!("{}", render_summary(&outcomes));
    Ok(outcomes.iter().all(|o| !o.is_failure()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}
