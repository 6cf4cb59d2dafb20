// src/pipeline.rs
//! Source lister → fetcher → normalizer → archive writer, one year at a time.

use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::archive::{Archive, YearWriteSummary};
use crate::error::{FetchError, WriteError, YearError};
use crate::fetch::{build_client, fetch_source_files, DownloadCache, Fetcher};
use crate::history::History;
use crate::process::{county::CountyLookup, NormalizeReport, Normalizer};
use crate::schema::{MappingTable, SourceFile};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub listing_url: String,
    pub cache_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub history_dir: PathBuf,
    /// Years to process; empty means every listed year.
    pub years: Vec<i32>,
    /// Local files used instead of discovery for their year.
    pub local_sources: Vec<SourceFile>,
    pub force: bool,
    pub jobs: usize,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Result of one year that did not fail.
#[derive(Debug)]
pub enum YearStatus {
    /// Same source already processed; nothing was touched.
    AlreadyProcessed,
    Written {
        report: NormalizeReport,
        write: YearWriteSummary,
    },
}

#[derive(Debug)]
pub struct YearOutcome {
    pub year: i32,
    pub result: Result<YearStatus, YearError>,
}

impl YearOutcome {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

/// Everything a year needs, shareable across tasks.
#[derive(Clone)]
pub struct Pipeline {
    fetcher: Fetcher,
    table: Arc<MappingTable>,
    counties: Option<Arc<CountyLookup>>,
    archive: Archive,
    history: Arc<History>,
    force: bool,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        table: MappingTable,
        counties: Option<CountyLookup>,
    ) -> Result<Self> {
        let client = build_client(config.timeout).context("building HTTP client")?;
        let fetcher = Fetcher::new(
            client,
            DownloadCache::new(&config.cache_dir),
            config.max_retries,
        );
        let archive = Archive::new(&config.archive_dir)
            .with_context(|| format!("opening archive {}", config.archive_dir.display()))?;
        let history = History::new(&config.history_dir)?;
        Ok(Self {
            fetcher,
            table: Arc::new(table),
            counties: counties.map(Arc::new),
            archive,
            history: Arc::new(history),
            force: config.force,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        self.fetcher.client()
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Fetch, normalize and write one source file. Partitions of other
    /// years are never touched, whatever happens here.
    #[instrument(level = "info", skip(self, source), fields(year = source.year))]
    pub async fn run_year(&self, source: SourceFile) -> Result<YearStatus, YearError> {
        if !self.force {
            match self.history.is_processed(&source) {
                Ok(true) => {
                    info!(url = %source.url, "already processed; use --force to redo");
                    return Ok(YearStatus::AlreadyProcessed);
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "history unreadable; processing anyway"),
            }
        }

        let fetched = self.fetcher.fetch(&source, self.force).await?;

        let table = self.table.clone();
        let counties = self.counties.clone();
        let archive = self.archive.clone();
        let force = self.force;
        let worker_source = fetched.clone();
        let (report, write) = tokio::task::spawn_blocking(move || -> Result<_, YearError> {
            let mut normalizer = Normalizer::new(&table);
            if let Some(lookup) = counties.as_deref() {
                normalizer = normalizer.with_counties(lookup);
            }
            let normalized = normalizer.normalize_source(&worker_source)?;
            if normalized.records.is_empty() && !force {
                let existing = archive.year_partitions(worker_source.year)?.len();
                if existing > 0 {
                    return Err(WriteError::EmptyReplacement {
                        year: worker_source.year,
                        existing,
                    }
                    .into());
                }
            }
            let write = archive.write_year(worker_source.year, normalized.records)?;
            Ok((normalized.report, write))
        })
        .await
        .map_err(|e| YearError::Aborted(e.to_string()))??;

        if let Err(e) = self
            .history
            .record_processed(&fetched, write.records_written as u64)
        {
            warn!(error = %e, "could not record history");
        }
        Ok(YearStatus::Written { report, write })
    }

    /// Run every source, at most `jobs` at a time. Outcomes come back in
    /// year order; one year failing never stops another.
    pub async fn run_all(&self, sources: Vec<SourceFile>, jobs: usize) -> Vec<YearOutcome> {
        let permits = Arc::new(Semaphore::new(jobs.max(1)));
        let tasks = sources.into_iter().map(|source| {
            let year = source.year;
            let pipeline = self.clone();
            let permits = permits.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| YearError::Aborted(e.to_string()))?;
                pipeline.run_year(source).await
            });
            async move {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Err(YearError::Aborted(e.to_string())));
                if let Err(e) = &result {
                    error!(year, kind = e.kind(), error = %e, "year failed");
                }
                YearOutcome { year, result }
            }
        });

        let mut outcomes = join_all(tasks).await;
        outcomes.sort_by_key(|o| o.year);
        outcomes
    }
}

/// Pick the sources to run: local overrides first, then discovery for the
/// rest. Requested years that cannot be found become failed outcomes.
pub async fn resolve_sources(
    config: &PipelineConfig,
    client: &reqwest::Client,
) -> Result<(Vec<SourceFile>, Vec<YearOutcome>)> {
    let mut chosen: BTreeMap<i32, SourceFile> = config
        .local_sources
        .iter()
        .map(|s| (s.year, s.clone()))
        .collect();
    let wanted: BTreeSet<i32> = config.years.iter().copied().collect();

    let needs_listing = if wanted.is_empty() {
        config.local_sources.is_empty()
    } else {
        wanted.iter().any(|y| !chosen.contains_key(y))
    };

    if needs_listing {
        let listed = fetch_source_files(client, &config.listing_url, config.max_retries)
            .await
            .with_context(|| format!("listing {}", config.listing_url))?;
        for source in listed {
            if wanted.is_empty() || wanted.contains(&source.year) {
                chosen.entry(source.year).or_insert(source);
            }
        }
    }

    let missing = wanted
        .iter()
        .filter(|y| !chosen.contains_key(y))
        .map(|&year| YearOutcome {
            year,
            result: Err(FetchError::NotListed {
                year,
                listing: config.listing_url.clone(),
            }
            .into()),
        })
        .collect();

    let sources = chosen
        .into_values()
        .filter(|s| wanted.is_empty() || wanted.contains(&s.year))
        .collect();
    Ok((sources, missing))
}

/// Fixed-width table for the terminal, one line per year.
pub fn render_summary(outcomes: &[YearOutcome]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<6} {:<20} {:>9} {:>6} {:>6} {:>7} {:>6} {:>5}  detail",
        "year", "status", "records", "blank", "footer", "skipped", "dups", "parts"
    );
    for o in outcomes {
        match &o.result {
            Ok(YearStatus::AlreadyProcessed) => {
                let _ = writeln!(out, "{:<6} {:<20}", o.year, "already-processed");
            }
            Ok(YearStatus::Written { report, write }) => {
                let mut detail = Vec::new();
                if !report.unrecognized_programs.is_empty() {
                    detail.push(format!(
                        "{} unrecognised program(s)",
                        report.unrecognized_programs.len()
                    ));
                }
                if write.stale_removed > 0 {
                    detail.push(format!("{} stale partition(s) removed", write.stale_removed));
                }
                let _ = writeln!(
                    out,
                    "{:<6} {:<20} {:>9} {:>6} {:>6} {:>7} {:>6} {:>5}  {}",
                    o.year,
                    "ok",
                    write.records_written,
                    report.blank_rows,
                    report.footer_rows,
                    report.skipped_rows,
                    write.duplicates,
                    write.partitions_written,
                    detail.join("; ")
                );
            }
            Err(e) => {
                let _ = writeln!(out, "{:<6} {:<20} {}", o.year, e.kind(), e);
            }
        }
    }
    out
}
