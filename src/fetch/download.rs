// src/fetch/download.rs

use reqwest::Client;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::{fs, time::sleep};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::schema::SourceFile;

/// Directory holding downloaded source files for the current run.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    dir: PathBuf,
}

impl DownloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, source: &SourceFile) -> PathBuf {
        self.dir.join(source.cache_file_name())
    }

    /// The cached copy, if one exists and is non-empty.
    pub async fn lookup(&self, source: &SourceFile) -> Option<PathBuf> {
        let path = self.path_for(source);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            _ => None,
        }
    }
}

/// Retrieves source files into a [`DownloadCache`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    cache: DownloadCache,
    max_retries: u32,
}

impl Fetcher {
    pub fn new(client: Client, cache: DownloadCache, max_retries: u32) -> Self {
        Self {
            client,
            cache,
            max_retries,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    /// Make `source` available locally.
    ///
    /// Files that already have a `local_path` pass through. Otherwise the
    /// cached copy is reused unless `force` is set.
    #[tracing::instrument(level = "info", skip(self, source), fields(year = source.year))]
    pub async fn fetch(&self, source: &SourceFile, force: bool) -> Result<SourceFile, FetchError> {
        if let Some(path) = &source.local_path {
            if fs::metadata(path).await.is_err() {
                return Err(FetchError::Io {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "local source missing"),
                });
            }
            return Ok(source.clone());
        }

        if !force {
            if let Some(path) = self.cache.lookup(source).await {
                debug!(path = %path.display(), "using cached download");
                return Ok(source.with_local_path(path));
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once(source).await {
                Ok(path) => {
                    info!(url = %source.url, path = %path.display(), "downloaded");
                    return Ok(source.with_local_path(path));
                }
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = super::backoff(attempt);
                    warn!(url = %source.url, attempt, error = %e, ?delay, "download failed, retrying");
                    sleep(delay).await;
                }
                Err(e) if attempt > 1 => {
                    return Err(FetchError::Exhausted {
                        url: source.url.clone(),
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: body goes to a temp file in the cache dir, then is
    /// renamed into place.
    async fn download_once(&self, source: &SourceFile) -> Result<PathBuf, FetchError> {
        let http = |e| FetchError::Http {
            url: source.url.clone(),
            source: e,
        };
        let resp = self.client.get(&source.url).send().await.map_err(http)?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url: source.url.clone(),
                status: resp.status().as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(http)?;

        let dest = self.cache.path_for(source);
        if bytes.is_empty() {
            return Err(FetchError::Corrupt {
                path: dest,
                reason: "empty response body".into(),
            });
        }

        let dir = self.cache.dir().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FetchError::Io { path: dir.clone(), source: e })?;

        let target = dest.clone();
        tokio::task::spawn_blocking(move || -> Result<(), FetchError> {
            let io = |path: &Path, source| FetchError::Io {
                path: path.to_path_buf(),
                source,
            };
            let mut tmp = tempfile::Builder::new()
                .prefix(".download.")
                .tempfile_in(&dir)
                .map_err(|e| io(&dir, e))?;
            if let Err(e) = tmp.write_all(&bytes).and_then(|_| tmp.as_file().sync_all()) {
                return Err(io(tmp.path(), e));
            }
            tmp.persist(&target).map_err(|e| FetchError::Io {
                path: target.clone(),
                source: e.error,
            })?;
            Ok(())
        })
        .await
        .map_err(|e| FetchError::Io {
            path: dest.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })??;

        Ok(dest)
    }
}
