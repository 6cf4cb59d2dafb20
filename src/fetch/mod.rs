// src/fetch/mod.rs

pub mod download;
pub mod listing;

use reqwest::Client;
use std::time::Duration;

pub use download::{DownloadCache, Fetcher};
pub use listing::{fetch_source_files, parse_listing, DEFAULT_LISTING_URL};

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (1-based): doubles each time, capped.
pub(crate) fn backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

/// HTTP client shared by discovery and downloads.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(30)))
        .gzip(true)
        .user_agent(concat!("fsapayments/", env!("CARGO_PKG_VERSION")))
        .build()
}
