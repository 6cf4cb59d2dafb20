// src/fetch/listing.rs

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::schema::{SourceFile, SourceFormat};

/// Page that links every yearly payment file.
pub const DEFAULT_LISTING_URL: &str =
    "https://www.fsa.usda.gov/tools/informational/freedom-information-act-foia/electronic-reading-room/frequently-requested/payment-files";

/// Earliest program year published as a payment file.
pub const FIRST_YEAR: i32 = 2004;

static YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    // four digits not glued to other digits
    Regex::new(r"(?:^|[^0-9])(20[0-9]{2})(?:[^0-9]|$)").expect("year pattern should compile")
});

static ANCHOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("anchor selector should parse"));

fn year_in(text: &str) -> Option<i32> {
    YEAR_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<i32>().ok())
        .find(|y| *y >= FIRST_YEAR)
}

/// Extract one source file per program year from a listing page.
///
/// The year comes from the file name first, then the link text. When a
/// year is offered in several formats xlsx beats xls beats csv; ties keep
/// the first link on the page.
pub fn parse_listing(html: &str, base: &Url) -> Vec<SourceFile> {
    let doc = Html::parse_document(html);
    let mut by_year: BTreeMap<i32, SourceFile> = BTreeMap::new();

    for anchor in doc.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(url) = base.join(href.trim()) else {
            debug!(href, "skipping unparseable link");
            continue;
        };
        let Some(format) = SourceFormat::from_name(url.path()) else {
            continue;
        };
        let file_name = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or_default()
            .to_string();
        let text: String = anchor.text().collect();
        let Some(year) = year_in(&file_name).or_else(|| year_in(&text)) else {
            debug!(%url, "payment-looking link without a year");
            continue;
        };

        let candidate = SourceFile::new(year, url.to_string(), format);
        match by_year.get(&year) {
            Some(existing) if existing.format.preference() >= format.preference() => {}
            _ => {
                by_year.insert(year, candidate);
            }
        }
    }

    by_year.into_values().collect()
}

/// Fetch the listing page and enumerate the yearly files it links.
#[tracing::instrument(level = "info", skip(client))]
pub async fn fetch_source_files(
    client: &Client,
    listing_url: &str,
    max_retries: u32,
) -> Result<Vec<SourceFile>, FetchError> {
    let base = Url::parse(listing_url).map_err(|e| FetchError::Corrupt {
        path: listing_url.into(),
        reason: e.to_string(),
    })?;

    let html = get_text_with_retry(client, &base, max_retries).await?;
    let files = parse_listing(&html, &base);
    if files.is_empty() {
        warn!(%base, "listing page links no payment files");
    } else {
        info!(count = files.len(), "discovered payment files");
    }
    Ok(files)
}

async fn get_text(client: &Client, url: &Url) -> Result<String, FetchError> {
    let http = |source| FetchError::Http {
        url: url.to_string(),
        source,
    };
    let resp = client.get(url.clone()).send().await.map_err(http)?;
    if !resp.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }
    resp.text().await.map_err(http)
}

async fn get_text_with_retry(
    client: &Client,
    url: &Url,
    max_retries: u32,
) -> Result<String, FetchError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match get_text(client, url).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retryable() && attempt <= max_retries => {
                let delay = super::backoff(attempt);
                warn!(%url, attempt, error = %e, ?delay, "listing fetch failed, retrying");
                sleep(delay).await;
            }
            Err(e) if attempt > 1 => {
                return Err(FetchError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                })
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <a href="/Assets/USDA-FSA-Public/usdafiles/FOIA/payment-files/2023_payments.csv">2023 (CSV)</a>
          <a href="/Assets/USDA-FSA-Public/usdafiles/FOIA/payment-files/2023_payments.xlsx">2023 (Excel)</a>
          <a href="files/pmt2005.xls">Payment file</a>
          <a href="files/payments.xls">Calendar Year 2010 Payments</a>
          <a href="files/readme.pdf">2011 readme</a>
          <a href="files/payments_1999.csv">1999</a>
          <a href="mailto:foia@usda.gov">contact</a>
        </body></html>"#;

    #[test]
    fn one_file_per_year_with_format_preference() {
        let base = Url::parse("https://www.fsa.usda.gov/payment-files/").unwrap();
        let files = parse_listing(PAGE, &base);
        let years: Vec<i32> = files.iter().map(|f| f.year).collect();
        assert_eq!(years, vec![2005, 2010, 2023]);

        assert_eq!(files[0].url, "https://www.fsa.usda.gov/payment-files/files/pmt2005.xls");
        assert_eq!(files[1].format, SourceFormat::Xls);
        assert_eq!(files[2].format, SourceFormat::Xlsx);
        assert!(files[2].url.ends_with("2023_payments.xlsx"));
        assert!(files.iter().all(|f| f.local_path.is_none()));
    }

    #[test]
    fn year_extraction_ignores_longer_numbers() {
        assert_eq!(year_in("payments_2019.xlsx"), Some(2019));
        assert_eq!(year_in("file120191.csv"), None);
        assert_eq!(year_in("FY2003 and 2004"), Some(2004));
    }
}
