// src/schema/source.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Xls,
    Xlsx,
    Csv,
}

impl SourceFormat {
    /// Detect the format from a URL path or file name.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let lower = lower.split(['?', '#']).next().unwrap_or_default();
        if lower.ends_with(".xlsx") {
            Some(SourceFormat::Xlsx)
        } else if lower.ends_with(".xls") {
            Some(SourceFormat::Xls)
        } else if lower.ends_with(".csv") {
            Some(SourceFormat::Csv)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::Xls => "xls",
            SourceFormat::Xlsx => "xlsx",
            SourceFormat::Csv => "csv",
        }
    }

    /// Preference when one year is published in several formats; higher wins.
    pub fn preference(&self) -> u8 {
        match self {
            SourceFormat::Xlsx => 3,
            SourceFormat::Xls => 2,
            SourceFormat::Csv => 1,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// One published yearly release. `local_path` is filled in once, by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub year: i32,
    pub url: String,
    pub format: SourceFormat,
    pub local_path: Option<PathBuf>,
}

impl SourceFile {
    pub fn new(year: i32, url: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            year,
            url: url.into(),
            format,
            local_path: None,
        }
    }

    /// A file already on disk, bypassing discovery and download.
    pub fn local(year: i32, path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let format = SourceFormat::from_name(&path.to_string_lossy())?;
        Some(Self {
            year,
            url: format!("file://{}", path.display()),
            format,
            local_path: Some(path.to_path_buf()),
        })
    }

    /// Stable file name used inside the download cache.
    pub fn cache_file_name(&self) -> String {
        format!("payments_{}.{}", self.year, self.format.extension())
    }

    /// A copy of this source pointing at its fetched file.
    pub fn with_local_path(&self, path: PathBuf) -> Self {
        Self {
            local_path: Some(path),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_from_url() {
        assert_eq!(
            SourceFormat::from_name("https://x/y/payment_file_2019.XLSX"),
            Some(SourceFormat::Xlsx)
        );
        assert_eq!(
            SourceFormat::from_name("https://x/y/pay_2005.xls?dl=1"),
            Some(SourceFormat::Xls)
        );
        assert_eq!(SourceFormat::from_name("a.csv"), Some(SourceFormat::Csv));
        assert_eq!(SourceFormat::from_name("a.pdf"), None);
    }

    #[test]
    fn local_source_carries_path() {
        let src = SourceFile::local(2023, "/tmp/in.csv").expect("csv is a known format");
        assert_eq!(src.format, SourceFormat::Csv);
        assert_eq!(src.local_path.as_deref(), Some(Path::new("/tmp/in.csv")));
        assert_eq!(src.cache_file_name(), "payments_2023.csv");
    }

    #[test]
    fn fetched_copy_leaves_listing_entry_alone() {
        let listed = SourceFile {
            year: 2019,
            url: "https://www.fsa.usda.gov/payments_2019.xlsx".into(),
            format: SourceFormat::Xlsx,
            local_path: None,
        };
        let fetched = listed.with_local_path(PathBuf::from("/cache/payments_2019.xlsx"));
        assert_eq!(listed.local_path, None);
        assert_eq!(fetched.url, listed.url);
        assert_eq!(
            fetched.local_path.as_deref(),
            Some(Path::new("/cache/payments_2019.xlsx"))
        );
    }
}
