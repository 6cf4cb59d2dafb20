// src/process/heuristics.rs
//! Row classification predicates used by the normalizer.
//!
//! Each heuristic is a plain function over a row of cell strings so it can
//! be tested without reading a file.

use crate::schema::MappingTable;

/// First-cell tokens that mark a summary row. Matching is case-insensitive
/// and accepts the token on its own or followed by a space or colon, so
/// `"Total:"` and `"TOTAL FOR MONTANA"` are footers but `"Totalville"` is not.
pub const FOOTER_TOKENS: &[&str] = &["grand total", "subtotal", "sub-total", "sub total", "total"];

/// Verdict on the first non-blank row of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVerdict {
    /// A majority of the non-empty cells are known header tokens.
    Header,
    /// None of the cells is a known header token.
    Data,
    /// Some, but not most, cells matched; the year's layout decides.
    Undetermined,
}

/// A row with no visible content.
pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// A summary/footer row such as `TOTAL,,,"$100.00"`.
pub fn is_footer_row(row: &[String]) -> bool {
    let Some(first) = row.first() else {
        return false;
    };
    let cell = first.trim().to_lowercase();
    FOOTER_TOKENS.iter().any(|token| match cell.strip_prefix(token) {
        Some(rest) => rest.is_empty() || rest.starts_with(' ') || rest.starts_with(':'),
        None => false,
    })
}

/// Classify a candidate header row against every header token the mapping
/// table knows about.
pub fn classify_header_row(row: &[String], table: &MappingTable) -> HeaderVerdict {
    let cells: Vec<&String> = row.iter().filter(|c| !c.trim().is_empty()).collect();
    if cells.is_empty() {
        return HeaderVerdict::Undetermined;
    }
    let matches = cells.iter().filter(|c| table.is_header_token(c)).count();
    if matches == 0 {
        HeaderVerdict::Data
    } else if matches * 2 > cells.len() {
        HeaderVerdict::Header
    } else {
        HeaderVerdict::Undetermined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn blank_rows() {
        assert!(is_blank_row(&row(&["", "", "", " "])));
        assert!(is_blank_row(&row(&[])));
        assert!(!is_blank_row(&row(&["", "x"])));
    }

    #[test]
    fn footer_rows() {
        assert!(is_footer_row(&row(&["TOTAL", "", "", "$100.00"])));
        assert!(is_footer_row(&row(&[" Subtotal ", "12"])));
        assert!(is_footer_row(&row(&["Grand Total:", "12"])));
        assert!(is_footer_row(&row(&["total for montana"])));
        assert!(is_footer_row(&row(&["Sub-Total"])));
        assert!(!is_footer_row(&row(&["Totalville", "MT"])));
        assert!(!is_footer_row(&row(&["Missoula", "TOTAL"])));
        assert!(!is_footer_row(&row(&[])));
    }

    #[test]
    fn header_detection() -> anyhow::Result<()> {
        let table = MappingTable::embedded()?;
        assert_eq!(
            classify_header_row(&row(&["County", "State", "Program", "Amount"]), &table),
            HeaderVerdict::Header
        );
        assert_eq!(
            classify_header_row(&row(&["Missoula", "MT", "LFP", "$100.00"]), &table),
            HeaderVerdict::Data
        );
        assert_eq!(
            classify_header_row(&row(&["County", "MT", "LFP", "$100.00"]), &table),
            HeaderVerdict::Undetermined
        );
        assert_eq!(
            classify_header_row(&row(&["", " "]), &table),
            HeaderVerdict::Undetermined
        );
        Ok(())
    }
}
