/// Trim whitespace and strip one pair of outer quotes if present.
pub fn clean_str(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// `clean_str`, with empty results mapped to `None`.
pub fn clean_opt(raw: &str) -> Option<String> {
    let cleaned = clean_str(raw);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Collapse every run of whitespace to a single space.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning() {
        assert_eq!(clean_str("  \" Missoula \" "), "Missoula");
        assert_eq!(clean_str("\""), "\"");
        assert_eq!(clean_opt("   "), None);
        assert_eq!(collapse_whitespace(" a \t b\n c "), "a b c");
    }
}
