// src/archive/path.rs

use std::path::{Path, PathBuf};

use crate::schema::{Field, PartitionKey};

pub const PARTITION_FILE: &str = "part-0.parquet";

/// Characters that may not appear verbatim in a hive-style path segment.
fn needs_escape(c: char) -> bool {
    c.is_control()
        || matches!(
            c,
            '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '[' | ']' | '^'
        )
}

/// Percent-encode a partition value for use as a directory name.
pub fn escape_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        } else {
            out.push(c);
        }
    }
    // "." and ".." are not usable directory names
    if out.is_empty() || out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
        if out.is_empty() {
            out.push_str("%00");
        }
    }
    out
}

/// Inverse of [`escape_partition_value`]. Returns `None` on malformed escapes.
pub fn unescape_partition_value(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let decoded = String::from_utf8(out).ok()?;
    Some(if decoded == "\0" { String::new() } else { decoded })
}

/// `<root>/State FSA Name=<v>/Accounting Program Year=<v>`
pub fn partition_dir(root: &Path, key: &PartitionKey) -> PathBuf {
    root.join(format!(
        "{}={}",
        Field::StateFsaName.column_name(),
        escape_partition_value(&key.state_fsa_name)
    ))
    .join(format!(
        "{}={}",
        Field::ProgramYear.column_name(),
        key.program_year
    ))
}

pub fn partition_file(root: &Path, key: &PartitionKey) -> PathBuf {
    partition_dir(root, key).join(PARTITION_FILE)
}

/// Recover the partition key from a partition directory path.
pub fn parse_partition_dir(dir: &Path) -> Option<PartitionKey> {
    let year_seg = dir.file_name()?.to_str()?;
    let state_seg = dir.parent()?.file_name()?.to_str()?;
    let year = year_seg
        .strip_prefix(Field::ProgramYear.column_name())?
        .strip_prefix('=')?
        .parse()
        .ok()?;
    let state = state_seg
        .strip_prefix(Field::StateFsaName.column_name())?
        .strip_prefix('=')?;
    Some(PartitionKey {
        state_fsa_name: unescape_partition_value(state)?,
        program_year: year,
    })
}
