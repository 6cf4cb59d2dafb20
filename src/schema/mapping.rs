// src/schema/mapping.rs

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::Path,
};

use super::types::Field;

/// The mapping table shipped with the crate.
const EMBEDDED_MAPPING: &str = include_str!("../../config/mapping.yaml");

pub const DEFAULT_SKIP_THRESHOLD: f64 = 0.05;

fn default_skip_threshold() -> f64 {
    DEFAULT_SKIP_THRESHOLD
}

/// Inclusive `[first, last]` program years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct YearRange(pub i32, pub i32);

impl YearRange {
    pub fn contains(&self, year: i32) -> bool {
        (self.0..=self.1).contains(&year)
    }
}

/// How the rows of one range of years are laid out.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "layout", rename_all = "lowercase")]
pub enum Layout {
    /// First row names the columns; `aliases` adds year-specific variants.
    Header {
        years: YearRange,
        #[serde(default)]
        aliases: BTreeMap<Field, Vec<String>>,
    },
    /// No header row; columns are identified by index.
    Positional {
        years: YearRange,
        columns: BTreeMap<usize, Field>,
    },
}

impl Layout {
    pub fn years(&self) -> YearRange {
        match self {
            Layout::Header { years, .. } | Layout::Positional { years, .. } => *years,
        }
    }
}

/// On-disk shape of the mapping file.
#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default = "default_skip_threshold")]
    skip_threshold: f64,
    aliases: BTreeMap<Field, Vec<String>>,
    #[serde(default)]
    ignored_columns: Vec<String>,
    layouts: Vec<Layout>,
    #[serde(default)]
    programs: BTreeMap<String, Vec<String>>,
}

/// Outcome of looking a header cell up in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLookup {
    Field(Field),
    Ignored,
    Unknown,
}

/// Compiled header-variant and program vocabularies plus per-year layouts.
#[derive(Debug, Clone)]
pub struct MappingTable {
    skip_threshold: f64,
    aliases: HashMap<String, Field>,
    year_aliases: Vec<(YearRange, HashMap<String, Field>)>,
    ignored: HashSet<String>,
    layouts: Vec<Layout>,
    programs: HashMap<String, String>,
}

/// Canonical comparison form of a header cell: BOM and outer quotes removed,
/// inner whitespace collapsed, lower-cased.
pub fn normalize_header(raw: &str) -> String {
    let cleaned = raw
        .trim_start_matches('\u{feff}')
        .trim()
        .trim_matches('"')
        .replace('\u{a0}', " ");
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical comparison form of a program name: trimmed, whitespace
/// collapsed, upper-cased.
pub fn normalize_program(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn compile_aliases(
    source: &BTreeMap<Field, Vec<String>>,
    into: &mut HashMap<String, Field>,
) -> Result<()> {
    for (field, variants) in source {
        for variant in variants {
            let key = normalize_header(variant);
            if key.is_empty() {
                bail!("empty header alias listed for {}", field);
            }
            match into.insert(key.clone(), *field) {
                Some(prev) if prev != *field => {
                    bail!("header alias {:?} maps to both {} and {}", key, prev, field)
                }
                _ => {}
            }
        }
    }
    Ok(())
}

impl MappingTable {
    /// The table compiled from the mapping file bundled with the crate.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED_MAPPING).context("parsing embedded mapping table")
    }

    /// Load a mapping file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading mapping table {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing mapping table {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: MappingFile = serde_yaml::from_str(text)?;

        if !(0.0..=1.0).contains(&file.skip_threshold) {
            bail!(
                "skip_threshold must be within [0, 1], got {}",
                file.skip_threshold
            );
        }

        let mut aliases: HashMap<String, Field> = Field::ALL
            .iter()
            .map(|f| (normalize_header(f.column_name()), *f))
            .collect();
        compile_aliases(&file.aliases, &mut aliases)?;

        let mut year_aliases = Vec::new();
        for (i, layout) in file.layouts.iter().enumerate() {
            let years = layout.years();
            if years.0 > years.1 {
                bail!("layout #{} has an empty year range {:?}", i, years);
            }
            if let Some(other) = file.layouts[..i]
                .iter()
                .find(|l| l.years().contains(years.0) || years.contains(l.years().0))
            {
                bail!(
                    "layout #{} years {:?} overlap layout years {:?}",
                    i,
                    years,
                    other.years()
                );
            }
            if let Layout::Header { aliases: extra, .. } = layout {
                let mut compiled = HashMap::new();
                compile_aliases(extra, &mut compiled)?;
                year_aliases.push((years, compiled));
            }
        }

        let ignored = file
            .ignored_columns
            .iter()
            .map(|c| normalize_header(c))
            .collect();

        let mut programs = HashMap::new();
        for (canonical, variants) in &file.programs {
            let canonical_form = normalize_program(canonical);
            programs.insert(canonical_form.clone(), canonical_form.clone());
            for variant in variants {
                programs.insert(normalize_program(variant), canonical_form.clone());
            }
        }

        Ok(Self {
            skip_threshold: file.skip_threshold,
            aliases,
            year_aliases,
            ignored,
            layouts: file.layouts,
            programs,
        })
    }

    pub fn skip_threshold(&self) -> f64 {
        self.skip_threshold
    }

    pub fn with_skip_threshold(mut self, threshold: f64) -> Self {
        self.skip_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn layout_for(&self, year: i32) -> Option<&Layout> {
        self.layouts.iter().find(|l| l.years().contains(year))
    }

    /// Resolve one header cell for `year`. Year-specific aliases win over
    /// the global ones.
    pub fn resolve_header(&self, year: i32, raw: &str) -> HeaderLookup {
        let key = normalize_header(raw);
        let year_specific = self
            .year_aliases
            .iter()
            .filter(|(years, _)| years.contains(year))
            .find_map(|(_, map)| map.get(&key));
        if let Some(field) = year_specific.or_else(|| self.aliases.get(&key)) {
            HeaderLookup::Field(*field)
        } else if key.is_empty() || self.ignored.contains(&key) {
            HeaderLookup::Ignored
        } else {
            HeaderLookup::Unknown
        }
    }

    /// Whether `raw` is any header token the table knows, in any year.
    pub fn is_header_token(&self, raw: &str) -> bool {
        let key = normalize_header(raw);
        !key.is_empty()
            && (self.aliases.contains_key(&key)
                || self.ignored.contains(&key)
                || self.year_aliases.iter().any(|(_, m)| m.contains_key(&key)))
    }

    /// Canonical program description, if the vocabulary knows `raw`.
    pub fn canonical_program(&self, raw: &str) -> Option<&str> {
        self.programs.get(&normalize_program(raw)).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_table_parses() -> Result<()> {
        let table = MappingTable::embedded()?;
        assert_eq!(table.skip_threshold(), 0.05);
        assert!(matches!(
            table.layout_for(2005),
            Some(Layout::Positional { .. })
        ));
        assert!(matches!(table.layout_for(2023), Some(Layout::Header { .. })));
        assert!(table.layout_for(1999).is_none());
        Ok(())
    }

    #[test]
    fn header_variants_are_case_and_whitespace_insensitive() -> Result<()> {
        let table = MappingTable::embedded()?;
        for variant in [
            "State FSA Code",
            "state fsa code",
            "  STATE   FSA CODE ",
            "\u{feff}State FSA Code",
            "\"State FSA Code\"",
            "State\u{a0}FSA Code",
            "St Code",
        ] {
            assert_eq!(
                table.resolve_header(2023, variant),
                HeaderLookup::Field(Field::StateFsaCode),
                "variant {:?}",
                variant
            );
        }
        Ok(())
    }

    #[test]
    fn every_alias_in_the_table_resolves_to_its_field() -> Result<()> {
        let file: MappingFile = serde_yaml::from_str(EMBEDDED_MAPPING)?;
        let table = MappingTable::embedded()?;
        for (field, variants) in &file.aliases {
            for variant in variants {
                let shouted = format!("  {}\t", variant.to_uppercase());
                assert_eq!(
                    table.resolve_header(2020, &shouted),
                    HeaderLookup::Field(*field)
                );
            }
        }
        Ok(())
    }

    #[test]
    fn year_specific_aliases_apply_only_to_their_years() -> Result<()> {
        let table = MappingTable::embedded()?;
        assert_eq!(
            table.resolve_header(2012, "Net Payment Amount"),
            HeaderLookup::Field(Field::DisbursementAmount)
        );
        assert_eq!(
            table.resolve_header(2022, "Net Payment Amount"),
            HeaderLookup::Unknown
        );
        Ok(())
    }

    #[test]
    fn ignored_and_blank_headers() -> Result<()> {
        let table = MappingTable::embedded()?;
        assert_eq!(table.resolve_header(2020, "Payee ID"), HeaderLookup::Ignored);
        assert_eq!(table.resolve_header(2020, "   "), HeaderLookup::Ignored);
        assert_eq!(
            table.resolve_header(2020, "Favourite Colour"),
            HeaderLookup::Unknown
        );
        Ok(())
    }

    #[test]
    fn program_vocabulary() -> Result<()> {
        let table = MappingTable::embedded()?;
        assert_eq!(
            table.canonical_program(" lfp "),
            Some("LIVESTOCK FORAGE DISASTER PROGRAM")
        );
        assert_eq!(
            table.canonical_program("Conservation  Reserve Program"),
            Some("CONSERVATION RESERVE PROGRAM")
        );
        assert_eq!(table.canonical_program("MYSTERY RELIEF"), None);
        Ok(())
    }

    #[test]
    fn rejects_conflicting_aliases() {
        let yaml = r#"
aliases:
  City Name: [town]
  County FSA Name: [TOWN]
layouts:
  - layout: header
    years: [2000, 2001]
"#;
        let err = MappingTable::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("town"));
    }

    #[test]
    fn rejects_overlapping_layouts() {
        let yaml = r#"
aliases: {}
layouts:
  - layout: header
    years: [2000, 2005]
  - layout: header
    years: [2005, 2010]
"#;
        assert!(MappingTable::from_yaml(yaml).is_err());
    }
}
