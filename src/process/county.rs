// src/process/county.rs

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, io::Read, path::Path};
use tracing::{debug, warn};

use crate::process::convert::{pad_code, COUNTY_CODE_WIDTH, STATE_CODE_WIDTH};
use crate::schema::PaymentRecord;

#[derive(Debug, Deserialize)]
struct CountyRow {
    state_code: String,
    county_code: String,
    county_name: String,
}

/// Reference table of FSA county names keyed by (state code, county code).
/// Only fills names the source left empty; it never overrides the file.
#[derive(Debug, Default, Clone)]
pub struct CountyLookup {
    names: HashMap<(String, String), String>,
}

impl CountyLookup {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening county reference {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("reading county reference {}", path.display()))
    }

    /// Read a `state_code,county_code,county_name` CSV with a header row.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut names = HashMap::new();
        for (idx, row) in rdr.deserialize::<CountyRow>().enumerate() {
            let row = row.with_context(|| format!("county reference row {}", idx + 1))?;
            let state = pad_code(&row.state_code, STATE_CODE_WIDTH);
            let county = pad_code(&row.county_code, COUNTY_CODE_WIDTH);
            match (state, county) {
                (Ok(Some(state)), Ok(Some(county))) => {
                    names.insert((state, county), row.county_name);
                }
                _ => warn!(row = idx + 1, "skipping county reference row with bad codes"),
            }
        }
        debug!(counties = names.len(), "loaded county reference");
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_for(&self, state_code: &str, county_code: &str) -> Option<&str> {
        self.names
            .get(&(state_code.to_string(), county_code.to_string()))
            .map(String::as_str)
    }

    /// Fill missing county names in place; returns how many were filled.
    pub fn fill_missing(&self, records: &mut [PaymentRecord]) -> usize {
        let mut filled = 0;
        for rec in records.iter_mut().filter(|r| r.county_fsa_name.is_none()) {
            let Some(county) = rec.county_fsa_code.as_deref() else {
                continue;
            };
            if let Some(name) = self.name_for(&rec.state_fsa_code, county) {
                rec.county_fsa_name = Some(name.to_string());
                filled += 1;
            }
        }
        filled
    }
}
