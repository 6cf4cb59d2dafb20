// src/archive/dedup.rs

use std::collections::HashSet;

use crate::schema::PaymentRecord;

/// Drop records equal on every canonical field, keeping the first one seen
/// in source order. Returns the survivors and how many were dropped.
pub fn dedup_records(records: Vec<PaymentRecord>) -> (Vec<PaymentRecord>, usize) {
    let keep: Vec<bool> = {
        let mut seen = HashSet::with_capacity(records.len());
        records.iter().map(|r| seen.insert(r)).collect()
    };
    let duplicates = keep.iter().filter(|k| !**k).count();
    let unique = records
        .into_iter()
        .zip(keep)
        .filter_map(|(rec, keep)| keep.then_some(rec))
        .collect();
    (unique, duplicates)
}
