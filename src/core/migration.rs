//! Read-repair for backing files written by older schema versions.
//!
//! Older files used the dashboard's first-generation column names (`Learner_Name`,
//! `Class`, ...) and had no `resolved` or `id` column. Headers are mapped to
//! canonical names on every read; the file is rewritten in canonical form on
//! the next persist, so migration is idempotent and never runs as a separate
//! step.

use crate::core::schemas;
use std::collections::HashMap;

/// Legacy header -> canonical column.
pub const LEGACY_COLUMNS: &[(&str, &str)] = &[
    ("Learner_Name", schemas::COL_SUBJECT),
    ("Class", schemas::COL_GROUP),
    ("Teacher", schemas::COL_REPORTER),
    ("Incident", schemas::COL_KIND),
    ("Category", schemas::COL_CATEGORY),
    ("Comment", schemas::COL_NOTE),
    ("Date", schemas::COL_OCCURRED_ON),
    ("Resolved", schemas::COL_RESOLVED),
];

/// Column positions for one file, resolved against canonical names.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    positions: HashMap<&'static str, usize>,
    /// `(legacy, canonical)` pairs that were renamed on read
    pub renamed: Vec<(String, &'static str)>,
    /// Canonical columns absent from the file
    pub missing: Vec<&'static str>,
}

impl HeaderMap {
    pub fn resolve<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut canonical_hits = HashMap::new();
        let mut legacy_hits = HashMap::new();
        for (idx, raw) in headers.into_iter().enumerate() {
            let name = raw.trim().trim_start_matches('\u{feff}');
            if let Some(col) = schemas::CANONICAL_HEADER.iter().find(|c| **c == name) {
                canonical_hits.entry(*col).or_insert(idx);
            } else if let Some((legacy, col)) = LEGACY_COLUMNS.iter().find(|(l, _)| *l == name) {
                legacy_hits.entry(*col).or_insert((idx, *legacy));
            }
        }

        let mut map = HeaderMap::default();
        for col in schemas::CANONICAL_HEADER {
            if let Some(idx) = canonical_hits.get(col) {
                map.positions.insert(col, *idx);
            } else if let Some((idx, legacy)) = legacy_hits.get(col) {
                map.positions.insert(col, *idx);
                map.renamed.push((legacy.to_string(), col));
            } else {
                map.missing.push(col);
            }
        }
        map
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    /// True when the file carries none of the known columns at all.
    pub fn is_unrecognised(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn needs_migration(&self) -> bool {
        !self.renamed.is_empty() || !self.missing.is_empty()
    }
}
