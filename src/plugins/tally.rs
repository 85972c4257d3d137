//! Aggregation over a snapshot. Everything here is a pure function of its
//! input; ordering is deterministic because all maps are `BTreeMap`s.

use crate::plugins::incidents::{Category, IncidentRecord, Snapshot};
use chrono::{Datelike, Duration, NaiveDate};
use clap::ValueEnum;
use serde::Serialize;
use std::collections::BTreeMap;

pub type SubjectTally = BTreeMap<String, BTreeMap<Category, usize>>;

/// subject → category → count. Categories a subject never hit are absent.
pub fn tally_by_subject_and_category(snapshot: &Snapshot) -> SubjectTally {
    let mut out: SubjectTally = BTreeMap::new();
    for record in snapshot.iter() {
        *out.entry(record.subject_name.clone())
            .or_default()
            .entry(record.category)
            .or_insert(0) += 1;
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairTally {
    pub total: usize,
    pub unresolved: usize,
}

pub fn tally_pairs(snapshot: &Snapshot) -> BTreeMap<(String, Category), PairTally> {
    let mut out: BTreeMap<(String, Category), PairTally> = BTreeMap::new();
    for record in snapshot.iter() {
        let pair = out
            .entry((record.subject_name.clone(), record.category))
            .or_default();
        pair.total += 1;
        if !record.resolved {
            pair.unresolved += 1;
        }
    }
    out
}

/// Exact-match filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub subject: Option<String>,
    pub group: Option<String>,
    pub reporter: Option<String>,
    pub kind: Option<String>,
    pub category: Option<Category>,
    pub unresolved_only: bool,
}

impl RecordFilter {
    pub fn matches(&self, record: &IncidentRecord) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w.trim() == have)
        }
        eq(&self.subject, &record.subject_name)
            && eq(&self.group, &record.group)
            && eq(&self.reporter, &record.reporter)
            && eq(&self.kind, &record.kind)
            && self.category.is_none_or(|c| c == record.category)
            && !(self.unresolved_only && record.resolved)
    }
}

/// Matching records with their ordinal in the full snapshot, so a listing can
/// be fed back into a positional delete.
pub fn filter<'a>(snapshot: &'a Snapshot, f: &RecordFilter) -> Vec<(usize, &'a IncidentRecord)> {
    snapshot
        .iter()
        .enumerate()
        .filter(|(_, r)| f.matches(r))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Category,
    Kind,
    Reporter,
    Group,
    Subject,
}

pub fn count_by(snapshot: &Snapshot, dimension: Dimension) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for r in snapshot.iter() {
        let key = match dimension {
            Dimension::Category => r.category.to_string(),
            Dimension::Kind => r.kind.clone(),
            Dimension::Reporter => r.reporter.clone(),
            Dimension::Group => r.group.clone(),
            Dimension::Subject => r.subject_name.clone(),
        };
        *out.entry(key).or_insert(0) += 1;
    }
    out
}

pub fn on_date(snapshot: &Snapshot, date: NaiveDate) -> Vec<&IncidentRecord> {
    snapshot
        .iter()
        .filter(|r| r.occurred_on == Some(date))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    /// Monday to Sunday
    Week,
    Month,
    Quarter,
}

pub fn period_start(date: NaiveDate, period: Period) -> NaiveDate {
    match period {
        Period::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        Period::Month => date.with_day(1).unwrap_or(date),
        Period::Quarter => {
            let month = (date.month0() / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
        }
    }
}

/// period start → category → count. Rows without a date are skipped.
pub fn summarize_by_period(
    snapshot: &Snapshot,
    period: Period,
) -> BTreeMap<NaiveDate, BTreeMap<Category, usize>> {
    let mut out: BTreeMap<NaiveDate, BTreeMap<Category, usize>> = BTreeMap::new();
    for r in snapshot.iter() {
        let Some(date) = r.occurred_on else { continue };
        *out.entry(period_start(date, period))
            .or_default()
            .entry(r.category)
            .or_insert(0) += 1;
    }
    out
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "tally",
        "version": "0.1.0",
        "description": "Per-subject category tallies and report summaries",
        "commands": [
            { "name": "tally", "parameters": [] },
            { "name": "count", "parameters": ["by"] },
            { "name": "summary", "parameters": ["period"] }
        ],
        "dimensions": ["category", "kind", "reporter", "group", "subject"],
        "periods": ["week", "month", "quarter"]
    })
}
