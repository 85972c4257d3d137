use chrono::NaiveDate;
use incident_ledger::plugins::incidents::{Category, IncidentRecord, Snapshot, SnapshotSource};
use incident_ledger::plugins::tally::{
    Dimension, PairTally, Period, RecordFilter, count_by, filter, on_date, summarize_by_period,
    tally_by_subject_and_category, tally_pairs,
};

fn record(subject: &str, category: u8, date: Option<(i32, u32, u32)>, resolved: bool) -> IncidentRecord {
    IncidentRecord {
        id: format!("{}-{}", subject, category),
        subject_name: subject.to_string(),
        group: if subject < "M" { "8A" } else { "8B" }.to_string(),
        reporter: "Mr Naidoo".to_string(),
        kind: if category == 4 { "Fighting" } else { "Late" }.to_string(),
        category: Category(category),
        note: "No comment".to_string(),
        occurred_on: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
        resolved,
    }
}

fn snapshot() -> Snapshot {
    Snapshot {
        records: vec![
            record("Anna", 1, Some((2024, 4, 29)), false),
            record("Anna", 1, Some((2024, 5, 5)), true),
            record("Anna", 4, Some((2024, 5, 6)), false),
            record("Zed", 2, Some((2024, 7, 1)), false),
            record("Zed", 2, None, false),
        ],
        source: SnapshotSource::Clean,
    }
}

#[test]
fn test_tally_by_subject_and_category() {
    let tally = tally_by_subject_and_category(&snapshot());
    assert_eq!(tally.len(), 2);
    assert_eq!(tally["Anna"][&Category(1)], 2);
    assert_eq!(tally["Anna"][&Category(4)], 1);
    assert!(!tally["Anna"].contains_key(&Category(2)));
    assert_eq!(tally["Zed"][&Category(2)], 2);
}

#[test]
fn test_tally_is_deterministic() {
    assert_eq!(
        tally_by_subject_and_category(&snapshot()),
        tally_by_subject_and_category(&snapshot())
    );
    assert!(tally_by_subject_and_category(&Snapshot::empty(SnapshotSource::Missing)).is_empty());
}

#[test]
fn test_pair_tally_tracks_unresolved() {
    let pairs = tally_pairs(&snapshot());
    assert_eq!(
        pairs[&("Anna".to_string(), Category(1))],
        PairTally { total: 2, unresolved: 1 }
    );
}

#[test]
fn test_filter_keeps_store_ordinals() {
    let snap = snapshot();
    let zed = filter(
        &snap,
        &RecordFilter {
            subject: Some("Zed".to_string()),
            ..RecordFilter::default()
        },
    );
    let ordinals: Vec<usize> = zed.iter().map(|(i, _)| *i).collect();
    assert_eq!(ordinals, vec![3, 4]);

    let unresolved_ones = filter(
        &snap,
        &RecordFilter {
            category: Some(Category(1)),
            unresolved_only: true,
            ..RecordFilter::default()
        },
    );
    assert_eq!(unresolved_ones.len(), 1);
    assert_eq!(unresolved_ones[0].0, 0);

    assert_eq!(filter(&snap, &RecordFilter::default()).len(), 5);
}

#[test]
fn test_count_by_dimension() {
    let snap = snapshot();
    let by_category = count_by(&snap, Dimension::Category);
    assert_eq!(by_category["1"], 2);
    assert_eq!(by_category["2"], 2);
    assert_eq!(by_category["4"], 1);

    let by_kind = count_by(&snap, Dimension::Kind);
    assert_eq!(by_kind["Fighting"], 1);
    assert_eq!(by_kind["Late"], 4);

    let by_group = count_by(&snap, Dimension::Group);
    assert_eq!(by_group["8A"], 3);
    assert_eq!(by_group["8B"], 2);
}

#[test]
fn test_on_date_ignores_null_dates() {
    let snap = snapshot();
    let day = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
    let hits = on_date(&snap, day);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].category, Category(4));
}

#[test]
fn test_summarize_by_week_and_month() {
    let snap = snapshot();
    let weekly = summarize_by_period(&snap, Period::Week);
    let monday = |m, d| NaiveDate::from_ymd_opt(2024, m, d).unwrap();
    // 2024-04-29 (Mon) and 2024-05-05 (Sun) share a week.
    assert_eq!(weekly[&monday(4, 29)][&Category(1)], 2);
    assert_eq!(weekly[&monday(5, 6)][&Category(4)], 1);
    assert_eq!(weekly[&monday(7, 1)][&Category(2)], 1);
    assert_eq!(weekly.values().flat_map(|c| c.values()).sum::<usize>(), 4);

    let monthly = summarize_by_period(&snap, Period::Month);
    let keys: Vec<NaiveDate> = monthly.keys().copied().collect();
    assert_eq!(keys, vec![monday(4, 1), monday(5, 1), monday(7, 1)]);

    let quarterly = summarize_by_period(&snap, Period::Quarter);
    assert_eq!(quarterly[&monday(4, 1)][&Category(1)], 2);
    assert_eq!(quarterly[&monday(7, 1)][&Category(2)], 1);
}
