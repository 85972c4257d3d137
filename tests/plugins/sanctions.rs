use chrono::NaiveDate;
use incident_ledger::core::config::LedgerConfig;
use incident_ledger::core::store::Store;
use incident_ledger::core::time::Clock;
use incident_ledger::plugins::incidents::{Category, IncidentLog, NewIncident};
use incident_ledger::plugins::sanctions::{
    Alert, PARENT_MEETING, PairState, RuleTable, SUSPENSION, evaluate, evaluate_states,
};
use std::path::Path;
use tempfile::tempdir;

fn open_log(root: &Path) -> IncidentLog {
    IncidentLog::open(&Store::new(root), &LedgerConfig::default())
        .unwrap()
        .with_clock(Clock::Pinned(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()))
}

fn add(log: &IncidentLog, subject: &str, category: &str) {
    log.append(NewIncident {
        subject_name: subject.to_string(),
        category: category.to_string(),
        ..NewIncident::default()
    })
    .unwrap();
}

#[test]
fn test_threshold_boundary_category_three() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    let table = RuleTable::standard();

    add(&log, "Anna", "3");
    add(&log, "Anna", "3");
    assert!(evaluate(&log.load(), &table).is_empty());

    add(&log, "Anna", "3");
    assert_eq!(
        evaluate(&log.load(), &table),
        vec![Alert {
            subject: "Anna".to_string(),
            category: Category(3),
            count: 3,
            sanction: PARENT_MEETING.to_string(),
        }]
    );
}

#[test]
fn test_resolution_suppresses_until_rearmed() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    let table = RuleTable::standard();
    for _ in 0..3 {
        add(&log, "Anna", "3");
    }
    assert_eq!(evaluate(&log.load(), &table).len(), 1);

    log.mark_resolved("Anna", Category(3)).unwrap();
    assert!(evaluate(&log.load(), &table).is_empty());
    let states = evaluate_states(&log.load(), &table);
    assert_eq!(states[0].state, PairState::ActiveResolved);

    add(&log, "Anna", "3");
    let snapshot = log.load();
    let alerts = evaluate(&snapshot, &table);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].count, 4);
    assert_eq!(snapshot.records.iter().filter(|r| r.resolved).count(), 3);
}

#[test]
fn test_end_to_end_category_four() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    add(&log, "A", "4");
    assert_eq!(
        evaluate(&log.load(), &RuleTable::standard()),
        vec![Alert {
            subject: "A".to_string(),
            category: Category(4),
            count: 1,
            sanction: SUSPENSION.to_string(),
        }]
    );
}

#[test]
fn test_counts_are_per_subject_and_category() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    let table = RuleTable::standard();
    for _ in 0..6 {
        add(&log, "Ben", "2");
    }
    for _ in 0..5 {
        add(&log, "Cara", "2");
    }
    for _ in 0..2 {
        add(&log, "Cara", "3");
    }
    for _ in 0..11 {
        add(&log, "Dan", "1");
    }

    let alerts = evaluate(&log.load(), &table);
    let pairs: Vec<(&str, Category, usize)> = alerts
        .iter()
        .map(|a| (a.subject.as_str(), a.category, a.count))
        .collect();
    assert_eq!(pairs, vec![("Ben", Category(2), 6), ("Dan", Category(1), 11)]);
}

#[test]
fn test_evaluate_is_side_effect_free() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    add(&log, "A", "4");
    let before = std::fs::read(tmp.path().join("incidents.csv")).unwrap();
    let snapshot = log.load();
    let first = evaluate(&snapshot, &RuleTable::standard());
    let second = evaluate(&snapshot, &RuleTable::standard());
    assert_eq!(first, second);
    assert_eq!(std::fs::read(tmp.path().join("incidents.csv")).unwrap(), before);
}

#[test]
fn test_configured_rules_replace_standard_table() {
    let tmp = tempdir().unwrap();
    let config = LedgerConfig::parse(
        r#"
        [[rules]]
        category = 2
        threshold = 2
        comparison = "at_least"
        sanction = "detention"
        "#,
    )
    .unwrap();
    let table = config.rule_table().unwrap();
    let log = open_log(tmp.path());
    add(&log, "Anna", "2");
    add(&log, "Anna", "4");
    assert!(evaluate(&log.load(), &table).is_empty());

    add(&log, "Anna", "2");
    let alerts = evaluate(&log.load(), &table);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].sanction, "detention");
}
