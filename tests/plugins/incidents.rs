use chrono::NaiveDate;
use incident_ledger::core::config::{LedgerConfig, StoreConfig};
use incident_ledger::core::error::LedgerError;
use incident_ledger::core::store::Store;
use incident_ledger::core::time::{Clock, now_epoch_secs};
use incident_ledger::plugins::incidents::{Category, IncidentLog, NewIncident, SnapshotSource};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn pinned() -> Clock {
    Clock::Pinned(NaiveDate::from_ymd_opt(2024, 3, 14).unwrap())
}

fn open_log(root: &Path) -> IncidentLog {
    IncidentLog::open(&Store::new(root), &LedgerConfig::default())
        .unwrap()
        .with_clock(pinned())
}

fn incident(subject: &str, category: &str) -> NewIncident {
    NewIncident {
        subject_name: subject.to_string(),
        group: "8B".to_string(),
        reporter: "Ms Dlamini".to_string(),
        kind: "Disruption".to_string(),
        category: category.to_string(),
        note: String::new(),
    }
}

#[test]
fn test_missing_file_is_empty_snapshot() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    let snapshot = log.load();
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.source, SnapshotSource::Missing);

    fs::write(tmp.path().join("incidents.csv"), "  \n").unwrap();
    assert_eq!(log.load().source, SnapshotSource::Empty);
}

#[test]
fn test_idempotent_reload() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    for _ in 0..3 {
        log.load();
    }
    let mutation = log.append(incident("Anna", "2")).unwrap();
    assert!(mutation.is_durable());
    let id = mutation.snapshot.records[0].id.clone();

    for _ in 0..3 {
        let snapshot = log.load();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.source, SnapshotSource::Clean);
        assert_eq!(snapshot.records.iter().filter(|r| r.id == id).count(), 1);
    }
}

#[test]
fn test_append_normalizes_fields() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    let mutation = log
        .append(NewIncident {
            subject_name: "  Ben  ".to_string(),
            ..NewIncident::default()
        })
        .unwrap();
    let r = &mutation.snapshot.records[0];
    assert_eq!(r.subject_name, "Ben");
    assert_eq!(r.group, "Unknown");
    assert_eq!(r.reporter, "Unknown");
    assert_eq!(r.kind, "Unknown");
    assert_eq!(r.note, "No comment");
    assert_eq!(r.occurred_on, NaiveDate::from_ymd_opt(2024, 3, 14));
    assert!(!r.resolved);
}

#[test]
fn test_category_coercion() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    log.append(incident("Anna", "severe")).unwrap();
    log.append(incident("Anna", "")).unwrap();
    log.append(incident("Anna", "7")).unwrap();
    log.append(incident("Anna", "4")).unwrap();

    let categories: Vec<Category> = log.load().records.iter().map(|r| r.category).collect();
    assert_eq!(categories, vec![Category(1), Category(1), Category(1), Category(4)]);
}

#[test]
fn test_schema_migration_from_legacy_columns() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("incidents.csv");
    fs::write(&path, "Learner_Name,Category,Date\nAnna,3,2024-01-10\nBen,x,not a date\n").unwrap();

    let log = open_log(tmp.path());
    let snapshot = log.load();
    assert!(matches!(snapshot.source, SnapshotSource::Migrated { .. }));
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.records.iter().all(|r| !r.resolved));
    assert_eq!(snapshot.records[0].subject_name, "Anna");
    assert_eq!(snapshot.records[0].category, Category(3));
    assert_eq!(snapshot.records[1].category, Category(1));
    assert_eq!(snapshot.records[1].occurred_on, None);

    // The first write persists the canonical header.
    log.append(incident("Cara", "2")).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("id,subjectName,group,reporter,kind,category,note,occurredOn,resolved\n"));
    let reread = log.load();
    assert_eq!(reread.source, SnapshotSource::Clean);
    assert_eq!(reread.len(), 3);
    assert_eq!(reread.records[0].id, snapshot.records[0].id);
}

#[test]
fn test_delete_bounds() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    log.append(incident("Anna", "2")).unwrap();
    let before = fs::read(tmp.path().join("incidents.csv")).unwrap();

    for ordinal in [-1, 1] {
        match log.delete_at(ordinal) {
            Err(LedgerError::OutOfRange { ordinal: o, len }) => {
                assert_eq!(o, ordinal);
                assert_eq!(len, 1);
            }
            other => panic!("expected OutOfRange, got {:?}", other),
        }
    }
    assert_eq!(fs::read(tmp.path().join("incidents.csv")).unwrap(), before);

    let mutation = log.delete_at(0).unwrap();
    assert!(mutation.snapshot.is_empty());
    assert!(log.load().is_empty());
}

#[test]
fn test_delete_by_id() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    log.append(incident("Anna", "2")).unwrap();
    let second = log.append(incident("Ben", "3")).unwrap();
    log.append(incident("Cara", "1")).unwrap();
    let ben_id = second.snapshot.records[1].id.clone();

    let mutation = log.delete_by_id(&ben_id).unwrap();
    assert_eq!(mutation.changed, 1);
    let names: Vec<String> = log.load().records.into_iter().map(|r| r.subject_name).collect();
    assert_eq!(names, vec!["Anna", "Cara"]);

    assert!(matches!(log.delete_by_id(&ben_id), Err(LedgerError::NotFound(_))));
}

#[test]
fn test_legacy_ids_are_stable_across_reads() {
    let tmp = tempdir().unwrap();
    fs::write(
        tmp.path().join("incidents.csv"),
        "Learner_Name,Category,Date\nAnna,2,2024-01-10\nAnna,2,2024-01-10\nBen,1,2024-01-11\n",
    )
    .unwrap();
    let log = open_log(tmp.path());
    let first = log.load();
    let second = log.load();
    assert_eq!(first.records, second.records);

    let ben_id = first.records[2].id.clone();
    log.delete_by_id(&first.records[0].id).unwrap();
    let after = log.load();
    assert_eq!(after.len(), 2);
    assert_eq!(after.records[0].id, first.records[1].id);
    assert_eq!(after.records[1].id, ben_id);
}

#[test]
fn test_mark_resolved_flips_matching_pair_only() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path());
    log.append(incident("Anna", "3")).unwrap();
    log.append(incident("Anna", "3")).unwrap();
    log.append(incident("Anna", "2")).unwrap();
    log.append(incident("Ben", "3")).unwrap();

    let mutation = log.mark_resolved(" Anna ", Category(3)).unwrap();
    assert_eq!(mutation.changed, 2);
    let flags: Vec<bool> = log.load().records.iter().map(|r| r.resolved).collect();
    assert_eq!(flags, vec![true, true, false, false]);

    let again = log.mark_resolved("Anna", Category(3)).unwrap();
    assert_eq!(again.changed, 0);
    let none = log.mark_resolved("Nobody", Category(1)).unwrap();
    assert_eq!(none.changed, 0);
}

#[test]
fn test_corrupt_file_is_quarantined_before_write() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("incidents.csv");
    fs::write(&path, "subjectName,category\nAnna,2\nBen\n").unwrap();

    let log = open_log(tmp.path());
    let snapshot = log.load();
    assert!(snapshot.is_empty());
    assert!(matches!(snapshot.source, SnapshotSource::Corrupt { .. }));

    log.append(incident("Cara", "1")).unwrap();
    assert_eq!(log.load().len(), 1);

    let quarantined: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("incidents.csv.corrupt."))
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(
        fs::read_to_string(quarantined[0].path()).unwrap(),
        "subjectName,category\nAnna,2\nBen\n"
    );
}

#[test]
fn test_corrupt_file_survives_rejected_delete() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("incidents.csv");
    fs::write(&path, "subjectName,category\nAnna,2\nBen\n").unwrap();
    let log = open_log(tmp.path());

    match log.delete_at(0) {
        Err(LedgerError::OutOfRange { ordinal, len }) => {
            assert_eq!(ordinal, 0);
            assert_eq!(len, 0);
        }
        other => panic!("expected OutOfRange, got {:?}", other),
    }
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "subjectName,category\nAnna,2\nBen\n"
    );
    assert!(matches!(log.load().source, SnapshotSource::Corrupt { .. }));
}

#[test]
fn test_corrupt_file_survives_noop_resolve() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("incidents.csv");
    fs::write(&path, "subjectName,category\nAnna,2\nBen\n").unwrap();
    let log = open_log(tmp.path());

    let mutation = log.mark_resolved("Anna", Category(2)).unwrap();
    assert_eq!(mutation.changed, 0);
    assert!(path.exists());
    assert!(matches!(log.load().source, SnapshotSource::Corrupt { .. }));
    let quarantined = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
        .count();
    assert_eq!(quarantined, 0);
}

#[test]
fn test_persist_failure_still_returns_snapshot() {
    let tmp = tempdir().unwrap();
    // A directory where the temp file should go makes the write fail.
    fs::create_dir(tmp.path().join("incidents.csv.tmp")).unwrap();

    let log = open_log(tmp.path());
    let mutation = log.append(incident("Anna", "4")).unwrap();
    assert!(!mutation.is_durable());
    assert!(matches!(
        mutation.persist_error,
        Some(LedgerError::PersistenceFailure { .. })
    ));
    assert_eq!(mutation.snapshot.len(), 1);
    assert!(log.load().is_empty());
}

#[test]
fn test_unreadable_file_refuses_mutation() {
    let tmp = tempdir().unwrap();
    fs::create_dir(tmp.path().join("incidents.csv")).unwrap();

    let log = open_log(tmp.path());
    assert!(matches!(log.load().source, SnapshotSource::Unreadable { .. }));
    assert!(matches!(
        log.append(incident("Anna", "1")),
        Err(LedgerError::PersistenceFailure { .. })
    ));
}

#[test]
fn test_held_lock_blocks_writers() {
    let tmp = tempdir().unwrap();
    let config = LedgerConfig {
        store: StoreConfig {
            lock_wait_ms: 50,
            ..StoreConfig::default()
        },
        ..LedgerConfig::default()
    };
    let log = IncidentLog::open(&Store::new(tmp.path()), &config).unwrap();
    fs::write(
        tmp.path().join("incidents.csv.lock"),
        format!("{{\"pid\":1,\"acquired_at\":{}}}", now_epoch_secs()),
    )
    .unwrap();

    assert!(matches!(
        log.append(incident("Anna", "1")),
        Err(LedgerError::LockContention(_))
    ));
    assert!(log.load().is_empty());
}

#[test]
fn test_mutations_are_audited() {
    let tmp = tempdir().unwrap();
    let log = open_log(tmp.path()).with_actor("deputy");
    log.append(incident("Anna", "1")).unwrap();
    let _ = log.delete_at(5);
    log.mark_resolved("Anna", Category(1)).unwrap();

    let events = log.broker().read_events().unwrap();
    let summary: Vec<(&str, &str)> = events
        .iter()
        .map(|e| (e.op.as_str(), e.status.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("incidents.append", "success"),
            ("incidents.delete_at", "rejected"),
            ("incidents.resolve", "success"),
        ]
    );
    assert!(events.iter().all(|e| e.actor == "deputy"));
    assert_eq!(events[0].sync.as_deref(), Some("disabled"));
}

#[test]
fn test_relative_data_file_under_store_root() {
    let tmp = tempdir().unwrap();
    let config = LedgerConfig::parse("[store]\nfile = \"data/log.csv\"\n").unwrap();
    let log = IncidentLog::open(&Store::new(tmp.path()), &config).unwrap();
    log.append(incident("Anna", "1")).unwrap();
    assert!(tmp.path().join("data").join("log.csv").is_file());
}
