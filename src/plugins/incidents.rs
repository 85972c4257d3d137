//! Record store for the incident log.
//!
//! The backing file is a flat CSV holding the full snapshot. Every mutation
//! re-reads the file under the store lock, applies the change in memory,
//! rewrites the whole file atomically and then hands the new bytes to the
//! remote mirror. Reads never fail: a missing file is an empty log and a
//! corrupt one is reported through [`SnapshotSource`].
//!
//! The resolution ledger lives here too, as the per-record `resolved` flag
//! flipped by [`IncidentLog::mark_resolved`].

use crate::core::broker::MutationBroker;
use crate::core::config::{CategoryPolicy, LedgerConfig};
use crate::core::error::{LedgerError, LedgerResult};
use crate::core::fsio;
use crate::core::migration::HeaderMap;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::Clock;
use crate::plugins::mirror::{Mirror, SyncReport};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ulid::Ulid;

/// Severity level. Only values in the configured [`CategoryPolicy`] are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(pub u8);

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    #[serde(rename = "subjectName")]
    pub subject_name: String,
    pub group: String,
    pub reporter: String,
    pub kind: String,
    pub category: Category,
    pub note: String,
    /// `None` only for rows read from files with unparseable dates.
    #[serde(rename = "occurredOn")]
    pub occurred_on: Option<NaiveDate>,
    pub resolved: bool,
}

/// Operator input for [`IncidentLog::append`]. Fields are raw and get
/// normalised on the way in; `category` is coerced, never rejected.
#[derive(Debug, Clone, Default)]
pub struct NewIncident {
    pub subject_name: String,
    pub group: String,
    pub reporter: String,
    pub kind: String,
    pub category: String,
    pub note: String,
}

/// How the snapshot was obtained from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotSource {
    /// No backing file yet
    Missing,
    /// Backing file exists but holds no bytes
    Empty,
    /// Canonical file read as-is
    Clean,
    /// Older schema, repaired on read
    Migrated {
        renamed: Vec<String>,
        added: Vec<String>,
    },
    /// Unparseable file; loaded as empty and moved aside before the next write
    Corrupt { reason: String },
    /// The file could not be read at all; mutations are refused
    Unreadable { reason: String },
    /// Produced in memory by a mutation
    Mutated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub records: Vec<IncidentRecord>,
    pub source: SnapshotSource,
}

impl Snapshot {
    pub fn empty(source: SnapshotSource) -> Self {
        Self {
            records: Vec::new(),
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncidentRecord> {
        self.records.iter()
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    pub fn to_csv_bytes(&self) -> LedgerResult<Vec<u8>> {
        encode_snapshot(&self.records)
    }
}

/// Result of a mutation that was applied in memory.
///
/// `persist_error` set means the snapshot is *not* durable and the operator
/// must be told so.
#[derive(Debug)]
pub struct Mutation {
    pub op: &'static str,
    pub snapshot: Snapshot,
    /// Records added, removed or flipped. Zero means nothing was written.
    pub changed: usize,
    pub persist_error: Option<LedgerError>,
    pub sync: SyncReport,
}

impl Mutation {
    pub fn is_durable(&self) -> bool {
        self.persist_error.is_none()
    }
}

pub struct IncidentLog {
    data_path: PathBuf,
    categories: CategoryPolicy,
    clock: Clock,
    broker: MutationBroker,
    mirror: Option<Mirror>,
    actor: String,
}

impl fmt::Debug for IncidentLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncidentLog")
            .field("data_path", &self.data_path)
            .field("categories", &self.categories)
            .field("clock", &self.clock)
            .field("mirror", &self.mirror)
            .field("actor", &self.actor)
            .finish()
    }
}

impl IncidentLog {
    /// Open the log described by `config`. The mirror is attached when
    /// `[mirror] enabled = true`.
    pub fn open(store: &Store, config: &LedgerConfig) -> LedgerResult<Self> {
        let data_path = store.data_path(&config.store.file);
        let broker = MutationBroker::new(
            store,
            &data_path,
            Duration::from_millis(config.store.lock_wait_ms),
            Duration::from_secs(config.store.stale_lock_secs),
        );
        Ok(Self {
            data_path,
            categories: config.categories.clone(),
            clock: config.clock.clock()?,
            broker,
            mirror: Mirror::from_config(&config.mirror)?,
            actor: "operator".to_string(),
        })
    }

    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn categories(&self) -> &CategoryPolicy {
        &self.categories
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn broker(&self) -> &MutationBroker {
        &self.broker
    }

    /// Full scan of the backing file with schema repair.
    pub fn load(&self) -> Snapshot {
        let bytes = match fs::read(&self.data_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Snapshot::empty(SnapshotSource::Missing);
            }
            Err(e) => {
                tracing::error!(path = %self.data_path.display(), error = %e, "backing file unreadable");
                return Snapshot::empty(SnapshotSource::Unreadable {
                    reason: e.to_string(),
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Snapshot::empty(SnapshotSource::Empty);
        }
        match decode_snapshot(&bytes, &self.categories) {
            Ok(snapshot) => {
                if let SnapshotSource::Migrated { renamed, added } = &snapshot.source {
                    tracing::debug!(?renamed, ?added, "repaired legacy schema on read");
                }
                snapshot
            }
            Err(e) => {
                tracing::error!(path = %self.data_path.display(), error = %e, "backing file is corrupt; continuing with an empty snapshot");
                Snapshot::empty(SnapshotSource::Corrupt {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Normalise `incident`, stamp it with today's date and a fresh id, and
    /// append it after every existing record.
    pub fn append(&self, incident: NewIncident) -> LedgerResult<Mutation> {
        let record = self.normalize(incident);
        self.mutate("incidents.append", move |records| {
            records.push(record);
            Ok(1)
        })
    }

    /// Legacy positional delete. The bound is checked against a fresh read
    /// taken under the store lock, never against the caller's snapshot.
    pub fn delete_at(&self, ordinal: i64) -> LedgerResult<Mutation> {
        self.mutate("incidents.delete_at", |records| {
            let len = records.len();
            let idx = usize::try_from(ordinal)
                .ok()
                .filter(|idx| *idx < len)
                .ok_or(LedgerError::OutOfRange { ordinal, len })?;
            records.remove(idx);
            Ok(1)
        })
    }

    pub fn delete_by_id(&self, id: &str) -> LedgerResult<Mutation> {
        self.mutate("incidents.delete", |records| {
            let idx = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| LedgerError::NotFound(format!("incident {}", id)))?;
            records.remove(idx);
            Ok(1)
        })
    }

    /// Flip `resolved` on every record of `(subject, category)`. A pair with
    /// no records, or whose records are all resolved already, is a no-op.
    pub fn mark_resolved(&self, subject: &str, category: Category) -> LedgerResult<Mutation> {
        let subject = normalize_text(subject, schemas::UNKNOWN);
        self.mutate("incidents.resolve", |records| {
            let mut flipped = 0;
            for record in records
                .iter_mut()
                .filter(|r| r.subject_name == subject && r.category == category)
            {
                if !record.resolved {
                    record.resolved = true;
                    flipped += 1;
                }
            }
            Ok(flipped)
        })
    }

    /// Push the current backing file to the mirror without mutating it.
    pub fn push_mirror(&self) -> SyncReport {
        let Some(mirror) = &self.mirror else {
            return SyncReport::Disabled;
        };
        match fs::read(&self.data_path) {
            Ok(bytes) => mirror.sync(&bytes),
            Err(e) => SyncReport::Skipped {
                reason: format!("backing file not readable: {}", e),
            },
        }
    }

    fn normalize(&self, incident: NewIncident) -> IncidentRecord {
        IncidentRecord {
            id: Ulid::new().to_string(),
            subject_name: normalize_text(&incident.subject_name, schemas::UNKNOWN),
            group: normalize_text(&incident.group, schemas::UNKNOWN),
            reporter: normalize_text(&incident.reporter, schemas::UNKNOWN),
            kind: normalize_text(&incident.kind, schemas::UNKNOWN),
            category: self.categories.coerce(&incident.category),
            note: normalize_text(&incident.note, schemas::NO_COMMENT),
            occurred_on: Some(self.clock.today()),
            resolved: false,
        }
    }

    fn mutate<F>(&self, op: &'static str, apply: F) -> LedgerResult<Mutation>
    where
        F: FnOnce(&mut Vec<IncidentRecord>) -> LedgerResult<usize>,
    {
        let locked = self.broker.with_lock(op, || {
            let current = self.load();
            let corrupt = match &current.source {
                SnapshotSource::Unreadable { reason } => {
                    return Err(LedgerError::PersistenceFailure {
                        path: self.data_path.clone(),
                        reason: reason.clone(),
                    });
                }
                SnapshotSource::Corrupt { .. } => true,
                _ => false,
            };

            let mut records = current.records;
            let changed = apply(&mut records)?;
            let snapshot = Snapshot {
                records,
                source: SnapshotSource::Mutated,
            };
            if changed == 0 {
                return Ok((snapshot, 0, None, self.skipped_sync("nothing changed")));
            }
            // The corrupt file is only moved aside once a replacement is about to land.
            if corrupt {
                self.quarantine_corrupt()?;
            }
            let written = match snapshot.to_csv_bytes() {
                Ok(bytes) => fsio::atomic_write(&self.data_path, &bytes)
                    .map(|()| bytes)
                    .map_err(|e| self.persistence_failure(e)),
                Err(e) => Err(self.persistence_failure(e)),
            };
            match written {
                Ok(bytes) => {
                    // Synced while the lock is held so remote writes land in local order.
                    let sync = match &self.mirror {
                        Some(mirror) => mirror.sync(&bytes),
                        None => SyncReport::Disabled,
                    };
                    Ok((snapshot, changed, None, sync))
                }
                Err(e) => Ok((
                    snapshot,
                    changed,
                    Some(e),
                    self.skipped_sync("local persist failed"),
                )),
            }
        });

        let (snapshot, changed, persist_error, sync) = match locked {
            Ok(outcome) => outcome,
            Err(e) => {
                self.broker
                    .record(MutationBroker::event(&self.actor, op, "rejected", 0, 0));
                return Err(e);
            }
        };

        let status = if persist_error.is_some() {
            tracing::error!(op, "mutation applied in memory but not persisted");
            "persist_failed"
        } else if changed == 0 {
            "noop"
        } else {
            tracing::info!(op, changed, records = snapshot.len(), "mutation persisted");
            "success"
        };
        let mut event = MutationBroker::event(&self.actor, op, status, snapshot.len(), changed);
        event.sync = Some(sync.label().to_string());
        self.broker.record(event);

        Ok(Mutation {
            op,
            snapshot,
            changed,
            persist_error,
            sync,
        })
    }

    fn quarantine_corrupt(&self) -> LedgerResult<()> {
        let moved = fsio::quarantine(&self.data_path, "corrupt").map_err(|e| {
            LedgerError::PersistenceFailure {
                path: self.data_path.clone(),
                reason: format!("could not move corrupt file aside: {}", e),
            }
        })?;
        tracing::error!(moved_to = %moved.display(), "corrupt backing file quarantined");
        Ok(())
    }

    fn skipped_sync(&self, reason: &str) -> SyncReport {
        match self.mirror {
            Some(_) => SyncReport::Skipped {
                reason: reason.to_string(),
            },
            None => SyncReport::Disabled,
        }
    }

    fn persistence_failure(&self, err: impl fmt::Display) -> LedgerError {
        LedgerError::PersistenceFailure {
            path: self.data_path.clone(),
            reason: err.to_string(),
        }
    }
}

fn normalize_text(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Calendar date from `YYYY-MM-DD`, tolerating a trailing time-of-day
/// (`2024-05-01 13:45:12.123`) as written by older exports.
pub fn parse_occurred_on(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let (date_part, rest) = match (trimmed.get(..10), trimmed.get(10..)) {
        (Some(date), Some(rest)) => (date, rest),
        _ => (trimmed, ""),
    };
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('T')) {
        return None;
    }
    NaiveDate::parse_from_str(date_part, schemas::DATE_FORMAT).ok()
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "t"
    )
}

/// Deterministic id for rows written before ids existed: the same file
/// yields the same ids on every read. `dup_index` separates identical rows.
fn content_id(fields: &[&str], dup_index: usize) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(dup_index.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("h{}", &digest[..16])
}

fn cell_text<'r>(row: &'r csv::StringRecord, map: &HeaderMap, column: &str) -> &'r str {
    map.position(column)
        .and_then(|idx| row.get(idx))
        .unwrap_or("")
}

pub fn decode_snapshot(bytes: &[u8], policy: &CategoryPolicy) -> LedgerResult<Snapshot> {
    let mut rdr = csv::ReaderBuilder::new().from_reader(bytes);
    let headers = rdr.headers()?.clone();
    let map = HeaderMap::resolve(headers.iter());
    if map.is_unrecognised() {
        return Err(LedgerError::ValidationError(format!(
            "no recognised columns in header {:?}",
            headers.iter().collect::<Vec<_>>()
        )));
    }

    let mut records = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for row in rdr.records() {
        let row = row?;
        let field = |column: &'static str| cell_text(&row, &map, column);

        let subject_name = normalize_text(field(schemas::COL_SUBJECT), schemas::UNKNOWN);
        let group = normalize_text(field(schemas::COL_GROUP), schemas::UNKNOWN);
        let reporter = normalize_text(field(schemas::COL_REPORTER), schemas::UNKNOWN);
        let kind = normalize_text(field(schemas::COL_KIND), schemas::UNKNOWN);
        let category = policy.coerce(field(schemas::COL_CATEGORY));
        let note = normalize_text(field(schemas::COL_NOTE), schemas::NO_COMMENT);
        let occurred_raw = field(schemas::COL_OCCURRED_ON);
        let occurred_on = parse_occurred_on(occurred_raw);
        let resolved = parse_flag(field(schemas::COL_RESOLVED));

        let id = match field(schemas::COL_ID).trim() {
            "" => {
                let category_text = category.to_string();
                let fields = [
                    subject_name.as_str(),
                    group.as_str(),
                    reporter.as_str(),
                    kind.as_str(),
                    category_text.as_str(),
                    note.as_str(),
                    occurred_raw.trim(),
                ];
                let key = fields.join("\u{1f}");
                let dup = seen.entry(key).or_insert(0);
                let id = content_id(&fields, *dup);
                *dup += 1;
                id
            }
            existing => existing.to_string(),
        };

        records.push(IncidentRecord {
            id,
            subject_name,
            group,
            reporter,
            kind,
            category,
            note,
            occurred_on,
            resolved,
        });
    }

    let source = if map.needs_migration() {
        SnapshotSource::Migrated {
            renamed: map
                .renamed
                .iter()
                .map(|(legacy, col)| format!("{} -> {}", legacy, col))
                .collect(),
            added: map.missing.iter().map(|c| c.to_string()).collect(),
        }
    } else {
        SnapshotSource::Clean
    };
    Ok(Snapshot { records, source })
}

pub fn encode_snapshot(records: &[IncidentRecord]) -> LedgerResult<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(schemas::CANONICAL_HEADER)?;
    for r in records {
        let category = r.category.to_string();
        let occurred_on = r
            .occurred_on
            .map(|d| d.format(schemas::DATE_FORMAT).to_string())
            .unwrap_or_default();
        wtr.write_record([
            r.id.as_str(),
            r.subject_name.as_str(),
            r.group.as_str(),
            r.reporter.as_str(),
            r.kind.as_str(),
            category.as_str(),
            r.note.as_str(),
            occurred_on.as_str(),
            if r.resolved { "true" } else { "false" },
        ])?;
    }
    wtr.into_inner()
        .map_err(|e| LedgerError::IoError(io::Error::new(e.error().kind(), e.error().to_string())))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "incidents",
        "version": "0.1.0",
        "description": "Append-only incident log with per-record resolution flags",
        "commands": [
            { "name": "add", "parameters": ["subject", "group", "reporter", "kind", "category", "note"] },
            { "name": "list", "parameters": ["subject", "group", "reporter", "kind", "category"] },
            { "name": "delete", "parameters": ["id", "ordinal"] },
            { "name": "resolve", "parameters": ["subject", "category"] },
            { "name": "today", "parameters": [] }
        ],
        "storage": [schemas::DEFAULT_DATA_FILE, "ledger.events.jsonl"]
    })
}
