use crate::core::error::{LedgerError, LedgerResult};
use crate::core::fsio::{self, StoreLock};
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// The mutation broker is the thin waist for writes to the backing file.
/// It serialises writers (in-process mutex plus a cross-process lock file)
/// and keeps an append-only audit trail of every mutation attempt.
#[derive(Debug, Clone)]
pub struct MutationBroker {
    audit_log_path: PathBuf,
    lock_path: PathBuf,
    lock_wait: Duration,
    stale_after: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub status: String,
    /// Records in the snapshot after the operation
    pub records: usize,
    /// Records touched by the operation
    pub changed: usize,
    /// Remote mirror outcome, when one was attempted
    #[serde(default)]
    pub sync: Option<String>,
}

impl MutationBroker {
    pub fn new(store: &Store, data_path: &Path, lock_wait: Duration, stale_after: Duration) -> Self {
        Self {
            audit_log_path: store.audit_log_path(),
            lock_path: fsio::lock_path(data_path),
            lock_wait,
            stale_after,
        }
    }

    /// Run `f` while holding the store lock.
    pub fn with_lock<F, R>(&self, op_name: &str, f: F) -> LedgerResult<R>
    where
        F: FnOnce() -> LedgerResult<R>,
    {
        static WRITE_LOCK: Mutex<()> = Mutex::new(());
        let _guard = WRITE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let lock = StoreLock::acquire(&self.lock_path, self.lock_wait, self.stale_after)?;
        tracing::debug!(op = op_name, "store lock acquired");
        let result = f();
        lock.release();
        result
    }

    /// Append one audit entry. Audit failures are logged, not propagated:
    /// the mutation they describe has already happened.
    pub fn record(&self, event: BrokerEvent) {
        if let Err(e) = self.append(&event) {
            tracing::warn!(op = %event.op, error = %e, "failed to write audit event");
        }
    }

    pub fn event(actor: &str, op: &str, status: &str, records: usize, changed: usize) -> BrokerEvent {
        BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            status: status.to_string(),
            records,
            changed,
            sync: None,
        }
    }

    fn append(&self, ev: &BrokerEvent) -> LedgerResult<()> {
        if let Some(parent) = self.audit_log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(LedgerError::IoError)?;
        writeln!(f, "{}", serde_json::to_string(ev)?).map_err(LedgerError::IoError)?;
        Ok(())
    }

    /// Read the audit trail. Unparseable lines are skipped.
    pub fn read_events(&self) -> LedgerResult<Vec<BrokerEvent>> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let f = fs::File::open(&self.audit_log_path).map_err(LedgerError::IoError)?;
        let mut out = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line.map_err(LedgerError::IoError)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BrokerEvent>(&line) {
                Ok(ev) => out.push(ev),
                Err(e) => tracing::debug!(error = %e, "skipping malformed audit line"),
            }
        }
        Ok(out)
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "broker",
        "version": "0.1.0",
        "description": "Write serialisation and mutation audit log",
        "commands": [
            { "name": "audit", "description": "Show the mutation audit log" }
        ],
        "storage": ["ledger.events.jsonl", "<data file>.lock"]
    })
}
