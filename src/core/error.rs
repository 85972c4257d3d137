use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// Local write/read of the backing file failed. Durability is not guaranteed.
    #[error("Persistence failure at {}: {reason}", path.display())]
    PersistenceFailure { path: PathBuf, reason: String },
    /// Remote mirror failure. Logged by the mirror, never returned from a local mutation.
    #[error("Sync error: {0}")]
    SyncError(String),
    #[error("Ordinal {ordinal} is out of range for a store of {len} records")]
    OutOfRange { ordinal: i64, len: usize },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store lock unavailable: {0}")]
    LockContention(String),
    #[error("Config error: {0}")]
    ConfigError(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
