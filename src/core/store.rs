//! Store handle for the incident ledger's on-disk workspace.
//!
//! A store is a directory holding the backing CSV file, its lock and temp
//! siblings, the optional `ledger.toml`, and the mutation audit log.

use crate::core::schemas;
use std::path::{Path, PathBuf};

/// Store handle representing one ledger workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute or caller-relative path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(schemas::CONFIG_FILE_NAME)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(schemas::AUDIT_LOG_NAME)
    }

    /// Resolve the backing file. Relative names are taken from the store root.
    pub fn data_path(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        }
    }
}

/// Walk upward from `start_dir` looking for a directory that holds `ledger.toml`.
pub fn find_store_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(schemas::CONFIG_FILE_NAME).is_file() {
            return Some(current_dir);
        }
        if !current_dir.pop() {
            return None;
        }
    }
}
