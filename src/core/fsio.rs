//! Whole-file persistence primitives: atomic replace, advisory lock, quarantine.

use crate::core::error::{LedgerError, LedgerResult};
use crate::core::time::now_epoch_secs;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use ulid::Ulid;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

pub fn lock_path(path: &Path) -> PathBuf {
    sibling(path, ".lock")
}

/// Replace `path` with `bytes` so readers only ever see the old or the new
/// file, never a truncated one.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = fs::File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}

/// Move an unreadable backing file aside so the next persist cannot destroy it.
pub fn quarantine(path: &Path, reason: &str) -> io::Result<PathBuf> {
    let target = sibling(path, &format!(".{}.{}", reason, now_epoch_secs()));
    fs::rename(path, &target)?;
    Ok(target)
}

#[derive(Serialize, Deserialize, Debug)]
struct LockInfo {
    pid: u32,
    acquired_at: u64,
    /// Identifies the holder; locks written without one can only be taken over.
    #[serde(default)]
    token: String,
}

/// Advisory cross-process lock held for one read-modify-persist window.
/// Released on drop, but only while the lock file still carries our token.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    token: String,
}

impl StoreLock {
    pub fn acquire(path: &Path, wait: Duration, stale_after: Duration) -> LedgerResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: now_epoch_secs(),
                        token: Ulid::new().to_string(),
                    };
                    file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                    file.sync_all()?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token: info.token,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(seen) = Self::stale_contents(path, stale_after)
                        && Self::take_over(path, &seen)
                    {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(LedgerError::LockContention(format!(
                            "{} is held by another writer",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(LedgerError::IoError(e)),
            }
        }
    }

    /// Contents of the lock file when it is old enough to take over.
    fn stale_contents(path: &Path, stale_after: Duration) -> Option<String> {
        // Vanished between the create attempt and this read; retry.
        let contents = fs::read_to_string(path).ok()?;
        let stale = match serde_json::from_str::<LockInfo>(&contents) {
            Ok(info) => now_epoch_secs().saturating_sub(info.acquired_at) >= stale_after.as_secs(),
            // Possibly mid-write by a live writer; only its age can tell.
            Err(_) => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age >= stale_after),
        };
        stale.then_some(contents)
    }

    /// Move the lock file aside under a unique name and keep it only if it is
    /// still the stale lock that was inspected. A lock another writer put in
    /// place meanwhile is linked back without clobbering anything newer.
    fn take_over(path: &Path, seen: &str) -> bool {
        let aside = sibling(path, &format!(".stale.{}", Ulid::new()));
        if fs::rename(path, &aside).is_err() {
            return false;
        }
        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved == seen {
            tracing::warn!(lock = %path.display(), "took over stale store lock");
            let _ = fs::remove_file(&aside);
            return true;
        }
        if let Err(e) = fs::hard_link(&aside, path) {
            tracing::warn!(lock = %path.display(), error = %e, "could not restore live store lock");
        }
        let _ = fs::remove_file(&aside);
        false
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let holder = fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok());
        match holder {
            Some(info) if info.token == self.token => {
                let _ = fs::remove_file(&self.path);
            }
            _ => tracing::warn!(lock = %self.path.display(), "store lock was taken over; leaving it"),
        }
    }
}
