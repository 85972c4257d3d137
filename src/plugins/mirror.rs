//! Best-effort replication of the backing file to a versioned remote store.
//!
//! Each sync reads the remote version tag for the mirrored path and then
//! either creates the file or performs an update conditional on that tag.
//! Failures are logged and reported in [`SyncReport`]; they never fail the
//! local mutation that triggered them. There is no retry.

use crate::core::config::MirrorConfig;
use crate::core::error::{LedgerError, LedgerResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("version conflict: {0}")]
    Conflict(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<RemoteError> for LedgerError {
    fn from(err: RemoteError) -> Self {
        LedgerError::SyncError(err.to_string())
    }
}

/// A file store addressed by path, where every stored file carries an opaque
/// version tag that changes on each write.
pub trait RemoteStore: Send + Sync {
    fn describe(&self) -> String;

    /// `None` when the path does not exist remotely.
    fn fetch_version(&self, path: &str) -> Result<Option<String>, RemoteError>;

    /// Returns the new version tag.
    fn create(&self, path: &str, bytes: &[u8], message: &str) -> Result<String, RemoteError>;

    /// Must fail with [`RemoteError::Conflict`] if `version` is no longer current.
    fn update(
        &self,
        path: &str,
        bytes: &[u8],
        version: &str,
        message: &str,
    ) -> Result<String, RemoteError>;
}

impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn fetch_version(&self, path: &str) -> Result<Option<String>, RemoteError> {
        (**self).fetch_version(path)
    }

    fn create(&self, path: &str, bytes: &[u8], message: &str) -> Result<String, RemoteError> {
        (**self).create(path, bytes, message)
    }

    fn update(
        &self,
        path: &str,
        bytes: &[u8],
        version: &str,
        message: &str,
    ) -> Result<String, RemoteError> {
        (**self).update(path, bytes, version, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncReport {
    Disabled,
    Created { version: String },
    Updated { version: String },
    Skipped { reason: String },
    Failed { reason: String },
}

impl SyncReport {
    pub fn label(&self) -> &'static str {
        match self {
            SyncReport::Disabled => "disabled",
            SyncReport::Created { .. } => "created",
            SyncReport::Updated { .. } => "updated",
            SyncReport::Skipped { .. } => "skipped",
            SyncReport::Failed { .. } => "failed",
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, SyncReport::Created { .. } | SyncReport::Updated { .. })
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncReport::Disabled => write!(f, "mirror disabled"),
            SyncReport::Created { version } => write!(f, "mirror created at {}", version),
            SyncReport::Updated { version } => write!(f, "mirror updated to {}", version),
            SyncReport::Skipped { reason } => write!(f, "mirror skipped: {}", reason),
            SyncReport::Failed { reason } => write!(f, "mirror failed: {}", reason),
        }
    }
}

pub struct Mirror {
    remote: Box<dyn RemoteStore>,
    path: String,
    message: String,
}

impl fmt::Debug for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mirror")
            .field("remote", &self.remote.describe())
            .field("path", &self.path)
            .finish()
    }
}

impl Mirror {
    pub fn new(remote: impl RemoteStore + 'static, path: &str, message: &str) -> Self {
        Self {
            remote: Box::new(remote),
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    /// `None` when mirroring is disabled.
    pub fn from_config(config: &MirrorConfig) -> LedgerResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let remote = GitHubContents::new(config)?;
        Ok(Some(Self::new(remote, &config.path, &config.commit_message)))
    }

    pub fn describe(&self) -> String {
        format!("{}:{}", self.remote.describe(), self.path)
    }

    /// Push the whole file. Never returns an error; see [`SyncReport`].
    pub fn sync(&self, bytes: &[u8]) -> SyncReport {
        match self.try_sync(bytes) {
            Ok(report) => {
                tracing::info!(remote = %self.describe(), outcome = report.label(), "mirror synced");
                report
            }
            Err(err) => {
                if matches!(err, RemoteError::Conflict(_)) {
                    tracing::warn!(remote = %self.describe(), error = %err, "remote changed since it was read; local write stands");
                } else {
                    tracing::warn!(remote = %self.describe(), error = %err, "mirror sync failed");
                }
                SyncReport::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn try_sync(&self, bytes: &[u8]) -> Result<SyncReport, RemoteError> {
        match self.remote.fetch_version(&self.path)? {
            None => {
                let version = self.remote.create(&self.path, bytes, &self.message)?;
                Ok(SyncReport::Created { version })
            }
            Some(current) => {
                let version = self
                    .remote
                    .update(&self.path, bytes, &current, &self.message)?;
                Ok(SyncReport::Updated { version })
            }
        }
    }
}

/// Repository contents API of a GitHub-compatible host. The file's blob
/// `sha` is the version tag; a PUT carrying a stale `sha` is rejected.
#[derive(Debug)]
pub struct GitHubContents {
    client: reqwest::blocking::Client,
    api_base: String,
    repository: String,
    branch: String,
    token_env: String,
}

#[derive(Deserialize)]
struct ContentsEntry {
    sha: String,
}

#[derive(Deserialize)]
struct PutResponse {
    content: ContentsEntry,
}

#[derive(Serialize)]
struct PutRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

impl GitHubContents {
    pub fn new(config: &MirrorConfig) -> LedgerResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("incident-ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LedgerError::ConfigError(format!("mirror client: {}", e)))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repository: config.repository.clone(),
            branch: config.branch.clone(),
            token_env: config.token_env.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.api_base,
            self.repository,
            path.trim_start_matches('/')
        )
    }

    fn token(&self) -> Result<String, RemoteError> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| RemoteError::Auth(format!("{} is not set", self.token_env)))
    }

    fn put(&self, path: &str, bytes: &[u8], sha: Option<&str>, message: &str) -> Result<String, RemoteError> {
        let body = PutRequest {
            message,
            content: BASE64.encode(bytes),
            branch: &self.branch,
            sha,
        };
        let resp = self
            .client
            .put(self.url(path))
            .bearer_auth(self.token()?)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        let resp = check_status(resp)?;
        let parsed: PutResponse = resp
            .json()
            .map_err(|e| RemoteError::Protocol(format!("bad PUT response: {}", e)))?;
        Ok(parsed.content.sha)
    }
}

fn check_status(
    resp: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let rate_limited = resp
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0");
    let detail = format!("HTTP {}", status.as_u16());
    Err(match status.as_u16() {
        429 => RemoteError::RateLimited(detail),
        401 | 403 if rate_limited => RemoteError::RateLimited(detail),
        401 | 403 => RemoteError::Auth(detail),
        409 | 422 => RemoteError::Conflict(detail),
        _ => RemoteError::Protocol(detail),
    })
}

impl RemoteStore for GitHubContents {
    fn describe(&self) -> String {
        format!("github:{}@{}", self.repository, self.branch)
    }

    fn fetch_version(&self, path: &str) -> Result<Option<String>, RemoteError> {
        let resp = self
            .client
            .get(self.url(path))
            .query(&[("ref", self.branch.as_str())])
            .bearer_auth(self.token()?)
            .header("Accept", "application/vnd.github+json")
            .send()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry: ContentsEntry = check_status(resp)?
            .json()
            .map_err(|e| RemoteError::Protocol(format!("bad contents response: {}", e)))?;
        Ok(Some(entry.sha))
    }

    fn create(&self, path: &str, bytes: &[u8], message: &str) -> Result<String, RemoteError> {
        self.put(path, bytes, None, message)
    }

    fn update(
        &self,
        path: &str,
        bytes: &[u8],
        version: &str,
        message: &str,
    ) -> Result<String, RemoteError> {
        self.put(path, bytes, Some(version), message)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, (String, Vec<u8>)>,
    next: u64,
    writes: usize,
}

/// In-process remote with the same conditional-write contract. Used by the
/// test suite and for dry runs.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|(_, bytes)| bytes.clone())
    }

    pub fn version(&self, path: &str) -> Option<String> {
        self.state().files.get(path).map(|(v, _)| v.clone())
    }

    pub fn writes(&self) -> usize {
        self.state().writes
    }

    fn store(state: &mut MemoryState, path: &str, bytes: &[u8]) -> String {
        state.next += 1;
        state.writes += 1;
        let version = format!("v{}", state.next);
        state
            .files
            .insert(path.to_string(), (version.clone(), bytes.to_vec()));
        version
    }
}

impl RemoteStore for MemoryRemote {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn fetch_version(&self, path: &str) -> Result<Option<String>, RemoteError> {
        Ok(self.version(path))
    }

    fn create(&self, path: &str, bytes: &[u8], _message: &str) -> Result<String, RemoteError> {
        let mut state = self.state();
        if state.files.contains_key(path) {
            return Err(RemoteError::Conflict(format!("{} already exists", path)));
        }
        Ok(Self::store(&mut state, path, bytes))
    }

    fn update(
        &self,
        path: &str,
        bytes: &[u8],
        version: &str,
        _message: &str,
    ) -> Result<String, RemoteError> {
        let mut state = self.state();
        match state.files.get(path) {
            Some((current, _)) if current == version => Ok(Self::store(&mut state, path, bytes)),
            Some((current, _)) => Err(RemoteError::Conflict(format!(
                "expected {}, remote is at {}",
                version, current
            ))),
            None => Err(RemoteError::Conflict(format!("{} no longer exists", path))),
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "mirror",
        "version": "0.1.0",
        "description": "Best-effort copy of the backing file to a versioned remote store",
        "commands": [
            { "name": "mirror push", "description": "Upload the current backing file" }
        ],
        "outcomes": ["disabled", "created", "updated", "skipped", "failed"]
    })
}
