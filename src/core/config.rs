//! `ledger.toml` loading and validation.
//!
//! Every section is optional. A store without a config file runs on the
//! defaults below, which reproduce the standard four-level category scale and
//! sanction table.

use crate::core::error::{LedgerError, LedgerResult};
use crate::core::schemas;
use crate::core::time::{self, Clock};
use crate::plugins::incidents::Category;
use crate::plugins::sanctions::{RuleTable, SanctionRule};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub store: StoreConfig,
    pub categories: CategoryPolicy,
    pub clock: ClockConfig,
    pub mirror: MirrorConfig,
    /// Empty means the standard table.
    pub rules: Vec<SanctionRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub file: PathBuf,
    pub lock_wait_ms: u64,
    pub stale_lock_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(schemas::DEFAULT_DATA_FILE),
            lock_wait_ms: 12_000,
            stale_lock_secs: 30,
        }
    }
}

/// Closed set of severity levels and the level that unparseable input falls back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryPolicy {
    pub valid: Vec<u8>,
    pub default: u8,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            valid: vec![1, 2, 3, 4],
            default: 1,
        }
    }
}

impl CategoryPolicy {
    pub fn default_category(&self) -> Category {
        Category(self.default)
    }

    pub fn is_valid(&self, category: Category) -> bool {
        self.valid.contains(&category.0)
    }

    /// Accepts `"3"`, `" 3 "` and float spellings such as `"3.0"`.
    pub fn parse_strict(&self, raw: &str) -> LedgerResult<Category> {
        let trimmed = raw.trim();
        let level = trimmed.parse::<u8>().ok().or_else(|| {
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0 && (0.0..=255.0).contains(f))
                .map(|f| f as u8)
        });
        match level {
            Some(n) if self.valid.contains(&n) => Ok(Category(n)),
            _ => Err(LedgerError::ValidationError(format!(
                "category '{}' is not one of {:?}",
                trimmed, self.valid
            ))),
        }
    }

    /// Never fails: anything outside the valid set becomes the default level.
    pub fn coerce(&self, raw: &str) -> Category {
        self.parse_strict(raw)
            .unwrap_or_else(|_| self.default_category())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClockConfig {
    pub utc_offset: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset: "+00:00".to_string(),
        }
    }
}

impl ClockConfig {
    pub fn clock(&self) -> LedgerResult<Clock> {
        Ok(Clock::Offset(time::parse_utc_offset(&self.utc_offset)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub api_base: String,
    /// `owner/name`
    pub repository: String,
    pub branch: String,
    pub path: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    pub timeout_secs: u64,
    pub commit_message: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://api.github.com".to_string(),
            repository: String::new(),
            branch: "main".to_string(),
            path: schemas::DEFAULT_DATA_FILE.to_string(),
            token_env: "INCIDENT_LEDGER_TOKEN".to_string(),
            timeout_secs: 5,
            commit_message: "Update incident log".to_string(),
        }
    }
}

impl MirrorConfig {
    fn validate(&self) -> LedgerResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let slug = Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$")
            .map_err(|e| LedgerError::ConfigError(e.to_string()))?;
        if !slug.is_match(&self.repository) {
            return Err(LedgerError::ConfigError(format!(
                "mirror.repository '{}' must look like owner/name",
                self.repository
            )));
        }
        if self.branch.trim().is_empty() || self.path.trim().is_empty() {
            return Err(LedgerError::ConfigError(
                "mirror.branch and mirror.path must be set".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(LedgerError::ConfigError(
                "mirror.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.categories.valid.is_empty() {
            return Err(LedgerError::ConfigError(
                "categories.valid must not be empty".into(),
            ));
        }
        if !self.categories.valid.contains(&self.categories.default) {
            return Err(LedgerError::ConfigError(format!(
                "categories.default {} is not in categories.valid {:?}",
                self.categories.default, self.categories.valid
            )));
        }
        self.clock.clock()?;
        for rule in &self.rules {
            if !self.categories.is_valid(rule.category) {
                return Err(LedgerError::ConfigError(format!(
                    "rule for category {} names a level outside categories.valid",
                    rule.category
                )));
            }
        }
        self.rule_table()?;
        self.mirror.validate()
    }

    pub fn rule_table(&self) -> LedgerResult<RuleTable> {
        if self.rules.is_empty() {
            Ok(RuleTable::standard())
        } else {
            RuleTable::new(self.rules.clone())
        }
    }

    pub fn parse(content: &str) -> LedgerResult<Self> {
        let config: LedgerConfig =
            toml::from_str(content).map_err(|e| LedgerError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Load `ledger.toml` from the store root. No file = defaults (not an error).
pub fn load_config(root: &Path) -> LedgerResult<LedgerConfig> {
    let config_path = root.join(schemas::CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(LedgerConfig::default());
    }
    let content = fs::read_to_string(&config_path).map_err(LedgerError::IoError)?;
    LedgerConfig::parse(&content)
}
