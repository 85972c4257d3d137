//! Sanction rules and alert evaluation.
//!
//! The rule table is data. [`evaluate`] is pure: it reads a snapshot, never
//! the store, so it is safe to call on every render.

use crate::core::error::{LedgerError, LedgerResult};
use crate::plugins::incidents::{Category, Snapshot};
use crate::plugins::tally::{PairTally, tally_pairs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const PARENT_MEETING: &str = "parent meeting required";
pub const SUSPENSION: &str = "suspension required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `count > threshold`
    GreaterThan,
    /// `count >= threshold`
    AtLeast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SanctionRule {
    pub category: Category,
    pub threshold: usize,
    #[serde(default = "default_comparison")]
    pub comparison: Comparison,
    pub sanction: String,
}

fn default_comparison() -> Comparison {
    Comparison::GreaterThan
}

impl SanctionRule {
    pub fn new(category: u8, threshold: usize, comparison: Comparison, sanction: &str) -> Self {
        Self {
            category: Category(category),
            threshold,
            comparison,
            sanction: sanction.to_string(),
        }
    }

    pub fn is_breached(&self, count: usize) -> bool {
        match self.comparison {
            Comparison::GreaterThan => count > self.threshold,
            Comparison::AtLeast => count >= self.threshold,
        }
    }
}

/// At most one rule per category. Categories without a rule never alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleTable {
    rules: Vec<SanctionRule>,
}

impl RuleTable {
    pub fn new(mut rules: Vec<SanctionRule>) -> LedgerResult<Self> {
        let mut seen = BTreeSet::new();
        for rule in &rules {
            if !seen.insert(rule.category) {
                return Err(LedgerError::ConfigError(format!(
                    "more than one sanction rule for category {}",
                    rule.category
                )));
            }
            if rule.sanction.trim().is_empty() {
                return Err(LedgerError::ConfigError(format!(
                    "sanction rule for category {} has no sanction text",
                    rule.category
                )));
            }
        }
        rules.sort_by_key(|r| r.category);
        Ok(Self { rules })
    }

    pub fn standard() -> Self {
        Self {
            rules: vec![
                SanctionRule::new(1, 10, Comparison::GreaterThan, PARENT_MEETING),
                SanctionRule::new(2, 5, Comparison::GreaterThan, PARENT_MEETING),
                SanctionRule::new(3, 2, Comparison::GreaterThan, PARENT_MEETING),
                SanctionRule::new(4, 1, Comparison::AtLeast, SUSPENSION),
            ],
        }
    }

    pub fn rule_for(&self, category: Category) -> Option<&SanctionRule> {
        self.rules.iter().find(|r| r.category == category)
    }

    pub fn rules(&self) -> &[SanctionRule] {
        &self.rules
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub subject: String,
    pub category: Category,
    pub count: usize,
    pub sanction: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Inactive,
    ActiveUnresolved,
    ActiveResolved,
}

pub fn pair_state(tally: PairTally, rule: Option<&SanctionRule>) -> PairState {
    match rule {
        Some(rule) if tally.total > 0 && rule.is_breached(tally.total) => {
            if tally.unresolved > 0 {
                PairState::ActiveUnresolved
            } else {
                PairState::ActiveResolved
            }
        }
        _ => PairState::Inactive,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairReport {
    pub subject: String,
    pub category: Category,
    pub count: usize,
    pub unresolved: usize,
    pub state: PairState,
    pub sanction: Option<String>,
}

/// State of every (subject, category) pair present in `snapshot`, ordered by
/// subject then category.
pub fn evaluate_states(snapshot: &Snapshot, table: &RuleTable) -> Vec<PairReport> {
    tally_pairs(snapshot)
        .into_iter()
        .map(|((subject, category), tally)| {
            let rule = table.rule_for(category);
            PairReport {
                subject,
                category,
                count: tally.total,
                unresolved: tally.unresolved,
                state: pair_state(tally, rule),
                sanction: rule.map(|r| r.sanction.clone()),
            }
        })
        .collect()
}

/// Active, unresolved alerts. Counts are cumulative over the whole snapshot;
/// resolved records still count once a pair is re-armed.
pub fn evaluate(snapshot: &Snapshot, table: &RuleTable) -> Vec<Alert> {
    evaluate_states(snapshot, table)
        .into_iter()
        .filter(|p| p.state == PairState::ActiveUnresolved)
        .filter_map(|p| {
            Some(Alert {
                sanction: p.sanction?,
                subject: p.subject,
                category: p.category,
                count: p.count,
            })
        })
        .collect()
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "sanctions",
        "version": "0.1.0",
        "description": "Threshold rules over cumulative per-subject category counts",
        "commands": [
            { "name": "alerts", "parameters": ["all"] }
        ],
        "rules": RuleTable::standard().rules(),
        "states": ["inactive", "active_unresolved", "active_resolved"]
    })
}
