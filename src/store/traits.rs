//! `RelayStore` trait: single async interface for rules, the processed
//! ledger and the audit log.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ── Rules ───────────────────────────────────────────────────────────

/// A keyword routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    /// Case-sensitive routing token, unique among non-deleted rules.
    pub key: String,
    pub target_address: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub key: String,
    pub target_address: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewRule {
    pub fn new(key: impl Into<String>, target_address: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target_address: target_address.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial rule update. `None` leaves the field as is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleUpdate {
    pub key: Option<String>,
    pub target_address: Option<String>,
    pub enabled: Option<bool>,
}

// ── Ledger ──────────────────────────────────────────────────────────

/// "Message `message_id` has been fully handled."
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
}

// ── Audit log ───────────────────────────────────────────────────────

/// Outcome of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Skipped,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOutcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "skipped" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            other => Err(StoreError::Serialization(format!(
                "unknown audit outcome '{other}'"
            ))),
        }
    }
}

/// An immutable audit log row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub message_id: String,
    pub rule_key: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// An audit row about to be appended.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub message_id: String,
    pub rule_key: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: String,
}

impl NewAuditEntry {
    pub fn new(message_id: &str, outcome: AuditOutcome) -> Self {
        Self {
            message_id: message_id.to_string(),
            rule_key: None,
            outcome,
            detail: String::new(),
        }
    }

    pub fn with_rule(mut self, key: &str) -> Self {
        self.rule_key = Some(key.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Filter and paging for audit queries. Newest entries come first.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditQuery {
    pub message_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            message_id: None,
            outcome: None,
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl AuditQuery {
    pub fn for_message(message_id: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            ..Default::default()
        }
    }

    /// Page/limit clamped the same way the log listing always has been:
    /// page >= 1, limit in 1..=100 (out of range falls back to 50).
    pub fn normalized(&self) -> (u32, u32) {
        let page = self.page.max(1);
        let limit = if (1..=100).contains(&self.limit) {
            self.limit
        } else {
            default_limit()
        };
        (page, limit)
    }
}

// ── Store trait ─────────────────────────────────────────────────────

/// Backend-agnostic store used by the pipeline and the control surface.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule, StoreError>;

    async fn get_rule(&self, id: i64) -> Result<Option<Rule>, StoreError>;

    /// All non-deleted rules, id ascending.
    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError>;

    /// Enabled, non-deleted rules, id ascending.
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StoreError>;

    async fn update_rule(&self, id: i64, update: &RuleUpdate) -> Result<Rule, StoreError>;

    /// Soft delete. Returns false when no live rule had this id.
    async fn delete_rule(&self, id: i64) -> Result<bool, StoreError>;

    // ── Processed ledger ────────────────────────────────────────────

    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError>;

    /// Insert-or-ignore. Returns true when a new record was written.
    async fn mark_processed(&self, message_id: &str) -> Result<bool, StoreError>;

    async fn get_processed(&self, message_id: &str)
    -> Result<Option<ProcessedRecord>, StoreError>;

    /// Number of ledger rows for this id (0 or 1 on a healthy store).
    async fn count_processed(&self, message_id: &str) -> Result<u64, StoreError>;

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, StoreError>;

    async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError>;

    async fn count_audit(&self) -> Result<u64, StoreError>;
}
