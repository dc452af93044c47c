//! libSQL backend: async `RelayStore` implementation.
//!
//! Supports local file and in-memory databases over a single shared
//! connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{
    AuditEntry, AuditOutcome, AuditQuery, NewAuditEntry, NewRule, ProcessedRecord, RelayStore,
    Rule, RuleUpdate,
};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// UNIQUE violations become `Constraint`, everything else `Query`.
fn write_error(op: &str, e: libsql::Error) -> StoreError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        StoreError::Constraint(format!("{op}: {msg}"))
    } else {
        StoreError::Query(format!("{op}: {msg}"))
    }
}

fn row_to_rule(row: &libsql::Row) -> Result<Rule, libsql::Error> {
    let enabled: i64 = row.get(3)?;
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;

    Ok(Rule {
        id: row.get(0)?,
        key: row.get(1)?,
        target_address: row.get(2)?,
        enabled: enabled != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, StoreError> {
    let parse = |e: libsql::Error| StoreError::Query(format!("audit row parse: {e}"));
    let outcome_str: String = row.get(3).map_err(parse)?;
    let created_str: String = row.get(5).map_err(parse)?;

    Ok(AuditEntry {
        id: row.get(0).map_err(parse)?,
        message_id: row.get(1).map_err(parse)?,
        rule_key: row.get::<String>(2).ok(),
        outcome: outcome_str.parse::<AuditOutcome>()?,
        detail: row.get(4).map_err(parse)?,
        created_at: parse_datetime(&created_str),
    })
}

async fn collect_rules(mut rows: libsql::Rows, op: &str) -> Result<Vec<Rule>, StoreError> {
    let mut rules = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
    {
        rules.push(
            row_to_rule(&row).map_err(|e| StoreError::Query(format!("{op} row parse: {e}")))?,
        );
    }
    Ok(rules)
}

async fn single_count(mut rows: libsql::Rows, op: &str) -> Result<u64, StoreError> {
    match rows.next().await {
        Ok(Some(row)) => {
            let n: i64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;
            Ok(n.max(0) as u64)
        }
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Query(format!("{op}: {e}"))),
    }
}

// ── Trait implementation ────────────────────────────────────────────

const RULE_COLUMNS: &str = "id, key, target_address, enabled, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, message_id, rule_key, outcome, detail, created_at";

#[async_trait]
impl RelayStore for LibSqlBackend {
    async fn ping(&self) -> Result<(), StoreError> {
        let rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| StoreError::Pool(format!("ping: {e}")))?;
        single_count(rows, "ping").await.map(|_| ())
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule, StoreError> {
        if rule.key.trim().is_empty() {
            return Err(StoreError::Constraint("rule key must not be empty".into()));
        }
        if rule.target_address.trim().is_empty() {
            return Err(StoreError::Constraint(
                "rule target_address must not be empty".into(),
            ));
        }

        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO forward_rules (key, target_address, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4) RETURNING {RULE_COLUMNS}"
                ),
                params![
                    rule.key.as_str(),
                    rule.target_address.as_str(),
                    rule.enabled as i64,
                    now
                ],
            )
            .await
            .map_err(|e| write_error("create_rule", e))?;

        let row = rows
            .next()
            .await
            .map_err(|e| write_error("create_rule", e))?
            .ok_or_else(|| StoreError::Query("create_rule: no row returned".into()))?;
        let created = row_to_rule(&row)
            .map_err(|e| StoreError::Query(format!("create_rule row parse: {e}")))?;

        debug!(rule_id = created.id, key = %created.key, "Rule created");
        Ok(created)
    }

    async fn get_rule(&self, id: i64) -> Result<Option<Rule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM forward_rules WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_rule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let rule = row_to_rule(&row)
                    .map_err(|e| StoreError::Query(format!("get_rule row parse: {e}")))?;
                Ok(Some(rule))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_rule: {e}"))),
        }
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM forward_rules WHERE deleted_at IS NULL ORDER BY id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_rules: {e}")))?;
        collect_rules(rows, "list_rules").await
    }

    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM forward_rules
                     WHERE enabled = 1 AND deleted_at IS NULL ORDER BY id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_enabled_rules: {e}")))?;
        collect_rules(rows, "list_enabled_rules").await
    }

    async fn update_rule(&self, id: i64, update: &RuleUpdate) -> Result<Rule, StoreError> {
        let existing = self.get_rule(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })?;

        let key = update.key.as_deref().unwrap_or(&existing.key);
        let target = update
            .target_address
            .as_deref()
            .unwrap_or(&existing.target_address);
        let enabled = update.enabled.unwrap_or(existing.enabled);

        if key.trim().is_empty() {
            return Err(StoreError::Constraint("rule key must not be empty".into()));
        }

        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE forward_rules SET key = ?1, target_address = ?2, enabled = ?3, updated_at = ?4
                 WHERE id = ?5 AND deleted_at IS NULL",
                params![key, target, enabled as i64, now, id],
            )
            .await
            .map_err(|e| write_error("update_rule", e))?;

        debug!(rule_id = id, "Rule updated");
        self.get_rule(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })
    }

    async fn delete_rule(&self, id: i64) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE forward_rules SET deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_rule: {e}")))?;
        Ok(count > 0)
    }

    // ── Processed ledger ────────────────────────────────────────────

    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        let rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("is_processed: {e}")))?;
        Ok(single_count(rows, "is_processed").await? > 0)
    }

    async fn mark_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        let count = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, processed_at) VALUES (?1, ?2)",
                params![message_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_processed: {e}")))?;
        Ok(count > 0)
    }

    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, processed_at FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parse = |e: libsql::Error| StoreError::Query(format!("get_processed: {e}"));
                let processed_str: String = row.get(1).map_err(parse)?;
                Ok(Some(ProcessedRecord {
                    message_id: row.get(0).map_err(parse)?,
                    processed_at: parse_datetime(&processed_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_processed: {e}"))),
        }
    }

    async fn count_processed(&self, message_id: &str) -> Result<u64, StoreError> {
        let rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("count_processed: {e}")))?;
        single_count(rows, "count_processed").await
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO forward_logs (message_id, rule_key, outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
                params![
                    entry.message_id.as_str(),
                    opt_text(entry.rule_key.as_deref()),
                    entry.outcome.as_str(),
                    entry.detail.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_audit: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("append_audit: {e}")))?
            .ok_or_else(|| StoreError::Query("append_audit: no row returned".into()))?;
        row.get::<i64>(0)
            .map_err(|e| StoreError::Query(format!("append_audit: {e}")))
    }

    async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let (page, limit) = query.normalized();
        let offset = (page as i64 - 1) * limit as i64;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM forward_logs
                     WHERE (?1 IS NULL OR message_id = ?1) AND (?2 IS NULL OR outcome = ?2)
                     ORDER BY id DESC LIMIT ?3 OFFSET ?4"
                ),
                params![
                    opt_text(query.message_id.as_deref()),
                    opt_text(query.outcome.map(|o| o.as_str())),
                    limit as i64,
                    offset
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_audit: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_audit: {e}")))?
        {
            entries.push(row_to_audit(&row)?);
        }
        Ok(entries)
    }

    async fn count_audit(&self) -> Result<u64, StoreError> {
        let rows = self
            .conn()
            .query("SELECT COUNT(*) FROM forward_logs", ())
            .await
            .map_err(|e| StoreError::Query(format!("count_audit: {e}")))?;
        single_count(rows, "count_audit").await
    }
}
