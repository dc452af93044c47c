//! Version-tracked database migrations for the libSQL backend.
//!
//! `run_migrations()` reads the highest applied version from `_migrations`
//! and applies the newer steps in order.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS forward_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                target_address TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_forward_rules_live_key
                ON forward_rules(key) WHERE deleted_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_forward_rules_enabled ON forward_rules(enabled);

            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS forward_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                rule_key TEXT,
                outcome TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_forward_logs_message ON forward_logs(message_id);
        "#,
    },
    Migration {
        version: 2,
        name: "audit_outcome_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_forward_logs_outcome ON forward_logs(outcome);
            CREATE INDEX IF NOT EXISTS idx_forward_logs_created ON forward_logs(created_at);
        "#,
    },
];

const MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the latest version. Each pending step and its
/// `_migrations` row commit together, so a failed step leaves the
/// recorded version where it was.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(MIGRATIONS_TABLE, ())
        .await
        .map_err(|e| StoreError::Migration(format!("cannot create _migrations: {e}")))?;

    let from = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Drop the half-applied transaction.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(StoreError::Migration(format!(
                "V{} {} failed: {e}",
                migration.version, migration.name
            )));
        }
    }

    tracing::info!(from, to = applied_version(conn).await?, "Schema migrated");
    Ok(())
}

/// Highest recorded version; 0 for a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, StoreError> {
    let migration_err = |e: libsql::Error| StoreError::Migration(format!("version lookup: {e}"));

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(migration_err)?;
    match rows.next().await.map_err(migration_err)? {
        Some(row) => row.get::<i64>(0).map_err(migration_err),
        None => Ok(0),
    }
}
