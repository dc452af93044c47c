//! Persistence layer: libSQL-backed storage for rules, the processed
//! ledger and the audit log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AuditEntry, AuditOutcome, AuditQuery, NewAuditEntry, NewRule, ProcessedRecord, RelayStore,
    Rule, RuleUpdate,
};
