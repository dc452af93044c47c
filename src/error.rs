//! Error types for the mail relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Rule, ledger and audit store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message source errors (source unreachable, auth failure, bad response).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Source {source_name} unreachable: {reason}")]
    Unreachable { source_name: String, reason: String },

    #[error("Authentication failed for source {source_name}: {reason}")]
    AuthFailed { source_name: String, reason: String },

    #[error("Invalid response from {source_name}: {reason}")]
    InvalidResponse { source_name: String, reason: String },

    #[error("Source {source_name} is closed")]
    Closed { source_name: String },
}

/// A single delivery attempt rejected by the message sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Back off and try again.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Permanent rejection; retrying will not help.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Terminal forwarding failure after the retry policy gave up.
#[derive(Debug, thiserror::Error)]
#[error("failed to forward message after {attempts} attempt(s): {last}")]
pub struct ForwardError {
    pub attempts: u32,
    #[source]
    pub last: SinkError,
}

/// Scheduler control errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler interval must be greater than zero, got {0:?}")]
    InvalidInterval(Duration),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
