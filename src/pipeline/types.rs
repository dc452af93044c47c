//! Shared types for the relay pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, SinkError};

// ── Inbound message ─────────────────────────────────────────────────

/// An inbound email, already parsed by the source that fetched it.
///
/// `id` is provider-assigned and stable across fetches; it is the only
/// idempotency key the pipeline uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Date header, when the source could read one.
    pub received_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Minimal message with an id and subject.
    pub fn new(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }
}

/// Opaque attachment blob carried through to the forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

// ── Cycle summary ───────────────────────────────────────────────────

/// Outcome counts for one processing cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub fetched: usize,
    pub matched: usize,
    pub forwarded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    /// Messages passed over because the ledger (or another cycle) had them.
    pub already_processed: usize,
    /// The batch stopped early (cancellation or ledger failure).
    pub aborted: bool,
    pub fetch_error: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl CycleSummary {
    pub(crate) fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            fetched: 0,
            matched: 0,
            forwarded: 0,
            failed: 0,
            skipped: 0,
            errored: 0,
            already_processed: 0,
            aborted: false,
            fetch_error: None,
            duration: Duration::ZERO,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ── Source / sink traits ────────────────────────────────────────────

/// Where inbound mail comes from. Pure I/O; no routing logic.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Source name for logs (e.g. "imap", "gmail").
    fn name(&self) -> &str;

    /// Fetch messages received since `since`.
    async fn fetch_new(&self, since: DateTime<Utc>) -> Result<Vec<Message>, FetchError>;

    /// Release the underlying session. Later fetches fail with `Closed`.
    async fn close(&self) -> Result<(), FetchError>;
}

/// Where matched mail is delivered. One attempt per call; the
/// dispatcher owns retries.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: &Message, target: &str) -> Result<(), SinkError>;
}
