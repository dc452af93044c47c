//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mail_relay::error::{FetchError, SinkError, StoreError};
use mail_relay::pipeline::{Message, MessageSink, MessageSource, Sleeper};
use mail_relay::store::{
    AuditEntry, AuditQuery, LibSqlBackend, NewAuditEntry, NewRule, ProcessedRecord, RelayStore,
    Rule, RuleUpdate,
};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn message(id: &str, subject: &str) -> Message {
    Message::new(id, subject)
        .with_from("sender@example.com")
        .with_text("body")
}

/// In-memory store seeded with `(key, target)` rules.
pub async fn store_with_rules(rules: &[(&str, &str)]) -> Arc<LibSqlBackend> {
    let store = LibSqlBackend::new_memory().await.unwrap();
    for (key, target) in rules {
        store.create_rule(&NewRule::new(*key, *target)).await.unwrap();
    }
    Arc::new(store)
}

// ── Source ──────────────────────────────────────────────────────────────

/// Returns whatever batch is currently loaded on every fetch.
pub struct ScriptedSource {
    batch: Mutex<Vec<Message>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(batch: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            batch: Mutex::new(batch),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set_batch(&self, batch: Vec<Message>) {
        *self.batch.lock().unwrap() = batch;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_new(&self, _since: DateTime<Utc>) -> Result<Vec<Message>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.batch.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

// ── Sink ────────────────────────────────────────────────────────────────

/// Records every send. Per-message scripts are consumed first; anything
/// unscripted succeeds after the configured delay.
#[derive(Default)]
pub struct RecordingSink {
    scripts: Mutex<HashMap<String, VecDeque<Result<(), SinkError>>>>,
    sent: Mutex<Vec<(String, String)>>,
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every send takes `delay` before succeeding.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn script(&self, message_id: &str, results: Vec<Result<(), SinkError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(message_id.to_string(), results.into());
    }

    /// `(message_id, target)` for every attempt, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, message_id: &str) -> usize {
        self.sent().iter().filter(|(id, _)| id == message_id).count()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, message: &Message, target: &str) -> Result<(), SinkError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .unwrap()
            .push((message.id.clone(), target.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&message.id)
            .and_then(|q| q.pop_front());
        self.finished.fetch_add(1, Ordering::SeqCst);
        scripted.unwrap_or(Ok(()))
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Default)]
pub struct InstantSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

// ── Store wrapper with fault injection ──────────────────────────────────

/// Delegates to a real store, failing selected calls on demand.
pub struct FlakyStore {
    inner: Arc<LibSqlBackend>,
    pub fail_ledger: AtomicBool,
    pub fail_rules: AtomicBool,
    pub fail_ping: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<LibSqlBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_ledger: AtomicBool::new(false),
            fail_rules: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
        })
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Pool(format!("{what} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Self::check(&self.fail_ping, "database")?;
        self.inner.ping().await
    }

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule, StoreError> {
        self.inner.create_rule(rule).await
    }

    async fn get_rule(&self, id: i64) -> Result<Option<Rule>, StoreError> {
        self.inner.get_rule(id).await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Self::check(&self.fail_rules, "rules")?;
        self.inner.list_rules().await
    }

    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Self::check(&self.fail_rules, "rules")?;
        self.inner.list_enabled_rules().await
    }

    async fn update_rule(&self, id: i64, update: &RuleUpdate) -> Result<Rule, StoreError> {
        self.inner.update_rule(id, update).await
    }

    async fn delete_rule(&self, id: i64) -> Result<bool, StoreError> {
        self.inner.delete_rule(id).await
    }

    async fn is_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        Self::check(&self.fail_ledger, "ledger")?;
        self.inner.is_processed(message_id).await
    }

    async fn mark_processed(&self, message_id: &str) -> Result<bool, StoreError> {
        Self::check(&self.fail_ledger, "ledger")?;
        self.inner.mark_processed(message_id).await
    }

    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedRecord>, StoreError> {
        self.inner.get_processed(message_id).await
    }

    async fn count_processed(&self, message_id: &str) -> Result<u64, StoreError> {
        self.inner.count_processed(message_id).await
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, StoreError> {
        self.inner.append_audit(entry).await
    }

    async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.list_audit(query).await
    }

    async fn count_audit(&self) -> Result<u64, StoreError> {
        self.inner.count_audit().await
    }
}
