//! Cycle runner: one fetch → match → forward → record pass.
//!
//! Each message is handled independently: a failure on one never stops
//! the next, except when the processed ledger itself is unreachable, in
//! which case the rest of the batch is deferred to a later cycle.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::pipeline::dispatcher::ForwardDispatcher;
use crate::pipeline::ledger::IdempotencyLedger;
use crate::pipeline::matcher::{RuleMatcher, extract_key};
use crate::pipeline::metrics::RelayMetrics;
use crate::pipeline::types::{CycleSummary, Message, MessageSource};
use crate::store::{AuditOutcome, NewAuditEntry, RelayStore};

pub struct CycleRunner {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn RelayStore>,
    matcher: RuleMatcher,
    ledger: IdempotencyLedger,
    dispatcher: ForwardDispatcher,
    metrics: Arc<RelayMetrics>,
    /// Lower bound passed to the next fetch.
    checkpoint: Mutex<DateTime<Utc>>,
}

impl CycleRunner {
    /// The first fetch looks back `lookback` from now.
    pub fn new(
        store: Arc<dyn RelayStore>,
        source: Arc<dyn MessageSource>,
        dispatcher: ForwardDispatcher,
        metrics: Arc<RelayMetrics>,
        lookback: chrono::Duration,
    ) -> Self {
        Self {
            matcher: RuleMatcher::new(Arc::clone(&store)),
            ledger: IdempotencyLedger::new(Arc::clone(&store)),
            source,
            store,
            dispatcher,
            metrics,
            checkpoint: Mutex::new(
                Utc::now()
                    .checked_sub_signed(lookback)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
        }
    }

    pub fn checkpoint(&self) -> DateTime<Utc> {
        *self.checkpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Run one cycle. Never returns an error: fetch and per-message
    /// failures are recorded in the summary and the audit log.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        let timer = Instant::now();
        let mut summary = CycleSummary::begin(Utc::now());
        self.metrics.record_pull();

        let since = self.checkpoint();
        let messages = match self.source.fetch_new(since).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "Fetch failed, skipping cycle");
                self.metrics.record_fetch_failure();
                summary.fetch_error = Some(e.to_string());
                return self.finish(summary, timer);
            }
        };
        summary.fetched = messages.len();
        debug!(count = messages.len(), since = %since, "Fetched messages");

        for message in &messages {
            if cancel.is_cancelled() {
                info!(
                    remaining = messages.len() - summary_handled(&summary),
                    "Cycle cancelled, deferring remaining messages"
                );
                summary.aborted = true;
                break;
            }
            if let Err(e) = self.process_message(message, &mut summary).await {
                error!(error = %e, "Processed ledger unavailable, aborting batch");
                summary.aborted = true;
                break;
            }
        }

        if !summary.aborted {
            self.advance_checkpoint(summary.started_at);
        }
        self.finish(summary, timer)
    }

    /// Handle one message. `Err` means the ledger is unreachable and the
    /// batch must stop.
    async fn process_message(
        &self,
        message: &Message,
        summary: &mut CycleSummary,
    ) -> Result<(), StoreError> {
        let Some(_claim) = self.ledger.try_claim(&message.id) else {
            debug!(message_id = %message.id, "Message claimed by another cycle");
            summary.already_processed += 1;
            return Ok(());
        };

        match self.ledger.is_processed(&message.id).await {
            Ok(true) => {
                summary.already_processed += 1;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                summary.errored += 1;
                self.audit(
                    NewAuditEntry::new(&message.id, AuditOutcome::Error)
                        .with_detail(format!("processed ledger lookup failed: {e}")),
                )
                .await;
                return Err(e);
            }
        }

        let key = extract_key(&message.subject);
        let rule = match self.matcher.resolve(&key).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                debug!(message_id = %message.id, key = %key, "No rule matched");
                summary.skipped += 1;
                self.audit(
                    NewAuditEntry::new(&message.id, AuditOutcome::Skipped)
                        .with_detail(format!("no rule matches key '{key}'")),
                )
                .await;
                self.mark(&message.id).await;
                return Ok(());
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Rule lookup failed");
                summary.errored += 1;
                self.audit(
                    NewAuditEntry::new(&message.id, AuditOutcome::Error)
                        .with_detail(format!("rule lookup failed: {e}")),
                )
                .await;
                return Ok(());
            }
        };

        summary.matched += 1;
        self.metrics.record_match();

        match self.dispatcher.forward(message, &rule.target_address).await {
            Ok(()) => {
                summary.forwarded += 1;
                self.metrics.record_forward_success();
                self.audit(
                    NewAuditEntry::new(&message.id, AuditOutcome::Success)
                        .with_rule(&rule.key)
                        .with_detail(format!("forwarded to {}", rule.target_address)),
                )
                .await;
                self.mark(&message.id).await;
            }
            Err(e) => {
                summary.failed += 1;
                self.metrics.record_forward_failure();
                self.audit(
                    NewAuditEntry::new(&message.id, AuditOutcome::Failure)
                        .with_rule(&rule.key)
                        .with_detail(e.to_string()),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn audit(&self, entry: NewAuditEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            error!(
                message_id = %entry.message_id,
                outcome = %entry.outcome,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }

    async fn mark(&self, message_id: &str) {
        if let Err(e) = self.ledger.mark_processed(message_id).await {
            error!(message_id, error = %e, "Failed to mark message processed");
        }
    }

    /// Overlapping cycles may finish out of order; never move backwards.
    fn advance_checkpoint(&self, to: DateTime<Utc>) {
        let mut checkpoint = self.checkpoint.lock().unwrap_or_else(|e| e.into_inner());
        if to > *checkpoint {
            *checkpoint = to;
        }
    }

    fn finish(&self, mut summary: CycleSummary, timer: Instant) -> CycleSummary {
        summary.duration = timer.elapsed();
        self.metrics.record_cycle_duration(summary.duration);
        info!(
            fetched = summary.fetched,
            forwarded = summary.forwarded,
            failed = summary.failed,
            skipped = summary.skipped,
            errored = summary.errored,
            already_processed = summary.already_processed,
            aborted = summary.aborted,
            duration_ms = summary.duration.as_millis() as u64,
            "Cycle complete"
        );
        summary
    }
}

fn summary_handled(summary: &CycleSummary) -> usize {
    summary.skipped
        + summary.forwarded
        + summary.failed
        + summary.errored
        + summary.already_processed
}
