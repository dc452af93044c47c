//! End-to-end cycle tests: real libSQL store, scripted source and sink.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mail_relay::error::SinkError;
use mail_relay::pipeline::{CycleRunner, ForwardDispatcher, RelayMetrics};
use mail_relay::store::{AuditOutcome, AuditQuery, LibSqlBackend, NewRule, RelayStore};

use common::{
    FlakyStore, InstantSleeper, RecordingSink, ScriptedSource, TEST_TIMEOUT, message,
    store_with_rules,
};

fn runner(
    store: Arc<dyn RelayStore>,
    source: Arc<ScriptedSource>,
    sink: Arc<RecordingSink>,
) -> CycleRunner {
    CycleRunner::new(
        store,
        source,
        ForwardDispatcher::with_sleeper(sink, Arc::new(InstantSleeper::default())),
        Arc::new(RelayMetrics::new()),
        chrono::Duration::hours(24),
    )
}

#[tokio::test]
async fn partial_failure_is_retried_next_cycle() {
    let store = store_with_rules(&[
        ("urgent", "ops@example.com"),
        ("billing", "accounts@example.com"),
    ])
    .await;
    let source = ScriptedSource::new(vec![
        message("m-1", "urgent - Jane Doe"),
        message("m-2", "billing - invoice 42"),
        message("m-3", "hello there"),
    ]);
    let sink = RecordingSink::new();
    sink.script("m-2", vec![Err(SinkError::Rejected("mailbox full".into()))]);
    let runner = runner(store.clone(), source.clone(), sink.clone());
    let cancel = CancellationToken::new();

    let first = runner.run_cycle(&cancel).await;
    assert_eq!(first.fetched, 3);
    assert_eq!(first.matched, 2);
    assert_eq!(first.forwarded, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.skipped, 1);
    assert!(!first.aborted);

    assert!(store.is_processed("m-1").await.unwrap());
    assert!(!store.is_processed("m-2").await.unwrap());
    assert!(store.is_processed("m-3").await.unwrap());

    let failure = store
        .list_audit(&AuditQuery::for_message("m-2"))
        .await
        .unwrap();
    assert_eq!(failure.len(), 1);
    assert_eq!(failure[0].outcome, AuditOutcome::Failure);
    assert_eq!(failure[0].rule_key.as_deref(), Some("billing"));
    assert!(failure[0].detail.contains("mailbox full"));

    let second = runner.run_cycle(&cancel).await;
    assert_eq!(second.already_processed, 2);
    assert_eq!(second.forwarded, 1);
    assert_eq!(second.failed, 0);

    assert!(store.is_processed("m-2").await.unwrap());
    assert_eq!(sink.attempts_for("m-1"), 1);
    assert_eq!(sink.attempts_for("m-2"), 2);
    assert_eq!(sink.attempts_for("m-3"), 0);
    for id in ["m-1", "m-2", "m-3"] {
        assert_eq!(store.count_processed(id).await.unwrap(), 1);
    }

    let snapshot = runner.metrics().snapshot();
    assert_eq!(snapshot.pull_count, 2);
    assert_eq!(snapshot.match_count, 3);
    assert_eq!(snapshot.forward_successes, 2);
    assert_eq!(snapshot.forward_failures, 1);
}

#[tokio::test]
async fn rate_limited_forward_backs_off_then_succeeds() {
    let store = store_with_rules(&[("urgent", "ops@example.com")]).await;
    let source = ScriptedSource::new(vec![message("m-1", "URGENT - call back")]);
    let sink = RecordingSink::new();
    sink.script(
        "m-1",
        vec![
            Err(SinkError::RateLimited("slow down".into())),
            Err(SinkError::RateLimited("slow down".into())),
        ],
    );
    let sleeper = Arc::new(InstantSleeper::default());
    let runner = CycleRunner::new(
        store.clone(),
        source,
        ForwardDispatcher::with_sleeper(sink.clone(), sleeper.clone()),
        Arc::new(RelayMetrics::new()),
        chrono::Duration::hours(1),
    );

    let summary = runner.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.forwarded, 1);
    assert_eq!(sink.attempts_for("m-1"), 3);
    assert_eq!(
        *sleeper.slept.lock().unwrap(),
        vec![Duration::from_secs(1), Duration::from_secs(4)]
    );
    // Case-insensitive tier resolved "URGENT" to the "urgent" rule.
    assert_eq!(sink.sent()[0].1, "ops@example.com");
}

#[tokio::test]
async fn overlapping_cycles_dispatch_once() {
    let store = store_with_rules(&[("urgent", "ops@example.com")]).await;
    let source = ScriptedSource::new(vec![message("m-1", "urgent - Jane")]);
    let sink = RecordingSink::slow(Duration::from_millis(200));
    let runner = Arc::new(runner(store.clone(), source, sink.clone()));
    let cancel = CancellationToken::new();

    let (first, second) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(runner.run_cycle(&cancel), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runner.run_cycle(&cancel).await
        })
    })
    .await
    .expect("cycles hung");

    assert_eq!(first.forwarded + second.forwarded, 1);
    assert_eq!(first.already_processed + second.already_processed, 1);
    assert_eq!(sink.started(), 1);
    assert_eq!(store.count_processed("m-1").await.unwrap(), 1);
    assert_eq!(runner.ledger().claimed(), 0);
}

#[tokio::test]
async fn ledger_outage_aborts_batch_and_keeps_checkpoint() {
    let inner = store_with_rules(&[("urgent", "ops@example.com")]).await;
    let store = FlakyStore::new(inner.clone());
    store
        .fail_ledger
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let source = ScriptedSource::new(vec![
        message("m-1", "urgent - one"),
        message("m-2", "urgent - two"),
    ]);
    let sink = RecordingSink::new();
    let runner = runner(store.clone(), source, sink.clone());
    let before = runner.checkpoint();

    let summary = runner.run_cycle(&CancellationToken::new()).await;
    assert!(summary.aborted);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.forwarded, 0);
    assert!(sink.sent().is_empty());
    assert_eq!(runner.checkpoint(), before);

    let entries = inner.list_audit(&AuditQuery::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message_id, "m-1");
    assert_eq!(entries[0].outcome, AuditOutcome::Error);
    assert!(entries[0].detail.contains("ledger"));

    // Once the ledger is back both messages go through.
    store
        .fail_ledger
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let summary = runner.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.forwarded, 2);
    assert!(runner.checkpoint() > before);
}

#[tokio::test]
async fn rule_lookup_failure_is_audited_and_retried() {
    let inner = store_with_rules(&[("urgent", "ops@example.com")]).await;
    let store = FlakyStore::new(inner.clone());
    store
        .fail_rules
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let source = ScriptedSource::new(vec![message("m-1", "urgent - one")]);
    let sink = RecordingSink::new();
    let runner = runner(store.clone(), source, sink.clone());

    let summary = runner.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.errored, 1);
    assert!(!summary.aborted);
    assert!(!inner.is_processed("m-1").await.unwrap());

    let entries = inner
        .list_audit(&AuditQuery::for_message("m-1"))
        .await
        .unwrap();
    assert_eq!(entries[0].outcome, AuditOutcome::Error);

    store
        .fail_rules
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let summary = runner.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.forwarded, 1);
    assert_eq!(sink.attempts_for("m-1"), 1);
}

#[tokio::test]
async fn processed_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let batch = vec![message("m-1", "urgent - persisted")];

    {
        let store = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        store
            .create_rule(&NewRule::new("urgent", "ops@example.com"))
            .await
            .unwrap();
        let sink = RecordingSink::new();
        let runner = runner(store, ScriptedSource::new(batch.clone()), sink.clone());
        let summary = runner.run_cycle(&CancellationToken::new()).await;
        assert_eq!(summary.forwarded, 1);
    }

    let store = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let sink = RecordingSink::new();
    let runner = runner(store.clone(), ScriptedSource::new(batch), sink.clone());
    let summary = runner.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.already_processed, 1);
    assert!(sink.sent().is_empty());
    assert_eq!(store.count_audit().await.unwrap(), 1);
}
