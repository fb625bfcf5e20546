// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures without panics,
//! deadlocks, lost local changes or skipped remote changes.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use inbox_replication::aggregate::AggregationService;
use inbox_replication::batch::{ChangeBatch, ChangeRow, PullRequest};
use inbox_replication::circuit_breaker::{CircuitConfig, RemoteCircuit};
use inbox_replication::remote::{BoxFuture, LiveFeed};
use inbox_replication::resilience::RetryConfig;
use inbox_replication::{
    AggregationConfig, Checkpoint, Collection, ControllerSettings, ControllerState, Document, LocalStore,
    MemoryStore, PullEngine, PushEngine, RemoteEndpoint, ReplicationController, ReplicationError, SqliteStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn single_attempt() -> RetryConfig {
    RetryConfig {
        max_attempts: 1,
        ..RetryConfig::testing()
    }
}

// =============================================================================
// Transport Failures
// =============================================================================

/// Test: transient pull failures are absorbed by retries
#[tokio::test]
async fn transient_pull_failures_are_retried() {
    let remote = fast_remote();
    remote.upsert(ACCOUNT, Collection::Messages, message("m1", "T1", 1, &[])).await;
    let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint(ACCOUNT))));
    flaky.fail_pulls(2);

    let store = Arc::new(MemoryStore::new());
    let pull = PullEngine::new(Collection::Messages, store.clone(), flaky.clone(), 10)
        .with_retry(RetryConfig::testing())
        .with_circuit(lenient_circuit());

    let outcome = pull.pull_once().await.unwrap();
    assert_eq!(outcome.fetched, 1);
    assert_eq!(flaky.pull_calls(), 3);
}

/// Test: a failed pull leaves checkpoint and documents untouched
#[tokio::test]
async fn failed_pull_preserves_checkpoint() {
    let remote = fast_remote();
    remote.upsert(ACCOUNT, Collection::Messages, message("m1", "T1", 1, &[])).await;
    let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint(ACCOUNT))));

    let store = Arc::new(MemoryStore::new());
    let pull = PullEngine::new(Collection::Messages, store.clone(), flaky.clone(), 10)
        .with_retry(RetryConfig::testing())
        .with_circuit(lenient_circuit());
    pull.pull_until_caught_up().await.unwrap();
    let before = store.load_checkpoint(ACCOUNT, Collection::Messages).await.unwrap();

    remote.upsert(ACCOUNT, Collection::Messages, message("m2", "T1", 1, &[])).await;
    flaky.fail_pulls(10);
    let err = pull.pull_once().await.unwrap_err();
    assert!(err.is_retryable(), "expected transport error, got {}", err);

    assert_eq!(store.load_checkpoint(ACCOUNT, Collection::Messages).await.unwrap(), before);
    assert!(store.get(ACCOUNT, Collection::Messages, "m2").await.unwrap().is_none());

    // Next successful pull picks up exactly where the last commit left off.
    flaky.fail_pulls(0);
    let outcome = pull.pull_once().await.unwrap();
    assert_eq!(outcome.fetched, 1);
}

/// Test: a failed push keeps every row pending for the next round
#[tokio::test]
async fn failed_push_keeps_rows_pending() {
    let remote = fast_remote();
    let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint(ACCOUNT))));
    let store = Arc::new(MemoryStore::new());
    for id in ["m1", "m2"] {
        store
            .write_local(ACCOUNT, Collection::Messages, message(id, "T1", 1, &[]))
            .await
            .unwrap();
    }

    let push = PushEngine::new(Collection::Messages, store.clone(), flaky.clone(), 10)
        .with_retry(RetryConfig::testing())
        .with_circuit(lenient_circuit());

    flaky.fail_pushes(10);
    assert!(push.push_pending().await.is_err());
    assert_eq!(store.pending_count(ACCOUNT, Collection::Messages).await.unwrap(), 2);
    assert!(remote.store(ACCOUNT, Collection::Messages).await.unwrap().is_empty());

    flaky.fail_pushes(0);
    let outcome = push.push_pending().await.unwrap();
    assert_eq!(outcome.acknowledged, 2);
    assert_eq!(remote.store(ACCOUNT, Collection::Messages).await.unwrap().len(), 2);
}

/// Test: repeated edits while offline coalesce into one row per document
#[tokio::test]
async fn offline_edits_coalesce_on_reconnect() {
    let remote = fast_remote();
    let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint(ACCOUNT))));
    let store = Arc::new(MemoryStore::new());
    for subject in ["draft 1", "draft 2", "draft 3"] {
        store
            .write_local(
                ACCOUNT,
                Collection::Messages,
                message("m1", "T1", 1, &[]).with_field("subject", subject),
            )
            .await
            .unwrap();
    }

    let push = PushEngine::new(Collection::Messages, store.clone(), flaky.clone(), 10)
        .with_retry(RetryConfig::testing());
    let outcome = push.push_pending().await.unwrap();
    assert_eq!(outcome.rows, 1);
    assert_eq!(outcome.acknowledged, 3);

    let rows = flaky.pushed_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].new_document_state.field("subject"),
        Some(&serde_json::json!("draft 3"))
    );
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Test: an open circuit stops calling the remote and recovers later
#[tokio::test]
async fn circuit_opens_under_outage_and_recovers() {
    let remote = fast_remote();
    remote.upsert(ACCOUNT, Collection::Messages, message("m1", "T1", 1, &[])).await;
    let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint(ACCOUNT))));
    flaky.fail_pulls(1000);

    let circuit = Arc::new(RemoteCircuit::with_configs(CircuitConfig::testing(), CircuitConfig::testing()));
    let store = Arc::new(MemoryStore::new());
    let pull = PullEngine::new(Collection::Messages, store.clone(), flaky.clone(), 10)
        .with_retry(single_attempt())
        .with_circuit(circuit.clone());

    for _ in 0..6 {
        assert!(pull.pull_once().await.is_err());
    }
    assert!(flaky.pull_calls() < 6, "open circuit must short-circuit calls");
    assert!(circuit.pulls.rejections() > 0);
    assert!(circuit.any_open());

    flaky.fail_pulls(0);
    let mut recovered = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        if pull.pull_once().await.is_ok() {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "circuit never let a call through after recovery timeout");
    assert!(store.get(ACCOUNT, Collection::Messages, "m1").await.unwrap().is_some());
}

/// Test: a controller rides out an outage and reaches Streaming
#[tokio::test]
async fn controller_recovers_from_outage() {
    let remote = fast_remote();
    remote.upsert(ACCOUNT, Collection::Messages, message("m1", "T1", 1, &[])).await;
    let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint(ACCOUNT))));
    flaky.fail_pulls(7);

    let store = Arc::new(MemoryStore::new());
    let controller = ReplicationController::new(
        Collection::Messages,
        ControllerSettings::testing(),
        store.clone(),
        flaky.clone(),
    )
    .with_circuit(lenient_circuit());

    let mut states = controller.state_receiver();
    controller.start().await.unwrap();

    let reached = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if *states.borrow_and_update() == ControllerState::Streaming {
                break;
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "controller never reached Streaming");
    assert!(flaky.pull_calls() >= 8, "every injected failure should have been consumed");
    assert!(store.get(ACCOUNT, Collection::Messages, "m1").await.unwrap().is_some());

    controller.shutdown().await;
    assert_eq!(controller.state(), ControllerState::Stopped);
}

// =============================================================================
// Malformed Remote Data
// =============================================================================

/// Remote that serves its pages in descending order.
struct ScrambledRemote {
    inner: Arc<dyn RemoteEndpoint>,
}

impl RemoteEndpoint for ScrambledRemote {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn pull<'a>(&'a self, collection: Collection, request: &'a PullRequest) -> BoxFuture<'a, ChangeBatch> {
        Box::pin(async move {
            let mut batch = self.inner.pull(collection, request).await?;
            batch.documents.reverse();
            Ok(batch)
        })
    }

    fn push<'a>(&'a self, collection: Collection, rows: &'a [ChangeRow]) -> BoxFuture<'a, Vec<Document>> {
        self.inner.push(collection, rows)
    }

    fn subscribe(&self, collection: Collection) -> BoxFuture<'_, Option<LiveFeed>> {
        self.inner.subscribe(collection)
    }
}

/// Test: an out-of-order page is rejected whole, nothing half-applied
#[tokio::test]
async fn out_of_order_page_is_rejected_atomically() {
    let remote = fast_remote();
    for id in ["m1", "m2", "m3"] {
        remote.upsert(ACCOUNT, Collection::Messages, message(id, "T1", 1, &[])).await;
    }
    let scrambled = Arc::new(ScrambledRemote {
        inner: Arc::new(remote.endpoint(ACCOUNT)),
    });
    let store = Arc::new(MemoryStore::new());
    let pull = PullEngine::new(Collection::Messages, store.clone(), scrambled, 10).with_retry(single_attempt());

    let err = pull.pull_once().await.unwrap_err();
    assert!(matches!(err, ReplicationError::Codec(_)), "got {}", err);
    assert!(store.scan(ACCOUNT, Collection::Messages).await.unwrap().is_empty());
    assert!(store.load_checkpoint(ACCOUNT, Collection::Messages).await.unwrap().is_none());
}

// =============================================================================
// Crash Recovery (SQLite)
// =============================================================================

/// Test: pull resumes from the persisted checkpoint after a restart
#[tokio::test]
async fn pull_resumes_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let remote = fast_remote();
    for i in 0..5 {
        remote
            .upsert(ACCOUNT, Collection::Messages, message(&format!("m{}", i), "T1", i, &[]))
            .await;
    }
    let endpoint: Arc<dyn RemoteEndpoint> = Arc::new(remote.endpoint(ACCOUNT));

    let checkpoint = {
        let store = Arc::new(SqliteStore::new(&path).await.unwrap());
        let pull = PullEngine::new(Collection::Messages, store.clone(), endpoint.clone(), 2)
            .with_retry(RetryConfig::testing());
        let outcome = pull.pull_once().await.unwrap();
        assert_eq!(outcome.fetched, 2);
        store.close().await;
        outcome.checkpoint
    };

    // "Crash" and restart
    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    assert_eq!(
        store.load_checkpoint(ACCOUNT, Collection::Messages).await.unwrap(),
        Some(checkpoint)
    );

    let pull = PullEngine::new(Collection::Messages, store.clone(), endpoint, 2).with_retry(RetryConfig::testing());
    let summary = pull.pull_until_caught_up().await.unwrap();
    assert_eq!(summary.fetched, 3);
    assert_eq!(store.scan(ACCOUNT, Collection::Messages).await.unwrap().len(), 5);
    store.close().await;
}

/// Test: unacknowledged local changes survive a restart and are pushed
#[tokio::test]
async fn pending_changes_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let remote = fast_remote();

    {
        let store = SqliteStore::new(&path).await.unwrap();
        store
            .write_local(ACCOUNT, Collection::Contacts, contact("p1", "Bob"))
            .await
            .unwrap();
        store.close().await;
    }

    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    assert_eq!(store.pending_count(ACCOUNT, Collection::Contacts).await.unwrap(), 1);

    let push = PushEngine::new(Collection::Contacts, store.clone(), Arc::new(remote.endpoint(ACCOUNT)), 10)
        .with_retry(RetryConfig::testing());
    let outcome = push.push_pending().await.unwrap();
    assert_eq!(outcome.acknowledged, 1);
    assert!(remote.get(ACCOUNT, Collection::Contacts, "p1").await.unwrap().is_some());
    store.close().await;
}

/// Test: live batches never move the checkpoint past unseen changes
#[tokio::test]
async fn uncommitted_live_batch_leaves_checkpoint_alone() {
    let store = Arc::new(MemoryStore::new());
    let remote = fast_remote();
    let pull = PullEngine::new(Collection::Messages, store.clone(), Arc::new(remote.endpoint(ACCOUNT)), 10);

    let doc = message("m9", "T1", 1, &[]);
    let batch = ChangeBatch {
        collection: Collection::Messages,
        checkpoint: Checkpoint::of(&doc),
        documents: vec![doc],
    };
    pull.apply_live(batch, false).await.unwrap();
    assert!(store.get(ACCOUNT, Collection::Messages, "m9").await.unwrap().is_some());
    assert!(store.load_checkpoint(ACCOUNT, Collection::Messages).await.unwrap().is_none());
}

// =============================================================================
// Aggregation Under Load
// =============================================================================

/// Test: a burst larger than the commit feed still converges
#[tokio::test]
async fn aggregation_converges_after_burst() {
    const BURST: usize = 4_500;

    let store = Arc::new(MemoryStore::new());
    let service = AggregationService::spawn(
        store.clone(),
        &AggregationConfig {
            enabled: true,
            backfill_on_start: false,
            max_event_attempts: 3,
            retry_delay: "5ms".to_string(),
        },
    );

    for i in 0..BURST {
        let tag = if i % 3 == 0 { "x" } else { "y" };
        store
            .write_local(
                ACCOUNT,
                Collection::Messages,
                message(&format!("m{:05}", i), &format!("T{}", i % 10), i as i64, &[tag]),
            )
            .await
            .unwrap();
    }

    let expected_x = (BURST / 3) as i64;
    let expected_y = (BURST - BURST / 3) as i64;
    let converged = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let x = count_of(store.as_ref(), Collection::Tags, "x").await;
            let y = count_of(store.as_ref(), Collection::Tags, "y").await;
            if x == Some(expected_x) && y == Some(expected_y) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "aggregation never converged after burst");

    let summary = service.backfill_all().await.unwrap();
    assert_eq!(summary.messages, BURST);
    assert_eq!(summary.records_written(), 0, "backfill found drift after convergence");
    service.shutdown().await;
}

/// Test: messages committed while aggregation was down are repaired by backfill
#[tokio::test]
async fn backfill_repairs_missed_events() {
    let store = Arc::new(MemoryStore::new());
    for (id, tags) in [("m1", ["x"]), ("m2", ["x"]), ("m3", ["y"])] {
        store
            .write_local(ACCOUNT, Collection::Messages, message(id, "T1", 1, &tags))
            .await
            .unwrap();
    }
    assert_eq!(count_of(store.as_ref(), Collection::Tags, "x").await, None);

    let service = AggregationService::spawn(
        store.clone(),
        &AggregationConfig {
            enabled: true,
            backfill_on_start: true,
            max_event_attempts: 3,
            retry_delay: "5ms".to_string(),
        },
    );
    eventually("startup backfill counted x", || async {
        count_of(store.as_ref(), Collection::Tags, "x").await == Some(2)
    })
    .await;
    assert_eq!(count_of(store.as_ref(), Collection::Tags, "y").await, Some(1));
    service.shutdown().await;
}
