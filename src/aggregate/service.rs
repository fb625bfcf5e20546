//! Background aggregation driven by the store's commit feed.
//!
//! The service is the single writer of derived collections. It consumes
//! every committed message (local or remote), applies tag, category and
//! thread changes in one commit per message, and falls back to a backfill
//! whenever it may have missed something:
//!
//! - the feed lagged past its capacity → backfill every account
//! - an event kept failing after its retries → backfill that account
//!
//! Derived commits are emitted on the same feed with
//! [`ChangeOrigin::Derived`](crate::store::ChangeOrigin) and ignored here.

use super::backfill::{self, BackfillSummary, Scope};
use super::{AggregationEngine, ThreadAssembler};
use crate::config::AggregationConfig;
use crate::document::{Collection, Document};
use crate::error::Result;
use crate::metrics;
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::store::{CommittedChange, DerivedCommit, LocalStore};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Serializes every derived write behind one lock.
struct Aggregator {
    store: Arc<dyn LocalStore>,
    counts: AggregationEngine,
    threads: ThreadAssembler,
    write_lock: tokio::sync::Mutex<()>,
    retry: RetryConfig,
}

impl Aggregator {
    fn new(store: Arc<dyn LocalStore>, retry: RetryConfig) -> Self {
        Self {
            counts: AggregationEngine::new(store.clone()),
            threads: ThreadAssembler::new(store.clone()),
            store,
            write_lock: tokio::sync::Mutex::new(()),
            retry,
        }
    }

    /// Apply the current stored version of `message`.
    ///
    /// Events can arrive after a newer commit of the same message; reading
    /// the store keeps a stale event from undoing it.
    async fn apply(&self, account_id: &str, message: &Document) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .store
            .get(account_id, Collection::Messages, &message.id)
            .await?
            .unwrap_or_else(|| message.clone());

        let mut commit = DerivedCommit::default();
        let touched = self.counts.plan(account_id, &current, &mut commit).await?
            + self.threads.plan(account_id, &current, &mut commit).await?;
        if !commit.is_empty() {
            self.store.commit_derived(account_id, commit).await?;
        }
        Ok(touched)
    }

    async fn backfill(&self, account_id: &str) -> Result<BackfillSummary> {
        let _guard = self.write_lock.lock().await;
        backfill::run(self.store.as_ref(), account_id, Scope::All).await
    }

    async fn backfill_all(&self) -> Result<BackfillSummary> {
        let _guard = self.write_lock.lock().await;
        backfill::backfill_all(self.store.as_ref()).await
    }
}

/// Handle to the running aggregation task.
pub struct AggregationService {
    aggregator: Arc<Aggregator>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationService {
    /// Subscribe to the commit feed and start aggregating.
    ///
    /// The feed subscription is taken before this returns, so no commit made
    /// after `spawn` is missed.
    pub fn spawn(store: Arc<dyn LocalStore>, config: &AggregationConfig) -> Self {
        let feed = store.subscribe();
        let aggregator = Arc::new(Aggregator::new(store, config.retry_config()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(
            run(aggregator.clone(), feed, config.backfill_on_start, shutdown_rx)
                .instrument(tracing::info_span!("aggregation")),
        );

        Self {
            aggregator,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Rebuild one account's derived collections now.
    pub async fn backfill(&self, account_id: &str) -> Result<BackfillSummary> {
        self.aggregator.backfill(account_id).await
    }

    /// Rebuild every account's derived collections now.
    pub async fn backfill_all(&self) -> Result<BackfillSummary> {
        self.aggregator.backfill_all().await
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop after the event in flight; pending feed events are dropped.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Aggregation task ended abnormally");
            }
        }
    }
}

async fn run(
    aggregator: Arc<Aggregator>,
    mut feed: broadcast::Receiver<CommittedChange>,
    backfill_on_start: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow_and_update() {
        debug!("Shutdown requested before start");
        return;
    }

    if backfill_on_start {
        match aggregator.backfill_all().await {
            Ok(summary) => info!(
                messages = summary.messages,
                records = summary.records_written(),
                "Startup backfill complete"
            ),
            Err(e) => error!(error = %e, "Startup backfill failed"),
        }
    }

    info!("Aggregation service started");
    let mut repair: BTreeSet<String> = BTreeSet::new();

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }

            event = feed.recv() => match event {
                Ok(change) if change.collection == Collection::Messages => {
                    handle_message(&aggregator, &change, &shutdown_rx, &mut repair).await;
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Commit feed lagged, rebuilding derived collections");
                    metrics::record_aggregation_repair("lagged");
                    if let Err(e) = aggregator.backfill_all().await {
                        error!(error = %e, "Lag repair failed");
                    }
                    repair.clear();
                }
                Err(RecvError::Closed) => {
                    debug!("Commit feed closed");
                    break;
                }
            }
        }

        for account_id in std::mem::take(&mut repair) {
            metrics::record_aggregation_repair("skipped_event");
            if let Err(e) = aggregator.backfill(&account_id).await {
                error!(account_id = %account_id, error = %e, "Repair backfill failed");
            }
        }
    }

    info!("Aggregation service stopped");
}

async fn handle_message(
    aggregator: &Aggregator,
    change: &CommittedChange,
    shutdown_rx: &watch::Receiver<bool>,
    repair: &mut BTreeSet<String>,
) {
    let account_id = change.account_id.as_str();
    let message = &change.document;

    let outcome = retry_with_backoff(&aggregator.retry, "aggregate_message", shutdown_rx, move || {
        aggregator.apply(account_id, message)
    })
    .await;

    match outcome {
        Ok(0) => metrics::record_aggregation_event("unchanged"),
        Ok(touched) => {
            metrics::record_aggregation_event("applied");
            debug!(account_id, message_id = %message.id, touched, "Aggregated message");
        }
        Err(e) => {
            metrics::record_aggregation_event("skipped");
            error!(
                account_id,
                message_id = %message.id,
                error = %e,
                "Giving up on message event, scheduling repair"
            );
            repair.insert(account_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::message_count;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn config(backfill_on_start: bool) -> AggregationConfig {
        AggregationConfig {
            enabled: true,
            backfill_on_start,
            max_event_attempts: 3,
            retry_delay: "5ms".to_string(),
        }
    }

    fn message(id: &str, thread: &str, tags: &[&str]) -> Document {
        Document::new("A", id, Utc::now())
            .with_field("threadId", thread)
            .with_field("tags", json!(tags))
    }

    async fn tag_count(store: &MemoryStore, tag: &str) -> Option<i64> {
        store
            .get("A", Collection::Tags, tag)
            .await
            .unwrap()
            .map(|d| message_count(&d))
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_service_follows_the_feed() {
        let store = Arc::new(MemoryStore::new());
        let service = AggregationService::spawn(store.clone(), &config(false));

        store.write_local("A", Collection::Messages, message("m1", "T1", &["x"])).await.unwrap();
        store.write_local("A", Collection::Messages, message("m2", "T1", &["x"])).await.unwrap();

        eventually(|| async { tag_count(&store, "x").await == Some(2) }).await;
        eventually(|| async { store.get("A", Collection::Threads, "T1").await.unwrap().is_some() }).await;

        store.write_local("A", Collection::Messages, message("m2", "T1", &["y"])).await.unwrap();
        eventually(|| async { tag_count(&store, "y").await == Some(1) }).await;
        assert_eq!(tag_count(&store, "x").await, Some(1));

        service.shutdown().await;
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_startup_backfill_covers_existing_messages() {
        let store = Arc::new(MemoryStore::new());
        store.write_local("A", Collection::Messages, message("m1", "T1", &["x"])).await.unwrap();

        let service = AggregationService::spawn(store.clone(), &config(true));
        eventually(|| async { tag_count(&store, "x").await == Some(1) }).await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_backfill() {
        let store = Arc::new(MemoryStore::new());
        let service = AggregationService::spawn(store.clone(), &config(false));
        service.shutdown().await;

        store.write_local("A", Collection::Messages, message("m1", "T1", &["x"])).await.unwrap();
        let summary = service.backfill("A").await.unwrap();
        assert_eq!(summary.messages, 1);
        assert_eq!(tag_count(&store, "x").await, Some(1));
    }

    #[tokio::test]
    async fn test_stale_event_uses_stored_version() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = Aggregator::new(store.clone(), RetryConfig::testing());

        let old = store.write_local("A", Collection::Messages, message("m1", "T1", &["x"])).await.unwrap();
        store.write_local("A", Collection::Messages, message("m1", "T1", &["y"])).await.unwrap();

        aggregator.apply("A", &old).await.unwrap();
        assert_eq!(tag_count(&store, "x").await, None);
        assert_eq!(tag_count(&store, "y").await, Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_skips_backfill() {
        let store = Arc::new(MemoryStore::new());
        store.write_local("A", Collection::Messages, message("m1", "T1", &["x"])).await.unwrap();
        let aggregator = Arc::new(Aggregator::new(store.clone(), RetryConfig::testing()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        tokio::time::timeout(Duration::from_secs(5), run(aggregator, store.subscribe(), true, shutdown_rx))
            .await
            .expect("run should return when shutdown is already set");

        assert_eq!(tag_count(&store, "x").await, None);
        assert!(store.get("A", Collection::Threads, "T1").await.unwrap().is_none());
    }
}
