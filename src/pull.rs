//! Pull engine: bring the local copy of one collection up to date.
//!
//! # Flow
//!
//! ```text
//! load checkpoint ──▶ remote.pull(since, limit) ──▶ validate order ──▶ apply_batch(commit checkpoint)
//!        ▲                                                                       │
//!        └──────────────── short page? no: loop ◀────────────────────────────────┘
//! ```
//!
//! The checkpoint only advances inside the same commit as the documents it
//! covers, so a failure at any step leaves the previous checkpoint in place
//! and the next attempt re-requests the same page. Re-applying a page is a
//! no-op (documents are written only when strictly newer).
//!
//! # Resilience
//!
//! Remote calls go through the `pulls` circuit breaker, the optional shared
//! rate limiter and [`retry_with_backoff`]. A one-permit bulkhead keeps at
//! most one pull in flight per collection.

use crate::batch::{ChangeBatch, PullRequest};
use crate::checkpoint::Checkpoint;
use crate::circuit_breaker::RemoteCircuit;
use crate::document::Collection;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteEndpoint;
use crate::resilience::{retry_with_backoff, Bulkhead, RateLimiter, RetryConfig};
use crate::store::{ApplyOutcome, LocalStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Result of one pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct PullOutcome {
    pub fetched: usize,
    pub applied: ApplyOutcome,
    /// Checkpoint after this pull (the batch checkpoint).
    pub checkpoint: Checkpoint,
    /// The page was shorter than requested: nothing newer remains.
    pub caught_up: bool,
}

/// Totals of a catch-up run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullSummary {
    pub batches: usize,
    pub fetched: usize,
    pub applied: usize,
    pub checkpoint: Option<Checkpoint>,
}

/// Pulls one collection for one account.
pub struct PullEngine {
    account_id: String,
    collection: Collection,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteEndpoint>,
    circuit: Arc<RemoteCircuit>,
    retry: RetryConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
    batch_size: usize,
    bulkhead: Bulkhead,
    shutdown_rx: watch::Receiver<bool>,
}

impl PullEngine {
    pub fn new(
        collection: Collection,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteEndpoint>,
        batch_size: usize,
    ) -> Self {
        // A receiver whose sender is gone never reports shutdown.
        let (_, shutdown_rx) = watch::channel(false);
        Self {
            account_id: remote.account_id().to_string(),
            collection,
            store,
            remote,
            circuit: Arc::new(RemoteCircuit::new()),
            retry: RetryConfig::default(),
            rate_limiter: None,
            batch_size,
            bulkhead: Bulkhead::single_flight(),
            shutdown_rx,
        }
    }

    pub fn with_circuit(mut self, circuit: Arc<RemoteCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = shutdown_rx;
        self
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn fetch(&self, request: &PullRequest) -> Result<ChangeBatch> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
        self.circuit
            .pulls
            .guard(|| self.remote.pull(self.collection, request))
            .await
    }

    async fn apply(&self, batch: &ChangeBatch, commit_checkpoint: bool) -> Result<ApplyOutcome> {
        let operation = format!("apply {}", self.collection);
        retry_with_backoff(&self.retry, &operation, &self.shutdown_rx, || {
            self.store.apply_batch(&self.account_id, batch, commit_checkpoint)
        })
        .await
    }

    /// Fetch and commit the page after the stored checkpoint.
    #[instrument(skip(self), fields(account_id = %self.account_id, collection = %self.collection))]
    pub async fn pull_once(&self) -> Result<PullOutcome> {
        let _permit = self.bulkhead.acquire().await.map_err(|e| ReplicationError::Internal(e.to_string()))?;

        let checkpoint = self.store.load_checkpoint(&self.account_id, self.collection).await?;
        let request = PullRequest::new(checkpoint, self.batch_size);
        let since = request.since();

        let start = Instant::now();
        let operation = format!("pull {}", self.collection);
        let batch = retry_with_backoff(&self.retry, &operation, &self.shutdown_rx, || self.fetch(&request)).await?;
        metrics::record_pull_batch(self.collection, batch.len(), start.elapsed());

        if batch.collection != self.collection {
            return Err(ReplicationError::Codec(format!(
                "expected {} batch, got {}",
                self.collection, batch.collection
            )));
        }
        batch.validate_order(&since)?;

        let caught_up = batch.is_caught_up(request.capped_limit());
        let applied = if batch.is_empty() {
            ApplyOutcome::default()
        } else {
            self.apply(&batch, true).await?
        };
        metrics::record_documents_applied(self.collection, applied.applied, applied.skipped);

        debug!(
            fetched = batch.len(),
            applied = applied.applied,
            skipped = applied.skipped,
            checkpoint = %batch.checkpoint,
            caught_up,
            "Pull batch committed"
        );

        Ok(PullOutcome {
            fetched: batch.len(),
            applied,
            checkpoint: batch.checkpoint,
            caught_up,
        })
    }

    /// Pull page after page until a short page says nothing newer remains.
    pub async fn pull_until_caught_up(&self) -> Result<PullSummary> {
        let mut summary = PullSummary::default();
        loop {
            if *self.shutdown_rx.borrow() {
                return Err(ReplicationError::Shutdown);
            }
            let outcome = self.pull_once().await?;
            summary.batches += 1;
            summary.fetched += outcome.fetched;
            summary.applied += outcome.applied.applied;
            summary.checkpoint = Some(outcome.checkpoint);
            if outcome.caught_up {
                break;
            }
        }

        if summary.fetched > 0 {
            info!(
                account_id = %self.account_id,
                collection = %self.collection,
                batches = summary.batches,
                fetched = summary.fetched,
                applied = summary.applied,
                "Caught up with remote"
            );
        }
        Ok(summary)
    }

    /// Apply a live-push batch. The checkpoint advances only when
    /// `commit_checkpoint` is set.
    pub async fn apply_live(&self, mut batch: ChangeBatch, commit_checkpoint: bool) -> Result<ApplyOutcome> {
        if batch.collection != self.collection {
            return Err(ReplicationError::Codec(format!(
                "expected {} live batch, got {}",
                self.collection, batch.collection
            )));
        }
        metrics::record_live_batch(self.collection, batch.len());
        batch.sort();
        if let Some(max) = batch.max_checkpoint() {
            if max > batch.checkpoint {
                batch.checkpoint = max;
            }
        }

        let applied = self.apply(&batch, commit_checkpoint).await?;
        metrics::record_documents_applied(self.collection, applied.applied, applied.skipped);
        debug!(
            account_id = %self.account_id,
            collection = %self.collection,
            documents = batch.len(),
            applied = applied.applied,
            commit_checkpoint,
            "Live batch applied"
        );
        Ok(applied)
    }
}
