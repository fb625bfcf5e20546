//! Push engine: send pending local change rows to the remote.
//!
//! # Round
//!
//! ```text
//! pending_changes(limit) ──▶ coalesce per document ──▶ remote.push(rows)
//!                                                          │
//!              ┌───────────────────────────────────────────┼──────────────────────┐
//!              ▼                                           ▼                      ▼
//!     row not in conflicts                        row in conflicts         Validation error
//!     acknowledge(id, through_seq)           ConflictResolver::resolve    re-send rows one by one,
//!                                                                         reject the offender
//! ```
//!
//! Rows stay pending until acknowledged, superseded or rejected, so a failed
//! push is simply retried later with the same rows. The remote treats a
//! redelivered row as a no-op.

use crate::batch::{ChangeRow, CoalescedRow, PendingRows};
use crate::circuit_breaker::RemoteCircuit;
use crate::conflict::ConflictResolver;
use crate::document::{Collection, Document};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteEndpoint;
use crate::resilience::{retry_with_backoff, Bulkhead, RateLimiter, RetryConfig};
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Upper bound on push rounds per call. Kept-local conflict resolutions
/// journal fresh rows, so a call could otherwise chase its own tail.
const MAX_PUSH_ROUNDS: usize = 8;

/// A change row the remote refused permanently.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub document_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Totals of one [`PushEngine::push_pending`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Coalesced rows sent.
    pub rows: usize,
    /// Pending change rows acknowledged.
    pub acknowledged: usize,
    pub conflicts: usize,
    pub rejected: usize,
    /// Rows still pending afterwards.
    pub remaining: usize,
}

/// Pushes one collection for one account.
pub struct PushEngine {
    account_id: String,
    collection: Collection,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteEndpoint>,
    resolver: ConflictResolver,
    circuit: Arc<RemoteCircuit>,
    retry: RetryConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
    batch_size: usize,
    bulkhead: Bulkhead,
    shutdown_rx: watch::Receiver<bool>,
    last_rejection: Mutex<Option<Rejection>>,
}

impl PushEngine {
    pub fn new(
        collection: Collection,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteEndpoint>,
        batch_size: usize,
    ) -> Self {
        let (_, shutdown_rx) = watch::channel(false);
        Self {
            account_id: remote.account_id().to_string(),
            collection,
            resolver: ConflictResolver::new(store.clone()),
            store,
            remote,
            circuit: Arc::new(RemoteCircuit::new()),
            retry: RetryConfig::default(),
            rate_limiter: None,
            batch_size: batch_size.max(1),
            bulkhead: Bulkhead::single_flight(),
            shutdown_rx,
            last_rejection: Mutex::new(None),
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

    /// Most recent permanent rejection, if any.
    pub fn last_rejection(&self) -> Option<Rejection> {
        self.last_rejection.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn send(&self, rows: &[ChangeRow]) -> Result<Vec<Document>> {
        let operation = format!("push {}", self.collection);
        retry_with_backoff(&self.retry, &operation, &self.shutdown_rx, || async {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            self.circuit
                .pushes
                .guard(|| self.remote.push(self.collection, rows))
                .await
        })
        .await
    }

    /// Push every pending row (bounded number of rounds).
    #[instrument(skip(self), fields(account_id = %self.account_id, collection = %self.collection))]
    pub async fn push_pending(&self) -> Result<PushOutcome> {
        let mut outcome = PushOutcome::default();
        if !self.collection.is_pushable() {
            return Ok(outcome);
        }
        let _permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))?;

        for _ in 0..MAX_PUSH_ROUNDS {
            let pending = self
                .store
                .pending_changes(&self.account_id, self.collection, self.batch_size)
                .await?;
            if pending.is_empty() {
                break;
            }

            let mut coalescer = PendingRows::new();
            for change in pending {
                coalescer.add(change);
            }
            let rows = coalescer.drain();
            outcome.rows += rows.len();
            self.push_round(&rows, &mut outcome).await?;
        }

        outcome.remaining = self.store.pending_count(&self.account_id, self.collection).await?;
        metrics::set_pending_push(self.collection, outcome.remaining);
        Ok(outcome)
    }

    async fn push_round(&self, rows: &[CoalescedRow], outcome: &mut PushOutcome) -> Result<()> {
        let payload: Vec<ChangeRow> = rows.iter().map(|r| r.row.clone()).collect();
        let start = Instant::now();

        match self.send(&payload).await {
            Ok(conflicts) => {
                let (acked, conflicted) = self.settle(rows, conflicts).await?;
                metrics::record_push_batch(self.collection, rows.len(), acked, conflicted, start.elapsed());
                outcome.acknowledged += acked;
                outcome.conflicts += conflicted;
                debug!(rows = rows.len(), acknowledged = acked, conflicts = conflicted, "Push round settled");
                Ok(())
            }
            Err(ReplicationError::Validation { message, .. }) => {
                warn!(rows = rows.len(), error = %message, "Push batch rejected, isolating offending rows");
                for row in rows {
                    self.push_single(row, outcome).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-send one row on its own so a permanent rejection can be pinned on it.
    async fn push_single(&self, row: &CoalescedRow, outcome: &mut PushOutcome) -> Result<()> {
        let start = Instant::now();
        match self.send(std::slice::from_ref(&row.row)).await {
            Ok(conflicts) => {
                let (acked, conflicted) = self.settle(std::slice::from_ref(row), conflicts).await?;
                metrics::record_push_batch(self.collection, 1, acked, conflicted, start.elapsed());
                outcome.acknowledged += acked;
                outcome.conflicts += conflicted;
                Ok(())
            }
            Err(ReplicationError::Validation { message, .. }) => {
                let document_id = row.row.new_document_state.id.clone();
                let rejected = self
                    .store
                    .reject(&self.account_id, self.collection, &document_id, row.through_seq, &message)
                    .await?;
                warn!(
                    document_id = %document_id,
                    through_seq = row.through_seq,
                    reason = %message,
                    "Change row rejected permanently"
                );
                metrics::record_rejection(self.collection);
                outcome.rejected += rejected;
                *self.last_rejection.lock().unwrap_or_else(|e| e.into_inner()) = Some(Rejection {
                    document_id,
                    reason: message,
                    at: Utc::now(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Acknowledge accepted rows and resolve conflicted ones.
    /// Returns `(acknowledged change rows, conflicts)`.
    async fn settle(&self, rows: &[CoalescedRow], conflicts: Vec<Document>) -> Result<(usize, usize)> {
        let mut by_id: HashMap<String, Document> =
            conflicts.into_iter().map(|doc| (doc.id.clone(), doc)).collect();

        let mut acks = Vec::new();
        let mut conflicted = 0;
        for row in rows {
            let pushed = &row.row.new_document_state;
            match by_id.remove(&pushed.id) {
                Some(remote) => {
                    self.resolver
                        .resolve(&self.account_id, self.collection, Some(pushed), remote, row.through_seq)
                        .await?;
                    conflicted += 1;
                }
                None => acks.push((pushed.id.clone(), row.through_seq)),
            }
        }
        for stray in by_id.keys() {
            warn!(document_id = %stray, "Remote returned a conflict for a row that was not pushed");
        }

        let acked = if acks.is_empty() {
            0
        } else {
            self.store.acknowledge(&self.account_id, self.collection, &acks).await?
        };
        Ok((acked, conflicted))
    }
}
