//! In-process authoritative tier.
//!
//! [`MemoryRemote`] implements the server side of the replication protocol
//! on top of a [`MemoryStore`]: composite-cursor pagination for pulls, the
//! authoritative push rule, and coalesced live batches. Every
//! [`MemoryEndpoint`] handed out shares the same backing store, so several
//! clients (devices) of one account converge through it.
//!
//! # Push Rule
//!
//! ```text
//! current = None                         → accept
//! row.updatedAt >  current.updatedAt     → accept
//! row has the same content as current    → no-op (redelivery)
//! otherwise                              → conflict: return current
//! ```
//!
//! Accepted writes are re-stamped by the backing store's commit clock, so
//! remote commits strictly increase and pull cursors never skip one.

use super::{BoxFuture, LiveFeed, RemoteEndpoint, LIVE_CHANNEL_CAPACITY};
use crate::batch::{paginate, BatchConfig, ChangeBatch, ChangeRow, PullRequest};
use crate::document::{Collection, Document};
use crate::error::{ReplicationError, Result};
use crate::store::{ChangeOrigin, CommittedChange, LocalStore, MemoryStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Extra field the remote bumps on every accepted write.
pub const REVISION_FIELD: &str = "revisionCount";

struct Shared {
    store: Arc<MemoryStore>,
    /// Serializes the compare-and-write of pushes.
    push_lock: Mutex<()>,
    live_batching: BatchConfig,
    disconnect: broadcast::Sender<()>,
}

/// Reference authoritative tier shared by any number of endpoints.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Live batches coalesce up to 10 changes or 1 second.
    pub fn new() -> Self {
        Self::with_live_batching(BatchConfig::default())
    }

    pub fn with_live_batching(live_batching: BatchConfig) -> Self {
        let (disconnect, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                store: Arc::new(MemoryStore::new()),
                push_lock: Mutex::new(()),
                live_batching,
                disconnect,
            }),
        }
    }

    /// An endpoint acting for `account_id`.
    pub fn endpoint(&self, account_id: impl Into<String>) -> MemoryEndpoint {
        MemoryEndpoint {
            remote: self.clone(),
            account_id: account_id.into(),
        }
    }

    /// Server-side write (as if another device or an ingestion pipeline
    /// committed it). Returns the stored, re-stamped document.
    pub async fn upsert(&self, account_id: &str, collection: Collection, document: Document) -> Document {
        self.shared.store.put_authoritative(account_id, collection, document).await
    }

    pub async fn get(&self, account_id: &str, collection: Collection, id: &str) -> Result<Option<Document>> {
        self.shared.store.get(account_id, collection, id).await
    }

    /// Every stored document of a collection for an account.
    pub async fn store(&self, account_id: &str, collection: Collection) -> Result<Vec<Document>> {
        self.shared.store.scan(account_id, collection).await
    }

    /// The backing store, e.g. to run server-side aggregation over it.
    pub fn backing_store(&self) -> Arc<MemoryStore> {
        self.shared.store.clone()
    }

    /// Drop every open live subscription (simulates a server restart).
    pub fn disconnect_live(&self) {
        let _ = self.shared.disconnect.send(());
    }

    async fn pull(&self, account_id: &str, collection: Collection, request: &PullRequest) -> Result<ChangeBatch> {
        let docs = self.shared.store.scan(account_id, collection).await?;
        Ok(paginate(collection, &docs, &request.since(), request.capped_limit()))
    }

    async fn push(&self, account_id: &str, collection: Collection, rows: &[ChangeRow]) -> Result<Vec<Document>> {
        if !collection.is_pushable() {
            return Err(ReplicationError::Validation {
                collection,
                document_id: String::new(),
                message: "collection has no push endpoint".to_string(),
            });
        }

        let _guard = self.shared.push_lock.lock().await;
        let mut conflicts = Vec::new();

        for row in rows {
            let incoming = &row.new_document_state;
            if incoming.account_id != account_id {
                return Err(ReplicationError::Validation {
                    collection,
                    document_id: incoming.id.clone(),
                    message: format!("document belongs to account {}", incoming.account_id),
                });
            }

            let current = self.shared.store.get(account_id, collection, &incoming.id).await?;
            match current {
                None => {
                    self.upsert(account_id, collection, incoming.clone()).await;
                }
                Some(current) if incoming.updated_at > current.updated_at => {
                    self.upsert(account_id, collection, incoming.clone()).await;
                }
                Some(current) if same_state(incoming, &current) => {
                    debug!(%collection, document_id = %incoming.id, "Redelivered push row, no-op");
                }
                Some(current) => {
                    debug!(%collection, document_id = %incoming.id, "Push row lost, returning conflict");
                    conflicts.push(current);
                }
            }
        }
        Ok(conflicts)
    }

    fn subscribe(&self, account_id: &str, collection: Collection) -> Option<LiveFeed> {
        collection.live_path()?;

        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        let changes = self.shared.store.subscribe();
        let disconnect = self.shared.disconnect.subscribe();
        let batching = self.shared.live_batching.clone();
        let account_id = account_id.to_string();

        let task = tokio::spawn(async move {
            run_live_stream(account_id, collection, batching, changes, disconnect, tx).await;
        });
        Some(LiveFeed::new(rx, task))
    }
}

/// Content equality that ignores the server-maintained revision counter.
fn same_state(row: &Document, current: &Document) -> bool {
    let mut row = row.clone();
    let mut current = current.clone();
    row.fields.remove(REVISION_FIELD);
    current.fields.remove(REVISION_FIELD);
    row.same_content(&current)
}

fn relevant(change: &CommittedChange, account_id: &str, collection: Collection) -> bool {
    change.account_id == account_id && change.collection == collection && change.origin != ChangeOrigin::Local
}

/// Coalesce committed changes into live batches until the consumer or the
/// server goes away.
async fn run_live_stream(
    account_id: String,
    collection: Collection,
    batching: BatchConfig,
    mut changes: broadcast::Receiver<CommittedChange>,
    mut disconnect: broadcast::Receiver<()>,
    tx: mpsc::Sender<Result<ChangeBatch>>,
) {
    loop {
        // Wait for the first change of the next batch.
        let first = tokio::select! {
            _ = disconnect.recv() => return,
            _ = tx.closed() => return,
            change = changes.recv() => change,
        };

        let mut pending: HashMap<String, Document> = HashMap::new();
        match first {
            Ok(change) if relevant(&change, &account_id, collection) => {
                pending.insert(change.document.id.clone(), change.document);
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%collection, skipped, "Live stream lagged, closing");
                let _ = tx
                    .send(Err(ReplicationError::transport_msg(
                        format!("live {}", collection),
                        format!("stream lagged by {} changes", skipped),
                    )))
                    .await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }

        let deadline = Instant::now() + batching.max_batch_delay;
        while pending.len() < batching.max_batch_size {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = disconnect.recv() => return,
                change = changes.recv() => match change {
                    Ok(change) if relevant(&change, &account_id, collection) => {
                        pending.insert(change.document.id.clone(), change.document);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let mut documents: Vec<Document> = pending.into_values().collect();
        documents.sort_by_key(crate::checkpoint::Checkpoint::of);
        let Some(checkpoint) = documents.last().map(crate::checkpoint::Checkpoint::of) else {
            continue;
        };
        let batch = ChangeBatch {
            collection,
            documents,
            checkpoint,
        };
        if tx.send(Ok(batch)).await.is_err() {
            return;
        }
    }
}

/// A [`MemoryRemote`] bound to one account.
#[derive(Clone)]
pub struct MemoryEndpoint {
    remote: MemoryRemote,
    account_id: String,
}

impl MemoryEndpoint {
    pub fn remote(&self) -> &MemoryRemote {
        &self.remote
    }
}

impl RemoteEndpoint for MemoryEndpoint {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn pull<'a>(&'a self, collection: Collection, request: &'a PullRequest) -> BoxFuture<'a, ChangeBatch> {
        Box::pin(self.remote.pull(&self.account_id, collection, request))
    }

    fn push<'a>(&'a self, collection: Collection, rows: &'a [ChangeRow]) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(self.remote.push(&self.account_id, collection, rows))
    }

    fn subscribe(&self, collection: Collection) -> BoxFuture<'_, Option<LiveFeed>> {
        Box::pin(async move { Ok(self.remote.subscribe(&self.account_id, collection)) })
    }
}
