//! In-memory [`LocalStore`].
//!
//! Every operation runs under one write lock, which makes each call a single
//! atomic commit. The commit feed is sent while the lock is held so feed
//! order is commit order.
//!
//! Also backs [`MemoryRemote`](crate::remote::MemoryRemote): the
//! authoritative tier writes through [`MemoryStore::put_authoritative`].

use super::{
    ensure_writable, ApplyOutcome, BoxFuture, ChangeOrigin, ChangeStatus, CommittedChange,
    DerivedCommit, Dimension, LocalStore, FEED_CAPACITY,
};
use crate::batch::{ChangeBatch, PendingChange};
use crate::checkpoint::Checkpoint;
use crate::conflict::Resolution;
use crate::document::{Collection, CommitClock, Document};
use crate::error::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct ChangeRecord {
    account_id: String,
    collection: Collection,
    document: Document,
    assumed_master: Option<Document>,
    status: ChangeStatus,
    reason: Option<String>,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<(String, Collection), BTreeMap<String, Document>>,
    checkpoints: HashMap<(String, Collection), Checkpoint>,
    changes: BTreeMap<i64, ChangeRecord>,
    last_seq: i64,
    memberships: HashMap<(String, Dimension, String), Vec<String>>,
}

impl Inner {
    fn document(&self, account_id: &str, collection: Collection, id: &str) -> Option<&Document> {
        self.documents
            .get(&(account_id.to_string(), collection))
            .and_then(|docs| docs.get(id))
    }

    fn put(&mut self, account_id: &str, collection: Collection, document: Document) {
        self.documents
            .entry((account_id.to_string(), collection))
            .or_default()
            .insert(document.id.clone(), document);
    }

    fn journal(
        &mut self,
        account_id: &str,
        collection: Collection,
        document: Document,
        assumed_master: Option<Document>,
    ) -> i64 {
        self.last_seq += 1;
        self.changes.insert(
            self.last_seq,
            ChangeRecord {
                account_id: account_id.to_string(),
                collection,
                document,
                assumed_master,
                status: ChangeStatus::Pending,
                reason: None,
            },
        );
        self.last_seq
    }

    /// Move matching pending rows of one document to `status`.
    fn settle<F>(
        &mut self,
        account_id: &str,
        collection: Collection,
        document_id: &str,
        status: ChangeStatus,
        reason: Option<&str>,
        mut matches: F,
    ) -> usize
    where
        F: FnMut(i64, &ChangeRecord) -> bool,
    {
        let mut settled = 0;
        for (seq, record) in self.changes.iter_mut() {
            if record.status == ChangeStatus::Pending
                && record.collection == collection
                && record.account_id == account_id
                && record.document.id == document_id
                && matches(*seq, record)
            {
                record.status = status;
                record.reason = reason.map(str::to_string);
                settled += 1;
            }
        }
        settled
    }

    fn has_pending_after(&self, account_id: &str, collection: Collection, document_id: &str, seq: i64) -> bool {
        self.changes.range(seq + 1..).any(|(_, r)| {
            r.status == ChangeStatus::Pending
                && r.collection == collection
                && r.account_id == account_id
                && r.document.id == document_id
        })
    }
}

/// Volatile local store.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: CommitClock,
    feed: broadcast::Sender<CommittedChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            clock: CommitClock::new(),
            feed,
        }
    }

    fn emit(&self, account_id: &str, collection: Collection, document: Document, origin: ChangeOrigin) {
        // No subscribers is fine.
        let _ = self.feed.send(CommittedChange {
            account_id: account_id.to_string(),
            collection,
            document,
            origin,
        });
    }

    /// Authoritative write: stamp a fresh commit time, keep the original
    /// `createdAt`, and bump the `revisionCount` field.
    pub async fn put_authoritative(&self, account_id: &str, collection: Collection, mut document: Document) -> Document {
        let mut inner = self.inner.write().await;
        let previous = inner.document(account_id, collection, &document.id).cloned();

        document.account_id = account_id.to_string();
        document.updated_at = self.clock.stamp();
        document.created_at = previous
            .as_ref()
            .and_then(|p| p.created_at)
            .or(document.created_at)
            .or(Some(document.updated_at));
        let revision = previous
            .as_ref()
            .and_then(|p| p.field("revisionCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        document.fields.insert("revisionCount".to_string(), Value::from(revision + 1));

        inner.put(account_id, collection, document.clone());
        self.emit(account_id, collection, document.clone(), ChangeOrigin::Remote);
        document
    }

    /// Status and reason of a journaled change row.
    pub async fn change_status(&self, seq: i64) -> Option<(ChangeStatus, Option<String>)> {
        let inner = self.inner.read().await;
        inner.changes.get(&seq).map(|r| (r.status, r.reason.clone()))
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, account_id: &str, collection: Collection, id: &str) -> BoxFuture<'_, Option<Document>> {
        let (account_id, id) = (account_id.to_string(), id.to_string());
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.document(&account_id, collection, &id).cloned())
        })
    }

    fn scan(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, Vec<Document>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .documents
                .get(&(account_id, collection))
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn accounts(&self, collection: Collection) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let mut accounts: Vec<String> = inner
                .documents
                .iter()
                .filter(|((_, c), docs)| *c == collection && !docs.is_empty())
                .map(|((account, _), _)| account.clone())
                .collect();
            accounts.sort();
            Ok(accounts)
        })
    }

    fn load_checkpoint(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, Option<Checkpoint>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.checkpoints.get(&(account_id, collection)).cloned())
        })
    }

    fn apply_batch<'a>(
        &'a self,
        account_id: &'a str,
        batch: &'a ChangeBatch,
        commit_checkpoint: bool,
    ) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let collection = batch.collection;
            let mut inner = self.inner.write().await;
            let mut outcome = ApplyOutcome::default();

            for incoming in &batch.documents {
                self.clock.observe(incoming.updated_at);
                let newer = inner
                    .document(account_id, collection, &incoming.id)
                    .map_or(true, |current| incoming.updated_at > current.updated_at);
                if !newer {
                    outcome.skipped += 1;
                    continue;
                }

                outcome.superseded += inner.settle(
                    account_id,
                    collection,
                    &incoming.id,
                    ChangeStatus::Superseded,
                    None,
                    |_, record| record.document.updated_at <= incoming.updated_at,
                );

                let mut document = incoming.clone();
                document.account_id = account_id.to_string();
                inner.put(account_id, collection, document.clone());
                self.emit(account_id, collection, document, ChangeOrigin::Remote);
                outcome.applied += 1;
            }

            if commit_checkpoint {
                let key = (account_id.to_string(), collection);
                let advance = inner
                    .checkpoints
                    .get(&key)
                    .map_or(true, |stored| batch.checkpoint > *stored);
                if advance {
                    inner.checkpoints.insert(key, batch.checkpoint.clone());
                }
            }

            debug!(
                account_id,
                %collection,
                applied = outcome.applied,
                skipped = outcome.skipped,
                "Applied batch"
            );
            Ok(outcome)
        })
    }

    fn write_local(&self, account_id: &str, collection: Collection, document: Document) -> BoxFuture<'_, Document> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            ensure_writable(collection, &document)?;
            let mut inner = self.inner.write().await;
            let previous = inner.document(&account_id, collection, &document.id).cloned();

            let mut document = document;
            document.account_id = account_id.clone();
            document.updated_at = self.clock.stamp();
            document.created_at = document
                .created_at
                .or_else(|| previous.as_ref().and_then(|p| p.created_at))
                .or(Some(document.updated_at));

            inner.put(&account_id, collection, document.clone());
            inner.journal(&account_id, collection, document.clone(), previous);
            self.emit(&account_id, collection, document.clone(), ChangeOrigin::Local);
            Ok(document)
        })
    }

    fn pending_changes(&self, account_id: &str, collection: Collection, limit: usize) -> BoxFuture<'_, Vec<PendingChange>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .changes
                .iter()
                .filter(|(_, r)| {
                    r.status == ChangeStatus::Pending && r.collection == collection && r.account_id == account_id
                })
                .take(limit)
                .map(|(seq, r)| PendingChange {
                    seq: *seq,
                    collection,
                    document: r.document.clone(),
                    assumed_master: r.assumed_master.clone(),
                })
                .collect())
        })
    }

    fn pending_count(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, usize> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .changes
                .values()
                .filter(|r| {
                    r.status == ChangeStatus::Pending && r.collection == collection && r.account_id == account_id
                })
                .count())
        })
    }

    fn acknowledge<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        acks: &'a [(String, i64)],
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let mut acknowledged = 0;
            for (document_id, through) in acks {
                acknowledged += inner.settle(
                    account_id,
                    collection,
                    document_id,
                    ChangeStatus::Acknowledged,
                    None,
                    |seq, _| seq <= *through,
                );
            }
            Ok(acknowledged)
        })
    }

    fn apply_resolution<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        resolution: &'a Resolution,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let id = resolution.document_id().to_string();
            let through = resolution.superseded_through();

            inner.settle(account_id, collection, &id, ChangeStatus::Superseded, None, |seq, _| {
                seq <= through
            });
            if inner.has_pending_after(account_id, collection, &id, through) {
                // A later local edit is already queued and carries the newest state.
                return Ok(());
            }

            match resolution {
                Resolution::TakeRemote { document, .. } => {
                    self.clock.observe(document.updated_at);
                    let current_is_older = inner
                        .document(account_id, collection, &id)
                        .map_or(true, |current| current.updated_at <= document.updated_at);
                    if current_is_older {
                        let mut document = document.clone();
                        document.account_id = account_id.to_string();
                        inner.put(account_id, collection, document.clone());
                        self.emit(account_id, collection, document, ChangeOrigin::Remote);
                    }
                }
                Resolution::KeepLocal { document, remote, .. } => {
                    self.clock.observe(remote.updated_at);
                    let mut document = document.clone();
                    document.account_id = account_id.to_string();
                    document.updated_at = self.clock.stamp();
                    inner.put(account_id, collection, document.clone());
                    inner.journal(account_id, collection, document.clone(), Some(remote.clone()));
                    self.emit(account_id, collection, document, ChangeOrigin::Local);
                }
            }
            Ok(())
        })
    }

    fn reject<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        document_id: &'a str,
        through_seq: i64,
        reason: &'a str,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            Ok(inner.settle(
                account_id,
                collection,
                document_id,
                ChangeStatus::Rejected,
                Some(reason),
                |seq, _| seq <= through_seq,
            ))
        })
    }

    fn memberships<'a>(
        &'a self,
        account_id: &'a str,
        dimension: Dimension,
        message_id: &'a str,
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .memberships
                .get(&(account_id.to_string(), dimension, message_id.to_string()))
                .cloned()
                .unwrap_or_default())
        })
    }

    fn commit_derived<'a>(&'a self, account_id: &'a str, commit: DerivedCommit) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;

            for dimension in &commit.reset_dimensions {
                inner
                    .memberships
                    .retain(|(account, dim, _), _| account != account_id || dim != dimension);
            }
            for update in commit.memberships {
                let key = (account_id.to_string(), update.dimension, update.message_id);
                if update.values.is_empty() {
                    inner.memberships.remove(&key);
                } else {
                    let mut values = update.values;
                    values.sort();
                    values.dedup();
                    inner.memberships.insert(key, values);
                }
            }

            let mut stored = Vec::with_capacity(commit.documents.len());
            for (collection, mut document) in commit.documents {
                document.account_id = account_id.to_string();
                document.updated_at = self.clock.stamp();
                inner.put(account_id, collection, document.clone());
                self.emit(account_id, collection, document.clone(), ChangeOrigin::Derived);
                stored.push(document);
            }
            Ok(stored)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<CommittedChange> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_timestamp;
    use crate::store::MembershipUpdate;
    use chrono::{DateTime, Utc};

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    fn remote_doc(id: &str, ts: &str) -> Document {
        Document::new("acct", id, at(ts)).with_field("subject", id)
    }

    fn batch(docs: Vec<Document>) -> ChangeBatch {
        let checkpoint = docs.last().map(Checkpoint::of).unwrap_or_default();
        ChangeBatch {
            collection: Collection::Messages,
            documents: docs,
            checkpoint,
        }
    }

    #[tokio::test]
    async fn test_apply_batch_is_idempotent() {
        let store = MemoryStore::new();
        let b = batch(vec![
            remote_doc("m1", "2025-01-01T00:00:00Z"),
            remote_doc("m2", "2025-01-01T00:00:01Z"),
        ]);

        let first = store.apply_batch("acct", &b, true).await.unwrap();
        assert_eq!(first.applied, 2);
        let snapshot = store.scan("acct", Collection::Messages).await.unwrap();

        let second = store.apply_batch("acct", &b, true).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(store.scan("acct", Collection::Messages).await.unwrap(), snapshot);
        assert_eq!(
            store.load_checkpoint("acct", Collection::Messages).await.unwrap(),
            Some(b.checkpoint.clone())
        );
    }

    #[tokio::test]
    async fn test_apply_batch_never_regresses() {
        let store = MemoryStore::new();
        store
            .apply_batch("acct", &batch(vec![remote_doc("m1", "2025-01-01T00:00:05Z")]), true)
            .await
            .unwrap();

        let stale = batch(vec![remote_doc("m1", "2025-01-01T00:00:01Z").with_field("subject", "old")]);
        let outcome = store.apply_batch("acct", &stale, true).await.unwrap();
        assert_eq!(outcome.skipped, 1);

        let doc = store.get("acct", Collection::Messages, "m1").await.unwrap().unwrap();
        assert_eq!(doc.field("subject"), Some(&Value::from("m1")));
        let cp = store.load_checkpoint("acct", Collection::Messages).await.unwrap().unwrap();
        assert_eq!(cp.updated_at, at("2025-01-01T00:00:05Z"));
    }

    #[tokio::test]
    async fn test_live_batch_without_checkpoint_commit() {
        let store = MemoryStore::new();
        let b = batch(vec![remote_doc("m1", "2025-01-01T00:00:00Z")]);
        store.apply_batch("acct", &b, false).await.unwrap();
        assert!(store.load_checkpoint("acct", Collection::Messages).await.unwrap().is_none());
        assert!(store.get("acct", Collection::Messages, "m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_local_journals_and_stamps() {
        let store = MemoryStore::new();
        store
            .apply_batch("acct", &batch(vec![remote_doc("m1", "2030-01-01T00:00:00Z")]), true)
            .await
            .unwrap();

        let edited = remote_doc("m1", "2000-01-01T00:00:00Z").with_field("subject", "edited");
        let written = store.write_local("acct", Collection::Messages, edited).await.unwrap();
        // Local stamps land after every remote time the store has seen.
        assert!(written.updated_at > at("2030-01-01T00:00:00Z"));

        let pending = store.pending_changes("acct", Collection::Messages, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].document, written);
        assert_eq!(
            pending[0].assumed_master.as_ref().map(|d| d.updated_at),
            Some(at("2030-01-01T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn test_write_local_rejects_derived() {
        let store = MemoryStore::new();
        let err = store
            .write_local("acct", Collection::Tags, Document::new("acct", "x", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ReplicationError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_acknowledge_respects_through_seq() {
        let store = MemoryStore::new();
        store.write_local("acct", Collection::Contacts, remote_doc("p1", "2025-01-01T00:00:00Z")).await.unwrap();
        store.write_local("acct", Collection::Contacts, remote_doc("p1", "2025-01-01T00:00:00Z")).await.unwrap();
        store.write_local("acct", Collection::Contacts, remote_doc("p1", "2025-01-01T00:00:00Z")).await.unwrap();

        let acked = store
            .acknowledge("acct", Collection::Contacts, &[("p1".to_string(), 2)])
            .await
            .unwrap();
        assert_eq!(acked, 2);
        assert_eq!(store.pending_count("acct", Collection::Contacts).await.unwrap(), 1);
        assert_eq!(store.change_status(1).await.unwrap().0, ChangeStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_newer_remote_supersedes_pending_row() {
        let store = MemoryStore::new();
        let written = store
            .write_local("acct", Collection::Messages, remote_doc("m1", "2025-01-01T00:00:00Z"))
            .await
            .unwrap();

        let mut newer = remote_doc("m1", "2025-01-01T00:00:00Z");
        newer.updated_at = written.updated_at + chrono::Duration::seconds(1);
        let outcome = store.apply_batch("acct", &batch(vec![newer]), true).await.unwrap();
        assert_eq!(outcome.superseded, 1);
        assert_eq!(store.pending_count("acct", Collection::Messages).await.unwrap(), 0);
        assert_eq!(store.change_status(1).await.unwrap().0, ChangeStatus::Superseded);
    }

    #[tokio::test]
    async fn test_keep_local_requeues_with_newer_stamp() {
        let store = MemoryStore::new();
        let written = store
            .write_local("acct", Collection::Messages, remote_doc("m1", "2025-01-01T00:00:00Z"))
            .await
            .unwrap();
        let mut remote = remote_doc("m1", "2025-01-01T00:00:00Z");
        remote.updated_at = written.updated_at - chrono::Duration::seconds(1);

        let resolution = Resolution::KeepLocal {
            document: written.clone(),
            remote: remote.clone(),
            superseded_through: 1,
        };
        store.apply_resolution("acct", Collection::Messages, &resolution).await.unwrap();

        let pending = store.pending_changes("acct", Collection::Messages, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
        assert!(pending[0].document.updated_at > written.updated_at);
        assert_eq!(pending[0].assumed_master, Some(remote));
    }

    #[tokio::test]
    async fn test_reject_records_reason() {
        let store = MemoryStore::new();
        store.write_local("acct", Collection::Messages, remote_doc("m1", "2025-01-01T00:00:00Z")).await.unwrap();
        let rejected = store
            .reject("acct", Collection::Messages, "m1", 1, "subject too long")
            .await
            .unwrap();
        assert_eq!(rejected, 1);
        let (status, reason) = store.change_status(1).await.unwrap();
        assert_eq!(status, ChangeStatus::Rejected);
        assert_eq!(reason.as_deref(), Some("subject too long"));
        assert_eq!(store.pending_count("acct", Collection::Messages).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_derived_memberships_and_feed() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe();

        let commit = DerivedCommit {
            reset_dimensions: Vec::new(),
            memberships: vec![MembershipUpdate {
                dimension: Dimension::Tag,
                message_id: "m1".to_string(),
                values: vec!["y".into(), "x".into(), "x".into()],
            }],
            documents: vec![(Collection::Tags, Document::new("acct", "x", Utc::now()).with_field("messageCount", 1))],
        };
        let stored = store.commit_derived("acct", commit).await.unwrap();
        assert_eq!(stored.len(), 1);

        assert_eq!(
            store.memberships("acct", Dimension::Tag, "m1").await.unwrap(),
            vec!["x".to_string(), "y".to_string()]
        );
        let event = feed.recv().await.unwrap();
        assert_eq!(event.origin, ChangeOrigin::Derived);
        assert_eq!(event.collection, Collection::Tags);

        let reset = DerivedCommit {
            reset_dimensions: vec![Dimension::Tag],
            ..Default::default()
        };
        store.commit_derived("acct", reset).await.unwrap();
        assert!(store.memberships("acct", Dimension::Tag, "m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_authoritative_counts_revisions() {
        let store = MemoryStore::new();
        let first = store
            .put_authoritative("acct", Collection::Messages, remote_doc("m1", "2025-01-01T00:00:00Z"))
            .await;
        let second = store
            .put_authoritative("acct", Collection::Messages, remote_doc("m1", "2025-01-01T00:00:00Z"))
            .await;
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.field("revisionCount"), Some(&Value::from(2)));
        assert_eq!(store.accounts(Collection::Messages).await.unwrap(), vec!["acct".to_string()]);
    }
}
