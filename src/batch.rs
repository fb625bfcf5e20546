//! Change batches: pull pages, push rows, and latest-wins coalescing.
//!
//! # Pull
//!
//! ```text
//! PullRequest { since, limit } ──▶ remote ──▶ ChangeBatch { documents ↑(updatedAt,key), checkpoint }
//!                                                      │
//!                         checkpoint = last document, or `since` when empty (caught up)
//! ```
//!
//! [`paginate`] is the composite-cursor algorithm the authoritative tier
//! runs: filter strictly after `(updatedAt, key)`, sort ascending, truncate.
//!
//! # Push
//!
//! Pending local change rows are coalesced per document before sending
//! (latest state wins, the earliest assumed master state is kept), then
//! encoded as `{ rows: [{ newDocumentState, assumedMasterState }] }`.
use crate::checkpoint::Checkpoint;
use crate::document::{Collection, Document};
use crate::error::{ReplicationError, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Largest page the remote serves.
pub const SERVER_MAX_LIMIT: usize = 100;

/// Page size the remote substitutes for an out-of-range limit.
pub const SERVER_DEFAULT_LIMIT: usize = 10;

/// A bounded request for changes after a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// `None` means from the beginning of time.
    pub checkpoint: Option<Checkpoint>,
    pub limit: usize,
}

impl PullRequest {
    pub fn new(checkpoint: Option<Checkpoint>, limit: usize) -> Self {
        Self { checkpoint, limit }
    }

    pub fn from_origin(limit: usize) -> Self {
        Self::new(None, limit)
    }

    /// The cursor this request starts after.
    pub fn since(&self) -> Checkpoint {
        self.checkpoint.clone().unwrap_or_else(Checkpoint::origin)
    }

    /// The page size the remote will actually serve.
    pub fn capped_limit(&self) -> usize {
        if self.limit == 0 || self.limit > SERVER_MAX_LIMIT {
            SERVER_DEFAULT_LIMIT
        } else {
            self.limit
        }
    }

    pub fn query_pairs(&self, collection: Collection) -> Vec<(String, String)> {
        let mut pairs = self.since().query_pairs(collection);
        pairs.push(("limit".to_string(), self.limit.to_string()));
        pairs
    }
}

/// An ordered batch of documents plus the checkpoint that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub collection: Collection,
    pub documents: Vec<Document>,
    pub checkpoint: Checkpoint,
}

impl ChangeBatch {
    pub fn empty(collection: Collection, checkpoint: Checkpoint) -> Self {
        Self {
            collection,
            documents: Vec::new(),
            checkpoint,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// A page shorter than the requested size means the puller is caught up.
    pub fn is_caught_up(&self, requested: usize) -> bool {
        self.documents.len() < requested
    }

    /// Largest document cursor in the batch.
    pub fn max_checkpoint(&self) -> Option<Checkpoint> {
        self.documents.iter().map(Checkpoint::of).max()
    }

    /// Decode `{ <docsField>: [...], checkpoint: {...} }`.
    ///
    /// A missing checkpoint falls back to the largest document cursor, or
    /// `since` for an empty batch.
    pub fn decode(collection: Collection, account_id: &str, body: &Value, since: &Checkpoint) -> Result<Self> {
        let Value::Object(map) = body else {
            return Err(ReplicationError::Codec(format!(
                "{} batch body is not an object",
                collection
            )));
        };

        let documents = match map.get(collection.docs_field()) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(|item| Document::from_wire(collection, account_id, item))
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(ReplicationError::Codec(format!(
                    "{} batch field {} is not an array: {}",
                    collection,
                    collection.docs_field(),
                    other
                )))
            }
        };

        let mut batch = Self {
            collection,
            documents,
            checkpoint: since.clone(),
        };

        batch.checkpoint = match map.get("checkpoint") {
            Some(value) if !value.is_null() => Checkpoint::decode(collection, value)?,
            _ => batch.max_checkpoint().unwrap_or_else(|| since.clone()),
        };

        Ok(batch)
    }

    pub fn encode(&self) -> Value {
        let docs: Vec<Value> = self
            .documents
            .iter()
            .map(|d| d.to_wire(self.collection))
            .collect();
        let mut map = Map::new();
        map.insert(self.collection.docs_field().to_string(), Value::Array(docs));
        map.insert("checkpoint".to_string(), self.checkpoint.encode(self.collection));
        Value::Object(map)
    }

    /// Check the pull ordering contract against the request cursor.
    ///
    /// Documents must be strictly ascending and strictly after `since`; a
    /// non-empty batch's checkpoint must be its last document's cursor.
    pub fn validate_order(&self, since: &Checkpoint) -> Result<()> {
        let mut previous = since.clone();
        for doc in &self.documents {
            if !previous.admits(doc) {
                return Err(ReplicationError::Codec(format!(
                    "{} batch out of order: {} is not after {}",
                    self.collection,
                    Checkpoint::of(doc),
                    previous
                )));
            }
            previous = Checkpoint::of(doc);
        }
        if !self.documents.is_empty() && self.checkpoint != previous {
            return Err(ReplicationError::Codec(format!(
                "{} batch checkpoint {} does not match last document {}",
                self.collection, self.checkpoint, previous
            )));
        }
        Ok(())
    }

    /// Sort documents by cursor (live batches arrive in commit order, but the
    /// coalescer may reorder).
    pub fn sort(&mut self) {
        self.documents.sort_by_key(Checkpoint::of);
    }
}

/// Composite-cursor pagination over an authoritative document set.
///
/// Returns at most `limit` documents strictly after `since`, ascending by
/// `(updatedAt, key)`. The batch checkpoint is the last returned document,
/// or `since` unchanged when nothing is newer.
pub fn paginate<'a, I>(collection: Collection, docs: I, since: &Checkpoint, limit: usize) -> ChangeBatch
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut page: Vec<Document> = docs
        .into_iter()
        .filter(|doc| since.admits(doc))
        .cloned()
        .collect();
    page.sort_by_key(Checkpoint::of);
    page.truncate(limit);

    let checkpoint = page.last().map(Checkpoint::of).unwrap_or_else(|| since.clone());
    ChangeBatch {
        collection,
        documents: page,
        checkpoint,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Push rows
// ═══════════════════════════════════════════════════════════════════════════════

/// One document state destined for the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub new_document_state: Document,
    /// Last remote-confirmed state the local edit was based on.
    /// `None` for documents created locally.
    pub assumed_master_state: Option<Document>,
}

impl ChangeRow {
    pub fn new(new_document_state: Document, assumed_master_state: Option<Document>) -> Self {
        Self {
            new_document_state,
            assumed_master_state,
        }
    }

    pub fn encode(&self, collection: Collection) -> Value {
        json!({
            "newDocumentState": self.new_document_state.to_wire(collection),
            "assumedMasterState": self
                .assumed_master_state
                .as_ref()
                .map(|d| d.to_wire(collection))
                .unwrap_or(Value::Null),
        })
    }

    pub fn decode(collection: Collection, account_id: &str, value: &Value) -> Result<Self> {
        let new_state = value
            .get("newDocumentState")
            .cloned()
            .ok_or_else(|| ReplicationError::Codec("push row missing newDocumentState".to_string()))?;
        let assumed = match value.get("assumedMasterState") {
            None | Some(Value::Null) => None,
            Some(v) => Some(Document::from_wire(collection, account_id, v.clone())?),
        };
        Ok(Self {
            new_document_state: Document::from_wire(collection, account_id, new_state)?,
            assumed_master_state: assumed,
        })
    }
}

/// Encode a push request body.
pub fn encode_push_body(collection: Collection, rows: &[ChangeRow]) -> Value {
    let rows: Vec<Value> = rows.iter().map(|r| r.encode(collection)).collect();
    json!({ "rows": rows })
}

/// Decode a push request body.
pub fn decode_push_body(collection: Collection, account_id: &str, body: &Value) -> Result<Vec<ChangeRow>> {
    match body.get("rows") {
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| ChangeRow::decode(collection, account_id, row))
            .collect(),
        _ => Err(ReplicationError::Codec("push body missing rows".to_string())),
    }
}

/// Remote answer to a push: the documents that lost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushResponse {
    pub conflicts: Vec<Document>,
}

impl PushResponse {
    pub fn decode(collection: Collection, account_id: &str, body: &Value) -> Result<Self> {
        let conflicts = match body.get("conflicts") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(|item| Document::from_wire(collection, account_id, item))
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(ReplicationError::Codec(format!(
                    "push response conflicts is not an array: {}",
                    other
                )))
            }
        };
        Ok(Self { conflicts })
    }

    pub fn encode(&self, collection: Collection) -> Value {
        let conflicts: Vec<Value> = self.conflicts.iter().map(|d| d.to_wire(collection)).collect();
        json!({ "conflicts": conflicts })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coalescing
// ═══════════════════════════════════════════════════════════════════════════════

/// A committed local mutation that has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Local commit sequence; defines commit order.
    pub seq: i64,
    pub collection: Collection,
    pub document: Document,
    pub assumed_master: Option<Document>,
}

/// Bounds for grouping live change events into one batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum documents per live batch.
    pub max_batch_size: usize,
    /// Maximum time to wait for a batch to fill.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay: Duration::from_secs(1),
        }
    }
}

impl BatchConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(5),
        }
    }
}

/// A coalesced push row and the highest pending sequence it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedRow {
    pub row: ChangeRow,
    pub first_seq: i64,
    pub through_seq: i64,
}

/// Accumulates pending changes keyed by document id (latest wins).
#[derive(Debug, Default)]
pub struct PendingRows {
    pending: HashMap<String, CoalescedRow>,
}

impl PendingRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change. A later change to the same document replaces the
    /// document state but keeps the earliest assumed master state.
    pub fn add(&mut self, change: PendingChange) {
        let PendingChange {
            seq,
            document,
            assumed_master,
            ..
        } = change;

        match self.pending.get_mut(&document.id) {
            Some(existing) if seq >= existing.through_seq => {
                existing.row.new_document_state = document;
                existing.through_seq = seq;
            }
            Some(existing) => {
                // Older row arriving late: its master state wins only if it
                // predates everything coalesced so far.
                if seq < existing.first_seq {
                    existing.row.assumed_master_state = assumed_master;
                    existing.first_seq = seq;
                }
            }
            None => {
                self.pending.insert(
                    document.id.clone(),
                    CoalescedRow {
                        row: ChangeRow::new(document, assumed_master),
                        first_seq: seq,
                        through_seq: seq,
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every coalesced row, ordered by the commit of its final state.
    pub fn drain(&mut self) -> Vec<CoalescedRow> {
        let mut rows: Vec<CoalescedRow> = self.pending.drain().map(|(_, row)| row).collect();
        rows.sort_by_key(|r| r.through_seq);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_timestamp;

    fn doc(id: &str, at: &str) -> Document {
        Document::new("acct", id, parse_timestamp(at).unwrap())
    }

    fn change(seq: i64, id: &str, at: &str, master: Option<Document>) -> PendingChange {
        PendingChange {
            seq,
            collection: Collection::Messages,
            document: doc(id, at).with_field("rev", seq),
            assumed_master: master,
        }
    }

    #[test]
    fn test_capped_limit() {
        assert_eq!(PullRequest::from_origin(0).capped_limit(), SERVER_DEFAULT_LIMIT);
        assert_eq!(PullRequest::from_origin(101).capped_limit(), SERVER_DEFAULT_LIMIT);
        assert_eq!(PullRequest::from_origin(100).capped_limit(), 100);
        assert_eq!(PullRequest::from_origin(7).capped_limit(), 7);
    }

    #[test]
    fn test_query_pairs_from_origin() {
        let pairs = PullRequest::from_origin(25).query_pairs(Collection::Messages);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1], ("messageId".to_string(), String::new()));
        assert_eq!(pairs[2], ("limit".to_string(), "25".to_string()));
    }

    #[test]
    fn test_paginate_breaks_timestamp_ties_by_key() {
        let docs = vec![
            doc("c", "2025-01-01T00:00:01Z"),
            doc("b", "2025-01-01T00:00:00Z"),
            doc("a", "2025-01-01T00:00:00Z"),
            doc("d", "2025-01-01T00:00:02Z"),
        ];
        let first = paginate(Collection::Messages, &docs, &Checkpoint::origin(), 1);
        assert_eq!(first.documents[0].id, "a");

        let second = paginate(Collection::Messages, &docs, &first.checkpoint, 2);
        let ids: Vec<_> = second.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(second.checkpoint > first.checkpoint);

        let third = paginate(Collection::Messages, &docs, &second.checkpoint, 2);
        assert_eq!(third.len(), 1);
        assert!(third.is_caught_up(2));

        let done = paginate(Collection::Messages, &docs, &third.checkpoint, 2);
        assert!(done.is_empty());
        assert_eq!(done.checkpoint, third.checkpoint);
    }

    #[test]
    fn test_decode_batch_without_checkpoint_uses_last_document() {
        let body = json!({
            "people": [
                {"personId": "p1", "updatedAt": "2025-01-01T00:00:00Z"},
                {"personId": "p2", "updatedAt": "2025-01-01T00:00:05Z"}
            ]
        });
        let batch = ChangeBatch::decode(Collection::Contacts, "acct", &body, &Checkpoint::origin()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.checkpoint.key, "p2");
        batch.validate_order(&Checkpoint::origin()).unwrap();
    }

    #[test]
    fn test_decode_null_documents_is_empty_batch() {
        let since = Checkpoint::new(parse_timestamp("2025-01-01T00:00:00Z").unwrap(), "x");
        let body = json!({"tags": null, "checkpoint": since.encode(Collection::Tags)});
        let batch = ChangeBatch::decode(Collection::Tags, "acct", &body, &since).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.checkpoint, since);
    }

    #[test]
    fn test_validate_order_rejects_regression() {
        let batch = ChangeBatch {
            collection: Collection::Messages,
            documents: vec![doc("b", "2025-01-01T00:00:01Z"), doc("a", "2025-01-01T00:00:00Z")],
            checkpoint: Checkpoint::new(parse_timestamp("2025-01-01T00:00:00Z").unwrap(), "a"),
        };
        assert!(batch.validate_order(&Checkpoint::origin()).is_err());
    }

    #[test]
    fn test_validate_order_rejects_mismatched_checkpoint() {
        let batch = ChangeBatch {
            collection: Collection::Messages,
            documents: vec![doc("a", "2025-01-01T00:00:00Z")],
            checkpoint: Checkpoint::origin(),
        };
        assert!(batch.validate_order(&Checkpoint::origin()).is_err());
    }

    #[test]
    fn test_push_body_shape() {
        let row = ChangeRow::new(doc("m1", "2025-01-01T00:00:00Z"), None);
        let body = encode_push_body(Collection::Messages, &[row.clone()]);
        assert_eq!(body["rows"][0]["newDocumentState"]["messageId"], json!("m1"));
        assert!(body["rows"][0]["assumedMasterState"].is_null());
        let rows = decode_push_body(Collection::Messages, "acct", &body).unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[test]
    fn test_push_response_decode() {
        let body = json!({"conflicts": [{"messageId": "m1", "updatedAt": "2025-01-01T00:00:00Z", "isDeleted": true}]});
        let response = PushResponse::decode(Collection::Messages, "acct", &body).unwrap();
        assert_eq!(response.conflicts.len(), 1);
        assert!(response.conflicts[0].is_deleted);
        assert!(PushResponse::decode(Collection::Messages, "acct", &json!({})).unwrap().conflicts.is_empty());
    }

    #[test]
    fn test_pending_rows_latest_state_earliest_master() {
        let master = doc("m1", "2024-12-31T00:00:00Z");
        let mut rows = PendingRows::new();
        rows.add(change(1, "m1", "2025-01-01T00:00:00Z", Some(master.clone())));
        rows.add(change(2, "m2", "2025-01-01T00:00:01Z", None));
        rows.add(change(3, "m1", "2025-01-01T00:00:02Z", Some(doc("m1", "2025-01-01T00:00:00Z"))));
        assert_eq!(rows.len(), 2);

        let drained = rows.drain();
        assert!(rows.is_empty());
        assert_eq!(drained[0].row.new_document_state.id, "m2");
        let m1 = &drained[1];
        assert_eq!(m1.through_seq, 3);
        assert_eq!(m1.first_seq, 1);
        assert_eq!(m1.row.new_document_state.field("rev"), Some(&json!(3)));
        assert_eq!(m1.row.assumed_master_state, Some(master));
    }

    #[test]
    fn test_pending_rows_late_row_between_seqs_keeps_earliest_master() {
        let master_a = doc("m1", "2024-12-01T00:00:00Z");
        let master_b = doc("m1", "2024-12-02T00:00:00Z");
        let master_c = doc("m1", "2024-12-03T00:00:00Z");
        let mut rows = PendingRows::new();
        rows.add(change(1, "m1", "2025-01-01T00:00:01Z", Some(master_a.clone())));
        rows.add(change(5, "m1", "2025-01-01T00:00:05Z", Some(master_c)));
        rows.add(change(3, "m1", "2025-01-01T00:00:03Z", Some(master_b)));

        let drained = rows.drain();
        assert_eq!(drained.len(), 1);
        let m1 = &drained[0];
        assert_eq!(m1.first_seq, 1);
        assert_eq!(m1.through_seq, 5);
        assert_eq!(m1.row.new_document_state.field("rev"), Some(&json!(5)));
        assert_eq!(m1.row.assumed_master_state, Some(master_a));
    }

    #[test]
    fn test_pending_rows_late_oldest_row_takes_master() {
        let master_early = doc("m1", "2024-12-01T00:00:00Z");
        let mut rows = PendingRows::new();
        rows.add(change(4, "m1", "2025-01-01T00:00:04Z", Some(doc("m1", "2025-01-01T00:00:03Z"))));
        rows.add(change(2, "m1", "2025-01-01T00:00:02Z", Some(master_early.clone())));

        let m1 = &rows.drain()[0];
        assert_eq!(m1.first_seq, 2);
        assert_eq!(m1.through_seq, 4);
        assert_eq!(m1.row.new_document_state.field("rev"), Some(&json!(4)));
        assert_eq!(m1.row.assumed_master_state, Some(master_early));
    }
}
