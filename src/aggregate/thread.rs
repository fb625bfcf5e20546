//! Thread rollups.
//!
//! One rollup document per `(account, threadId)`:
//!
//! ```text
//! {
//!   "threadId": "T1",
//!   "messages": [ { messageId, internalDate, sender, subject, snippet, labels, tags, categories }, ... ],
//!   "mostRecentInternalDate": 1730800000000,
//!   "labels": [...], "tags": [...], "categories": [...],   ← unions over member summaries
//!   "isDeleted": false                                     ← true once the last member leaves
//! }
//! ```
//!
//! Summaries are kept in arrival order and carry their
//! own labels, tags and categories, so every derived field is recomputed
//! from the rollup alone when a summary is added, replaced or removed.
//! A thread-membership row remembers which rollup a message currently sits
//! in, which is how moves between threads are detected.

use super::{backfill, dimension_values, message_fields, BackfillSummary};
use crate::document::{Collection, Document, MessageFields, Person};
use crate::error::{ReplicationError, Result};
use crate::store::{DerivedCommit, Dimension, LocalStore, MembershipUpdate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const MESSAGES_FIELD: &str = "messages";
const MOST_RECENT_FIELD: &str = "mostRecentInternalDate";
const LABELS_FIELD: &str = "labels";
const TAGS_FIELD: &str = "tags";
const CATEGORIES_FIELD: &str = "categories";

/// One message as it appears inside a thread rollup.
///
/// A rollup lists its summaries in arrival order: a new member is appended,
/// an updated member keeps its slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageSummary {
    pub message_id: String,
    pub internal_date: i64,
    pub sender: Person,
    pub subject: String,
    pub snippet: String,
    pub labels: Vec<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
}

impl MessageSummary {
    pub fn of(message_id: &str, fields: &MessageFields) -> Self {
        let distinct = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .filter(|v| !v.is_empty())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        Self {
            message_id: message_id.to_string(),
            internal_date: fields.internal_date,
            sender: fields.sender.clone(),
            subject: fields.subject.clone(),
            snippet: fields.snippet.clone(),
            labels: distinct(&fields.labels),
            tags: distinct(&fields.tags),
            categories: distinct(&fields.categories),
        }
    }
}

/// In-memory form of a thread rollup document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadRollup {
    pub thread_id: String,
    pub messages: Vec<MessageSummary>,
    pub most_recent_internal_date: i64,
    pub labels: Vec<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
}

impl ThreadRollup {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    /// Decode the member summaries of a stored rollup. Derived fields are
    /// recomputed rather than trusted.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let messages = match doc.field(MESSAGES_FIELD) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value::<Vec<MessageSummary>>(value.clone()).map_err(|e| {
                ReplicationError::Codec(format!("thread {} has malformed messages: {}", doc.id, e))
            })?,
        };
        let mut rollup = Self {
            thread_id: doc.id.clone(),
            messages,
            ..Default::default()
        };
        rollup.recompute();
        Ok(rollup)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(|m| m.message_id.as_str())
    }

    /// Insert or replace the summary with the same `messageId`.
    /// Returns whether anything changed.
    pub fn upsert(&mut self, summary: MessageSummary) -> bool {
        match self.messages.iter_mut().find(|m| m.message_id == summary.message_id) {
            Some(existing) if *existing == summary => return false,
            Some(existing) => *existing = summary,
            None => self.messages.push(summary),
        }
        self.recompute();
        true
    }

    /// Drop a member. Returns whether it was present.
    pub fn remove(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.message_id != message_id);
        if self.messages.len() == before {
            return false;
        }
        self.recompute();
        true
    }

    fn recompute(&mut self) {
        self.most_recent_internal_date = self.messages.iter().map(|m| m.internal_date).max().unwrap_or(0);

        let union = |pick: fn(&MessageSummary) -> &Vec<String>| -> Vec<String> {
            self.messages
                .iter()
                .flat_map(|m| pick(m).iter().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        let labels = union(|m| &m.labels);
        let tags = union(|m| &m.tags);
        let categories = union(|m| &m.categories);
        self.labels = labels;
        self.tags = tags;
        self.categories = categories;
    }

    /// Encode as a document. An empty rollup is soft-deleted; `previous`
    /// supplies `createdAt`.
    pub fn into_document(self, account_id: &str, previous: Option<&Document>) -> Document {
        let now = Utc::now();
        let mut doc = Document::new(account_id, self.thread_id, now);
        doc.created_at = previous.and_then(|p| p.created_at).or(Some(now));
        doc.is_deleted = self.messages.is_empty();
        doc.fields.insert(
            MESSAGES_FIELD.to_string(),
            serde_json::to_value(&self.messages).unwrap_or(Value::Array(Vec::new())),
        );
        doc.fields
            .insert(MOST_RECENT_FIELD.to_string(), Value::from(self.most_recent_internal_date));
        doc.fields.insert(LABELS_FIELD.to_string(), Value::from(self.labels));
        doc.fields.insert(TAGS_FIELD.to_string(), Value::from(self.tags));
        doc.fields.insert(CATEGORIES_FIELD.to_string(), Value::from(self.categories));
        doc
    }
}

/// Maintains thread rollups from committed messages, one message at a time.
pub struct ThreadAssembler {
    store: Arc<dyn LocalStore>,
}

impl ThreadAssembler {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    async fn load(&self, account_id: &str, thread_id: &str) -> Result<(Option<Document>, ThreadRollup)> {
        let previous = self.store.get(account_id, Collection::Threads, thread_id).await?;
        let rollup = match &previous {
            Some(doc) => ThreadRollup::from_document(doc)?,
            None => ThreadRollup::new(thread_id),
        };
        Ok((previous, rollup))
    }

    /// Add the rollup edits for `message` to `commit`.
    ///
    /// Returns the number of rollups touched (two when the message moved).
    pub async fn plan(&self, account_id: &str, message: &Document, commit: &mut DerivedCommit) -> Result<usize> {
        let fields = message_fields(message);
        let target = dimension_values(message, &fields, Dimension::Thread).into_iter().next();
        let stored = self
            .store
            .memberships(account_id, Dimension::Thread, &message.id)
            .await?
            .into_iter()
            .next();

        let mut touched: BTreeMap<String, (Option<Document>, ThreadRollup)> = BTreeMap::new();

        if let Some(old) = stored.as_ref().filter(|old| Some(*old) != target.as_ref()) {
            let (previous, mut rollup) = self.load(account_id, old).await?;
            if rollup.remove(&message.id) {
                touched.insert(old.clone(), (previous, rollup));
            }
        }

        if let Some(thread_id) = &target {
            let (previous, mut rollup) = self.load(account_id, thread_id).await?;
            // A soft-deleted rollup revives when a member joins.
            let revived = previous.as_ref().is_some_and(|p| p.is_deleted);
            if rollup.upsert(MessageSummary::of(&message.id, &fields)) || revived {
                touched.insert(thread_id.clone(), (previous, rollup));
            }
        }

        if stored != target {
            commit.memberships.push(MembershipUpdate {
                dimension: Dimension::Thread,
                message_id: message.id.clone(),
                values: target.into_iter().collect(),
            });
        }

        let count = touched.len();
        for (_, (previous, rollup)) in touched {
            commit
                .documents
                .push((Collection::Threads, rollup.into_document(account_id, previous.as_ref())));
        }
        Ok(count)
    }

    /// Apply one committed message: edit its rollup(s), then commit atomically.
    pub async fn apply_message(&self, account_id: &str, message: &Document) -> Result<usize> {
        let mut commit = DerivedCommit::default();
        let touched = self.plan(account_id, message, &mut commit).await?;
        if !commit.is_empty() {
            self.store.commit_derived(account_id, commit).await?;
        }
        Ok(touched)
    }

    /// Rebuild every rollup of the account from a full message scan.
    pub async fn backfill(&self, account_id: &str) -> Result<BackfillSummary> {
        backfill::run(self.store.as_ref(), account_id, backfill::Scope::Threads).await
    }
}
