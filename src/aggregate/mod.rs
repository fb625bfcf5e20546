//! Derived collections maintained from committed messages.
//!
//! Three derived collections hang off the Messages collection:
//!
//! | Collection | Key | Maintained by |
//! |------------|-----|---------------|
//! | `tags` | tag value | [`AggregationEngine`] |
//! | `categories` | category value | [`AggregationEngine`] |
//! | `threads` | thread id | [`ThreadAssembler`] |
//!
//! # Incremental Path
//!
//! Each committed message is diffed against the membership rows the store
//! remembers for it (its tags, categories and thread). The diff turns into
//! `+1`/`-1` count deltas and rollup summary edits, which commit together
//! with the new membership rows in one [`DerivedCommit`]. Redelivering the
//! same message finds nothing to diff and writes nothing.
//!
//! # Repair Path
//!
//! [`backfill`] recomputes everything for an account from a full message
//! scan. It runs once at startup (optionally) and whenever the incremental
//! path could have missed an event.
//!
//! Callers must serialize derived writes per account; [`AggregationService`]
//! is that single writer.

pub mod backfill;
pub mod service;
pub mod thread;

pub use backfill::BackfillSummary;
pub use service::AggregationService;
pub use thread::{MessageSummary, ThreadAssembler, ThreadRollup};

use crate::document::{Collection, Document, MessageFields};
use crate::error::Result;
use crate::store::{DerivedCommit, Dimension, LocalStore, MembershipUpdate};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

/// Count field on tag and category records.
pub const MESSAGE_COUNT_FIELD: &str = "messageCount";

/// Counted dimensions and the collection holding their records.
pub(crate) const COUNTED: [(Dimension, Collection); 2] = [
    (Dimension::Tag, Collection::Tags),
    (Dimension::Category, Collection::Categories),
];

/// Typed view of a message, or an empty one if its fields are malformed.
///
/// A malformed message references no tag, category or thread; backfill
/// treats it the same way, so both paths agree.
pub(crate) fn message_fields(message: &Document) -> MessageFields {
    MessageFields::from_document(message).unwrap_or_else(|e| {
        warn!(message_id = %message.id, error = %e, "Treating malformed message as unlinked");
        MessageFields::default()
    })
}

/// Distinct non-empty values of one dimension. Deleted messages have none.
pub(crate) fn dimension_values(message: &Document, fields: &MessageFields, dimension: Dimension) -> BTreeSet<String> {
    if message.is_deleted {
        return BTreeSet::new();
    }
    let values = match dimension {
        Dimension::Tag => &fields.tags,
        Dimension::Category => &fields.categories,
        Dimension::Thread => return fields.thread_id.iter().filter(|t| !t.is_empty()).cloned().collect(),
    };
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

pub fn message_count(record: &Document) -> i64 {
    record.field(MESSAGE_COUNT_FIELD).and_then(Value::as_i64).unwrap_or(0)
}

/// Tag/category record with `count`, carrying over what `previous` had.
///
/// Records are never deleted: a value nobody references keeps a zero count.
pub(crate) fn aggregate_record(account_id: &str, value: &str, count: i64, previous: Option<&Document>) -> Document {
    let now = Utc::now();
    let mut record = previous
        .cloned()
        .unwrap_or_else(|| Document::new(account_id, value, now));
    record.fields.insert(MESSAGE_COUNT_FIELD.to_string(), Value::from(count.max(0)));
    record.is_deleted = false;
    record.created_at = record.created_at.or(Some(now));
    record
}

/// Maintains tag and category message counts.
pub struct AggregationEngine {
    store: Arc<dyn LocalStore>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Add the membership and count changes for `message` to `commit`.
    ///
    /// Returns the number of aggregate records touched.
    pub async fn plan(&self, account_id: &str, message: &Document, commit: &mut DerivedCommit) -> Result<usize> {
        let fields = message_fields(message);
        let mut touched = 0;

        for (dimension, collection) in COUNTED {
            let stored: BTreeSet<String> = self
                .store
                .memberships(account_id, dimension, &message.id)
                .await?
                .into_iter()
                .collect();
            let current = dimension_values(message, &fields, dimension);
            if stored == current {
                continue;
            }

            let mut deltas: BTreeMap<&str, i64> = BTreeMap::new();
            for added in current.difference(&stored) {
                *deltas.entry(added.as_str()).or_default() += 1;
            }
            for removed in stored.difference(&current) {
                *deltas.entry(removed.as_str()).or_default() -= 1;
            }

            for (value, delta) in deltas {
                let previous = self.store.get(account_id, collection, value).await?;
                let count = previous.as_ref().map(message_count).unwrap_or(0) + delta;
                commit
                    .documents
                    .push((collection, aggregate_record(account_id, value, count, previous.as_ref())));
                touched += 1;
            }

            commit.memberships.push(MembershipUpdate {
                dimension,
                message_id: message.id.clone(),
                values: current.into_iter().collect(),
            });
        }

        Ok(touched)
    }

    /// Apply one committed message: diff, then commit atomically.
    pub async fn apply_message(&self, account_id: &str, message: &Document) -> Result<usize> {
        let mut commit = DerivedCommit::default();
        let touched = self.plan(account_id, message, &mut commit).await?;
        if !commit.is_empty() {
            self.store.commit_derived(account_id, commit).await?;
        }
        Ok(touched)
    }

    /// Recompute every tag and category count of the account from a full
    /// message scan.
    pub async fn backfill(&self, account_id: &str) -> Result<BackfillSummary> {
        backfill::run(self.store.as_ref(), account_id, backfill::Scope::Counts).await
    }
}
