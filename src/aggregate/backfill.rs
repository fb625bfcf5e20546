//! Full recomputation of derived collections.
//!
//! Incremental aggregation is only as good as the events it saw. Backfill
//! throws away the membership rows of an account and rebuilds counts and
//! rollups from a full scan of its live messages:
//!
//! 1. Scan every non-deleted message.
//! 2. Reset the membership rows of the dimensions in scope.
//! 3. Re-emit memberships and recompute counts and rollups.
//! 4. Records no message references drop to zero (counts) or become empty
//!    and soft-deleted (threads). Nothing is ever hard-deleted.
//! 5. Skip every record whose content is already correct, so a backfill of
//!    a healthy account only rewrites membership rows.
//!
//! All of it lands in one [`DerivedCommit`].

use super::thread::{MessageSummary, ThreadRollup};
use super::{aggregate_record, dimension_values, message_fields, COUNTED};
use crate::checkpoint::Checkpoint;
use crate::document::{Collection, Document};
use crate::error::Result;
use crate::metrics;
use crate::store::{DerivedCommit, Dimension, LocalStore, MembershipUpdate};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a backfill rewrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Live messages scanned.
    pub messages: usize,
    /// Tag records written.
    pub tags: usize,
    /// Category records written.
    pub categories: usize,
    /// Thread rollups written.
    pub threads: usize,
}

impl BackfillSummary {
    fn merge(&mut self, other: BackfillSummary) {
        self.messages += other.messages;
        self.tags += other.tags;
        self.categories += other.categories;
        self.threads += other.threads;
    }

    pub fn records_written(&self) -> usize {
        self.tags + self.categories + self.threads
    }
}

/// Which derived collections to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Tag and category counts.
    Counts,
    /// Thread rollups.
    Threads,
    All,
}

impl Scope {
    fn counts(self) -> bool {
        matches!(self, Self::Counts | Self::All)
    }

    fn threads(self) -> bool {
        matches!(self, Self::Threads | Self::All)
    }

    fn dimensions(self) -> Vec<Dimension> {
        let mut dims = Vec::new();
        if self.counts() {
            dims.extend(COUNTED.iter().map(|(dim, _)| *dim));
        }
        if self.threads() {
            dims.push(Dimension::Thread);
        }
        dims
    }
}

/// Rebuild the derived collections in `scope` for one account.
///
/// The caller must be the only derived writer for the account while this runs.
#[instrument(skip(store), fields(scope = ?scope))]
pub async fn run(store: &dyn LocalStore, account_id: &str, scope: Scope) -> Result<BackfillSummary> {
    let started = Instant::now();
    let messages: Vec<Document> = store
        .scan(account_id, Collection::Messages)
        .await?
        .into_iter()
        .filter(|m| !m.is_deleted)
        .collect();

    let mut summary = BackfillSummary {
        messages: messages.len(),
        ..Default::default()
    };
    let mut commit = DerivedCommit {
        reset_dimensions: scope.dimensions(),
        ..Default::default()
    };

    let mut counts: BTreeMap<Collection, BTreeMap<String, i64>> = BTreeMap::new();
    let mut threads: BTreeMap<String, Vec<(Checkpoint, MessageSummary)>> = BTreeMap::new();

    for message in &messages {
        let fields = message_fields(message);

        if scope.counts() {
            for (dimension, collection) in COUNTED {
                let values = dimension_values(message, &fields, dimension);
                if values.is_empty() {
                    continue;
                }
                let per_value = counts.entry(collection).or_default();
                for value in &values {
                    *per_value.entry(value.clone()).or_default() += 1;
                }
                commit.memberships.push(MembershipUpdate {
                    dimension,
                    message_id: message.id.clone(),
                    values: values.into_iter().collect(),
                });
            }
        }

        if scope.threads() {
            if let Some(thread_id) = dimension_values(message, &fields, Dimension::Thread).into_iter().next() {
                threads
                    .entry(thread_id.clone())
                    .or_default()
                    .push((Checkpoint::of(message), MessageSummary::of(&message.id, &fields)));
                commit.memberships.push(MembershipUpdate {
                    dimension: Dimension::Thread,
                    message_id: message.id.clone(),
                    values: vec![thread_id],
                });
            }
        }
    }

    if scope.counts() {
        for (_, collection) in COUNTED {
            let per_value = counts.remove(&collection).unwrap_or_default();
            let written = rebuild_counts(store, account_id, collection, per_value, &mut commit).await?;
            match collection {
                Collection::Tags => summary.tags = written,
                _ => summary.categories = written,
            }
        }
    }

    if scope.threads() {
        summary.threads = rebuild_threads(store, account_id, threads, &mut commit).await?;
    }

    store.commit_derived(account_id, commit).await?;

    let elapsed = started.elapsed();
    metrics::record_backfill(summary.messages, elapsed);
    info!(
        messages = summary.messages,
        tags = summary.tags,
        categories = summary.categories,
        threads = summary.threads,
        elapsed_ms = elapsed.as_millis() as u64,
        "Backfill complete"
    );
    Ok(summary)
}

async fn rebuild_counts(
    store: &dyn LocalStore,
    account_id: &str,
    collection: Collection,
    mut counts: BTreeMap<String, i64>,
    commit: &mut DerivedCommit,
) -> Result<usize> {
    let existing: BTreeMap<String, Document> = store
        .scan(account_id, collection)
        .await?
        .into_iter()
        .map(|doc| (doc.id.clone(), doc))
        .collect();
    for id in existing.keys() {
        counts.entry(id.clone()).or_insert(0);
    }

    let mut written = 0;
    for (value, count) in counts {
        let previous = existing.get(&value);
        let record = aggregate_record(account_id, &value, count, previous);
        if previous.is_some_and(|p| p.same_content(&record)) {
            continue;
        }
        commit.documents.push((collection, record));
        written += 1;
    }
    debug!(collection = %collection, written, "Rebuilt counts");
    Ok(written)
}

/// Members already listed in the stored rollup keep their slots; the rest
/// are appended in commit order.
async fn rebuild_threads(
    store: &dyn LocalStore,
    account_id: &str,
    mut members: BTreeMap<String, Vec<(Checkpoint, MessageSummary)>>,
    commit: &mut DerivedCommit,
) -> Result<usize> {
    let existing: BTreeMap<String, Document> = store
        .scan(account_id, Collection::Threads)
        .await?
        .into_iter()
        .map(|doc| (doc.id.clone(), doc))
        .collect();
    for id in existing.keys() {
        members.entry(id.clone()).or_default();
    }

    let mut written = 0;
    for (thread_id, mut summaries) in members {
        let previous = existing.get(&thread_id);
        let stored_order: Vec<String> = match previous.map(ThreadRollup::from_document) {
            Some(Ok(stored)) => stored.message_ids().map(str::to_string).collect(),
            Some(Err(e)) => {
                warn!(thread_id = %thread_id, error = %e, "Discarding malformed rollup order");
                Vec::new()
            }
            None => Vec::new(),
        };
        summaries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut rollup = ThreadRollup::new(thread_id.as_str());
        for id in &stored_order {
            if let Some((_, summary)) = summaries.iter().find(|(_, s)| &s.message_id == id) {
                rollup.upsert(summary.clone());
            }
        }
        for (_, summary) in summaries {
            rollup.upsert(summary);
        }

        let doc = rollup.into_document(account_id, previous);
        if previous.is_some_and(|p| p.same_content(&doc)) {
            continue;
        }
        commit.documents.push((Collection::Threads, doc));
        written += 1;
    }
    debug!(written, "Rebuilt thread rollups");
    Ok(written)
}

/// Rebuild everything for every account that has messages or derived records.
pub async fn backfill_all(store: &dyn LocalStore) -> Result<BackfillSummary> {
    let mut accounts = BTreeSet::new();
    for collection in [
        Collection::Messages,
        Collection::Tags,
        Collection::Categories,
        Collection::Threads,
    ] {
        accounts.extend(store.accounts(collection).await?);
    }

    let mut total = BackfillSummary::default();
    for account_id in accounts {
        total.merge(run(store, &account_id, Scope::All).await?);
    }
    Ok(total)
}
