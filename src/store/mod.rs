//! Local document store interface.
//!
//! The replication core needs three things from the local tier:
//!
//! 1. **Atomic batch apply**: a pulled batch and its checkpoint commit
//!    together or not at all, so a crash never loses applied documents
//!    and never silently skips past unapplied ones.
//! 2. **A change-row journal**: every local mutation is recorded in commit
//!    order until the remote acknowledges (or supersedes, or rejects) it.
//! 3. **A commit feed**: [`LocalStore::subscribe`] delivers every committed
//!    document in commit order to the push loop and the aggregation service.
//!
//! ```text
//!            pull ──▶ apply_batch ──┐                ┌──▶ push loop (Local)
//!     local edit ──▶ write_local  ──┼──▶ commit ──▶ feed
//!  aggregation ──▶ commit_derived ──┘                └──▶ aggregation (Messages)
//! ```
//!
//! Two implementations ship: [`MemoryStore`] and the durable [`SqliteStore`].

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::batch::{ChangeBatch, PendingChange};
use crate::checkpoint::Checkpoint;
use crate::conflict::Resolution;
use crate::document::{Collection, Document};
use crate::error::{ReplicationError, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use tokio::sync::broadcast;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Capacity of the commit feed. A subscriber that falls further behind
/// receives `RecvError::Lagged` and must repair from a full scan.
pub const FEED_CAPACITY: usize = 4096;

/// Who produced a committed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Local mutation via [`LocalStore::write_local`] (or a kept-local
    /// conflict resolution); destined for push.
    Local,
    /// Applied from a pull, a live batch or a conflict resolution.
    Remote,
    /// Written by the aggregation layer.
    Derived,
}

/// One committed document, as delivered on the commit feed.
#[derive(Debug, Clone)]
pub struct CommittedChange {
    pub account_id: String,
    pub collection: Collection,
    pub document: Document,
    pub origin: ChangeOrigin,
}

/// Dimension of a message membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Tag,
    Category,
    Thread,
}

impl Dimension {
    pub fn name(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Category => "category",
            Self::Thread => "thread",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dimension {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tag" => Ok(Self::Tag),
            "category" => Ok(Self::Category),
            "thread" => Ok(Self::Thread),
            other => Err(ReplicationError::Codec(format!("unknown dimension: {}", other))),
        }
    }
}

/// Lifecycle of a change row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Pending,
    Acknowledged,
    /// Overridden by a newer remote version; never pushed.
    Superseded,
    /// Permanently refused by the remote; never pushed.
    Rejected,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Superseded => "superseded",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "superseded" => Ok(Self::Superseded),
            "rejected" => Ok(Self::Rejected),
            other => Err(ReplicationError::Codec(format!("unknown change status: {}", other))),
        }
    }
}

/// Result of [`LocalStore::apply_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Documents written.
    pub applied: usize,
    /// Documents skipped because the local copy was already at or past them.
    pub skipped: usize,
    /// Pending change rows overridden by a newer remote version.
    pub superseded: usize,
}

/// Replace the stored values of one message's membership in a dimension.
/// An empty `values` removes the membership entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipUpdate {
    pub dimension: Dimension,
    pub message_id: String,
    pub values: Vec<String>,
}

/// Everything one aggregation step writes, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct DerivedCommit {
    /// Dimensions whose membership rows are dropped for the account before
    /// anything else is written (backfill).
    pub reset_dimensions: Vec<Dimension>,
    pub memberships: Vec<MembershipUpdate>,
    /// Derived documents to upsert. `updatedAt` is stamped by the store.
    pub documents: Vec<(Collection, Document)>,
}

impl DerivedCommit {
    pub fn is_empty(&self) -> bool {
        self.reset_dimensions.is_empty() && self.memberships.is_empty() && self.documents.is_empty()
    }
}

/// Local tier consumed by the replication core.
///
/// Every method that writes more than one row commits atomically.
pub trait LocalStore: Send + Sync + 'static {
    /// Fetch one document (including soft-deleted ones).
    fn get(&self, account_id: &str, collection: Collection, id: &str) -> BoxFuture<'_, Option<Document>>;

    /// Every document of a collection for an account, ascending by id.
    fn scan(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, Vec<Document>>;

    /// Accounts that own at least one document in `collection`.
    fn accounts(&self, collection: Collection) -> BoxFuture<'_, Vec<String>>;

    /// Last committed pull checkpoint. `None` before the first pull.
    fn load_checkpoint(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, Option<Checkpoint>>;

    /// Apply a remote batch in one commit.
    ///
    /// A document is written only if it is strictly newer than the local
    /// copy. Pending change rows for a document that a newer remote version
    /// overrides are superseded. When `commit_checkpoint` is set the stored
    /// checkpoint advances to the batch checkpoint, never backwards.
    fn apply_batch<'a>(
        &'a self,
        account_id: &'a str,
        batch: &'a ChangeBatch,
        commit_checkpoint: bool,
    ) -> BoxFuture<'a, ApplyOutcome>;

    /// Commit a local mutation and journal it for push.
    ///
    /// `updatedAt` is stamped by the store's commit clock. Derived
    /// collections reject local writes.
    fn write_local(&self, account_id: &str, collection: Collection, document: Document) -> BoxFuture<'_, Document>;

    /// Pending change rows in commit order.
    fn pending_changes(&self, account_id: &str, collection: Collection, limit: usize) -> BoxFuture<'_, Vec<PendingChange>>;

    fn pending_count(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, usize>;

    /// Mark pending rows acknowledged: for each `(document_id, through_seq)`,
    /// every pending row of that document with `seq <= through_seq`.
    fn acknowledge<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        acks: &'a [(String, i64)],
    ) -> BoxFuture<'a, usize>;

    /// Commit a conflict resolution.
    fn apply_resolution<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        resolution: &'a Resolution,
    ) -> BoxFuture<'a, ()>;

    /// Mark a document's pending rows through `through_seq` as rejected.
    fn reject<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        document_id: &'a str,
        through_seq: i64,
        reason: &'a str,
    ) -> BoxFuture<'a, usize>;

    /// Stored membership values of one message in a dimension.
    fn memberships<'a>(
        &'a self,
        account_id: &'a str,
        dimension: Dimension,
        message_id: &'a str,
    ) -> BoxFuture<'a, Vec<String>>;

    /// Commit memberships and derived documents in one atomic step.
    /// Returns the documents as stored (with their stamped `updatedAt`).
    fn commit_derived<'a>(&'a self, account_id: &'a str, commit: DerivedCommit) -> BoxFuture<'a, Vec<Document>>;

    /// Subscribe to the commit feed.
    fn subscribe(&self) -> broadcast::Receiver<CommittedChange>;
}

/// Reject local writes to collections only the aggregation layer may write.
pub(crate) fn ensure_writable(collection: Collection, document: &Document) -> Result<()> {
    if collection.is_derived() {
        return Err(ReplicationError::Validation {
            collection,
            document_id: document.id.clone(),
            message: "derived collections are maintained by aggregation only".to_string(),
        });
    }
    Ok(())
}
