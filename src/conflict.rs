//! Conflict resolution: last writer wins, remote wins ties.
//!
//! A conflict is the remote's current version of a document it refused to
//! overwrite with a pushed row. The resolver compares it with the local
//! version that was pushed:
//!
//! | local.updatedAt vs remote.updatedAt | Outcome |
//! |-------------------------------------|---------|
//! | `<` or `==`                         | [`Resolution::TakeRemote`]: local copy replaced, pending rows superseded |
//! | `>`                                 | [`Resolution::KeepLocal`]: local copy re-stamped and re-queued for push |
//!
//! Whole documents are replaced; there is no field-level merge. The
//! remote's deleted flag arrives already translated into
//! [`Document::is_deleted`] by the codec.

use crate::document::{Collection, Document};
use crate::error::Result;
use crate::store::LocalStore;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Overwrite the local document with the remote version and mark the
    /// pushed rows (through `superseded_through`) superseded.
    TakeRemote {
        document: Document,
        superseded_through: i64,
    },
    /// The local version is strictly newer. The store re-stamps it after the
    /// remote's `updatedAt` and journals a fresh change row, superseding
    /// the rows that lost.
    KeepLocal {
        document: Document,
        remote: Document,
        superseded_through: i64,
    },
}

impl Resolution {
    pub fn document_id(&self) -> &str {
        match self {
            Self::TakeRemote { document, .. } | Self::KeepLocal { document, .. } => &document.id,
        }
    }

    pub fn superseded_through(&self) -> i64 {
        match self {
            Self::TakeRemote { superseded_through, .. } | Self::KeepLocal { superseded_through, .. } => {
                *superseded_through
            }
        }
    }

    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::TakeRemote { .. } => "take_remote",
            Self::KeepLocal { .. } => "keep_local",
        }
    }
}

/// Routes push conflicts into the local store.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn LocalStore>,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Pure decision. `local` is the pushed state, `None` if the local copy
    /// vanished in the meantime.
    pub fn decide(local: Option<&Document>, remote: Document, superseded_through: i64) -> Resolution {
        match local {
            Some(local) if local.updated_at > remote.updated_at => Resolution::KeepLocal {
                document: local.clone(),
                remote,
                superseded_through,
            },
            _ => Resolution::TakeRemote {
                document: remote,
                superseded_through,
            },
        }
    }

    /// Decide and commit the resolution of one conflict.
    #[instrument(skip(self, pushed, remote), fields(document_id = %remote.id))]
    pub async fn resolve(
        &self,
        account_id: &str,
        collection: Collection,
        pushed: Option<&Document>,
        remote: Document,
        superseded_through: i64,
    ) -> Result<Resolution> {
        let resolution = Self::decide(pushed, remote, superseded_through);
        match &resolution {
            Resolution::TakeRemote { document, .. } => {
                debug!(%collection, updated_at = %document.updated_at, "Conflict: remote wins");
            }
            Resolution::KeepLocal { document, remote, .. } => {
                warn!(
                    %collection,
                    local_updated_at = %document.updated_at,
                    remote_updated_at = %remote.updated_at,
                    "Conflict: local version is newer, re-queueing"
                );
            }
        }
        self.store
            .apply_resolution(account_id, collection, &resolution)
            .await?;
        crate::metrics::record_conflict_resolution(collection, resolution.outcome());
        Ok(resolution)
    }
}
