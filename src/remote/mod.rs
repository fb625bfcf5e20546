//! Remote tier interface.
//!
//! The remote is authoritative: it owns the canonical copy of every document
//! and serves three operations per collection:
//!
//! | Operation | HTTP | Purpose |
//! |-----------|------|---------|
//! | [`RemoteEndpoint::pull`] | `GET <pull_path>?updatedAt=..&<key>=..&limit=..` | page of changes after a checkpoint |
//! | [`RemoteEndpoint::push`] | `POST <push_path>` `{ rows }` | local change rows; answers with conflicts |
//! | [`RemoteEndpoint::subscribe`] | `GET <live_path>` (SSE) | coalesced live change batches |
//!
//! An endpoint is bound to one account: the credential identifies it and
//! documents missing an `accountId` are attributed to it.
//!
//! Two implementations ship: [`HttpRemote`] talks to a real server,
//! [`MemoryRemote`] is the in-process reference tier used by tests and
//! embedded deployments.

pub mod http;
pub mod memory;
pub mod sse;

pub use http::HttpRemote;
pub use memory::{MemoryEndpoint, MemoryRemote};
pub use sse::SseDecoder;

use crate::batch::{ChangeBatch, ChangeRow, PullRequest};
use crate::document::{Collection, Document};
use crate::error::Result;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use crate::store::BoxFuture;

/// Capacity of the channel between a live-stream reader task and its consumer.
pub const LIVE_CHANNEL_CAPACITY: usize = 64;

/// Supplies the bearer credential for remote requests.
///
/// Called once per request, so a refreshed credential takes effect on the
/// next call without rebuilding the endpoint.
pub trait TokenProvider: Send + Sync + 'static {
    fn token(&self) -> BoxFuture<'_, String>;
}

/// A credential held in memory that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct SharedToken {
    token: RwLock<String>,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token.into()),
        }
    }

    /// Replace the credential (e.g. after an OAuth refresh).
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token.into();
    }

    pub fn get(&self) -> String {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TokenProvider for SharedToken {
    fn token(&self) -> BoxFuture<'_, String> {
        Box::pin(async move { Ok(self.get()) })
    }
}

/// An open live-push subscription.
///
/// Yields decoded change batches in arrival order. `None` means the stream
/// ended (server closed it or the connection dropped); an `Err` item is a
/// transport or codec failure, after which the stream ends.
///
/// Dropping the feed aborts the reader task.
pub struct LiveFeed {
    rx: mpsc::Receiver<Result<ChangeBatch>>,
    task: Option<JoinHandle<()>>,
}

impl LiveFeed {
    pub fn new(rx: mpsc::Receiver<Result<ChangeBatch>>, task: JoinHandle<()>) -> Self {
        Self { rx, task: Some(task) }
    }

    /// Build a feed from a bare channel (no reader task to own).
    pub fn from_channel(rx: mpsc::Receiver<Result<ChangeBatch>>) -> Self {
        Self { rx, task: None }
    }

    /// Next batch, or `None` once the subscription has ended.
    ///
    /// Cancel-safe.
    pub async fn next(&mut self) -> Option<Result<ChangeBatch>> {
        self.rx.recv().await
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Authoritative tier, bound to one account.
pub trait RemoteEndpoint: Send + Sync + 'static {
    /// Account this endpoint acts for.
    fn account_id(&self) -> &str;

    /// Fetch the page of changes strictly after `request.checkpoint`.
    fn pull<'a>(&'a self, collection: Collection, request: &'a PullRequest) -> BoxFuture<'a, ChangeBatch>;

    /// Push change rows. Returns the remote's current version of every
    /// document whose row was not accepted; an empty list means every row
    /// was acknowledged.
    fn push<'a>(&'a self, collection: Collection, rows: &'a [ChangeRow]) -> BoxFuture<'a, Vec<Document>>;

    /// Open the live-push channel. Resolves once the subscription is
    /// established. `Ok(None)` when the collection has no live channel.
    fn subscribe(&self, collection: Collection) -> BoxFuture<'_, Option<LiveFeed>>;
}
