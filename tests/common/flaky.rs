//! Failure-injecting remote for chaos and integration tests.
//!
//! Wraps any `RemoteEndpoint` and records every call. Failures are armed
//! per operation and consumed one call at a time.
//!
//! # Example
//! ```rust,ignore
//! let remote = MemoryRemote::new();
//! let flaky = Arc::new(FlakyRemote::new(Arc::new(remote.endpoint("A"))));
//!
//! flaky.fail_pulls(2);          // next two pulls fail with a transport error
//! flaky.reject_pushes("bad");   // pushes of document "bad" fail validation
//!
//! assert_eq!(flaky.pull_calls(), 3);
//! ```

use inbox_replication::batch::{ChangeBatch, ChangeRow, PullRequest};
use inbox_replication::remote::{BoxFuture, LiveFeed, RemoteEndpoint};
use inbox_replication::{Collection, Document, ReplicationError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A `RemoteEndpoint` that fails on demand.
pub struct FlakyRemote {
    inner: Arc<dyn RemoteEndpoint>,
    pull_failures: AtomicUsize,
    push_failures: AtomicUsize,
    subscribe_failures: AtomicUsize,
    auth_failing: AtomicBool,
    live_disabled: AtomicBool,
    rejected_ids: Mutex<HashSet<String>>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    pushed_rows: Mutex<Vec<ChangeRow>>,
}

impl FlakyRemote {
    pub fn new(inner: Arc<dyn RemoteEndpoint>) -> Self {
        Self {
            inner,
            pull_failures: AtomicUsize::new(0),
            push_failures: AtomicUsize::new(0),
            subscribe_failures: AtomicUsize::new(0),
            auth_failing: AtomicBool::new(false),
            live_disabled: AtomicBool::new(false),
            rejected_ids: Mutex::new(HashSet::new()),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            pushed_rows: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` pulls with a transport error.
    pub fn fail_pulls(&self, n: usize) {
        self.pull_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` pushes with a transport error.
    pub fn fail_pushes(&self, n: usize) {
        self.push_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` live subscriptions with a transport error.
    pub fn fail_subscribes(&self, n: usize) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }

    /// Reject every call with an auth error until cleared.
    pub fn set_auth_failing(&self, failing: bool) {
        self.auth_failing.store(failing, Ordering::SeqCst);
    }

    /// Report no live channel, forcing poll-only streaming.
    pub fn disable_live(&self) {
        self.live_disabled.store(true, Ordering::SeqCst);
    }

    /// Pushes containing this document fail validation.
    pub fn reject_pushes(&self, document_id: &str) {
        self.rejected_ids
            .lock()
            .unwrap()
            .insert(document_id.to_string());
    }

    pub fn pull_calls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Every row handed to `push`, including failed attempts.
    pub fn pushed_rows(&self) -> Vec<ChangeRow> {
        self.pushed_rows.lock().unwrap().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn auth_error(&self) -> Option<ReplicationError> {
        self.auth_failing
            .load(Ordering::SeqCst)
            .then(|| ReplicationError::Auth("token expired".to_string()))
    }
}

impl RemoteEndpoint for FlakyRemote {
    fn account_id(&self) -> &str {
        self.inner.account_id()
    }

    fn pull<'a>(&'a self, collection: Collection, request: &'a PullRequest) -> BoxFuture<'a, ChangeBatch> {
        Box::pin(async move {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.auth_error() {
                return Err(e);
            }
            if Self::take_failure(&self.pull_failures) {
                return Err(ReplicationError::transport_msg(
                    format!("pull {}", collection),
                    "503 Service Unavailable",
                ));
            }
            self.inner.pull(collection, request).await
        })
    }

    fn push<'a>(&'a self, collection: Collection, rows: &'a [ChangeRow]) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.pushed_rows.lock().unwrap().extend(rows.iter().cloned());
            if let Some(e) = self.auth_error() {
                return Err(e);
            }
            if Self::take_failure(&self.push_failures) {
                return Err(ReplicationError::transport_msg(
                    format!("push {}", collection),
                    "connection reset",
                ));
            }
            let rejected = {
                let ids = self.rejected_ids.lock().unwrap();
                rows.iter()
                    .find(|r| ids.contains(&r.new_document_state.id))
                    .map(|r| r.new_document_state.id.clone())
            };
            if let Some(document_id) = rejected {
                return Err(ReplicationError::Validation {
                    collection,
                    document_id,
                    message: "422 subject too long".to_string(),
                });
            }
            self.inner.push(collection, rows).await
        })
    }

    fn subscribe(&self, collection: Collection) -> BoxFuture<'_, Option<LiveFeed>> {
        Box::pin(async move {
            if let Some(e) = self.auth_error() {
                return Err(e);
            }
            if self.live_disabled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if Self::take_failure(&self.subscribe_failures) {
                return Err(ReplicationError::transport_msg(
                    format!("live {}", collection),
                    "stream refused",
                ));
            }
            self.inner.subscribe(collection).await
        })
    }
}
