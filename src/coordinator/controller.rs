//! Per (account, collection) replication controller.
//!
//! A controller owns one [`PullEngine`] and, for pushable collections, one
//! [`PushEngine`]. Its task runs replication cycles: pull until caught up,
//! then stream (see [`super::streaming`]) until something fails or shutdown
//! is signaled. A failed cycle parks the controller in
//! [`ControllerState::Error`] for a backoff (or until credentials are
//! refreshed, after an auth failure) and starts over.
//!
//! Controllers of one account share nothing but the store, the remote and
//! an optional rate limiter; no ordering holds across collections.

use super::streaming;
use super::types::{ControllerHealth, ControllerState};
use crate::circuit_breaker::RemoteCircuit;
use crate::config::{CollectionConfig, ReplicationConfig};
use crate::document::Collection;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::remote::RemoteEndpoint;
use crate::resilience::{sleep_or_shutdown, RateLimiter, RetryConfig};
use crate::store::LocalStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runtime knobs of one controller, resolved from [`ReplicationConfig`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub push_enabled: bool,
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    /// Catch-up poll cadence while streaming.
    pub poll_interval: Duration,
    /// Push cadence when no local commit triggers one.
    pub push_interval: Duration,
    pub live_push: bool,
    pub live_reconnect_delay: Duration,
    /// Per-request retries; `delay_for_attempt` also paces error cycles.
    pub retry: RetryConfig,
    /// Consecutive failed cycles before the controller stays in `Error`.
    pub max_error_cycles: Option<u32>,
    /// How long `shutdown()` waits for the task before aborting it.
    pub drain_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &ReplicationConfig, collection: &CollectionConfig) -> Self {
        let settings = &config.settings;
        Self {
            push_enabled: collection.pushes(),
            pull_batch_size: settings.pull.batch_size,
            push_batch_size: settings.push.batch_size,
            poll_interval: settings.pull.poll_interval_duration(),
            push_interval: settings.push.interval_duration(),
            live_push: config.remote.live_push,
            live_reconnect_delay: settings.pull.live_reconnect_delay_duration(),
            retry: settings.retry.retry_config(config.remote.request_timeout_duration()),
            max_error_cycles: settings.retry.max_error_cycles,
            drain_timeout: Duration::from_secs(10),
        }
    }

    /// Fast timings for tests.
    pub fn testing() -> Self {
        Self {
            push_enabled: true,
            pull_batch_size: 10,
            push_batch_size: 10,
            poll_interval: Duration::from_millis(50),
            push_interval: Duration::from_millis(20),
            live_push: true,
            live_reconnect_delay: Duration::from_millis(20),
            retry: RetryConfig::testing(),
            max_error_cycles: None,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

struct Runtime {
    handle: JoinHandle<()>,
    push: Option<Arc<PushEngine>>,
}

/// Replicates one collection of one account.
pub struct ReplicationController {
    account_id: String,
    collection: Collection,
    settings: ControllerSettings,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteEndpoint>,
    circuit: Arc<RemoteCircuit>,
    rate_limiter: Option<Arc<RateLimiter>>,
    credentials: Arc<Notify>,
    state_tx: Arc<watch::Sender<ControllerState>>,
    state_rx: watch::Receiver<ControllerState>,
    shutdown_tx: watch::Sender<bool>,
    last_error: Arc<Mutex<Option<String>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl ReplicationController {
    pub fn new(
        collection: Collection,
        settings: ControllerSettings,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteEndpoint>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ControllerState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            account_id: remote.account_id().to_string(),
            collection,
            settings,
            store,
            remote,
            circuit: Arc::new(RemoteCircuit::new()),
            rate_limiter: None,
            credentials: Arc::new(Notify::new()),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            last_error: Arc::new(Mutex::new(None)),
            runtime: Mutex::new(None),
        }
    }

    pub fn with_circuit(mut self, circuit: Arc<RemoteCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Share the notifier that [`ReplicationEngine::credentials_refreshed`]
    /// fires.
    ///
    /// [`ReplicationEngine::credentials_refreshed`]: super::ReplicationEngine::credentials_refreshed
    pub fn with_credentials(mut self, credentials: Arc<Notify>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn state(&self) -> ControllerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ControllerState> {
        self.state_rx.clone()
    }

    /// Spawn the controller task. Only valid from `Idle`.
    pub async fn start(&self) -> Result<()> {
        let state = self.state();
        if state != ControllerState::Idle {
            return Err(ReplicationError::InvalidState {
                expected: ControllerState::Idle.to_string(),
                actual: state.to_string(),
            });
        }
        let shutdown_rx = self.shutdown_tx.subscribe();

        let pull = PullEngine::new(
            self.collection,
            self.store.clone(),
            self.remote.clone(),
            self.settings.pull_batch_size,
        )
        .with_circuit(self.circuit.clone())
        .with_retry(self.settings.retry.clone())
        .with_rate_limiter(self.rate_limiter.clone())
        .with_shutdown(shutdown_rx.clone());

        let push = (self.settings.push_enabled && self.collection.is_pushable()).then(|| {
            Arc::new(
                PushEngine::new(
                    self.collection,
                    self.store.clone(),
                    self.remote.clone(),
                    self.settings.push_batch_size,
                )
                .with_circuit(self.circuit.clone())
                .with_retry(self.settings.retry.clone())
                .with_rate_limiter(self.rate_limiter.clone())
                .with_shutdown(shutdown_rx.clone()),
            )
        });

        let task = ControllerTask {
            account_id: self.account_id.clone(),
            collection: self.collection,
            settings: self.settings.clone(),
            store: self.store.clone(),
            remote: self.remote.clone(),
            pull,
            push: push.clone(),
            state_tx: self.state_tx.clone(),
            last_error: self.last_error.clone(),
            credentials: self.credentials.clone(),
        };

        task.set_state(ControllerState::PullingInitial);
        let span = info_span!("controller", account_id = %self.account_id, collection = %self.collection);
        let handle = tokio::spawn(task.run(shutdown_rx).instrument(span));

        *self.runtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(Runtime { handle, push });
        Ok(())
    }

    /// Stop the controller and wait for its task.
    ///
    /// The live subscription is released and in-flight requests finish or
    /// time out; batches are committed whole or not at all. A task still
    /// running after `drain_timeout` is aborted.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runtime) = runtime {
            let abort = runtime.handle.abort_handle();
            match tokio::time::timeout(self.settings.drain_timeout, runtime.handle).await {
                Ok(Ok(())) => debug!(collection = %self.collection, "Controller task completed"),
                Ok(Err(e)) => warn!(collection = %self.collection, error = %e, "Controller task panicked"),
                Err(_) => {
                    warn!(collection = %self.collection, "Controller task did not drain in time, aborting");
                    abort.abort();
                }
            }
        }

        self.state_tx.send_replace(ControllerState::Stopped);
        metrics::set_controller_state(self.collection, ControllerState::Stopped.as_str());
    }

    /// Snapshot from local state only.
    pub async fn health(&self) -> ControllerHealth {
        let checkpoint = match self.store.load_checkpoint(&self.account_id, self.collection).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "Failed to read checkpoint for health");
                None
            }
        };
        let pending_push = if self.collection.is_pushable() {
            self.store
                .pending_count(&self.account_id, self.collection)
                .await
                .unwrap_or_default()
        } else {
            0
        };
        let last_rejection = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|rt| rt.push.as_ref())
            .and_then(|push| push.last_rejection());

        ControllerHealth {
            collection: self.collection,
            state: self.state(),
            checkpoint,
            pending_push,
            last_error: self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            last_rejection,
            circuit_open: self.circuit.any_open(),
        }
    }
}

/// Everything the controller task owns.
pub(super) struct ControllerTask {
    pub(super) account_id: String,
    pub(super) collection: Collection,
    pub(super) settings: ControllerSettings,
    pub(super) store: Arc<dyn LocalStore>,
    pub(super) remote: Arc<dyn RemoteEndpoint>,
    pub(super) pull: PullEngine,
    pub(super) push: Option<Arc<PushEngine>>,
    state_tx: Arc<watch::Sender<ControllerState>>,
    last_error: Arc<Mutex<Option<String>>>,
    credentials: Arc<Notify>,
}

impl ControllerTask {
    pub(super) fn set_state(&self, state: ControllerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Controller state changed");
            metrics::set_controller_state(self.collection, state.as_str());
        }
    }

    fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Starting replication controller");
        let mut failures = 0u32;

        loop {
            self.set_state(ControllerState::PullingInitial);
            let err = match self.run_cycle(&mut shutdown_rx).await {
                Ok(()) | Err(ReplicationError::Shutdown) => break,
                Err(e) => e,
            };
            if *shutdown_rx.borrow() {
                break;
            }

            // A cycle that reached streaming resets the failure streak.
            if self.state() == ControllerState::Streaming {
                failures = 0;
            }
            failures += 1;
            metrics::record_error(self.collection, err.kind());
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());

            if err.is_auth() {
                let refreshed = self.credentials.notified();
                tokio::pin!(refreshed);
                refreshed.as_mut().enable();
                self.set_state(ControllerState::Error);
                error!(error = %err, "Credentials rejected, pausing until refreshed");
                tokio::select! {
                    _ = &mut refreshed => {
                        info!("Credentials refreshed, resuming");
                        failures = 0;
                    }
                    _ = streaming::wait_for_shutdown(&mut shutdown_rx) => break,
                }
                continue;
            }

            self.set_state(ControllerState::Error);
            if self.settings.max_error_cycles.is_some_and(|max| failures >= max) {
                error!(error = %err, failures, "Replication cycle failed, giving up until shutdown");
                streaming::wait_for_shutdown(&mut shutdown_rx).await;
                break;
            }

            let delay = self.settings.retry.delay_for_attempt(failures as usize);
            error!(
                error = %err,
                failures,
                retry_in_ms = delay.as_millis() as u64,
                "Replication cycle failed"
            );
            if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                break;
            }
        }

        self.set_state(ControllerState::Stopped);
        info!("Replication controller stopped");
    }

    async fn run_cycle(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let summary = self.pull.pull_until_caught_up().await?;
        self.set_state(ControllerState::Streaming);
        debug!(batches = summary.batches, fetched = summary.fetched, "Initial pull complete");
        streaming::run(self, shutdown_rx).await
    }
}
