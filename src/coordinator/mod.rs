// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! One [`ReplicationEngine`] per account. It owns:
//! - one [`ReplicationController`] per enabled collection
//! - the optional [`AggregationService`] that maintains tags, categories
//!   and threads from committed messages
//! - the credential notifier that releases controllers paused on an auth
//!   failure
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────── ReplicationEngine (account A) ────────────┐
//!                    │                                                       │
//!   RemoteEndpoint ◀─┼─▶ controller(messages) ─┐                             │
//!                    │   controller(contacts) ─┼──▶ LocalStore ──feed──▶ AggregationService
//!                    │   controller(...)      ─┘        ▲                    │
//!                    │                                  └── derived commits ─┘
//!                    └───────────────────────────────────────────────────────┘
//! ```
//!
//! Controllers share nothing but the store, the remote, the rate limiter and
//! the credential notifier. Their lifecycles are independent: one collection
//! sitting in `Error` never blocks another.

mod controller;
mod streaming;
mod types;

pub use controller::{ControllerSettings, ReplicationController};
pub use types::{ControllerHealth, ControllerState, EngineState, HealthCheck};

use crate::aggregate::AggregationService;
use crate::config::ReplicationConfig;
use crate::document::Collection;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteEndpoint;
use crate::resilience::RateLimiter;
use crate::store::LocalStore;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// The per-account replication engine.
///
/// Built in `Created` state; call [`start()`](Self::start) to spawn the
/// controllers and [`shutdown()`](Self::shutdown) to stop them.
pub struct ReplicationEngine {
    config: ReplicationConfig,

    store: Arc<dyn LocalStore>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Fired by [`credentials_refreshed`](Self::credentials_refreshed).
    credentials: Arc<Notify>,

    /// One per enabled collection, in config order.
    controllers: Vec<Arc<ReplicationController>>,

    aggregation: Option<AggregationService>,
}

impl ReplicationEngine {
    /// Build the engine and its controllers without starting anything.
    ///
    /// Fails with [`ReplicationError::Config`] if the config is invalid or
    /// names a different account than `remote` acts for.
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteEndpoint>,
    ) -> Result<Self> {
        config.validate()?;
        if remote.account_id() != config.account_id {
            return Err(ReplicationError::Config(format!(
                "config is for account {} but the remote acts for {}",
                config.account_id,
                remote.account_id()
            )));
        }

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let credentials = Arc::new(Notify::new());

        // Shared across every controller of the account
        let rate_limiter: Option<Arc<RateLimiter>> =
            config.settings.rate_limit.rate_limit_config().map(|cfg| {
                info!(
                    rate_per_sec = cfg.refill_rate,
                    burst = cfg.burst_size,
                    "Rate limiting enabled for remote requests"
                );
                Arc::new(RateLimiter::new(cfg))
            });

        let controllers = config
            .enabled_collections()
            .map(|entry| {
                let settings = ControllerSettings::from_config(&config, entry);
                Arc::new(
                    ReplicationController::new(entry.collection, settings, store.clone(), remote.clone())
                        .with_rate_limiter(rate_limiter.clone())
                        .with_credentials(credentials.clone()),
                )
            })
            .collect();

        Ok(Self {
            config,
            store,
            state_tx,
            state_rx,
            credentials,
            controllers,
            aggregation: None,
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn account_id(&self) -> &str {
        &self.config.account_id
    }

    pub fn controllers(&self) -> &[Arc<ReplicationController>] {
        &self.controllers
    }

    /// The controller replicating `collection`, if it is enabled.
    pub fn controller(&self, collection: Collection) -> Option<&Arc<ReplicationController>> {
        self.controllers.iter().find(|c| c.collection() == collection)
    }

    /// The aggregation service, once started with aggregation enabled.
    pub fn aggregation(&self) -> Option<&AggregationService> {
        self.aggregation.as_ref()
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start aggregation (when enabled) and every controller.
    ///
    /// Aggregation subscribes to the commit feed before any controller
    /// pulls, so no remote message commit goes unaggregated.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: EngineState::Created.to_string(),
                actual: state.to_string(),
            });
        }

        info!(
            account_id = %self.config.account_id,
            collections = self.controllers.len(),
            aggregation = self.config.settings.aggregation.enabled,
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        if self.config.settings.aggregation.enabled {
            self.aggregation = Some(AggregationService::spawn(
                self.store.clone(),
                &self.config.settings.aggregation,
            ));
            debug!("Spawned aggregation service");
        }

        for controller in &self.controllers {
            controller.start().await?;
        }

        self.set_state(EngineState::Running);
        info!(account_id = %self.config.account_id, "Replication engine running");
        Ok(())
    }

    /// Stop every controller (concurrently), then aggregation.
    ///
    /// Safe to call from any state; ends in `Stopped`.
    pub async fn shutdown(&mut self) {
        info!(account_id = %self.config.account_id, "Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        futures::future::join_all(self.controllers.iter().map(|c| c.shutdown())).await;

        if let Some(aggregation) = self.aggregation.take() {
            aggregation.shutdown().await;
        }

        self.set_state(EngineState::Stopped);
        info!(account_id = %self.config.account_id, "Replication engine stopped");
    }

    /// Release controllers paused on an authentication failure.
    ///
    /// Call after the token provider behind the remote has a fresh token.
    pub fn credentials_refreshed(&self) {
        info!(account_id = %self.config.account_id, "Credentials refreshed, resuming paused controllers");
        self.credentials.notify_waiters();
    }

    /// Health snapshot for monitoring endpoints.
    ///
    /// Performs no network I/O: states come from watch channels and the rest
    /// from the local store.
    ///
    /// ```rust,ignore
    /// let health = engine.health_check().await;
    /// if !health.ready {
    ///     return StatusCode::SERVICE_UNAVAILABLE;
    /// }
    /// for failing in health.failing() {
    ///     warn!(collection = %failing.collection, error = ?failing.last_error, "Controller failing");
    /// }
    /// ```
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let controllers = futures::future::join_all(self.controllers.iter().map(|c| c.health())).await;

        let aggregation_running = self
            .config
            .settings
            .aggregation
            .enabled
            .then(|| self.aggregation.as_ref().is_some_and(AggregationService::is_running));

        let ready = state == EngineState::Running
            && controllers.iter().all(|c| c.state == ControllerState::Streaming);
        let healthy = ready && !controllers.iter().any(|c| c.circuit_open) && aggregation_running.unwrap_or(true);

        HealthCheck {
            account_id: self.config.account_id.clone(),
            state,
            ready,
            healthy,
            controllers,
            aggregation_running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use crate::remote::MemoryRemote;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn engine(config: ReplicationConfig) -> Result<ReplicationEngine> {
        let remote = MemoryRemote::new();
        ReplicationEngine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(remote.endpoint("acct")),
        )
    }

    async fn wait_ready(engine: &ReplicationEngine) -> HealthCheck {
        for _ in 0..200 {
            let health = engine.health_check().await;
            if health.ready {
                return health;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never became ready");
    }

    #[test]
    fn test_engine_initial_state() {
        let engine = engine(ReplicationConfig::for_testing("acct")).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.account_id(), "acct");
        assert_eq!(engine.controllers().len(), 2);
        assert!(engine.controller(Collection::Messages).is_some());
        assert!(engine.controller(Collection::Threads).is_none());
    }

    #[test]
    fn test_engine_rejects_account_mismatch() {
        let result = engine(ReplicationConfig::for_testing("other"));
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = ReplicationConfig::for_testing("acct");
        config.settings.aggregation.enabled = true;
        config.collections.push(CollectionConfig::new(Collection::Tags));
        assert!(matches!(engine(config), Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_disabled_collections_get_no_controller() {
        let mut config = ReplicationConfig::for_testing("acct");
        config.collections[1].enabled = false;
        let engine = engine(config).unwrap();
        assert_eq!(engine.controllers().len(), 1);
        assert!(engine.controller(Collection::Contacts).is_none());
    }

    #[test]
    fn test_engine_state_receiver() {
        let engine = engine(ReplicationConfig::for_testing("acct")).unwrap();
        let state_rx = engine.state_receiver();
        assert_eq!(*state_rx.borrow(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let mut engine = engine(ReplicationConfig::for_testing("acct")).unwrap();
        engine.state_tx.send_replace(EngineState::Running);

        match engine.start().await {
            Err(ReplicationError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("Expected InvalidState error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let mut engine = engine(ReplicationConfig::for_testing("acct")).unwrap();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine
            .controllers()
            .iter()
            .all(|c| c.state() == ControllerState::Stopped));
    }

    #[tokio::test]
    async fn test_engine_start_reaches_ready() {
        let mut engine = engine(ReplicationConfig::for_testing("acct")).unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());

        let health = wait_ready(&engine).await;
        assert!(health.healthy);
        assert_eq!(health.aggregation_running, None);
        assert_eq!(health.failing().count(), 0);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.health_check().await.ready);
    }

    #[tokio::test]
    async fn test_engine_with_aggregation() {
        let mut config = ReplicationConfig::for_testing("acct");
        config.settings.aggregation.enabled = true;
        let mut engine = engine(config).unwrap();
        assert!(engine.aggregation().is_none());

        engine.start().await.unwrap();
        let health = wait_ready(&engine).await;
        assert_eq!(health.aggregation_running, Some(true));
        assert!(health.healthy);

        engine.shutdown().await;
        assert!(engine.aggregation().is_none());
    }
}
