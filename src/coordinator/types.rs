//! Controller and engine state types.
//!
//! # Controller State Transitions
//!
//! ```text
//!            start()
//! Idle ─────────────────→ PullingInitial ──(caught up)──→ Streaming
//!  │                          ↑     │                         │
//!  │                 (backoff │     │ transport / auth        │ transport / auth
//!  │            or new creds) │     ↓ failure                 │ failure
//!  │                          └── Error ←─────────────────────┘
//!  │                                │
//!  │ shutdown()                     │ shutdown() (from any state)
//!  └──────────────────────────→ Stopped
//! ```
//!
//! - **Idle**: created, not started.
//! - **PullingInitial**: pulling page after page until a short page.
//! - **Streaming**: polling, live push and push loop running concurrently.
//! - **Error**: waiting out backoff (or new credentials) before the next cycle.
//! - **Stopped**: terminal. Live subscription released, no batch half-applied.

use crate::checkpoint::Checkpoint;
use crate::document::Collection;
use crate::push::Rejection;
use std::fmt;

/// State of one (account, collection) replication controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    PullingInitial,
    Streaming,
    Error,
    Stopped,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PullingInitial => "PullingInitial",
            Self::Streaming => "Streaming",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the per-account engine.
///
/// ```text
/// Created ──start()──→ Starting ──→ Running ──shutdown()──→ ShuttingDown ──→ Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built but not started. Call [`start()`](super::ReplicationEngine::start).
    Created,
    /// Backfilling aggregates and spawning controllers.
    Starting,
    /// Every enabled controller has been started.
    Running,
    /// Controllers are draining in-flight work.
    ShuttingDown,
    /// Shut down cleanly. Safe to drop.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot of one controller, built from local state only.
#[derive(Debug, Clone)]
pub struct ControllerHealth {
    pub collection: Collection,
    pub state: ControllerState,
    /// Last committed pull checkpoint.
    pub checkpoint: Option<Checkpoint>,
    /// Local change rows not yet acknowledged.
    pub pending_push: usize,
    pub last_error: Option<String>,
    pub last_rejection: Option<Rejection>,
    /// Whether the pull or push circuit is likely open.
    pub circuit_open: bool,
}

/// Health snapshot of a [`ReplicationEngine`](super::ReplicationEngine).
///
/// Collected without network I/O, so it is cheap enough for readiness probes.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub account_id: String,
    pub state: EngineState,
    /// Running with every controller past its initial pull.
    pub ready: bool,
    /// Ready and no controller in `Error`.
    pub healthy: bool,
    pub controllers: Vec<ControllerHealth>,
    /// Aggregation service running (when enabled).
    pub aggregation_running: Option<bool>,
}

impl HealthCheck {
    /// Controllers currently in [`ControllerState::Error`].
    pub fn failing(&self) -> impl Iterator<Item = &ControllerHealth> {
        self.controllers.iter().filter(|c| c.state == ControllerState::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_state_display() {
        assert_eq!(ControllerState::Idle.to_string(), "Idle");
        assert_eq!(ControllerState::PullingInitial.to_string(), "PullingInitial");
        assert_eq!(ControllerState::Streaming.to_string(), "Streaming");
        assert_eq!(ControllerState::Error.to_string(), "Error");
        assert_eq!(ControllerState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_only_stopped_is_terminal() {
        assert!(ControllerState::Stopped.is_terminal());
        assert!(!ControllerState::Error.is_terminal());
        assert!(!ControllerState::Idle.is_terminal());
    }

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
    }

    #[test]
    fn test_health_failing_filter() {
        let controller = |collection, state| ControllerHealth {
            collection,
            state,
            checkpoint: None,
            pending_push: 0,
            last_error: None,
            last_rejection: None,
            circuit_open: false,
        };
        let health = HealthCheck {
            account_id: "acct".into(),
            state: EngineState::Running,
            ready: true,
            healthy: false,
            controllers: vec![
                controller(Collection::Messages, ControllerState::Streaming),
                controller(Collection::Contacts, ControllerState::Error),
            ],
            aggregation_running: None,
        };
        let failing: Vec<_> = health.failing().map(|c| c.collection).collect();
        assert_eq!(failing, vec![Collection::Contacts]);
    }
}
