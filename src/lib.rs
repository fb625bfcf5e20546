//! # Inbox Replication
//!
//! Offline-first replication of mailbox collections between a local store
//! and an authoritative remote, plus local maintenance of the derived
//! tag, category and thread collections.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     ReplicationEngine (one account)                      │
//! │                                                                          │
//! │  ┌──────────────────────┐  pull / live  ┌────────────┐                   │
//! │  │ ReplicationController│──────────────►│            │  commit feed      │
//! │  │ (per collection)     │               │ LocalStore │──────────┐        │
//! │  │  PullEngine          │◄──────────────│ (SQLite)   │          ▼        │
//! │  │  PushEngine          │  change rows  │            │◄── AggregationService
//! │  └──────────┬───────────┘               └────────────┘   (tags, categories,
//! │             │                                             threads)       │
//! └─────────────┼────────────────────────────────────────────────────────────┘
//!               ▼
//!        RemoteEndpoint (HTTP + SSE live push)
//! ```
//!
//! ## Replication Model
//!
//! 1. **Pull**: page through changes strictly after a `(updatedAt, id)`
//!    checkpoint; each page and its checkpoint commit atomically.
//! 2. **Live push**: server-sent batches applied between polls; a resync
//!    pull follows every (re)subscription.
//! 3. **Push**: journaled local changes, coalesced per document; conflicts
//!    resolve last-writer-wins with the remote winning ties.
//! 4. **Aggregation**: committed messages update tag/category counts and
//!    thread rollups incrementally; backfill repairs anything missed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use inbox_replication::{HttpRemote, ReplicationConfig, ReplicationEngine, SharedToken, SqliteStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> inbox_replication::Result<()> {
//!     let config = ReplicationConfig::for_testing("acct-1");
//!     let store = Arc::new(SqliteStore::from_config(&config.store).await?);
//!     let token = Arc::new(SharedToken::new("bearer-token"));
//!     let remote = Arc::new(HttpRemote::new(&config.remote, config.account_id.clone(), token)?);
//!
//!     let mut engine = ReplicationEngine::new(config, store, remote)?;
//!     engine.start().await?;
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod batch;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod metrics;
pub mod pull;
pub mod push;
pub mod remote;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use aggregate::{AggregationEngine, AggregationService, BackfillSummary, ThreadAssembler, ThreadRollup};
pub use batch::{ChangeBatch, ChangeRow, PullRequest};
pub use checkpoint::Checkpoint;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitStats, RemoteCircuit};
pub use config::{AggregationConfig, CollectionConfig, RemoteConfig, ReplicationConfig, ReplicationSettings, StoreConfig};
pub use conflict::{ConflictResolver, Resolution};
pub use coordinator::{
    ControllerHealth, ControllerSettings, ControllerState, EngineState, HealthCheck, ReplicationController,
    ReplicationEngine,
};
pub use document::{Collection, Document, MessageFields, Person};
pub use error::{ReplicationError, Result};
pub use pull::PullEngine;
pub use push::{PushEngine, Rejection};
pub use remote::{HttpRemote, LiveFeed, MemoryRemote, RemoteEndpoint, SharedToken, TokenProvider};
pub use store::{LocalStore, MemoryStore, SqliteStore};
