//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use inbox_replication::config::{CollectionConfig, ReplicationConfig};
//! use inbox_replication::Collection;
//!
//! let config = ReplicationConfig {
//!     account_id: "acct-1".into(),
//!     collections: vec![
//!         CollectionConfig::new(Collection::Messages),
//!         CollectionConfig::new(Collection::Contacts),
//!     ],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── account_id: String              # Account whose collections replicate
//! ├── remote: RemoteConfig            # Base URL, request timeout, live push
//! ├── collections: Vec<CollectionConfig>
//! ├── settings: ReplicationSettings
//! │   ├── pull: PullConfig            # Batch size, poll interval
//! │   ├── push: PushConfig            # Batch size, push interval
//! │   ├── retry: RetrySettings        # Backoff for transport/store failures
//! │   ├── rate_limit: RateLimitSettings
//! │   └── aggregation: AggregationConfig
//! └── store: StoreConfig              # SQLite persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! account_id: "acct-1"
//!
//! remote:
//!   base_url: "https://mail.example.com/api/"
//!   request_timeout: "30s"
//!
//! collections:
//!   - collection: messages
//!   - collection: contacts
//!
//! settings:
//!   pull:
//!     batch_size: 50
//!     poll_interval: "30s"
//!   aggregation:
//!     enabled: true
//!
//! store:
//!   sqlite_path: "/var/lib/app/replica.db"
//! ```

use crate::document::Collection;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Account whose collections this engine replicates.
    /// One engine (and one controller per collection) per account.
    pub account_id: String,

    #[serde(default)]
    pub remote: RemoteConfig,

    /// Collections to replicate. Order is controller start order.
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionConfig>,

    #[serde(default)]
    pub settings: ReplicationSettings,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_collections() -> Vec<CollectionConfig> {
    vec![
        CollectionConfig::new(Collection::Messages),
        CollectionConfig::new(Collection::Contacts),
    ]
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            remote: RemoteConfig::default(),
            collections: default_collections(),
            settings: ReplicationSettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config with fast timings for testing.
    pub fn for_testing(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            remote: RemoteConfig {
                request_timeout: "500ms".to_string(),
                ..RemoteConfig::default()
            },
            collections: default_collections(),
            settings: ReplicationSettings {
                pull: PullConfig {
                    batch_size: 10,
                    poll_interval: "50ms".to_string(),
                    live_reconnect_delay: "20ms".to_string(),
                },
                push: PushConfig {
                    batch_size: 10,
                    interval: "20ms".to_string(),
                },
                retry: RetrySettings {
                    initial_delay: "5ms".to_string(),
                    max_delay: "50ms".to_string(),
                    backoff_factor: 2.0,
                    max_attempts: 3,
                    max_error_cycles: None,
                },
                rate_limit: RateLimitSettings::default(),
                aggregation: AggregationConfig {
                    enabled: false,
                    backfill_on_start: false,
                    max_event_attempts: 3,
                    retry_delay: "5ms".to_string(),
                },
            },
            store: StoreConfig::in_memory(),
        }
    }

    /// Collections with replication enabled.
    pub fn enabled_collections(&self) -> impl Iterator<Item = &CollectionConfig> {
        self.collections.iter().filter(|c| c.enabled)
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(ReplicationError::Config("account_id must not be empty".into()));
        }
        if self.settings.pull.batch_size == 0 {
            return Err(ReplicationError::Config("pull.batch_size must be at least 1".into()));
        }
        if self.settings.push.batch_size == 0 {
            return Err(ReplicationError::Config("push.batch_size must be at least 1".into()));
        }

        let mut seen = Vec::new();
        for entry in &self.collections {
            if seen.contains(&entry.collection) {
                return Err(ReplicationError::Config(format!(
                    "collection {} listed twice",
                    entry.collection
                )));
            }
            seen.push(entry.collection);
        }

        if self.settings.aggregation.enabled {
            if let Some(derived) = self
                .enabled_collections()
                .find(|c| c.collection.is_derived())
            {
                return Err(ReplicationError::Config(format!(
                    "local aggregation and pulling {} both write derived collections",
                    derived.collection
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteConfig: where the authoritative tier lives
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL every collection path is joined onto, including any `/api/`
    /// prefix. Must end with `/` for relative joins to keep the prefix.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout (pull and push; not the live stream).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Attach the live-push stream where the remote offers one.
    #[serde(default = "default_true")]
    pub live_push: bool,
}

fn default_base_url() -> String {
    "http://localhost:8080/api/".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            live_push: true,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout_duration(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CollectionConfig: one entry per replicated collection
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub collection: Collection,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Push local mutations upstream. Ignored for derived collections,
    /// which are pull-only.
    #[serde(default = "default_true")]
    pub push_enabled: bool,
}

impl CollectionConfig {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            enabled: true,
            push_enabled: true,
        }
    }

    /// Pull-only replication.
    pub fn pull_only(collection: Collection) -> Self {
        Self {
            push_enabled: false,
            ..Self::new(collection)
        }
    }

    /// Whether the controller runs a push loop for this collection.
    pub fn pushes(&self) -> bool {
        self.push_enabled && self.collection.is_pushable()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

/// Pull loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Documents requested per pull. The remote serves at most 100 and
    /// substitutes 10 for anything out of range.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How often to poll for changes while streaming.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Delay before re-opening a dropped live stream.
    #[serde(default = "default_live_reconnect_delay")]
    pub live_reconnect_delay: String,
}

fn default_batch_size() -> usize {
    50
}

fn default_poll_interval() -> String {
    "30s".to_string()
}

fn default_live_reconnect_delay() -> String {
    "2s".to_string()
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            live_reconnect_delay: default_live_reconnect_delay(),
        }
    }
}

impl PullConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(30))
    }

    pub fn live_reconnect_delay_duration(&self) -> Duration {
        parse_or(&self.live_reconnect_delay, Duration::from_secs(2))
    }
}

/// Push loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Pending change rows sent per request (after coalescing).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Push is triggered by local commits; this interval is the fallback
    /// sweep for rows whose trigger was missed.
    #[serde(default = "default_push_interval")]
    pub interval: String,
}

fn default_push_interval() -> String {
    "5s".to_string()
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval: default_push_interval(),
        }
    }
}

impl PushConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(5))
    }
}

/// Backoff for retryable failures and for `Error` state cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Attempts per request before the controller escalates to `Error`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Maximum `Error` → retry cycles before the controller stops.
    /// `None` retries forever.
    #[serde(default)]
    pub max_error_cycles: Option<u32>,
}

fn default_initial_delay() -> String {
    "500ms".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_attempts() -> usize {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            max_attempts: default_max_attempts(),
            max_error_cycles: None,
        }
    }
}

impl RetrySettings {
    /// Build the runtime retry policy. `request_timeout` comes from the
    /// remote settings.
    pub fn retry_config(&self, request_timeout: Duration) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: parse_or(&self.initial_delay, Duration::from_millis(500)),
            max_delay: parse_or(&self.max_delay, Duration::from_secs(300)),
            backoff_factor: if self.backoff_factor >= 1.0 {
                self.backoff_factor
            } else {
                default_backoff_factor()
            },
            request_timeout,
        }
    }
}

/// Optional throttle shared by all of an account's controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Sustained remote requests per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub burst: u32,
}

fn default_rate_limit_per_sec() -> u32 {
    20
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            per_sec: default_rate_limit_per_sec(),
            burst: default_rate_limit_burst(),
        }
    }
}

impl RateLimitSettings {
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.enabled.then(|| RateLimitConfig {
            burst_size: self.burst,
            refill_rate: self.per_sec,
        })
    }
}

/// Local tag/category/thread maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Maintain derived collections locally from committed messages.
    /// Mutually exclusive with pulling derived collections.
    #[serde(default)]
    pub enabled: bool,

    /// Rebuild every known account's derived state when the service starts.
    #[serde(default = "default_true")]
    pub backfill_on_start: bool,

    /// Attempts per message event before it is skipped and a repair backfill
    /// is scheduled.
    #[serde(default = "default_max_attempts")]
    pub max_event_attempts: usize,

    #[serde(default = "default_aggregation_retry_delay")]
    pub retry_delay: String,
}

fn default_aggregation_retry_delay() -> String {
    "100ms".to_string()
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backfill_on_start: true,
            max_event_attempts: default_max_attempts(),
            retry_delay: default_aggregation_retry_delay(),
        }
    }
}

impl AggregationConfig {
    pub fn retry_config(&self) -> RetryConfig {
        let initial = parse_or(&self.retry_delay, Duration::from_millis(100));
        RetryConfig {
            max_attempts: self.max_event_attempts.max(1),
            initial_delay: initial,
            max_delay: initial.saturating_mul(16),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: local persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Local store persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replica.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
