// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (remote transport, credentials,
//! local store, wire codec) and carry enough context to tell which
//! collection or request failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network errors, timeouts, 5xx, circuit open |
//! | `Store` | Yes | Local commit failed; the batch is retried whole |
//! | `Auth` | No | Credential expired or invalid; controller pauses |
//! | `Validation` | No | Remote rejected a document permanently |
//! | `Codec` | No | Malformed checkpoint or change batch |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Controller is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! A push conflict is not an error: it arrives in the `conflicts` list of a
//! successful push response and is routed to [`crate::conflict::ConflictResolver`].
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. A non-retryable error escalates the
//! owning controller to [`ControllerState::Error`](crate::coordinator::ControllerState::Error).

use crate::document::Collection;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication and aggregation.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network, timeout or server-side failure talking to the remote.
    ///
    /// Never surfaced as data loss: the last committed checkpoint and the
    /// unacknowledged change rows are preserved, and the call is retried.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Credential rejected by the remote (401/403).
    ///
    /// Replication for the controller pauses until credentials are refreshed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote permanently rejected a document on push.
    ///
    /// The change row is marked rejected and never re-pushed.
    #[error("Validation rejected {collection} document {document_id}: {message}")]
    Validation {
        collection: Collection,
        document_id: String,
        message: String,
    },

    /// Local store commit or query failure.
    ///
    /// Batches are applied in a single transaction, so a failed commit
    /// leaves nothing behind and the batch can be retried.
    #[error("Local store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Malformed wire data (checkpoint, change batch, event frame).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation
    /// (e.g., calling `start()` on an already-running controller).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a reqwest error.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Store(_) => true, // Whole batch retried, never partial
            Self::Auth(_) => false, // Waits for new credentials instead
            Self::Validation { .. } => false,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error means the credential must be refreshed.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Auth(_) => "auth",
            Self::Validation { .. } => "validation",
            Self::Store(_) => "store",
            Self::Codec(_) => "codec",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transport() {
        let err = ReplicationError::transport_msg("pull messages", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("pull messages"));
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_is_retryable_store() {
        let err = ReplicationError::Store(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_auth() {
        let err = ReplicationError::Auth("token expired".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_auth());
    }

    #[test]
    fn test_not_retryable_validation() {
        let err = ReplicationError::Validation {
            collection: Collection::Messages,
            document_id: "m-1".to_string(),
            message: "subject too long".to_string(),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("messages"));
        assert!(msg.contains("m-1"));
        assert!(msg.contains("subject too long"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("empty account id".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_codec_from_serde_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: ReplicationError = parse.unwrap_err().into();
        assert!(matches!(err, ReplicationError::Codec(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Idle".to_string(),
            actual: "Streaming".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Idle"));
        assert!(err.to_string().contains("Streaming"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!ReplicationError::Shutdown.is_retryable());
    }

    #[test]
    fn test_transport_error_formatting() {
        let err = ReplicationError::Transport {
            operation: "push contacts".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Transport error"));
        assert!(msg.contains("push contacts"));
        assert!(msg.contains("timeout"));
    }
}
