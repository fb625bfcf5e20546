// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composite replication cursor.
//!
//! A [`Checkpoint`] is the `(updatedAt, primaryKey)` pair of the last document
//! a pull returned. Ordering is lexicographic on that pair, so documents that
//! share an `updatedAt` at a batch boundary are never skipped: the next pull
//! asks for everything strictly after the pair, not after the timestamp.
//!
//! ```text
//! (10:00, "a") < (10:00, "b") < (10:01, "")
//!        ▲ cursor                   everything after (10:00,"a") is re-offered,
//!                                   including (10:00,"b")
//! ```
//!
//! The origin checkpoint is `(1970-01-01T00:00:00Z, "")`, i.e. "from the
//! beginning of time".

use crate::document::{format_timestamp, parse_timestamp, Collection, Document};
use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Ordered cursor marking pull progress for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub updated_at: DateTime<Utc>,
    pub key: String,
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.updated_at
            .cmp(&other.updated_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::origin()
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", format_timestamp(&self.updated_at), self.key)
    }
}

impl Checkpoint {
    pub fn new(updated_at: DateTime<Utc>, key: impl Into<String>) -> Self {
        Self {
            updated_at,
            key: key.into(),
        }
    }

    /// The "beginning of time" sentinel.
    pub fn origin() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH, "")
    }

    pub fn is_origin(&self) -> bool {
        *self == Self::origin()
    }

    /// Cursor position of a document.
    pub fn of(doc: &Document) -> Self {
        Self::new(doc.updated_at, doc.id.clone())
    }

    /// True if `doc` sorts strictly after this cursor.
    pub fn admits(&self, doc: &Document) -> bool {
        match doc.updated_at.cmp(&self.updated_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => doc.id.as_str() > self.key.as_str(),
        }
    }

    /// Wire form: `{ "updatedAt": ..., "<tieBreaker>": ... }`.
    pub fn encode(&self, collection: Collection) -> Value {
        let mut map = Map::new();
        map.insert(
            "updatedAt".to_string(),
            Value::String(format_timestamp(&self.updated_at)),
        );
        map.insert(
            collection.key_field().to_string(),
            Value::String(self.key.clone()),
        );
        Value::Object(map)
    }

    /// Parse the wire form. An empty or missing `updatedAt` decodes to the
    /// origin timestamp, and a missing tie-breaker to the empty key.
    pub fn decode(collection: Collection, value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ReplicationError::Codec(format!(
                "{} checkpoint is not an object",
                collection
            )));
        };

        let updated_at = match map.get("updatedAt") {
            None | Some(Value::Null) => DateTime::<Utc>::UNIX_EPOCH,
            Some(Value::String(s)) if s.is_empty() => DateTime::<Utc>::UNIX_EPOCH,
            Some(Value::String(s)) => parse_timestamp(s)?,
            Some(other) => {
                return Err(ReplicationError::Codec(format!(
                    "{} checkpoint has non-string updatedAt: {}",
                    collection, other
                )))
            }
        };

        let key = match map.get(collection.key_field()) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(ReplicationError::Codec(format!(
                    "{} checkpoint has non-string {}: {}",
                    collection,
                    collection.key_field(),
                    other
                )))
            }
        };

        Ok(Self { updated_at, key })
    }

    /// Query parameters for a pull request starting after this cursor.
    pub fn query_pairs(&self, collection: Collection) -> Vec<(String, String)> {
        vec![
            ("updatedAt".to_string(), format_timestamp(&self.updated_at)),
            (collection.key_field().to_string(), self.key.clone()),
        ]
    }
}
