//! Replicated document model.
//!
//! A [`Document`] is a structured core (primary key, owning account,
//! timestamps, soft-delete flag) plus an open-ended `fields` map that carries
//! every other attribute verbatim. The engine only reasons about the core;
//! the typed [`MessageFields`] view is decoded on demand by the aggregation
//! layer.
//!
//! # Wire Shape
//!
//! ```text
//! {
//!   "messageId": "m-1",            ← primary key under the collection's tie-breaker field
//!   "accountId": "acct-1",         ← optional on the wire (endpoint account is assumed)
//!   "updatedAt": "2025-11-05T10:00:00.000000000Z",
//!   "createdAt": "2025-11-05T09:00:00.000000000Z",
//!   "isDeleted": false,
//!   "subject": "...", ...          ← preserved in `fields`
//! }
//! ```

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

const ACCOUNT_FIELD: &str = "accountId";
const UPDATED_AT_FIELD: &str = "updatedAt";
const CREATED_AT_FIELD: &str = "createdAt";
const DELETED_FIELD: &str = "isDeleted";
const RX_DELETED_FIELD: &str = "_deleted";
const REMOTE_ID_FIELD: &str = "_id";

/// Separator between account and logical id in remote composite keys.
pub const KEY_SEPARATOR: char = ';';

/// Logical collections replicated between the local and remote tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Messages,
    Contacts,
    Tags,
    Categories,
    Threads,
}

impl Collection {
    /// Every collection, in controller start order.
    pub const ALL: [Collection; 5] = [
        Collection::Messages,
        Collection::Contacts,
        Collection::Tags,
        Collection::Categories,
        Collection::Threads,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Contacts => "contacts",
            Self::Tags => "tags",
            Self::Categories => "categories",
            Self::Threads => "threads",
        }
    }

    /// Field holding the document array in pull, push and live bodies.
    pub fn docs_field(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Contacts => "people",
            Self::Tags => "tags",
            Self::Categories => "categories",
            Self::Threads => "threads",
        }
    }

    /// Primary key field; doubles as the checkpoint tie-breaker.
    pub fn key_field(self) -> &'static str {
        match self {
            Self::Messages => "messageId",
            Self::Contacts => "personId",
            Self::Tags => "tag",
            Self::Categories => "category",
            Self::Threads => "threadId",
        }
    }

    pub fn pull_path(self) -> &'static str {
        match self {
            Self::Messages => "messages/pull",
            Self::Contacts => "people/pull",
            Self::Tags => "messages/aggregate/pullTags",
            Self::Categories => "messages/aggregate/pullCategories",
            Self::Threads => "threads/pull",
        }
    }

    /// Push endpoint. `None` for derived collections.
    pub fn push_path(self) -> Option<&'static str> {
        match self {
            Self::Messages => Some("messages/push"),
            Self::Contacts => Some("people/push"),
            Self::Tags | Self::Categories | Self::Threads => None,
        }
    }

    /// Live event stream endpoint, where the remote offers one.
    pub fn live_path(self) -> Option<&'static str> {
        match self {
            Self::Messages => Some("messages/pullStream"),
            Self::Threads => Some("threads/pullStream"),
            Self::Contacts | Self::Tags | Self::Categories => None,
        }
    }

    /// Derived collections are written only by the aggregation layer.
    pub fn is_derived(self) -> bool {
        matches!(self, Self::Tags | Self::Categories | Self::Threads)
    }

    pub fn is_pushable(self) -> bool {
        self.push_path().is_some()
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| ReplicationError::Config(format!("unknown collection: {}", s)))
    }
}

/// Format a timestamp the way it travels on the wire and sorts in storage.
///
/// Fixed-width nanosecond precision keeps the text form lexicographically
/// ordered.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ReplicationError::Codec(format!("invalid timestamp {:?}: {}", raw, e)))
}

/// A replicated document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Logical primary key, unique within (account, collection).
    pub id: String,
    /// Owning account.
    pub account_id: String,
    /// Commit timestamp assigned by whichever side committed the mutation.
    pub updated_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    /// Soft-delete flag. Documents under replication are never hard-deleted.
    pub is_deleted: bool,
    /// Every other field, preserved verbatim.
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(account_id: impl Into<String>, id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            updated_at,
            created_at: None,
            is_deleted: false,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Remote composite key: `accountId;logicalId`.
    pub fn remote_id(&self) -> String {
        format!("{}{}{}", self.account_id, KEY_SEPARATOR, self.id)
    }

    /// True when both versions carry the same user-visible state.
    ///
    /// Timestamps are ignored; this is what makes push redelivery a no-op.
    pub fn same_content(&self, other: &Document) -> bool {
        self.id == other.id
            && self.account_id == other.account_id
            && self.is_deleted == other.is_deleted
            && self.fields == other.fields
    }

    /// Decode a document from its wire object.
    ///
    /// `account_id` fills in the owning account when the remote omits it.
    pub fn from_wire(collection: Collection, account_id: &str, value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(ReplicationError::Codec(format!(
                "{} document is not an object",
                collection
            )));
        };

        let remote_id = match map.remove(REMOTE_ID_FIELD) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let id = match map.remove(collection.key_field()) {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(ReplicationError::Codec(format!(
                    "{} has non-string {}: {}",
                    collection,
                    collection.key_field(),
                    other
                )))
            }
            None => remote_id
                .as_deref()
                .and_then(|rid| rid.split_once(KEY_SEPARATOR).map(|(_, key)| key.to_string()))
                .ok_or_else(|| {
                    ReplicationError::Codec(format!(
                        "{} document missing {}",
                        collection,
                        collection.key_field()
                    ))
                })?,
        };

        let account_id = match map.remove(ACCOUNT_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => account_id.to_string(),
        };

        let updated_at = match map.remove(UPDATED_AT_FIELD) {
            Some(Value::String(s)) => parse_timestamp(&s)?,
            _ => {
                return Err(ReplicationError::Codec(format!(
                    "{} document {} missing updatedAt",
                    collection, id
                )))
            }
        };

        let created_at = match map.remove(CREATED_AT_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => Some(parse_timestamp(&s)?),
            _ => None,
        };

        let deleted = map.remove(DELETED_FIELD);
        let rx_deleted = map.remove(RX_DELETED_FIELD);
        let is_deleted = [deleted, rx_deleted]
            .into_iter()
            .flatten()
            .any(|v| v.as_bool().unwrap_or(false));

        Ok(Self {
            id,
            account_id,
            updated_at,
            created_at,
            is_deleted,
            fields: map,
        })
    }

    /// Encode the document as its wire object.
    pub fn to_wire(&self, collection: Collection) -> Value {
        let mut map = self.fields.clone();
        map.insert(collection.key_field().to_string(), Value::String(self.id.clone()));
        map.insert(ACCOUNT_FIELD.to_string(), Value::String(self.account_id.clone()));
        map.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(format_timestamp(&self.updated_at)),
        );
        if let Some(created_at) = &self.created_at {
            map.insert(
                CREATED_AT_FIELD.to_string(),
                Value::String(format_timestamp(created_at)),
            );
        }
        map.insert(DELETED_FIELD.to_string(), Value::Bool(self.is_deleted));
        Value::Object(map)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Typed message view
// ═══════════════════════════════════════════════════════════════════════════════

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Sender or recipient of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Person {
    #[serde(deserialize_with = "nullable")]
    pub email: String,
    #[serde(deserialize_with = "nullable")]
    pub name: String,
}

/// The message fields the aggregation layer reasons about.
///
/// Everything else on a message stays in [`Document::fields`] untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageFields {
    pub thread_id: Option<String>,
    /// Provider timestamp in epoch milliseconds.
    #[serde(deserialize_with = "nullable")]
    pub internal_date: i64,
    #[serde(deserialize_with = "nullable")]
    pub sender: Person,
    #[serde(deserialize_with = "nullable")]
    pub subject: String,
    #[serde(deserialize_with = "nullable")]
    pub snippet: String,
    #[serde(deserialize_with = "nullable")]
    pub labels: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub categories: Vec<String>,
}

impl MessageFields {
    pub fn from_document(doc: &Document) -> Result<Self> {
        serde_json::from_value(Value::Object(doc.fields.clone())).map_err(|e| {
            ReplicationError::Codec(format!("message {} has malformed fields: {}", doc.id, e))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commit clock
// ═══════════════════════════════════════════════════════════════════════════════

/// Hands out strictly increasing commit timestamps.
///
/// `stamp()` returns `max(now, last + 1µs)`, so two commits on the same tier
/// never share an `updatedAt` even when the wall clock stalls or steps back.
#[derive(Debug)]
pub struct CommitClock {
    last: Mutex<DateTime<Utc>>,
}

impl Default for CommitClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    pub fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + chrono::Duration::microseconds(1)
        };
        *last = next;
        next
    }

    /// Make sure future stamps land after `ts` (used when reopening a store).
    pub fn observe(&self, ts: DateTime<Utc>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if ts > *last {
            *last = ts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn test_collection_wire_names() {
        assert_eq!(Collection::Contacts.docs_field(), "people");
        assert_eq!(Collection::Contacts.key_field(), "personId");
        assert_eq!(Collection::Tags.pull_path(), "messages/aggregate/pullTags");
        assert_eq!(Collection::Threads.live_path(), Some("threads/pullStream"));
        assert!(Collection::Tags.push_path().is_none());
        assert!(Collection::Messages.is_pushable());
        assert!(Collection::Threads.is_derived());
        assert!(!Collection::Contacts.is_derived());
    }

    #[test]
    fn test_collection_from_str() {
        assert_eq!("categories".parse::<Collection>().unwrap(), Collection::Categories);
        assert!("mailboxes".parse::<Collection>().is_err());
    }

    #[test]
    fn test_from_wire_extracts_core_fields() {
        let value = json!({
            "messageId": "m-1",
            "accountId": "acct-1",
            "updatedAt": "2025-11-05T10:00:00.5Z",
            "createdAt": "2025-11-05T09:00:00Z",
            "isDeleted": false,
            "subject": "hello",
            "tags": ["x"]
        });
        let doc = Document::from_wire(Collection::Messages, "other", value).unwrap();
        assert_eq!(doc.id, "m-1");
        assert_eq!(doc.account_id, "acct-1");
        assert_eq!(doc.updated_at, ts("2025-11-05T10:00:00.5Z"));
        assert_eq!(doc.created_at, Some(ts("2025-11-05T09:00:00Z")));
        assert!(!doc.is_deleted);
        assert_eq!(doc.field("subject"), Some(&json!("hello")));
        assert!(doc.field("messageId").is_none());
    }

    #[test]
    fn test_from_wire_fills_account_and_key_from_remote_id() {
        let value = json!({
            "_id": "acct-9;p-3",
            "updatedAt": "2025-11-05T10:00:00Z",
            "_deleted": true
        });
        let doc = Document::from_wire(Collection::Contacts, "acct-9", value).unwrap();
        assert_eq!(doc.id, "p-3");
        assert_eq!(doc.account_id, "acct-9");
        assert!(doc.is_deleted);
        assert_eq!(doc.remote_id(), "acct-9;p-3");
    }

    #[test]
    fn test_from_wire_rejects_missing_updated_at() {
        let err = Document::from_wire(Collection::Messages, "a", json!({"messageId": "m"}))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Codec(_)));
    }

    #[test]
    fn test_from_wire_rejects_non_object() {
        assert!(Document::from_wire(Collection::Tags, "a", json!([1, 2])).is_err());
    }

    #[test]
    fn test_to_wire_keeps_extra_fields() {
        let doc = Document::new("a", "work", ts("2025-01-01T00:00:00Z")).with_field("messageCount", 3);
        let wire = doc.to_wire(Collection::Tags);
        assert_eq!(wire["tag"], json!("work"));
        assert_eq!(wire["messageCount"], json!(3));
        assert_eq!(wire["updatedAt"], json!("2025-01-01T00:00:00.000000000Z"));
        assert_eq!(wire["isDeleted"], json!(false));
        let back = Document::from_wire(Collection::Tags, "a", wire).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_same_content_ignores_timestamps() {
        let a = Document::new("a", "m", ts("2025-01-01T00:00:00Z")).with_field("subject", "s");
        let mut b = a.clone();
        b.updated_at = ts("2025-01-02T00:00:00Z");
        assert!(a.same_content(&b));
        b.is_deleted = true;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_message_fields_tolerate_nulls() {
        let doc = Document::new("a", "m", Utc::now())
            .with_field("threadId", "t-1")
            .with_field("tags", Value::Null)
            .with_field("sender", json!({"email": "x@y.z", "name": null}))
            .with_field("internalDate", 1_700_000_000_000i64);
        let fields = MessageFields::from_document(&doc).unwrap();
        assert_eq!(fields.thread_id.as_deref(), Some("t-1"));
        assert!(fields.tags.is_empty());
        assert_eq!(fields.sender.email, "x@y.z");
        assert_eq!(fields.sender.name, "");
        assert_eq!(fields.internal_date, 1_700_000_000_000);
    }

    #[test]
    fn test_message_fields_reject_wrong_types() {
        let doc = Document::new("a", "m", Utc::now()).with_field("tags", "not-a-list");
        assert!(MessageFields::from_document(&doc).is_err());
    }

    #[test]
    fn test_commit_clock_strictly_increases() {
        let clock = CommitClock::new();
        let future = Utc::now() + chrono::Duration::seconds(60);
        clock.observe(future);
        let a = clock.stamp();
        let b = clock.stamp();
        assert!(a > future);
        assert!(b > a);
    }
}
