//! Document builders and async assertion helpers.

use chrono::Utc;
use inbox_replication::aggregate::message_count;
use inbox_replication::batch::BatchConfig;
use inbox_replication::circuit_breaker::{CircuitConfig, RemoteCircuit};
use inbox_replication::{Collection, Document, LocalStore, MemoryRemote, ReplicationConfig};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const ACCOUNT: &str = "A";

/// A message in thread `thread` with the given tags.
pub fn message(id: &str, thread: &str, internal_date: i64, tags: &[&str]) -> Document {
    Document::new(ACCOUNT, id, Utc::now())
        .with_field("threadId", thread)
        .with_field("internalDate", internal_date)
        .with_field("subject", format!("Subject of {}", id))
        .with_field("snippet", format!("Snippet of {}", id))
        .with_field("sender", json!({ "email": "alice@example.com", "name": "Alice" }))
        .with_field("labels", json!(["INBOX"]))
        .with_field("tags", json!(tags))
        .with_field("categories", json!([]))
}

pub fn contact(id: &str, name: &str) -> Document {
    Document::new(ACCOUNT, id, Utc::now())
        .with_field("name", name)
        .with_field("email", format!("{}@example.com", id))
}

/// Remote with fast live batching.
pub fn fast_remote() -> MemoryRemote {
    MemoryRemote::with_live_batching(BatchConfig::testing())
}

/// Test config replicating only messages, with aggregation on or off.
pub fn messages_config(aggregation: bool) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(ACCOUNT);
    config.collections.retain(|c| c.collection == Collection::Messages);
    config.settings.aggregation.enabled = aggregation;
    config
}

/// Circuit that stays closed through a handful of injected failures.
pub fn lenient_circuit() -> Arc<RemoteCircuit> {
    let lenient = CircuitConfig {
        failure_threshold: 100,
        ..CircuitConfig::testing()
    };
    Arc::new(RemoteCircuit::with_configs(lenient.clone(), lenient))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// `messageCount` of a tag or category record, if the record exists.
pub async fn count_of(store: &dyn LocalStore, collection: Collection, value: &str) -> Option<i64> {
    store
        .get(ACCOUNT, collection, value)
        .await
        .unwrap()
        .map(|doc| message_count(&doc))
}
