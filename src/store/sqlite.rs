// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable [`LocalStore`] backed by SQLite.
//!
//! Documents, pull checkpoints, the change-row journal and membership rows
//! live in one database, so a pulled batch and its checkpoint commit in the
//! same transaction:
//!
//! ```text
//! BEGIN
//!   upsert documents (only where strictly newer)
//!   supersede pending rows the batch overrides
//!   advance checkpoint (never backwards)
//! COMMIT            ← crash before here = batch re-pulled, idempotent
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Whole transactions are retried with exponential backoff
//! (10ms doubling to 500ms, 5 attempts); a transaction that fails leaves
//! nothing behind.
//!
//! # Timestamps
//!
//! `updated_at` columns hold fixed-width RFC 3339 nanosecond text, so
//! string comparison in SQL is chronological comparison.

use super::{
    ensure_writable, ApplyOutcome, BoxFuture, ChangeOrigin, ChangeStatus, CommittedChange,
    DerivedCommit, Dimension, LocalStore, FEED_CAPACITY,
};
use crate::batch::{ChangeBatch, PendingChange};
use crate::checkpoint::Checkpoint;
use crate::config::StoreConfig;
use crate::conflict::Resolution;
use crate::document::{format_timestamp, parse_timestamp, Collection, CommitClock, Document};
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        account_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        is_deleted INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (account_id, collection, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        account_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        key TEXT NOT NULL,
        PRIMARY KEY (account_id, collection)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        document_id TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        body TEXT NOT NULL,
        assumed_master TEXT,
        status TEXT NOT NULL,
        reason TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS changes_by_status ON changes (account_id, collection, status, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS memberships (
        account_id TEXT NOT NULL,
        dimension TEXT NOT NULL,
        message_id TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (account_id, dimension, message_id, value)
    )
    "#,
];

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &ReplicationError) -> bool {
    match e {
        ReplicationError::Store(sqlx::Error::Database(db_err)) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a whole transaction, retrying it on SQLITE_BUSY/SQLITE_LOCKED.
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn encode_body(collection: Collection, document: &Document) -> Result<String> {
    Ok(serde_json::to_string(&document.to_wire(collection))?)
}

fn decode_body(collection: Collection, account_id: &str, body: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    Document::from_wire(collection, account_id, value)
}

async fn fetch_document(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    collection: Collection,
    id: &str,
) -> Result<Option<Document>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT body FROM documents WHERE account_id = ? AND collection = ? AND id = ?")
            .bind(account_id)
            .bind(collection.name())
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
    row.map(|(body,)| decode_body(collection, account_id, &body)).transpose()
}

async fn upsert_document(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    collection: Collection,
    document: &Document,
) -> Result<()> {
    let body = encode_body(collection, document)?;
    sqlx::query(
        r#"
        INSERT INTO documents (account_id, collection, id, updated_at, is_deleted, body)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(account_id, collection, id) DO UPDATE SET
            updated_at = excluded.updated_at,
            is_deleted = excluded.is_deleted,
            body = excluded.body
        "#,
    )
    .bind(account_id)
    .bind(collection.name())
    .bind(&document.id)
    .bind(format_timestamp(&document.updated_at))
    .bind(document.is_deleted)
    .bind(body)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn journal_change(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    collection: Collection,
    document: &Document,
    assumed_master: Option<&Document>,
) -> Result<i64> {
    let body = encode_body(collection, document)?;
    let master = assumed_master.map(|m| encode_body(collection, m)).transpose()?;
    let result = sqlx::query(
        r#"
        INSERT INTO changes (account_id, collection, document_id, updated_at, body, assumed_master, status)
        VALUES (?, ?, ?, ?, ?, ?, 'pending')
        "#,
    )
    .bind(account_id)
    .bind(collection.name())
    .bind(&document.id)
    .bind(format_timestamp(&document.updated_at))
    .bind(body)
    .bind(master)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn settle_through(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    collection: Collection,
    document_id: &str,
    through_seq: i64,
    status: ChangeStatus,
    reason: Option<&str>,
) -> Result<usize> {
    let result = sqlx::query(
        r#"
        UPDATE changes SET status = ?, reason = ?
        WHERE account_id = ? AND collection = ? AND document_id = ?
          AND status = 'pending' AND seq <= ?
        "#,
    )
    .bind(status.as_str())
    .bind(reason)
    .bind(account_id)
    .bind(collection.name())
    .bind(document_id)
    .bind(through_seq)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() as usize)
}

async fn has_pending_after(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    collection: Collection,
    document_id: &str,
    seq: i64,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT seq FROM changes
        WHERE account_id = ? AND collection = ? AND document_id = ?
          AND status = 'pending' AND seq > ?
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .bind(collection.name())
    .bind(document_id)
    .bind(seq)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.is_some())
}

/// Persistent local store.
pub struct SqliteStore {
    pool: SqlitePool,
    clock: CommitClock,
    feed: broadcast::Sender<CommittedChange>,
    /// Serializes commit + feed send so the feed stays in commit order.
    writer: Mutex<()>,
    path: String,
}

impl SqliteStore {
    /// Open (or create) a WAL-mode store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config = StoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
        };
        Self::from_config(&config).await
    }

    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let path_str = config.sqlite_path.clone();
        info!(path = %path_str, "Initializing local store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let journal = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(250))
            .create_if_missing(true);

        // An in-memory database exists per connection; keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let clock = CommitClock::new();
        let newest: Option<(Option<String>,)> = sqlx::query_as("SELECT MAX(updated_at) FROM documents")
            .fetch_optional(&pool)
            .await?;
        if let Some((Some(raw),)) = newest {
            clock.observe(parse_timestamp(&raw)?);
        }

        let pending: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM changes WHERE status = 'pending'")
            .fetch_one(&pool)
            .await?;
        if pending.0 > 0 {
            info!(pending = pending.0, "Restored unacknowledged change rows from previous run");
        }

        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            pool,
            clock,
            feed,
            writer: Mutex::new(()),
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    fn emit(&self, account_id: &str, collection: Collection, document: Document, origin: ChangeOrigin) {
        let _ = self.feed.send(CommittedChange {
            account_id: account_id.to_string(),
            collection,
            document,
            origin,
        });
    }

    /// Status and reason of a journaled change row.
    pub async fn change_status(&self, seq: i64) -> Result<Option<(ChangeStatus, Option<String>)>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, reason FROM changes WHERE seq = ?")
                .bind(seq)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(status, reason)| Ok((status.parse::<ChangeStatus>()?, reason)))
            .transpose()
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = self.pool.clone();
        execute_with_retry("wal_checkpoint", || {
            let pool = pool.clone();
            async move {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await?;
                Ok(())
            }
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Local store closed");
    }

    async fn apply_batch_tx(
        &self,
        account_id: &str,
        batch: &ChangeBatch,
        commit_checkpoint: bool,
    ) -> Result<(ApplyOutcome, Vec<Document>)> {
        let collection = batch.collection;
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();
        let mut written = Vec::new();

        for incoming in &batch.documents {
            let incoming_ts = format_timestamp(&incoming.updated_at);
            let current: Option<(String,)> = sqlx::query_as(
                "SELECT updated_at FROM documents WHERE account_id = ? AND collection = ? AND id = ?",
            )
            .bind(account_id)
            .bind(collection.name())
            .bind(&incoming.id)
            .fetch_optional(&mut *tx)
            .await?;

            if matches!(&current, Some((current_ts,)) if incoming_ts <= *current_ts) {
                outcome.skipped += 1;
                continue;
            }

            let superseded = sqlx::query(
                r#"
                UPDATE changes SET status = 'superseded'
                WHERE account_id = ? AND collection = ? AND document_id = ?
                  AND status = 'pending' AND updated_at <= ?
                "#,
            )
            .bind(account_id)
            .bind(collection.name())
            .bind(&incoming.id)
            .bind(&incoming_ts)
            .execute(&mut *tx)
            .await?;
            outcome.superseded += superseded.rows_affected() as usize;

            let mut document = incoming.clone();
            document.account_id = account_id.to_string();
            upsert_document(&mut tx, account_id, collection, &document).await?;
            written.push(document);
            outcome.applied += 1;
        }

        if commit_checkpoint {
            let stored: Option<(String, String)> = sqlx::query_as(
                "SELECT updated_at, key FROM checkpoints WHERE account_id = ? AND collection = ?",
            )
            .bind(account_id)
            .bind(collection.name())
            .fetch_optional(&mut *tx)
            .await?;

            let next = (format_timestamp(&batch.checkpoint.updated_at), batch.checkpoint.key.clone());
            if stored.map_or(true, |stored| next > stored) {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (account_id, collection, updated_at, key)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(account_id, collection) DO UPDATE SET
                        updated_at = excluded.updated_at,
                        key = excluded.key
                    "#,
                )
                .bind(account_id)
                .bind(collection.name())
                .bind(&next.0)
                .bind(&next.1)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok((outcome, written))
    }

    async fn write_local_tx(&self, account_id: &str, collection: Collection, document: &Document) -> Result<Document> {
        let mut tx = self.pool.begin().await?;
        let previous = fetch_document(&mut tx, account_id, collection, &document.id).await?;

        let mut document = document.clone();
        document.created_at = document
            .created_at
            .or_else(|| previous.as_ref().and_then(|p| p.created_at))
            .or(Some(document.updated_at));

        upsert_document(&mut tx, account_id, collection, &document).await?;
        journal_change(&mut tx, account_id, collection, &document, previous.as_ref()).await?;
        tx.commit().await?;
        Ok(document)
    }

    async fn apply_resolution_tx(
        &self,
        account_id: &str,
        collection: Collection,
        resolution: &Resolution,
        restamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<(Document, ChangeOrigin)>> {
        let id = resolution.document_id();
        let through = resolution.superseded_through();
        let mut tx = self.pool.begin().await?;

        settle_through(&mut tx, account_id, collection, id, through, ChangeStatus::Superseded, None).await?;
        if has_pending_after(&mut tx, account_id, collection, id, through).await? {
            tx.commit().await?;
            return Ok(None);
        }

        let written = match resolution {
            Resolution::TakeRemote { document, .. } => {
                let current = fetch_document(&mut tx, account_id, collection, id).await?;
                if current.map_or(true, |c| c.updated_at <= document.updated_at) {
                    let mut document = document.clone();
                    document.account_id = account_id.to_string();
                    upsert_document(&mut tx, account_id, collection, &document).await?;
                    Some((document, ChangeOrigin::Remote))
                } else {
                    None
                }
            }
            Resolution::KeepLocal { document, remote, .. } => {
                let mut document = document.clone();
                document.account_id = account_id.to_string();
                document.updated_at = restamp;
                upsert_document(&mut tx, account_id, collection, &document).await?;
                journal_change(&mut tx, account_id, collection, &document, Some(remote)).await?;
                Some((document, ChangeOrigin::Local))
            }
        };

        tx.commit().await?;
        Ok(written)
    }

    async fn commit_derived_tx(&self, account_id: &str, commit: &DerivedCommit, documents: &[(Collection, Document)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for dimension in &commit.reset_dimensions {
            sqlx::query("DELETE FROM memberships WHERE account_id = ? AND dimension = ?")
                .bind(account_id)
                .bind(dimension.name())
                .execute(&mut *tx)
                .await?;
        }
        for update in &commit.memberships {
            sqlx::query("DELETE FROM memberships WHERE account_id = ? AND dimension = ? AND message_id = ?")
                .bind(account_id)
                .bind(update.dimension.name())
                .bind(&update.message_id)
                .execute(&mut *tx)
                .await?;
            for value in &update.values {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO memberships (account_id, dimension, message_id, value)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(account_id)
                .bind(update.dimension.name())
                .bind(&update.message_id)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
        }
        for (collection, document) in documents {
            upsert_document(&mut tx, account_id, *collection, document).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, account_id: &str, collection: Collection, id: &str) -> BoxFuture<'_, Option<Document>> {
        let (account_id, id) = (account_id.to_string(), id.to_string());
        Box::pin(async move {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT body FROM documents WHERE account_id = ? AND collection = ? AND id = ?")
                    .bind(&account_id)
                    .bind(collection.name())
                    .bind(&id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(|(body,)| decode_body(collection, &account_id, &body)).transpose()
        })
    }

    fn scan(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, Vec<Document>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT body FROM documents WHERE account_id = ? AND collection = ? ORDER BY id")
                    .bind(&account_id)
                    .bind(collection.name())
                    .fetch_all(&self.pool)
                    .await?;
            rows.iter()
                .map(|(body,)| decode_body(collection, &account_id, body))
                .collect()
        })
    }

    fn accounts(&self, collection: Collection) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT DISTINCT account_id FROM documents WHERE collection = ? ORDER BY account_id",
            )
            .bind(collection.name())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(account,)| account).collect())
        })
    }

    fn load_checkpoint(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, Option<Checkpoint>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let row: Option<(String, String)> = sqlx::query_as(
                "SELECT updated_at, key FROM checkpoints WHERE account_id = ? AND collection = ?",
            )
            .bind(&account_id)
            .bind(collection.name())
            .fetch_optional(&self.pool)
            .await?;
            row.map(|(updated_at, key)| Ok(Checkpoint::new(parse_timestamp(&updated_at)?, key)))
                .transpose()
        })
    }

    fn apply_batch<'a>(
        &'a self,
        account_id: &'a str,
        batch: &'a ChangeBatch,
        commit_checkpoint: bool,
    ) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            for doc in &batch.documents {
                self.clock.observe(doc.updated_at);
            }
            let _writer = self.writer.lock().await;
            let (outcome, written) = execute_with_retry("apply_batch", move || {
                self.apply_batch_tx(account_id, batch, commit_checkpoint)
            })
            .await?;

            for document in written {
                self.emit(account_id, batch.collection, document, ChangeOrigin::Remote);
            }
            debug!(
                account_id,
                collection = %batch.collection,
                applied = outcome.applied,
                skipped = outcome.skipped,
                "Applied batch"
            );
            Ok(outcome)
        })
    }

    fn write_local(&self, account_id: &str, collection: Collection, document: Document) -> BoxFuture<'_, Document> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            ensure_writable(collection, &document)?;
            let _writer = self.writer.lock().await;

            let mut document = document;
            document.account_id = account_id.clone();
            document.updated_at = self.clock.stamp();

            let (account, pending) = (account_id.as_str(), &document);
            let stored = execute_with_retry("write_local", move || {
                self.write_local_tx(account, collection, pending)
            })
            .await?;
            self.emit(&account_id, collection, stored.clone(), ChangeOrigin::Local);
            Ok(stored)
        })
    }

    fn pending_changes(&self, account_id: &str, collection: Collection, limit: usize) -> BoxFuture<'_, Vec<PendingChange>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let rows: Vec<(i64, String, Option<String>)> = sqlx::query_as(
                r#"
                SELECT seq, body, assumed_master FROM changes
                WHERE account_id = ? AND collection = ? AND status = 'pending'
                ORDER BY seq
                LIMIT ?
                "#,
            )
            .bind(&account_id)
            .bind(collection.name())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(seq, body, master)| {
                    Ok(PendingChange {
                        seq,
                        collection,
                        document: decode_body(collection, &account_id, &body)?,
                        assumed_master: master
                            .map(|m| decode_body(collection, &account_id, &m))
                            .transpose()?,
                    })
                })
                .collect()
        })
    }

    fn pending_count(&self, account_id: &str, collection: Collection) -> BoxFuture<'_, usize> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM changes WHERE account_id = ? AND collection = ? AND status = 'pending'",
            )
            .bind(&account_id)
            .bind(collection.name())
            .fetch_one(&self.pool)
            .await?;
            Ok(count as usize)
        })
    }

    fn acknowledge<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        acks: &'a [(String, i64)],
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let _writer = self.writer.lock().await;
            execute_with_retry("acknowledge", move || async move {
                let mut tx = self.pool.begin().await?;
                let mut acknowledged = 0;
                for (document_id, through) in acks {
                    acknowledged += settle_through(
                        &mut tx,
                        account_id,
                        collection,
                        document_id,
                        *through,
                        ChangeStatus::Acknowledged,
                        None,
                    )
                    .await?;
                }
                tx.commit().await?;
                Ok(acknowledged)
            })
            .await
        })
    }

    fn apply_resolution<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        resolution: &'a Resolution,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _writer = self.writer.lock().await;
            let restamp = match resolution {
                Resolution::TakeRemote { document, .. } => {
                    self.clock.observe(document.updated_at);
                    document.updated_at
                }
                Resolution::KeepLocal { remote, .. } => {
                    self.clock.observe(remote.updated_at);
                    self.clock.stamp()
                }
            };

            let written = execute_with_retry("apply_resolution", move || {
                self.apply_resolution_tx(account_id, collection, resolution, restamp)
            })
            .await?;
            if let Some((document, origin)) = written {
                self.emit(account_id, collection, document, origin);
            }
            Ok(())
        })
    }

    fn reject<'a>(
        &'a self,
        account_id: &'a str,
        collection: Collection,
        document_id: &'a str,
        through_seq: i64,
        reason: &'a str,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let _writer = self.writer.lock().await;
            execute_with_retry("reject", move || async move {
                let mut tx = self.pool.begin().await?;
                let rejected = settle_through(
                    &mut tx,
                    account_id,
                    collection,
                    document_id,
                    through_seq,
                    ChangeStatus::Rejected,
                    Some(reason),
                )
                .await?;
                tx.commit().await?;
                Ok(rejected)
            })
            .await
        })
    }

    fn memberships<'a>(
        &'a self,
        account_id: &'a str,
        dimension: Dimension,
        message_id: &'a str,
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT value FROM memberships
                WHERE account_id = ? AND dimension = ? AND message_id = ?
                ORDER BY value
                "#,
            )
            .bind(account_id)
            .bind(dimension.name())
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(value,)| value).collect())
        })
    }

    fn commit_derived<'a>(&'a self, account_id: &'a str, commit: DerivedCommit) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let _writer = self.writer.lock().await;
            let documents: Vec<(Collection, Document)> = commit
                .documents
                .iter()
                .map(|(collection, document)| {
                    let mut document = document.clone();
                    document.account_id = account_id.to_string();
                    document.updated_at = self.clock.stamp();
                    (*collection, document)
                })
                .collect();

            let (commit, stamped) = (&commit, &documents);
            execute_with_retry("commit_derived", move || {
                self.commit_derived_tx(account_id, commit, stamped)
            })
            .await?;

            let mut stored = Vec::with_capacity(documents.len());
            for (collection, document) in documents {
                self.emit(account_id, collection, document.clone(), ChangeOrigin::Derived);
                stored.push(document);
            }
            Ok(stored)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<CommittedChange> {
        self.feed.subscribe()
    }
}
