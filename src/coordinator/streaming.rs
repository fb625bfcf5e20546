//! Streaming phase of a replication cycle.
//!
//! ```text
//!   live forwarder ──(Subscribed / Batch / Lost)──┐
//!                                                 ├──▶ apply loop ──▶ PullEngine ──▶ store
//!   poll ticker ──────────────(tick)──────────────┘
//!
//!   store feed (Local) / push ticker ──▶ push loop ──▶ PushEngine ──▶ remote
//! ```
//!
//! Every pulled or live document is applied by the single apply loop, so
//! poll results and live batches never interleave. The push loop runs
//! beside it and only ever touches change rows.
//!
//! # Live Checkpoints
//!
//! A live batch may advance the stored checkpoint only when its
//! subscription was open before the most recent caught-up poll and has
//! stayed open since; anything older could sit in a gap the stream never
//! saw. Other live batches are applied without moving the checkpoint.
//! Each (re)subscription is followed by a catch-up pull.

use super::controller::ControllerTask;
use crate::batch::ChangeBatch;
use crate::document::Collection;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteEndpoint;
use crate::resilience::sleep_or_shutdown;
use crate::store::ChangeOrigin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

/// Capacity of the apply loop's inbound channel.
const INBOUND_CAPACITY: usize = 32;

/// Messages from the live forwarder to the apply loop.
#[derive(Debug)]
enum Inbound {
    Subscribed { generation: u64 },
    Batch { generation: u64, batch: ChangeBatch },
    Lost { generation: u64 },
    /// Unrecoverable live failure (credentials).
    Failed(ReplicationError),
}

/// Tracks whether live batches may commit their checkpoint.
#[derive(Debug, Default)]
struct LiveState {
    connected: Option<u64>,
    synced: bool,
}

impl LiveState {
    fn subscribed(&mut self, generation: u64) {
        self.connected = Some(generation);
        self.synced = false;
    }

    /// A catch-up pull just finished.
    fn caught_up(&mut self) {
        if self.connected.is_some() {
            self.synced = true;
        }
    }

    fn lost(&mut self, generation: u64) {
        if self.connected == Some(generation) {
            self.connected = None;
            self.synced = false;
        }
    }

    fn may_commit(&self, generation: u64) -> bool {
        self.synced && self.connected == Some(generation)
    }
}

/// Resolve once shutdown is signaled. Never resolves if the sender is gone.
pub(super) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run the streaming phase until shutdown (`Ok`) or a failure (`Err`).
pub(super) async fn run(task: &ControllerTask, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let mut live = JoinSet::new();
    if task.settings.live_push && task.collection.live_path().is_some() {
        live.spawn(
            forward_live(
                task.remote.clone(),
                task.collection,
                task.settings.live_reconnect_delay,
                tx,
                shutdown_rx.clone(),
            )
            .in_current_span(),
        );
    } else {
        drop(tx);
    }

    let result = futures::future::try_join(
        apply_loop(task, rx, shutdown_rx.clone()),
        push_loop(task, shutdown_rx.clone()),
    )
    .await;

    live.shutdown().await;
    result.map(|_| ())
}

async fn apply_loop(
    task: &ControllerTask,
    mut rx: mpsc::Receiver<Inbound>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut poll = tokio::time::interval(task.settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The initial pull has just caught up.
    poll.tick().await;

    let mut live = LiveState::default();
    loop {
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown_rx) => {
                debug!("Apply loop stopping");
                return Ok(());
            }

            Some(inbound) = rx.recv() => match inbound {
                Inbound::Subscribed { generation } => {
                    live.subscribed(generation);
                    let resync = task.pull.pull_until_caught_up().await?;
                    live.caught_up();
                    debug!(generation, fetched = resync.fetched, "Resynced after live subscribe");
                }
                Inbound::Batch { generation, batch } => {
                    let commit = live.may_commit(generation);
                    task.pull.apply_live(batch, commit).await?;
                }
                Inbound::Lost { generation } => live.lost(generation),
                Inbound::Failed(e) => return Err(e),
            },

            _ = poll.tick() => {
                task.pull.pull_until_caught_up().await?;
                live.caught_up();
            }
        }
    }
}

/// Keep a live subscription open, forwarding batches to the apply loop.
async fn forward_live(
    remote: Arc<dyn RemoteEndpoint>,
    collection: Collection,
    reconnect_delay: Duration,
    tx: mpsc::Sender<Inbound>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut generation = 0u64;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match remote.subscribe(collection).await {
            Ok(None) => {
                debug!("Remote offers no live channel, polling only");
                return;
            }
            Ok(Some(mut feed)) => {
                generation += 1;
                metrics::record_live_subscribe(collection, true);
                info!(generation, "Live subscription established");
                if tx.send(Inbound::Subscribed { generation }).await.is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown_rx) => return,
                        item = feed.next() => match item {
                            Some(Ok(batch)) => {
                                if tx.send(Inbound::Batch { generation, batch }).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) if e.is_auth() => {
                                let _ = tx.send(Inbound::Failed(e)).await;
                                return;
                            }
                            Some(Err(e)) => {
                                warn!(generation, error = %e, "Live stream failed");
                                break;
                            }
                            None => {
                                debug!(generation, "Live stream ended");
                                break;
                            }
                        }
                    }
                }

                if tx.send(Inbound::Lost { generation }).await.is_err() {
                    return;
                }
            }
            Err(e) if e.is_auth() => {
                let _ = tx.send(Inbound::Failed(e)).await;
                return;
            }
            Err(e) => {
                metrics::record_live_subscribe(collection, false);
                warn!(error = %e, "Live subscribe failed");
            }
        }

        if sleep_or_shutdown(reconnect_delay, &mut shutdown_rx).await {
            return;
        }
    }
}

/// Push whenever a local commit lands, and on a timer.
async fn push_loop(task: &ControllerTask, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let Some(push) = task.push.as_ref() else {
        wait_for_shutdown(&mut shutdown_rx).await;
        return Ok(());
    };

    let mut feed = task.store.subscribe();
    let mut feed_open = true;
    let mut ticker = tokio::time::interval(task.settings.push_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut shutdown_rx) => {
                debug!("Push loop stopping");
                return Ok(());
            }

            event = feed.recv(), if feed_open => match event {
                Ok(change) => {
                    let ours = change.origin == ChangeOrigin::Local
                        && change.collection == task.collection
                        && change.account_id == task.account_id;
                    if !ours {
                        continue;
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Commit feed lagged"),
                Err(RecvError::Closed) => {
                    feed_open = false;
                    continue;
                }
            },

            _ = ticker.tick() => {}
        }

        let outcome = push.push_pending().await?;
        if outcome.rows > 0 {
            debug!(
                rows = outcome.rows,
                acknowledged = outcome.acknowledged,
                conflicts = outcome.conflicts,
                rejected = outcome.rejected,
                remaining = outcome.remaining,
                "Pushed local changes"
            );
        }
    }
}
