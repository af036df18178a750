//! The background sync loop.
//!
//! Runs one select loop per broker: a periodic retry tick, the
//! connection-status watch, and the shutdown signal. Every trigger funnels
//! into the broker's single-flight [`sync`](crate::Broker::sync), throttled
//! to at most one pass per fifth of the retry interval so flapping
//! connectivity cannot thrash the server.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broker::BrokerInner;

/// Controls a running sync loop.
///
/// Shutdown is graceful (signal, then await the task) and idempotent;
/// [`abort`](SyncLoopHandle::abort) is the synchronous best-effort variant
/// used from `Drop`.
pub(crate) struct SyncLoopHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SyncLoopHandle {
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    tracing::error!(error = %error, "sync loop task panicked");
                }
            }
        }
    }

    pub(crate) fn abort(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Spawn the loop for `inner`. The first interval tick fires immediately,
/// which is what performs the startup sync.
pub(crate) fn spawn_sync_loop(inner: Arc<BrokerInner>) -> SyncLoopHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_sync_loop(inner, shutdown_rx));
    SyncLoopHandle {
        shutdown_tx,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

async fn run_sync_loop(inner: Arc<BrokerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let throttle = inner.retry_sync_interval / 5;
    let mut interval = tokio::time::interval(inner.retry_sync_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut connection_rx = inner.connection.as_ref().map(|adapter| adapter.subscribe());
    let mut last_status = match &inner.connection {
        Some(adapter) => adapter.get().await,
        None => None,
    };
    let mut last_sync: Option<Instant> = None;

    loop {
        let triggered = tokio::select! {
            changed = shutdown_rx.changed() => {
                // A closed channel means the handle is gone; stop either way.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                false
            }
            _ = interval.tick() => true,
            status = next_status(&mut connection_rx) => {
                match status {
                    Some(status) => {
                        let went_online = status == Some(true) && last_status != Some(true);
                        // Unknown statuses are ignored, not remembered.
                        if status.is_some() {
                            last_status = status;
                        }
                        if went_online {
                            tracing::info!("connection restored; requesting sync");
                        }
                        went_online
                    }
                    None => {
                        // Status feed closed; fall back to the interval.
                        connection_rx = None;
                        false
                    }
                }
            }
        };

        if !triggered {
            continue;
        }
        if let Some(at) = last_sync {
            if at.elapsed() < throttle {
                tracing::debug!("sync trigger throttled");
                continue;
            }
        }
        inner.sync().await;
        last_sync = Some(Instant::now());
    }

    tracing::debug!("sync loop stopped");
}

/// Wait for the next connection-status change. Outer `None` means the feed
/// is gone; a `None` receiver pends forever so the select arm stays inert.
async fn next_status(
    rx: &mut Option<watch::Receiver<Option<bool>>>,
) -> Option<Option<bool>> {
    match rx {
        Some(receiver) => match receiver.changed().await {
            Ok(()) => Some(*receiver.borrow()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
