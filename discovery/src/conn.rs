//! Per-target connection ownership and retry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use verkko_core::{Endpoint, Transport};

/// Default pace of a connection's dial retry loop: one attempt per second.
pub(crate) const DEFAULT_DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Shared view of target → live address set.
///
/// Written only by the store's reconciliation loop; read by connection loops
/// at dial time, so every attempt sees the newest membership without
/// touching the connection map.
#[derive(Default)]
pub(crate) struct AddressBook {
    pub(crate) targets: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl AddressBook {
    pub(crate) fn snapshot(&self, target: &str) -> Vec<Endpoint> {
        self.targets.read().get(target).cloned().unwrap_or_default()
    }
}

/// Owns one target's live connection and the background loop that dials it.
///
/// The handle may be read concurrently through [`ManagedConnection::current`]
/// while the loop swaps it; the swap is the only mutation and happens under
/// the handle's own read/write lock, independent of any store-level lock.
pub(crate) struct ManagedConnection<C> {
    handle: Arc<RwLock<Option<C>>>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<C: Clone + Send + Sync + 'static> ManagedConnection<C> {
    /// Spawn the dial loop for `target`.
    pub(crate) fn connect<T>(
        target: String,
        book: Arc<AddressBook>,
        transport: Arc<T>,
        retry_interval: Duration,
    ) -> Self
    where
        T: Transport<Conn = C>,
    {
        let handle = Arc::new(RwLock::new(None));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(dial_loop(
            target,
            book,
            transport,
            Arc::clone(&handle),
            cancel_rx,
            retry_interval,
        ));
        Self {
            handle,
            cancel_tx,
            task,
        }
    }

    /// The live connection, or `None` during the initial dial or any redial
    /// window. Transient by contract; callers retry, they do not give up.
    #[cfg(test)]
    pub(crate) fn current(&self) -> Option<C> {
        self.handle.read().clone()
    }

    /// Cheap cloneable reader over the handle, so callers can drop the
    /// store's lock before reading the connection.
    pub(crate) fn reader(&self) -> ConnReader<C> {
        ConnReader {
            handle: Arc::clone(&self.handle),
        }
    }

    /// Cancel the loop and wait for it to exit. The underlying connection,
    /// if one was held, has been released by the time this returns.
    pub(crate) async fn close(self) {
        let _ = self.cancel_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "connection loop failed during close");
        }
    }
}

/// Non-blocking reader over a managed connection's handle.
pub(crate) struct ConnReader<C> {
    handle: Arc<RwLock<Option<C>>>,
}

impl<C: Clone> ConnReader<C> {
    pub(crate) fn current(&self) -> Option<C> {
        self.handle.read().clone()
    }
}

/// The background loop: rate-limited dial attempts until one sticks, then
/// park until cancelled. There is deliberately no connection-loss detection
/// here — health of an established connection is the transport's concern.
async fn dial_loop<T: Transport>(
    target: String,
    book: Arc<AddressBook>,
    transport: Arc<T>,
    handle: Arc<RwLock<Option<T::Conn>>>,
    mut cancel_rx: watch::Receiver<bool>,
    retry_interval: Duration,
) {
    let mut tick = tokio::time::interval(retry_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => return,
            _ = tick.tick() => {}
        }

        let endpoints = book.snapshot(&target);
        let dialed = tokio::select! {
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => return,
            dialed = transport.dial(&target, &endpoints) => dialed,
        };
        let conn = match dialed {
            Ok(conn) => conn,
            Err(err) => {
                warn!(target = %target, error = %err, "dial failed");
                continue;
            }
        };

        *handle.write() = Some(conn.clone());
        info!(target = %target, "dial succeeded");

        let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
        handle.write().take();
        transport.disconnect(conn).await;
        info!(target = %target, "connection closed");
        return;
    }
}
