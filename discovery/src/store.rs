//! The reconciliation engine: consumes watcher updates, owns one managed
//! connection per live target, publishes connection handles to callers.
//!
//! # Invariant
//!
//! After every reconciled batch, a managed connection exists for exactly the
//! targets whose address set is non-empty. The driving loop is the only
//! writer of both maps; `get` readers touch the connection map just long
//! enough to clone a handle reference.

use crate::conn::{AddressBook, ConnReader, ManagedConnection, DEFAULT_DIAL_RETRY_INTERVAL};
use crate::watcher::{AddressWatcher, WatcherHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use verkko_core::{DiscoveryError, Endpoint, KvStore, Op, Transport, Update};

/// Tunables for [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Pace of each managed connection's dial retry loop.
    pub dial_retry_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dial_retry_interval: DEFAULT_DIAL_RETRY_INTERVAL,
        }
    }
}

enum Driver {
    Idle(AddressWatcher),
    Running(JoinHandle<()>),
    Stopped,
}

/// Watch-driven client store: one managed connection per discovered target.
///
/// `start` begins consuming address updates; `get` is the non-blocking read
/// path; `stop` tears everything down. The store never dials on a caller's
/// behalf — connections come and go with the address feed.
pub struct Store<T: Transport> {
    transport: Arc<T>,
    config: StoreConfig,
    book: Arc<AddressBook>,
    conns: Arc<RwLock<HashMap<String, ManagedConnection<T::Conn>>>>,
    closer: WatcherHandle,
    driver: Mutex<Driver>,
}

impl<T: Transport> Store<T> {
    /// Store over `kv`, watching every target under `target_prefix`,
    /// dialing through `transport`.
    pub fn new(kv: Arc<dyn KvStore>, target_prefix: impl Into<String>, transport: Arc<T>) -> Self {
        Self::with_config(kv, target_prefix, transport, StoreConfig::default())
    }

    /// Like [`Store::new`] with explicit tunables.
    pub fn with_config(
        kv: Arc<dyn KvStore>,
        target_prefix: impl Into<String>,
        transport: Arc<T>,
        config: StoreConfig,
    ) -> Self {
        let watcher = AddressWatcher::new(kv, target_prefix);
        let closer = watcher.handle();
        Self {
            transport,
            config,
            book: Arc::new(AddressBook::default()),
            conns: Arc::new(RwLock::new(HashMap::new())),
            closer,
            driver: Mutex::new(Driver::Idle(watcher)),
        }
    }

    /// Begin the driving loop. Fails with [`DiscoveryError::AlreadyStarted`]
    /// on a second call or after `stop`.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut driver = self.driver.lock();
        match std::mem::replace(&mut *driver, Driver::Stopped) {
            Driver::Idle(watcher) => {
                let task = tokio::spawn(drive(
                    watcher,
                    Arc::clone(&self.book),
                    Arc::clone(&self.conns),
                    Arc::clone(&self.transport),
                    self.config.clone(),
                ));
                *driver = Driver::Running(task);
                Ok(())
            }
            other => {
                *driver = other;
                Err(DiscoveryError::AlreadyStarted)
            }
        }
    }

    /// The current connection for `target`, or `None` when the target is
    /// unknown or not yet connected.
    ///
    /// Fully non-blocking: it never waits for discovery and never triggers a
    /// dial. Callers that need presence poll with their own backoff.
    pub fn get(&self, target: &str) -> Option<T::Conn> {
        let reader: ConnReader<T::Conn> = {
            let conns = self.conns.read();
            conns.get(target)?.reader()
        };
        reader.current()
    }

    /// The address set currently believed live for `target`. Empty when the
    /// target is unknown.
    pub fn addresses(&self, target: &str) -> Vec<Endpoint> {
        self.book.snapshot(target)
    }

    /// Tear everything down: close the watcher (unblocking the driving
    /// loop), wait for the loop to exit, then close every managed
    /// connection. All of it completes before `stop` returns. Idempotent.
    pub async fn stop(&self) {
        self.closer.close();

        let driver = std::mem::replace(&mut *self.driver.lock(), Driver::Stopped);
        if let Driver::Running(task) = driver {
            if let Err(err) = task.await {
                warn!(error = %err, "driving loop failed");
            }
        }

        let drained: Vec<ManagedConnection<T::Conn>> = {
            let mut conns = self.conns.write();
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.close().await;
        }
    }
}

/// The driving loop. Consumes watcher batches until the watcher is closed
/// (clean stop) or fails (logged, then stop — restarting is a deployment
/// concern, not this loop's).
async fn drive<T: Transport>(
    mut watcher: AddressWatcher,
    book: Arc<AddressBook>,
    conns: Arc<RwLock<HashMap<String, ManagedConnection<T::Conn>>>>,
    transport: Arc<T>,
    config: StoreConfig,
) {
    loop {
        match watcher.next().await {
            Ok(updates) => reconcile(&book, &conns, &transport, &config, updates).await,
            Err(err) if err.is_closed() => {
                debug!("address watch closed, stopping");
                return;
            }
            Err(err) => {
                warn!(error = %err, "address watch failed, stopping");
                return;
            }
        }
    }
}

/// Apply one batch of updates, then restore the invariant.
///
/// Membership changes for the whole batch happen under the address-book
/// lock; connection-map changes under the connection lock. Closes of
/// displaced connections await outside both.
async fn reconcile<T: Transport>(
    book: &Arc<AddressBook>,
    conns: &RwLock<HashMap<String, ManagedConnection<T::Conn>>>,
    transport: &Arc<T>,
    config: &StoreConfig,
    updates: Vec<Update>,
) {
    {
        let mut targets = book.targets.write();
        for update in updates {
            match update.op {
                Op::Add => {
                    let set = targets.entry(update.target.clone()).or_default();
                    if set.contains(&update.endpoint) {
                        debug!(
                            target = %update.target,
                            address = %update.endpoint.address,
                            "add for an address already present, ignoring"
                        );
                        continue;
                    }
                    set.push(update.endpoint);
                }
                Op::Remove => {
                    if let Some(set) = targets.get_mut(&update.target) {
                        if let Some(idx) = set.iter().position(|e| *e == update.endpoint) {
                            set.remove(idx);
                        }
                        if set.is_empty() {
                            targets.remove(&update.target);
                        }
                    }
                }
            }
        }
    }

    let mut displaced = Vec::new();
    {
        let targets = book.targets.read();
        let mut conns = conns.write();

        let stale: Vec<String> = conns
            .keys()
            .filter(|target| !targets.contains_key(*target))
            .cloned()
            .collect();
        for target in stale {
            if let Some(conn) = conns.remove(&target) {
                info!(target = %target, "no addresses left, closing connection");
                displaced.push(conn);
            }
        }

        for target in targets.keys() {
            if !conns.contains_key(target) {
                info!(target = %target, "target discovered, opening connection");
                conns.insert(
                    target.clone(),
                    ManagedConnection::connect(
                        target.clone(),
                        Arc::clone(book),
                        Arc::clone(transport),
                        config.dial_retry_interval,
                    ),
                );
            }
        }
    }

    for conn in displaced {
        conn.close().await;
    }
}
