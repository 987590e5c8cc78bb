//! Lease-backed self-registration: the dual of discovery.
//!
//! A registration keeps this process's address published under a prefix for
//! as long as the process is healthy. Each cycle acquires a lease-backed
//! session, publishes the endpoint tied to that lease, and parks until
//! either the caller closes the registration or the session reports expiry.
//! Expiry is non-fatal — the loop acquires a brand-new session and
//! republishes, with no cap on retries. Only an explicit close ends it.
//!
//! The lease is the anti-entropy mechanism: if this process dies without
//! closing, the store reclaims the entry when the lease runs out, so stale
//! addresses disappear without operator intervention.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use verkko_core::{join_key, validate_address, DiscoveryError, Endpoint, KvStore, Session};

/// Default pace of registration attempts: one per second.
const DEFAULT_REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables for [`Registration`].
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Pace of session-acquire/publish attempts.
    pub retry_interval: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_REGISTER_RETRY_INTERVAL,
        }
    }
}

/// A running registration.
///
/// [`Registration::close`] is the graceful teardown: it cancels the loop,
/// closes the session, and waits for the loop to exit. Merely dropping the
/// handle also cancels the loop, but without waiting for the cleanup to
/// finish. [`Registration::done`] reports that registration stopped, for
/// whichever reason.
pub struct Registration {
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Registration {
    /// Publish `endpoint` under `prefix`, backed by a lease with the given
    /// time-to-live.
    ///
    /// Precondition: the endpoint address becomes the final segment of the
    /// published key, so it must be non-empty and must not contain `/`.
    pub fn start(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        endpoint: Endpoint,
        ttl: Duration,
    ) -> Result<Self, DiscoveryError> {
        Self::start_with(kv, prefix, endpoint, ttl, RegistrationConfig::default())
    }

    /// Like [`Registration::start`] with explicit tunables.
    pub fn start_with(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        endpoint: Endpoint,
        ttl: Duration,
        config: RegistrationConfig,
    ) -> Result<Self, DiscoveryError> {
        validate_address(&endpoint.address)?;
        let key = join_key(&prefix.into(), &endpoint.address);
        let value = endpoint.encode()?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let task = tokio::spawn(register_loop(
            kv, key, value, ttl, config, cancel_rx, done_tx,
        ));
        Ok(Self {
            cancel_tx,
            done_rx,
            task,
        })
    }

    /// Resolves once registration has permanently stopped.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether registration has permanently stopped.
    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Graceful teardown: cancel the loop, close the current session if one
    /// is held, and wait for the loop to exit.
    pub async fn close(self) {
        let _ = self.cancel_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "registration loop failed during close");
        }
    }
}

enum Parked {
    Cancelled,
    Expired,
}

async fn register_loop(
    kv: Arc<dyn KvStore>,
    key: String,
    value: Bytes,
    ttl: Duration,
    config: RegistrationConfig,
    mut cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
) {
    let mut tick = tokio::time::interval(config.retry_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => break,
            _ = tick.tick() => {}
        }

        let session = tokio::select! {
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => break,
            session = kv.session(ttl) => match session {
                Ok(session) => session,
                Err(err) => {
                    warn!(key = %key, error = %err, "session acquire failed");
                    continue;
                }
            }
        };

        let lease = session.lease_id();
        let published = tokio::select! {
            _ = async { let _ = cancel_rx.wait_for(|cancelled| *cancelled).await; } => {
                // Shutdown won the race against the publish; the session is
                // still ours to clean up.
                close_session(&key, session).await;
                break;
            }
            published = kv.put_with_lease(&key, value.clone(), lease) => published,
        };
        if let Err(err) = published {
            // The unpublished session is dropped here; its lease dies by
            // TTL, so nothing stale can linger.
            warn!(key = %key, error = %err, "publish failed");
            continue;
        }
        info!(key = %key, lease, ttl_secs = ttl.as_secs(), "registered with lease");

        let parked = {
            let expired = session.expired();
            tokio::pin!(expired);
            tokio::select! {
                _ = cancel_rx.wait_for(|cancelled| *cancelled) => Parked::Cancelled,
                _ = &mut expired => Parked::Expired,
            }
        };
        match parked {
            Parked::Cancelled => {
                close_session(&key, session).await;
                break;
            }
            Parked::Expired => {
                warn!(key = %key, "session expired; possible network partition or store restart");
                info!(key = %key, "acquiring a new session to rejoin");
                continue;
            }
        }
    }

    let _ = done_tx.send(true);
}

async fn close_session(key: &str, session: Box<dyn Session>) {
    match session.close().await {
        Ok(()) => info!(key = %key, "session closed"),
        Err(err) => warn!(key = %key, error = %err, "session close failed; it may already be gone"),
    }
}
