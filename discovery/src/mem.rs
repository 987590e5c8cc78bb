//! In-memory key-value watch store.
//!
//! Reference implementation of the [`KvStore`] boundary: revisioned entries,
//! ordered watch delivery with previous values on deletes, and lease-scoped
//! keys that vanish when their session closes or expires. It keeps the full
//! change history, so a watch opened at `snapshot.revision + 1` replays
//! everything that happened since the snapshot — the no-gap guarantee real
//! adapters get from their store.
//!
//! Single-node and unbounded; it backs the test suite and serves as the
//! semantics adapters are expected to match. [`MemoryKvStore::expire_session`]
//! simulates a missed renewal window (network partition, store restart)
//! without waiting out a TTL.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use verkko_core::{
    EventKind, KvError, KvPair, KvStore, LeaseId, Session, Snapshot, WatchBatch, WatchEvent,
};

/// Per-subscription channel capacity. A subscriber that lags this far behind
/// is cancelled with [`KvError::WatchCancelled`], the way a real store drops
/// slow watchers.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// In-memory [`KvStore`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<MemInner>>,
}

#[derive(Default)]
struct MemInner {
    revision: i64,
    entries: BTreeMap<String, Bytes>,
    history: Vec<(i64, WatchEvent)>,
    watchers: Vec<MemWatcher>,
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseState>,
}

struct LeaseState {
    keys: Vec<String>,
    expired_tx: watch::Sender<bool>,
}

struct MemWatcher {
    prefix: String,
    tx: mpsc::Sender<Result<WatchBatch, KvError>>,
}

impl MemoryKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a key without a lease. Test control surface; lease-scoped
    /// writes go through [`KvStore::put_with_lease`].
    pub fn put(&self, key: impl Into<String>, value: Bytes) {
        let mut inner = self.inner.lock();
        inner.apply_put(key.into(), value);
    }

    /// Delete a key. Test control surface.
    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.apply_delete(key);
    }

    /// Lease ids of the sessions currently alive, oldest first.
    pub fn active_leases(&self) -> Vec<LeaseId> {
        let inner = self.inner.lock();
        let mut ids: Vec<LeaseId> = inner.leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a key currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Simulate the store losing a lease (missed renewal window): entries
    /// tied to it are deleted and the session observes expiry. Returns
    /// `false` when the lease is not alive.
    pub fn expire_session(&self, lease: LeaseId) -> bool {
        let mut inner = self.inner.lock();
        inner.reclaim_lease(lease, true)
    }
}

impl MemInner {
    fn apply_put(&mut self, key: String, value: Bytes) {
        self.revision += 1;
        let prev = self.entries.insert(key.clone(), value.clone());
        let event = WatchEvent {
            kind: EventKind::Put,
            key,
            value,
            prev_value: prev,
        };
        self.record(event);
    }

    fn apply_delete(&mut self, key: &str) {
        let Some(prev) = self.entries.remove(key) else {
            return;
        };
        self.revision += 1;
        let event = WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: Bytes::new(),
            prev_value: Some(prev),
        };
        self.record(event);
    }

    fn record(&mut self, event: WatchEvent) {
        self.history.push((self.revision, event.clone()));
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return true;
            }
            match w.tx.try_send(Ok(vec![event.clone()])) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Lagging subscriber: fail the stream rather than block
                    // the store. The error itself may not fit either; the
                    // closed channel still ends the subscription.
                    let _ = w.tx.try_send(Err(KvError::WatchCancelled(
                        "subscriber lagged".to_string(),
                    )));
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn reclaim_lease(&mut self, lease: LeaseId, notify_expired: bool) -> bool {
        let Some(state) = self.leases.remove(&lease) else {
            return false;
        };
        if notify_expired {
            let _ = state.expired_tx.send(true);
        }
        for key in state.keys {
            self.apply_delete(&key);
        }
        true
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, KvError> {
        let inner = self.inner.lock();
        let entries = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(Snapshot {
            entries,
            revision: inner.revision,
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<Result<WatchBatch, KvError>>, KvError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();

        let backlog: WatchBatch = inner
            .history
            .iter()
            .filter(|(rev, event)| *rev >= from_revision && event.key.starts_with(prefix))
            .map(|(_, event)| event.clone())
            .collect();
        if !backlog.is_empty() {
            let _ = tx.try_send(Ok(backlog));
        }

        inner.watchers.push(MemWatcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn session(&self, _ttl: Duration) -> Result<Box<dyn Session>, KvError> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        let (expired_tx, expired_rx) = watch::channel(false);
        inner.leases.insert(
            id,
            LeaseState {
                keys: Vec::new(),
                expired_tx,
            },
        );
        Ok(Box::new(MemorySession {
            id,
            inner: Arc::clone(&self.inner),
            expired_rx,
        }))
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: Bytes,
        lease: LeaseId,
    ) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        let Some(state) = inner.leases.get_mut(&lease) else {
            return Err(KvError::LeaseNotFound(lease));
        };
        if !state.keys.iter().any(|k| k == key) {
            state.keys.push(key.to_string());
        }
        inner.apply_put(key.to_string(), value);
        Ok(())
    }
}

/// A lease held in a [`MemoryKvStore`]. Never expires on its own; tests
/// drive expiry through [`MemoryKvStore::expire_session`].
struct MemorySession {
    id: LeaseId,
    inner: Arc<Mutex<MemInner>>,
    expired_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Session for MemorySession {
    fn lease_id(&self) -> LeaseId {
        self.id
    }

    async fn expired(&self) {
        let mut rx = self.expired_rx.clone();
        // An error means the store dropped the lease state entirely, which
        // is expiry from the session's point of view.
        let _ = rx.wait_for(|expired| *expired).await;
    }

    async fn close(self: Box<Self>) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        if inner.reclaim_lease(self.id, false) {
            Ok(())
        } else {
            Err(KvError::LeaseNotFound(self.id))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn value(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn snapshot_scopes_to_prefix_and_reports_revision() {
        let store = MemoryKvStore::new();
        store.put("svc/a", value("1"));
        store.put("svc/b", value("2"));
        store.put("other/c", value("3"));

        let snap = store.get_prefix("svc").await.unwrap();
        assert_eq!(snap.revision, 3);
        let keys: Vec<&str> = snap.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["svc/a", "svc/b"]);
    }

    #[tokio::test]
    async fn watch_replays_changes_after_the_snapshot_revision() {
        let store = MemoryKvStore::new();
        store.put("svc/a", value("1"));

        let snap = store.get_prefix("svc").await.unwrap();
        // A change landing between snapshot and subscribe must not be lost.
        store.put("svc/b", value("2"));

        let mut rx = store.watch_prefix("svc", snap.revision + 1).await.unwrap();
        let batch = rx.recv().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "svc/b");
        assert_eq!(batch[0].kind, EventKind::Put);
    }

    #[tokio::test]
    async fn delete_events_carry_the_previous_value() {
        let store = MemoryKvStore::new();
        store.put("svc/a", value("payload"));
        let mut rx = store.watch_prefix("svc", 2).await.unwrap();

        store.delete("svc/a");
        let batch = rx.recv().await.unwrap().unwrap();
        assert_eq!(batch[0].kind, EventKind::Delete);
        assert_eq!(batch[0].prev_value, Some(value("payload")));
        assert!(!store.contains_key("svc/a"));
    }

    #[tokio::test]
    async fn deleting_an_absent_key_emits_nothing() {
        let store = MemoryKvStore::new();
        let mut rx = store.watch_prefix("svc", 1).await.unwrap();
        store.delete("svc/ghost");
        store.put("svc/real", value("1"));
        // First observed event is the put, not a phantom delete.
        let batch = rx.recv().await.unwrap().unwrap();
        assert_eq!(batch[0].key, "svc/real");
    }

    #[tokio::test]
    async fn lease_scoped_keys_vanish_on_close() {
        let store = MemoryKvStore::new();
        let session = store.session(Duration::from_secs(5)).await.unwrap();
        store
            .put_with_lease("svc/a", value("1"), session.lease_id())
            .await
            .unwrap();
        assert!(store.contains_key("svc/a"));

        session.close().await.unwrap();
        assert!(!store.contains_key("svc/a"));
        assert!(store.active_leases().is_empty());
    }

    #[tokio::test]
    async fn expire_session_deletes_keys_and_signals_the_session() {
        let store = MemoryKvStore::new();
        let session = store.session(Duration::from_secs(5)).await.unwrap();
        let lease = session.lease_id();
        store
            .put_with_lease("svc/a", value("1"), lease)
            .await
            .unwrap();

        assert!(store.expire_session(lease));
        session.expired().await;
        assert!(!store.contains_key("svc/a"));

        // Closing an expired session reports the lease as gone.
        assert_eq!(
            session.close().await.unwrap_err(),
            KvError::LeaseNotFound(lease)
        );
    }

    #[tokio::test]
    async fn put_with_unknown_lease_is_rejected() {
        let store = MemoryKvStore::new();
        let err = store.put_with_lease("svc/a", value("1"), 99).await;
        assert_eq!(err.unwrap_err(), KvError::LeaseNotFound(99));
        assert!(!store.contains_key("svc/a"));
    }

    #[tokio::test]
    async fn watchers_only_see_their_prefix() {
        let store = MemoryKvStore::new();
        let mut svc_rx = store.watch_prefix("svc", 1).await.unwrap();

        store.put("other/x", value("1"));
        store.put("svc/a", value("2"));

        let batch = svc_rx.recv().await.unwrap().unwrap();
        assert_eq!(batch[0].key, "svc/a");
    }
}
