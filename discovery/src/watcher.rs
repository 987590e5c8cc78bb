//! One watch subscription over a key prefix, reduced to address updates.
//!
//! The first [`AddressWatcher::next`] call takes a consistent snapshot of
//! the prefix and returns every entry as an `Add`, then subscribes to the
//! change stream at the snapshot revision + 1 so nothing is missed or
//! duplicated between snapshot and stream. Later calls drain one
//! notification batch each: puts become `Add`, deletes become `Remove`
//! recovered from the entry's previous value.
//!
//! Termination is sticky. Once closed — by [`WatcherHandle::close`] or by
//! the far end ending the stream — every later `next` returns
//! [`DiscoveryError::WatcherClosed`]. Once the stream fails with any other
//! error, every later `next` returns that same error. The watcher never
//! re-opens the stream; whether to build a new one is the owner's call.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use verkko_core::{
    target_from_key, DiscoveryError, Endpoint, EventKind, KvError, KvStore, Op, Update,
    WatchBatch,
};

/// Cloneable closer for an [`AddressWatcher`].
///
/// The watcher itself is consumed by the loop that drives it; the handle is
/// how anyone else shuts it down.
#[derive(Clone)]
pub struct WatcherHandle {
    close_tx: Arc<watch::Sender<bool>>,
}

impl WatcherHandle {
    /// Close the watcher. Idempotent; unblocks a pending
    /// [`AddressWatcher::next`], including one still waiting on the initial
    /// snapshot.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// Streams address add/remove updates for every target under a prefix.
pub struct AddressWatcher {
    kv: Arc<dyn KvStore>,
    prefix: String,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    stream: Option<mpsc::Receiver<Result<WatchBatch, KvError>>>,
    poisoned: Option<DiscoveryError>,
}

impl AddressWatcher {
    /// Watcher over every key under `prefix` in `kv`. Nothing happens until
    /// the first [`AddressWatcher::next`] call.
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            kv,
            prefix: prefix.into(),
            close_tx: Arc::new(close_tx),
            close_rx,
            stream: None,
            poisoned: None,
        }
    }

    /// A handle that can close this watcher from another task.
    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            close_tx: Arc::clone(&self.close_tx),
        }
    }

    /// The next batch of updates, blocking until changes arrive or the
    /// watcher is closed.
    pub async fn next(&mut self) -> Result<Vec<Update>, DiscoveryError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }
        if *self.close_rx.borrow() {
            return Err(self.poison(DiscoveryError::WatcherClosed));
        }
        if self.stream.is_none() {
            return self.first_next().await;
        }

        let received = {
            let mut close_rx = self.close_rx.clone();
            let Some(stream) = self.stream.as_mut() else {
                return Err(self.poison(DiscoveryError::WatcherClosed));
            };
            tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => None,
                batch = stream.recv() => Some(batch),
            }
        };

        match received {
            // Closed via the handle, or the far end ended the stream: both
            // are the deliberate-close sentinel.
            None | Some(None) => Err(self.poison(DiscoveryError::WatcherClosed)),
            Some(Some(Err(err))) => Err(self.poison(err.into())),
            Some(Some(Ok(events))) => Ok(self.reduce(events)),
        }
    }

    /// Snapshot the prefix, emit everything as `Add`, then subscribe to the
    /// change stream starting right after the snapshot revision.
    async fn first_next(&mut self) -> Result<Vec<Update>, DiscoveryError> {
        let snapshot = {
            let mut close_rx = self.close_rx.clone();
            tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => None,
                snapshot = self.kv.get_prefix(&self.prefix) => Some(snapshot),
            }
        };
        let snapshot = match snapshot {
            None => return Err(self.poison(DiscoveryError::WatcherClosed)),
            Some(Err(err)) => return Err(self.poison(err.into())),
            Some(Ok(snapshot)) => snapshot,
        };

        let mut updates = Vec::with_capacity(snapshot.entries.len());
        for pair in &snapshot.entries {
            if let Some(update) = decode_update(Op::Add, &pair.key, &pair.value) {
                updates.push(update);
            }
        }

        let stream = {
            let mut close_rx = self.close_rx.clone();
            tokio::select! {
                _ = close_rx.wait_for(|closed| *closed) => None,
                stream = self.kv.watch_prefix(&self.prefix, snapshot.revision + 1) => Some(stream),
            }
        };
        match stream {
            None => Err(self.poison(DiscoveryError::WatcherClosed)),
            Some(Err(err)) => Err(self.poison(err.into())),
            Some(Ok(stream)) => {
                self.stream = Some(stream);
                Ok(updates)
            }
        }
    }

    /// Map raw watch events onto updates. Entries that cannot be decoded are
    /// logged and skipped, never fatal.
    fn reduce(&self, events: WatchBatch) -> Vec<Update> {
        let mut updates = Vec::with_capacity(events.len());
        for event in &events {
            let update = match event.kind {
                EventKind::Put => decode_update(Op::Add, &event.key, &event.value),
                // Deletes carry no payload; the removed entry lives in the
                // previous value.
                EventKind::Delete => match &event.prev_value {
                    Some(prev) => decode_update(Op::Remove, &event.key, prev),
                    None => {
                        warn!(key = %event.key, "delete without previous value, skipping");
                        None
                    }
                },
            };
            if let Some(update) = update {
                updates.push(update);
            }
        }
        updates
    }

    fn poison(&mut self, err: DiscoveryError) -> DiscoveryError {
        self.poisoned = Some(err.clone());
        err
    }
}

fn decode_update(op: Op, key: &str, value: &[u8]) -> Option<Update> {
    let endpoint = match Endpoint::decode(key, value) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            warn!(key = %key, error = %err, "undecodable endpoint entry, skipping");
            return None;
        }
    };
    let Some(target) = target_from_key(key, &endpoint.address) else {
        warn!(key = %key, address = %endpoint.address, "key does not match its payload address, skipping");
        return None;
    };
    Some(Update {
        op,
        target: target.to_string(),
        endpoint,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mem::MemoryKvStore;
    use bytes::Bytes;
    use serde_json::json;
    use verkko_core::join_key;

    fn publish(store: &MemoryKvStore, prefix: &str, target: &str, endpoint: &Endpoint) {
        let key = join_key(&format!("{prefix}/{target}"), &endpoint.address);
        store.put(key, endpoint.encode().unwrap());
    }

    fn unpublish(store: &MemoryKvStore, prefix: &str, target: &str, address: &str) {
        store.delete(&join_key(&format!("{prefix}/{target}"), address));
    }

    #[tokio::test]
    async fn first_next_returns_the_snapshot_as_adds() {
        let store = MemoryKvStore::new();
        let a = Endpoint::new("10.0.0.1:9000");
        let b = Endpoint::with_metadata("10.0.0.2:9000", json!({"zone": "b"}));
        publish(&store, "peers", "svc-a", &a);
        publish(&store, "peers", "svc-b", &b);

        let mut watcher = AddressWatcher::new(Arc::new(store), "peers");
        let updates = watcher.next().await.unwrap();

        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.op == Op::Add));
        assert!(updates
            .iter()
            .any(|u| u.target == "peers/svc-b" && u.endpoint == b));
    }

    #[tokio::test]
    async fn changes_after_the_snapshot_stream_in_order() {
        let store = MemoryKvStore::new();
        let mut watcher = AddressWatcher::new(Arc::new(store.clone()), "peers");
        assert!(watcher.next().await.unwrap().is_empty());

        let endpoint = Endpoint::new("10.0.0.1:9000");
        publish(&store, "peers", "svc-a", &endpoint);
        let updates = watcher.next().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].op, Op::Add);
        assert_eq!(updates[0].target, "peers/svc-a");

        unpublish(&store, "peers", "svc-a", "10.0.0.1:9000");
        let updates = watcher.next().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].op, Op::Remove);
        assert_eq!(updates[0].endpoint, endpoint);
    }

    #[tokio::test]
    async fn nothing_is_lost_between_snapshot_and_stream() {
        let store = MemoryKvStore::new();
        let before = Endpoint::new("10.0.0.1:9000");
        publish(&store, "peers", "svc-a", &before);

        let mut watcher = AddressWatcher::new(Arc::new(store.clone()), "peers");
        let snapshot = watcher.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        // Landed after the snapshot read; must arrive exactly once on the
        // stream, not be dropped and not be duplicated.
        let after = Endpoint::new("10.0.0.2:9000");
        publish(&store, "peers", "svc-a", &after);
        let updates = watcher.next().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].endpoint, after);
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped() {
        let store = MemoryKvStore::new();
        store.put("peers/svc-a/garbage", Bytes::from_static(b"not json"));
        let good = Endpoint::new("10.0.0.1:9000");
        publish(&store, "peers", "svc-a", &good);

        let mut watcher = AddressWatcher::new(Arc::new(store), "peers");
        let updates = watcher.next().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].endpoint, good);
    }

    #[tokio::test]
    async fn key_mismatching_its_payload_is_skipped() {
        let store = MemoryKvStore::new();
        // Payload claims a different address than the key carries.
        let lying = Endpoint::new("10.9.9.9:1");
        store.put("peers/svc-a/10.0.0.1:9000", lying.encode().unwrap());

        let mut watcher = AddressWatcher::new(Arc::new(store), "peers");
        assert!(watcher.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_makes_every_next_return_the_sentinel() {
        let store = MemoryKvStore::new();
        let mut watcher = AddressWatcher::new(Arc::new(store), "peers");
        watcher.next().await.unwrap();

        watcher.handle().close();
        assert!(watcher.next().await.unwrap_err().is_closed());
        // Sticky: still the sentinel on the call after.
        assert!(watcher.next().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn close_before_first_next_short_circuits_the_snapshot() {
        let store = MemoryKvStore::new();
        let mut watcher = AddressWatcher::new(Arc::new(store), "peers");
        watcher.handle().close();
        assert!(watcher.next().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_next() {
        let store = MemoryKvStore::new();
        let mut watcher = AddressWatcher::new(Arc::new(store), "peers");
        watcher.next().await.unwrap();
        let handle = watcher.handle();

        let pending = tokio::spawn(async move { watcher.next().await });
        tokio::task::yield_now().await;

        // Closing twice exercises idempotence as well.
        handle.close();
        handle.close();

        let result = pending.await.unwrap();
        assert!(result.unwrap_err().is_closed());
    }
}
