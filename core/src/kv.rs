//! The consistent, revisioned key-value watch store boundary.
//!
//! Discovery and registration consume the store exclusively through
//! [`KvStore`] and [`Session`]. An adapter over a real store (etcd, consul,
//! anything with revisioned prefix watches and leases) implements these
//! traits; the engine never sees the store's native API.
//!
//! # Implementation requirements
//!
//! - Snapshot reads may be serializable/stale — discovery tolerates
//!   staleness within a reconciliation window.
//! - Watch batches must arrive in revision order and must not skip changes
//!   between `from_revision` and the live edge.
//! - Delete events carry no payload of their own; `prev_value` is how
//!   consumers recover what was removed.
//! - Sessions renew their lease internally. Consumers only observe
//!   [`Session::expired`], which means renewal has irrecoverably failed.

use crate::error::KvError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lease identifier handed out by the store.
pub type LeaseId = i64;

/// One key/value entry returned by a snapshot read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Full key, `prefix/address`.
    pub key: String,
    /// Raw stored value.
    pub value: Bytes,
}

/// A consistent prefix read plus the store revision it was taken at.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Entries under the prefix as of `revision`.
    pub entries: Vec<KvPair>,
    /// Store revision of the read; a watch opened at `revision + 1` observes
    /// every later change exactly once.
    pub revision: i64,
}

/// The kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A key was created or overwritten.
    Put,
    /// A key was deleted.
    Delete,
}

/// One change observed by a watch subscription.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Put or delete.
    pub kind: EventKind,
    /// Full key the change applies to.
    pub key: String,
    /// New value. Empty for deletes.
    pub value: Bytes,
    /// Last value the key held before this change, when the store knows it.
    pub prev_value: Option<Bytes>,
}

/// One notification batch from a watch stream, in delivery order.
pub type WatchBatch = Vec<WatchEvent>;

/// A lease-backed liveness session.
///
/// Entries put with the session's lease vanish when the lease does — the
/// anti-entropy mechanism that reclaims entries of dead processes without
/// operator intervention.
#[async_trait]
pub trait Session: Send + Sync {
    /// The lease backing this session.
    fn lease_id(&self) -> LeaseId;

    /// Resolves once the lease has been lost (missed renewal window, store
    /// restart). Never resolves for a healthy session. Must be cancel-safe:
    /// callers race it against their own shutdown signal.
    async fn expired(&self);

    /// Revoke the lease and stop renewing it. The store removes every entry
    /// tied to the lease. Fails with [`KvError::LeaseNotFound`] when the
    /// lease is already gone.
    async fn close(self: Box<Self>) -> Result<(), KvError>;
}

/// The key-value watch store consumed by discovery and registration.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Snapshot of every entry under `prefix`, tagged with the revision the
    /// read was served at.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, KvError>;

    /// Subscribe to changes under `prefix` starting at `from_revision`.
    ///
    /// The channel yields batches in order, yields `Err` once on a stream
    /// failure, and closes when the store tears the subscription down.
    /// Dropping the receiver cancels the subscription.
    async fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<Result<WatchBatch, KvError>>, KvError>;

    /// Acquire a lease-backed session with the given time-to-live. The
    /// session renews itself until closed or lost.
    async fn session(&self, ttl: Duration) -> Result<Box<dyn Session>, KvError>;

    /// Write `value` under `key`, tied to `lease`: the entry is removed
    /// automatically when the lease expires or is revoked.
    async fn put_with_lease(&self, key: &str, value: Bytes, lease: LeaseId)
        -> Result<(), KvError>;
}
