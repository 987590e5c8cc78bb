//! Error types for verkko

use thiserror::Error;

/// Errors surfaced by the key-value watch store boundary.
///
/// Adapters translate their native failures into these categories so the
/// engine can tell transient infrastructure trouble apart from conditions
/// that end a subscription or a lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The store could not be reached or rejected the request.
    ///
    /// Examples: connection refused, request timeout, quorum loss.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// The lease backing an operation no longer exists.
    ///
    /// Returned by lease-scoped puts and by closing a session whose lease
    /// the store already reclaimed.
    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    /// The store tore down a watch subscription on its own.
    ///
    /// Examples: the subscriber lagged too far behind, the watched range
    /// was compacted away.
    #[error("watch cancelled by the store: {0}")]
    WatchCancelled(String),
}

/// Errors from a transport dialing attempt.
///
/// Dial failures are transient by definition: the owning connection loop
/// retries them at a fixed pace and never surfaces them to callers.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The target currently has no dialable addresses.
    #[error("no dialable addresses for target {0:?}")]
    NoEndpoints(String),

    /// The connection attempt itself failed.
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Errors surfaced by the discovery engine.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// The watcher was deliberately closed.
    ///
    /// This is a sentinel: callers use [`DiscoveryError::is_closed`] to tell
    /// "I stopped you" apart from "something broke". Once returned, every
    /// later call on the same watcher returns it again.
    #[error("address watch closed")]
    WatcherClosed,

    /// The key-value store boundary failed.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// A published endpoint entry could not be encoded or decoded.
    #[error("malformed endpoint entry at {key:?}: {reason}")]
    Codec {
        /// Key of the offending entry.
        key: String,
        /// What went wrong while (de)serializing the value.
        reason: String,
    },

    /// `start` was called on a store that is already running or stopped.
    #[error("store already started")]
    AlreadyStarted,

    /// Addresses may not contain the key separator, otherwise the target
    /// name cannot be recovered from the published key.
    #[error("invalid address {0:?}: must not be empty or contain '/'")]
    InvalidAddress(String),
}

impl DiscoveryError {
    /// True for the deliberate-close sentinel.
    pub fn is_closed(&self) -> bool {
        matches!(self, DiscoveryError::WatcherClosed)
    }
}
