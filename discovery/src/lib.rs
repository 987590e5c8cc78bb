//! verkko-discovery - watch-based service discovery with self-registration
//!
//! Keeps a local, eventually-consistent view of which network addresses
//! currently answer for each logical target, and symmetrically keeps this
//! process's own address visible to others for as long as it is healthy.
//!
//! ```text
//! AddressWatcher ──► Store ──► managed connection per target ──► get()
//!
//! Registration ──► lease-scoped put ──► other processes' watchers
//! ```
//!
//! - [`Store`] consumes an address feed over a key prefix, reconciles it
//!   into per-target address sets, and owns one retrying connection per
//!   live target.
//! - [`Registration`] publishes this process's address under a lease and
//!   survives session expiry by re-registering on its own.
//! - [`AddressWatcher`] is the feed both sides meet through: snapshot
//!   first, then an incremental change stream with nothing lost in between.
//!
//! The key-value watch store and the dialing transport are collaborators
//! behind the `verkko-core` traits; [`MemoryKvStore`] and [`GrpcTransport`]
//! are the in-tree implementations of each.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

mod conn;
pub mod grpc;
pub mod mem;
pub mod register;
pub mod store;
pub mod watcher;

pub use grpc::GrpcTransport;
pub use mem::MemoryKvStore;
pub use register::{Registration, RegistrationConfig};
pub use store::{Store, StoreConfig};
pub use watcher::{AddressWatcher, WatcherHandle};

// Re-export the boundary surface so engine users need a single import.
pub use verkko_core::{
    join_key, target_from_key, validate_address, DiscoveryError, Endpoint, EventKind, KvError,
    KvPair, KvStore, LeaseId, Op, Session, Snapshot, Transport, TransportError, Update,
    WatchBatch, WatchEvent, KEY_SEPARATOR,
};
