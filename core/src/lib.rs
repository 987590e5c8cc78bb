//! verkko-core - boundary types for the verkko discovery engine
//!
//! This crate provides the types shared between the discovery engine and the
//! external collaborators it orchestrates:
//!
//! - [`Update`] / [`Endpoint`] - the address-change records discovery is
//!   built from, plus the key layout they are published under
//! - [`KvStore`] / [`Session`] traits - the revisioned watch store boundary
//!   (Get/Watch/Lease/Put)
//! - [`Transport`] trait - the dialing boundary
//! - [`DiscoveryError`] / [`KvError`] / [`TransportError`] - the error
//!   taxonomy, including the `WatcherClosed` sentinel
//!
//! # Why this crate exists
//!
//! Store adapters (etcd, consul, an in-memory double) and transports (tonic,
//! a mock) implement these traits. Without `verkko-core` they would depend
//! on the engine crate, which in turn wants to ship default implementations
//! of both boundaries — a cycle. Extracting the boundary here breaks it:
//!
//! ```text
//! verkko-core ◄── verkko-discovery
//!     ▲
//!     └─────────── store adapters / transports
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod endpoint;
mod error;
/// The key-value watch store boundary
pub mod kv;
/// The dialing transport boundary
pub mod transport;

pub use endpoint::{
    join_key, target_from_key, validate_address, Endpoint, Op, Update, KEY_SEPARATOR,
};
pub use error::{DiscoveryError, KvError, TransportError};
pub use kv::{EventKind, KvPair, KvStore, LeaseId, Session, Snapshot, WatchBatch, WatchEvent};
pub use transport::Transport;
