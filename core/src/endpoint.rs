//! Endpoint records and the key layout they are published under.
//!
//! Registered entries live at `prefix + "/" + address`; the value is the
//! serialized `{address, metadata}` payload. The target name is never stored
//! in the value — it is recovered by stripping the trailing `"/" + address`
//! suffix from the key. That rule is why addresses must not contain the
//! separator themselves (enforced by [`validate_address`] at registration).

use crate::error::DiscoveryError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Separator between a target prefix and an address in published keys.
pub const KEY_SEPARATOR: char = '/';

/// Whether an update adds or removes an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// The address answers for the target.
    Add,
    /// The address no longer answers for the target.
    Remove,
}

/// One dialable endpoint for a target.
///
/// Two endpoints describe the same entry only when both the address and the
/// metadata match; an address republished with different metadata counts as
/// a distinct entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Dialable network address, e.g. `10.0.0.1:9000`.
    pub address: String,
    /// Opaque caller-defined document carried alongside the address.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Endpoint {
    /// Endpoint with no metadata.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Endpoint with attached metadata.
    pub fn with_metadata(address: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            address: address.into(),
            metadata,
        }
    }

    /// Serialize to the published key-value payload.
    pub fn encode(&self) -> Result<Bytes, DiscoveryError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| DiscoveryError::Codec {
                key: self.address.clone(),
                reason: e.to_string(),
            })
    }

    /// Decode a published key-value payload. `key` is only used for error
    /// context.
    pub fn decode(key: &str, value: &[u8]) -> Result<Self, DiscoveryError> {
        serde_json::from_slice(value).map_err(|e| DiscoveryError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// One address change observed under the watched prefix. Immutable once
/// produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Add or remove.
    pub op: Op,
    /// Logical service name the address answers for.
    pub target: String,
    /// The affected endpoint.
    pub endpoint: Endpoint,
}

/// Join a target prefix and an address into the published key.
pub fn join_key(prefix: &str, address: &str) -> String {
    format!("{prefix}{KEY_SEPARATOR}{address}")
}

/// Recover the target name from a published key.
///
/// The target is everything before the trailing `"/" + address` suffix.
/// Returns `None` when the key does not end in that suffix or the remaining
/// target name would be empty.
pub fn target_from_key<'a>(key: &'a str, address: &str) -> Option<&'a str> {
    let rest = key.strip_suffix(address)?;
    let rest = rest.strip_suffix(KEY_SEPARATOR)?;
    (!rest.is_empty()).then_some(rest)
}

/// Registration precondition: the address becomes the final path segment of
/// the published key, so it must be non-empty and free of the separator.
pub fn validate_address(address: &str) -> Result<(), DiscoveryError> {
    if address.is_empty() || address.contains(KEY_SEPARATOR) {
        return Err(DiscoveryError::InvalidAddress(address.to_string()));
    }
    Ok(())
}
