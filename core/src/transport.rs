//! The dialing transport boundary.

use crate::endpoint::Endpoint;
use crate::error::TransportError;
use async_trait::async_trait;

/// Turns a target's current address set into a live connection.
///
/// Discovery decides *when* to dial; the transport owns the wire protocol
/// and the selection policy among the offered addresses (round-robin, pick
/// first, weighted — not this crate's concern). The engine hands every dial
/// attempt the newest address set it holds for the target.
///
/// # Implementation requirements
///
/// - `dial` is invoked repeatedly by the owning connection loop until it
///   succeeds, and not again while the returned connection is held.
/// - A dropped `dial` future means the caller was cancelled mid-attempt;
///   implementations must not require a matching `disconnect` in that case.
/// - `disconnect` is invoked exactly once per connection that `dial`
///   returned, at teardown.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection handle type handed back to callers. Cloning must be cheap
    /// (a channel handle, not a socket).
    type Conn: Clone + Send + Sync + 'static;

    /// Dial `target`, choosing among `endpoints`.
    async fn dial(
        &self,
        target: &str,
        endpoints: &[Endpoint],
    ) -> Result<Self::Conn, TransportError>;

    /// Release a connection previously returned by [`Transport::dial`].
    ///
    /// The default drops the handle, which suits transports whose
    /// connections close on drop.
    async fn disconnect(&self, conn: Self::Conn) {
        drop(conn);
    }
}
