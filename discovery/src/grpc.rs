//! Default transport over tonic channels.

use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint as ChannelEndpoint};
use tracing::warn;
use verkko_core::{Endpoint, Transport, TransportError};

/// Default per-endpoint connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] producing tonic [`Channel`]s.
///
/// Builds one channel endpoint per discovered address and hands the whole
/// set to [`Channel::balance_list`], so selection among the addresses stays
/// the balancer's job — this transport never picks a favorite. The channel
/// connects lazily; a returned channel means the address set was usable, not
/// that a TCP session exists yet.
pub struct GrpcTransport {
    scheme: String,
    connect_timeout: Duration,
}

impl GrpcTransport {
    /// Transport dialing `http://` addresses.
    pub fn new() -> Self {
        Self {
            scheme: "http".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the URI scheme prepended to discovered addresses.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Override the per-endpoint connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    type Conn = Channel;

    async fn dial(
        &self,
        target: &str,
        endpoints: &[Endpoint],
    ) -> Result<Channel, TransportError> {
        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints(target.to_string()));
        }

        let mut candidates = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let uri = format!("{}://{}", self.scheme, endpoint.address);
            match ChannelEndpoint::from_shared(uri) {
                Ok(candidate) => {
                    candidates.push(candidate.connect_timeout(self.connect_timeout));
                }
                Err(err) => {
                    warn!(
                        target = %target,
                        address = %endpoint.address,
                        error = %err,
                        "skipping undialable address"
                    );
                }
            }
        }
        if candidates.is_empty() {
            return Err(TransportError::Connect(format!(
                "no valid addresses for {target}"
            )));
        }

        Ok(Channel::balance_list(candidates.into_iter()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_address_set_is_a_no_endpoints_error() {
        let transport = GrpcTransport::new();
        let err = transport.dial("svc-a", &[]).await.unwrap_err();
        assert!(matches!(err, TransportError::NoEndpoints(_)));
    }

    #[tokio::test]
    async fn valid_addresses_produce_a_channel() {
        let transport = GrpcTransport::new();
        let endpoints = [
            Endpoint::new("127.0.0.1:50051"),
            Endpoint::new("127.0.0.1:50052"),
        ];
        assert!(transport.dial("svc-a", &endpoints).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_addresses_are_skipped_not_fatal() {
        let transport = GrpcTransport::new();
        let endpoints = [
            Endpoint::new("not a uri"),
            Endpoint::new("127.0.0.1:50051"),
        ];
        assert!(transport.dial("svc-a", &endpoints).await.is_ok());
    }

    #[tokio::test]
    async fn all_invalid_addresses_fail_the_attempt() {
        let transport = GrpcTransport::new();
        let endpoints = [Endpoint::new("not a uri")];
        let err = transport.dial("svc-a", &endpoints).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn scheme_override_applies() {
        let transport = GrpcTransport::new().with_scheme("https");
        let endpoints = [Endpoint::new("example.test:443")];
        assert!(transport.dial("svc-a", &endpoints).await.is_ok());
    }
}
