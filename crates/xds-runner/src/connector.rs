//! Dialing the target and the companion adapter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

use crate::adapter::{CompanionAdapter, GrpcAdapterClient};
use crate::transport::{DiscoveryTransport, GrpcTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Target,
    Adapter,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target => f.write_str("target"),
            Self::Adapter => f.write_str("adapter"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid {role} address '{address}': {detail}")]
    InvalidAddress {
        role: ConnectionRole,
        address: String,
        detail: String,
    },
    #[error("timed out after {timeout:?} dialing {role} at {address}")]
    Timeout {
        role: ConnectionRole,
        address: String,
        timeout: Duration,
    },
    #[error("cannot reach {role} at {address}: {detail}")]
    Unreachable {
        role: ConnectionRole,
        address: String,
        detail: String,
    },
}

/// Produces transport handles for the target and the adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_target(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn DiscoveryTransport>, ConnectionError>;

    async fn connect_adapter(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn CompanionAdapter>, ConnectionError>;
}

/// Dials real gRPC endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

impl GrpcConnector {
    async fn dial(
        role: ConnectionRole,
        address: &str,
        timeout: Duration,
    ) -> Result<Channel, ConnectionError> {
        let endpoint = Endpoint::from_shared(endpoint_uri(address))
            .map_err(|error| ConnectionError::InvalidAddress {
                role,
                address: address.to_string(),
                detail: error.to_string(),
            })?
            .connect_timeout(timeout);

        match tokio::time::timeout(timeout, endpoint.connect()).await {
            Err(_) => Err(ConnectionError::Timeout {
                role,
                address: address.to_string(),
                timeout,
            }),
            Ok(Err(error)) => Err(ConnectionError::Unreachable {
                role,
                address: address.to_string(),
                detail: error.to_string(),
            }),
            Ok(Ok(channel)) => {
                tracing::info!(%role, address, "connected");
                Ok(channel)
            }
        }
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect_target(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn DiscoveryTransport>, ConnectionError> {
        let channel = Self::dial(ConnectionRole::Target, address, timeout).await?;
        Ok(Arc::new(GrpcTransport::new(channel)))
    }

    async fn connect_adapter(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn CompanionAdapter>, ConnectionError> {
        let channel = Self::dial(ConnectionRole::Adapter, address, timeout).await?;
        Ok(Arc::new(GrpcAdapterClient::new(channel)))
    }
}

/// `:18000` is shorthand for a port on the loopback interface.
fn endpoint_uri(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if address.starts_with(':') {
        format!("http://127.0.0.1{address}")
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::{endpoint_uri, ConnectionError, ConnectionRole, Connector, GrpcConnector};
    use std::time::Duration;

    #[test]
    fn endpoint_uri_expands_port_shorthand() {
        assert_eq!(endpoint_uri(":18000"), "http://127.0.0.1:18000");
        assert_eq!(endpoint_uri("target:17000"), "http://target:17000");
        assert_eq!(endpoint_uri("https://cp.example"), "https://cp.example");
    }

    #[tokio::test]
    async fn invalid_address_is_rejected_before_dialing() {
        let error = GrpcConnector
            .connect_target("not a uri", Duration::from_millis(50))
            .await
            .err()
            .expect("invalid address");
        assert!(matches!(
            error,
            ConnectionError::InvalidAddress {
                role: ConnectionRole::Target,
                ..
            }
        ));
    }
}
