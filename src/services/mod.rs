//! gRPC service implementations.

use std::net::SocketAddr;

use tonic::transport::server::TcpIncoming;

pub mod audit_query;

pub use audit_query::AuditQueryService;

/// Errors starting the query server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Failed to bind query server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to configure query listener: {0}")]
    Listener(String),
}

/// Bind the query server's socket up front so an unusable address fails
/// startup instead of surfacing when the server task is joined.
pub async fn bind_query_listener(addr: SocketAddr) -> Result<TcpIncoming, ServeError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    TcpIncoming::from_listener(listener, true, None).map_err(|e| ServeError::Listener(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_query_listener_rejects_address_in_use() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind_query_listener(addr).await.unwrap_err();

        assert!(matches!(err, ServeError::Bind { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn test_bind_query_listener_on_free_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(bind_query_listener(addr).await.is_ok());
    }
}
