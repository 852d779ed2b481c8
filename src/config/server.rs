//! gRPC server configuration.

use std::net::SocketAddr;

use serde::Deserialize;

use super::ConfigError;

/// Where the query service listens.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_socket_addr_rejects_hostname_garbage() {
        let config = ServerConfig {
            host: "not an address".to_string(),
            port: 1,
        };
        assert!(config.socket_addr().is_err());
    }
}
