//! Error types for tenantdb-gateway

use thiserror::Error;

use crate::tls::TlsError;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Tenant directory could not be reached or returned garbage
    #[error("Tenant directory error: {0}")]
    Directory(String),

    /// A tenant resource (archive, directory) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Archive extraction failed
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Engine start, bootstrap or session failure
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Result type alias for GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Directory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::NotFound("archive for t1".into());
        assert_eq!(err.to_string(), "Not found: archive for t1");

        let err = GatewayError::Extraction("unexpected EOF".into());
        assert_eq!(err.to_string(), "Extraction failed: unexpected EOF");
    }

    #[test]
    fn test_yaml_error_maps_to_config() {
        let err: GatewayError = serde_yaml::from_str::<u32>("not: [a number")
            .unwrap_err()
            .into();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
