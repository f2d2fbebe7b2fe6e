//! TLS configuration types

use serde::Deserialize;
use std::path::PathBuf;

/// Server-side TLS configuration
///
/// TLS is mandatory: a connection without a server name cannot be routed to
/// a tenant, so there is no plaintext mode.
///
/// # Example YAML
/// ```yaml
/// tls:
///   cert_path: "/etc/tenantdb/wildcard.crt"
///   key_path: "/etc/tenantdb/wildcard.key"
///   wildcard_domain: "db.example.com"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TlsServerConfig {
    /// Path to the wildcard certificate chain in PEM format
    pub cert_path: PathBuf,

    /// Path to the private key in PEM format
    pub key_path: PathBuf,

    /// Serving domain; tenants are its direct subdomains.
    ///
    /// Accepts either `db.example.com` or `*.db.example.com`.
    pub wildcard_domain: String,
}

impl TlsServerConfig {
    /// The serving domain, lowercased and without wildcard or dot prefixes
    pub fn serving_domain(&self) -> String {
        self.wildcard_domain
            .trim()
            .trim_start_matches("*.")
            .trim_start_matches('.')
            .trim_end_matches('.')
            .to_ascii_lowercase()
    }

    /// Validate the TLS configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cert_path.as_os_str().is_empty() {
            return Err("tls.cert_path is required".to_string());
        }
        if self.key_path.as_os_str().is_empty() {
            return Err("tls.key_path is required".to_string());
        }
        let domain = self.serving_domain();
        if domain.is_empty() {
            return Err("tls.wildcard_domain is required".to_string());
        }
        if domain.contains('*') || domain.split('.').any(str::is_empty) {
            return Err(format!(
                "tls.wildcard_domain '{}' is not a valid domain",
                self.wildcard_domain
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(domain: &str) -> TlsServerConfig {
        TlsServerConfig {
            cert_path: PathBuf::from("/cert.pem"),
            key_path: PathBuf::from("/key.pem"),
            wildcard_domain: domain.to_string(),
        }
    }

    #[test]
    fn test_serving_domain_normalization() {
        assert_eq!(config("db.example.com").serving_domain(), "db.example.com");
        assert_eq!(config("*.db.example.com").serving_domain(), "db.example.com");
        assert_eq!(config(".DB.Example.com.").serving_domain(), "db.example.com");
    }

    #[test]
    fn test_validate() {
        assert!(config("db.example.com").validate().is_ok());
        assert!(config("").validate().is_err());
        assert!(config("*.").validate().is_err());
        assert!(config("db..example.com").validate().is_err());
        assert!(config("a.*.example.com").validate().is_err());

        let mut missing_cert = config("db.example.com");
        missing_cert.cert_path = PathBuf::new();
        assert!(missing_cert.validate().unwrap_err().contains("cert_path"));
    }
}
