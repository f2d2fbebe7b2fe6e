//! TLS termination and SNI tenant routing
//!
//! Every client connection is upgraded in-band: the client sends an
//! `SSLRequest`, the gateway answers `S`, and the TLS handshake follows on
//! the same socket. The server name the client asks for selects the tenant.
//!
//! ```text
//! ┌──────────┐  SSLRequest / TLS   ┌───────────┐   unix socket   ┌──────────┐
//! │  Client  │ ─────────────────── │  Gateway  │ ─────────────── │  Engine  │
//! │  (psql)  │ SNI t1.db.example.com│           │  (tenant t1)    │          │
//! └──────────┘                     └───────────┘                 └──────────┘
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! tls:
//!   cert_path: "/etc/tenantdb/wildcard.crt"
//!   key_path: "/etc/tenantdb/wildcard.key"
//!   wildcard_domain: "db.example.com"
//! ```
//!
//! The certificate is a single wildcard identity (`*.db.example.com`) that
//! covers every tenant.

mod acceptor;
mod config;
mod error;
mod sni;

pub use acceptor::{SniHandshake, TlsAcceptor};
pub use config::TlsServerConfig;
pub use error::TlsError;
pub use sni::{SniRejection, SniResolver, TenantId};

// Shared utilities for loading certificates and keys
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Load certificates from a PEM file
///
/// Reads all certificates from a PEM-encoded file and returns them as
/// a vector of `CertificateDer`. This supports certificate chains.
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;

    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))?;

    Ok(certs)
}

/// Load a private key from a PEM file. Supports RSA, PKCS8, and EC keys.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;

    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}
