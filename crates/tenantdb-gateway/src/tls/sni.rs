//! Server-name routing
//!
//! The tenant id is the left-most label of the TLS server name. The name
//! must sit under the configured serving domain; anything else is refused
//! before a tenant lookup happens.

use std::fmt;

/// Opaque tenant identifier taken from the TLS server name
///
/// Used as the credential lookup key, the cache key and the engine key.
/// No character-set validation happens here: ids that cannot name an
/// archive simply fail to resolve downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a raw tenant id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Why a ClientHello could not be routed to a tenant
///
/// The `Display` text is sent to the client verbatim in a FATAL
/// connection-exception notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniRejection {
    /// No server name extension (or a plaintext startup)
    Missing,
    /// Server name is not a subdomain of the serving domain
    UnknownServer(String),
}

impl fmt::Display for SniRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniRejection::Missing => f.write_str("server name required"),
            SniRejection::UnknownServer(name) => write!(f, "unknown server {}", name),
        }
    }
}

/// Maps TLS server names onto tenant ids for one serving domain
#[derive(Debug, Clone)]
pub struct SniResolver {
    /// Lowercased serving domain, e.g. `db.example.com`
    domain: String,
}

impl SniResolver {
    /// Create a resolver for an already-normalized serving domain
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into().to_ascii_lowercase(),
        }
    }

    /// The serving domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Resolve the server name offered in a ClientHello.
    ///
    /// Accepts `<label>[.<more labels>].<domain>`, compared without regard
    /// to ASCII case, and returns the first label as the tenant id.
    pub fn resolve(&self, server_name: Option<&str>) -> Result<TenantId, SniRejection> {
        let name = match server_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(SniRejection::Missing),
        };

        let lowered = name.trim_end_matches('.').to_ascii_lowercase();
        let prefix = lowered
            .strip_suffix(self.domain.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .ok_or_else(|| SniRejection::UnknownServer(name.to_string()))?;

        match prefix.split('.').next() {
            Some(label) if !label.is_empty() => Ok(TenantId::new(label)),
            _ => Err(SniRejection::UnknownServer(name.to_string())),
        }
    }
}
