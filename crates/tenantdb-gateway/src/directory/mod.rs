//! Tenant directory: credential records keyed by tenant id
//!
//! The gateway never stores credentials. Every connection performs a fresh
//! lookup so that revoking or rotating a tenant takes effect immediately.

mod rest;
mod static_directory;

pub use rest::RestTenantDirectory;
pub use static_directory::StaticTenantDirectory;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::DirectoryConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::postgres::auth::ScramVerifier;
use crate::tls::TenantId;

/// The only stored authentication method the gateway accepts.
pub const SCRAM_SHA_256: &str = "scram-sha-256";

/// A stored credential record.
///
/// `auth_data` is an opaque verifier bundle. It is never a password.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialRecord {
    pub auth_method: String,
    pub auth_data: serde_json::Value,
}

/// Source of credential records.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Fetch the single credential record for `tenant`.
    ///
    /// `Ok(None)` means the tenant does not exist. `Err` is a transport or
    /// decoding failure.
    async fn lookup_credential(&self, tenant: &TenantId) -> Result<Option<CredentialRecord>>;
}

/// Build the configured directory backend.
pub fn from_config(config: &DirectoryConfig) -> Result<Arc<dyn TenantDirectory>> {
    Ok(match config {
        DirectoryConfig::Rest(rest) => Arc::new(RestTenantDirectory::new(rest)?),
        DirectoryConfig::Static(records) => {
            Arc::new(StaticTenantDirectory::new(records.tenants.clone()))
        }
    })
}

/// Why a tenant's verifier could not be produced.
#[derive(Debug)]
pub enum CredentialError {
    /// Directory transport or decoding failure
    Lookup(GatewayError),
    /// No record for the tenant
    NotFound,
    /// Record exists with a method other than SCRAM-SHA-256
    UnsupportedMethod(String),
    /// Record exists but its verifier bundle is unusable
    InvalidAuthData(GatewayError),
}

impl CredentialError {
    /// Message sent to the client in the FATAL notice.
    pub fn client_message(&self, tenant: &TenantId) -> String {
        match self {
            CredentialError::Lookup(_) | CredentialError::InvalidAuthData(_) => {
                format!("Error getting auth data for database {}", tenant)
            }
            CredentialError::NotFound => format!("Database {} not found", tenant),
            CredentialError::UnsupportedMethod(method) => format!(
                "Unsupported auth method for database {}: {}",
                tenant, method
            ),
        }
    }
}

/// Look up `tenant` and turn its record into a SCRAM verifier.
pub async fn resolve_verifier(
    directory: &dyn TenantDirectory,
    tenant: &TenantId,
) -> std::result::Result<ScramVerifier, CredentialError> {
    let record = directory
        .lookup_credential(tenant)
        .await
        .map_err(CredentialError::Lookup)?
        .ok_or(CredentialError::NotFound)?;

    if record.auth_method != SCRAM_SHA_256 {
        return Err(CredentialError::UnsupportedMethod(record.auth_method));
    }

    ScramVerifier::from_bundle(&record.auth_data).map_err(CredentialError::InvalidAuthData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn directory(records: Vec<(&str, CredentialRecord)>) -> StaticTenantDirectory {
        StaticTenantDirectory::new(
            records
                .into_iter()
                .map(|(id, record)| (id.to_string(), record))
                .collect::<HashMap<_, _>>(),
        )
    }

    struct FailingDirectory;

    #[async_trait]
    impl TenantDirectory for FailingDirectory {
        async fn lookup_credential(&self, _tenant: &TenantId) -> Result<Option<CredentialRecord>> {
            Err(GatewayError::Directory("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_resolve_verifier_scram() {
        let verifier = ScramVerifier::from_password("pw", 4096);
        let dir = directory(vec![(
            "t1",
            CredentialRecord {
                auth_method: SCRAM_SHA_256.into(),
                auth_data: verifier.to_bundle(),
            },
        )]);
        let resolved = resolve_verifier(&dir, &TenantId::new("t1")).await.unwrap();
        assert_eq!(resolved.iterations(), 4096);
    }

    #[tokio::test]
    async fn test_resolve_verifier_not_found() {
        let dir = directory(vec![]);
        let tenant = TenantId::new("ghost");
        let err = resolve_verifier(&dir, &tenant).await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound));
        assert_eq!(err.client_message(&tenant), "Database ghost not found");
    }

    #[tokio::test]
    async fn test_resolve_verifier_unsupported_method() {
        let dir = directory(vec![(
            "t2",
            CredentialRecord {
                auth_method: "md5".into(),
                auth_data: serde_json::json!("md5abcdef"),
            },
        )]);
        let tenant = TenantId::new("t2");
        let err = resolve_verifier(&dir, &tenant).await.unwrap_err();
        assert_eq!(
            err.client_message(&tenant),
            "Unsupported auth method for database t2: md5"
        );
    }

    #[tokio::test]
    async fn test_resolve_verifier_transport_failure() {
        let tenant = TenantId::new("t1");
        let err = resolve_verifier(&FailingDirectory, &tenant).await.unwrap_err();
        assert!(matches!(err, CredentialError::Lookup(_)));
        assert_eq!(
            err.client_message(&tenant),
            "Error getting auth data for database t1"
        );
    }

    #[tokio::test]
    async fn test_resolve_verifier_bad_bundle() {
        let dir = directory(vec![(
            "t3",
            CredentialRecord {
                auth_method: SCRAM_SHA_256.into(),
                auth_data: serde_json::json!({"salt": "x"}),
            },
        )]);
        let err = resolve_verifier(&dir, &TenantId::new("t3")).await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidAuthData(_)));
    }
}
