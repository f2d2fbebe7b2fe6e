//! PostgREST-compatible directory client
//!
//! Issues `GET {url}/rest/v1/{table}?select=auth_method,auth_data&database_id=eq.{id}`
//! with the service key as both `apikey` and bearer token.

use async_trait::async_trait;
use std::time::Duration;

use super::{CredentialRecord, TenantDirectory};
use crate::config::RestDirectoryConfig;
use crate::error::{GatewayError, Result};
use crate::tls::TenantId;

/// Directory backed by a PostgREST endpoint (e.g. Supabase).
pub struct RestTenantDirectory {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
}

impl std::fmt::Debug for RestTenantDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTenantDirectory")
            .field("endpoint", &self.endpoint)
            .field("service_key", &"<redacted>")
            .finish()
    }
}

impl RestTenantDirectory {
    pub fn new(config: &RestDirectoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_client(config, client))
    }

    /// Use a preconfigured HTTP client.
    pub fn with_client(config: &RestDirectoryConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/rest/v1/{}",
                config.url.trim_end_matches('/'),
                config.table
            ),
            service_key: config.service_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn query_params(tenant: &TenantId) -> [(&'static str, String); 2] {
    [
        ("select", "auth_method,auth_data".to_string()),
        ("database_id", format!("eq.{}", tenant)),
    ]
}

/// Collapse the row array into at most one record.
fn single_record(
    tenant: &TenantId,
    mut rows: Vec<CredentialRecord>,
) -> Result<Option<CredentialRecord>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        n => Err(GatewayError::Directory(format!(
            "expected one credential record for {}, found {}",
            tenant, n
        ))),
    }
}

#[async_trait]
impl TenantDirectory for RestTenantDirectory {
    async fn lookup_credential(&self, tenant: &TenantId) -> Result<Option<CredentialRecord>> {
        debug!("Directory lookup: GET {} for {}", self.endpoint, tenant);

        let response = self
            .client
            .get(&self.endpoint)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Accept", "application/json")
            .query(&query_params(tenant))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Directory(format!(
                "lookup for {} failed with status: {}",
                tenant,
                response.status()
            )));
        }

        let text = response.text().await?;
        let rows: Vec<CredentialRecord> = serde_json::from_str(&text).map_err(|e| {
            GatewayError::Directory(format!("invalid directory response: {}", e))
        })?;

        single_record(tenant, rows)
    }
}
