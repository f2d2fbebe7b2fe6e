//! In-memory directory loaded from the config file

use async_trait::async_trait;
use std::collections::HashMap;

use super::{CredentialRecord, TenantDirectory};
use crate::error::Result;
use crate::tls::TenantId;

/// Directory backed by a fixed map of records.
///
/// Used for single-host deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    records: HashMap<String, CredentialRecord>,
}

impl StaticTenantDirectory {
    pub fn new(records: HashMap<String, CredentialRecord>) -> Self {
        Self { records }
    }

    pub fn insert(&mut self, tenant: impl Into<String>, record: CredentialRecord) {
        self.records.insert(tenant.into(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn lookup_credential(&self, tenant: &TenantId) -> Result<Option<CredentialRecord>> {
        Ok(self.records.get(tenant.as_str()).cloned())
    }
}
