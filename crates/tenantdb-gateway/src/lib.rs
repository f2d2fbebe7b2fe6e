//! tenantdb-gateway - Multi-tenant PostgreSQL wire-protocol gateway
//!
//! This library provides the core functionality for a gateway that:
//! - Routes each TLS connection to a tenant database using the SNI server name
//! - Authenticates clients with SCRAM-SHA-256 against stored verifiers
//! - Materializes tenant data from compressed archives into a local cache
//! - Binds each connection to an engine session under a restricted role
//! - Relays all traffic transparently after authentication

#[macro_use]
mod logging;

pub mod archive;
pub mod cache;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tls;

pub use archive::{ArchiveStore, FsArchiveStore};
pub use cache::{CacheLease, CacheManager, CacheState};
pub use config::Config;
pub use directory::{CredentialRecord, StaticTenantDirectory, TenantDirectory};
pub use engine::{EngineBackend, EngineHandle, EnginePool, PostgresProcessBackend};
pub use error::{GatewayError, Result};
pub use server::{GatewayMetrics, GatewayServices, Listener, MetricsSnapshot};
pub use tls::{SniRejection, TenantId, TlsAcceptor, TlsError};
