//! Engine pool: embedded PostgreSQL instances per warm tenant
//!
//! ```text
//!   EnginePool ──start/stop──► EngineBackend (one instance per tenant)
//!       │
//!       └─ bind(lease) ──► EngineHandle ──► EngineSession (own connection)
//! ```
//!
//! An instance stays up while at least one handle is alive. Each client
//! connection gets its own session, authenticated as the restricted role.

mod pool;
mod process;
mod session;

pub use pool::{EngineHandle, EnginePool, EngineSettings};
pub use process::PostgresProcessBackend;
pub use session::{EngineSession, QueryResult};

use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::tls::TenantId;

/// Byte stream to an engine.
pub trait EngineIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> EngineIo for T {}

/// Boxed engine connection.
pub type EngineStream = Box<dyn EngineIo>;

/// Runs engine instances.
///
/// Calls for one tenant are serialized by the pool; calls for different
/// tenants may run concurrently.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// Start an instance serving `data_dir`.
    async fn start(&self, tenant: &TenantId, data_dir: &Path) -> Result<()>;

    /// Open a new connection to the running instance.
    async fn connect(&self, tenant: &TenantId) -> Result<EngineStream>;

    /// Stop the instance.
    async fn stop(&self, tenant: &TenantId) -> Result<()>;
}
