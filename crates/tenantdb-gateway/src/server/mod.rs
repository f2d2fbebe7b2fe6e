//! Connection gateway
//!
//! The [`Listener`] accepts TCP connections and runs each one as a
//! [`Connection`] state machine on its own task. After authentication the
//! connection hands off to [`relay`] until either side ends the session.

mod connection;
mod listener;
mod metrics;
mod relay;

use std::sync::Arc;

pub use connection::{Connection, ConnectionState, GatewayContext};
pub use listener::Listener;
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use relay::{relay, DisconnectReason};

use crate::archive::{ArchiveStore, FsArchiveStore};
use crate::config::Config;
use crate::directory::{self, TenantDirectory};
use crate::engine::{EngineBackend, PostgresProcessBackend};
use crate::error::Result;

/// External collaborators of the gateway.
#[derive(Clone)]
pub struct GatewayServices {
    pub directory: Arc<dyn TenantDirectory>,
    pub archives: Arc<dyn ArchiveStore>,
    pub engine: Arc<dyn EngineBackend>,
}

impl GatewayServices {
    /// Build the production services described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            directory: directory::from_config(&config.directory)?,
            archives: Arc::new(FsArchiveStore::new(config.archive.root.clone())),
            engine: Arc::new(PostgresProcessBackend::new(config.engine.clone())),
        })
    }
}
