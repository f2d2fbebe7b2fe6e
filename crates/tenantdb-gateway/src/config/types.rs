//! Configuration types

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::directory::CredentialRecord;
use crate::tls::TlsServerConfig;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// TLS material and serving domain
    pub tls: TlsServerConfig,

    /// Where tenant credentials come from
    pub directory: DirectoryConfig,

    /// Where tenant archives live
    pub archive: ArchiveConfig,

    /// Local working copies of tenant data
    #[serde(default)]
    pub cache: CacheConfig,

    /// Engine processes
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.tls.validate()?;
        self.directory.validate()?;

        if self.server.handshake_timeout_secs == 0 {
            return Err("server.handshake_timeout_secs must be greater than 0".to_string());
        }
        if self.archive.root.as_os_str().is_empty() {
            return Err("archive.root is required".to_string());
        }
        if self.cache.root.as_os_str().is_empty() {
            return Err("cache.root is required".to_string());
        }
        if self.cache.max_size_mb == 0 && self.cache.idle_ttl_secs == 0 {
            return Err(
                "cache needs a bound: set cache.max_size_mb or cache.idle_ttl_secs".to_string(),
            );
        }
        if self.cache.reclaim_interval_secs == 0 {
            return Err("cache.reclaim_interval_secs must be greater than 0".to_string());
        }

        validate_role("engine.privileged_role", &self.engine.privileged_role)?;
        validate_role("engine.restricted_role", &self.engine.restricted_role)?;
        if self.engine.privileged_role == self.engine.restricted_role {
            return Err(
                "engine.restricted_role must differ from engine.privileged_role".to_string(),
            );
        }

        Ok(())
    }
}

/// Role names are spliced into bootstrap SQL, so only plain lowercase
/// identifiers are accepted.
fn validate_role(field: &str, role: &str) -> Result<(), String> {
    let mut chars = role.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && role.len() <= 63 {
        Ok(())
    } else {
        Err(format!(
            "{} '{}' must be a lowercase SQL identifier",
            field, role
        ))
    }
}

/// Server listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port to listen on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Bound on each pre-authentication read (startup, TLS, SASL) in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Idle timeout for established sessions in seconds (0 = unbounded)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Maximum number of concurrent connections (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long shutdown waits for open connections before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: 0,
            max_connections: default_max_connections(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    /// Handshake timeout as a Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Idle timeout, `None` when unbounded
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Tenant directory backend
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DirectoryConfig {
    /// PostgREST-style HTTP endpoint (e.g. Supabase)
    Rest(RestDirectoryConfig),
    /// Records listed inline in the config file
    Static(StaticDirectoryConfig),
}

impl DirectoryConfig {
    /// Validate the directory configuration
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DirectoryConfig::Rest(rest) => {
                if !(rest.url.starts_with("http://") || rest.url.starts_with("https://")) {
                    return Err(format!(
                        "directory.url '{}' must be an http(s) URL",
                        rest.url
                    ));
                }
                if rest.service_key.is_empty() || rest.service_key.starts_with('$') {
                    return Err("directory.service_key is required".to_string());
                }
                if rest.table.is_empty() {
                    return Err("directory.table must not be empty".to_string());
                }
                Ok(())
            }
            DirectoryConfig::Static(_) => Ok(()),
        }
    }
}

/// REST directory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RestDirectoryConfig {
    /// Base URL of the metadata service
    pub url: String,
    /// Service key sent as `apikey` and bearer token
    pub service_key: String,
    /// Table holding `database_id`, `auth_method`, `auth_data`
    #[serde(default = "default_directory_table")]
    pub table: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_directory_timeout")]
    pub timeout_secs: u64,
}

/// Static directory configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StaticDirectoryConfig {
    /// Credential records keyed by tenant id
    #[serde(default)]
    pub tenants: HashMap<String, CredentialRecord>,
}

/// Archive store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding `<tenant>.tar.gz` archives
    pub root: PathBuf,
}

/// Local cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one working copy per tenant
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    /// Disk budget in megabytes (0 = unbounded, requires `idle_ttl_secs`)
    #[serde(default = "default_cache_max_size_mb")]
    pub max_size_mb: u64,
    /// Evict unpinned tenants unused for this long (0 = never)
    #[serde(default)]
    pub idle_ttl_secs: u64,
    /// Period of the background reclaimer
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
    /// Bound on one materialization in seconds (0 = unbounded)
    #[serde(default)]
    pub materialize_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_size_mb: default_cache_max_size_mb(),
            idle_ttl_secs: 0,
            reclaim_interval_secs: default_reclaim_interval(),
            materialize_timeout_secs: 0,
        }
    }
}

impl CacheConfig {
    /// Disk budget in bytes, `None` when unbounded
    pub fn max_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| self.max_size_mb.saturating_mul(1024 * 1024))
    }

    /// Idle TTL, `None` when disabled
    pub fn idle_ttl(&self) -> Option<Duration> {
        (self.idle_ttl_secs > 0).then(|| Duration::from_secs(self.idle_ttl_secs))
    }

    /// Materialization bound, `None` when unbounded
    pub fn materialize_timeout(&self) -> Option<Duration> {
        (self.materialize_timeout_secs > 0)
            .then(|| Duration::from_secs(self.materialize_timeout_secs))
    }
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// `postgres` server binary
    #[serde(default = "default_postgres_bin")]
    pub postgres_bin: PathBuf,
    /// `pg_ctl` binary used for fast shutdown
    #[serde(default = "default_pg_ctl_bin")]
    pub pg_ctl_bin: PathBuf,
    /// Parent directory for per-tenant unix socket directories
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Database every session connects to
    #[serde(default = "default_database")]
    pub database: String,
    /// Role used for the one-time bootstrap
    #[serde(default = "default_privileged_role")]
    pub privileged_role: String,
    /// Role all client traffic runs as
    #[serde(default = "default_restricted_role")]
    pub restricted_role: String,
    /// How long to wait for an engine to accept connections
    #[serde(default = "default_engine_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            postgres_bin: default_postgres_bin(),
            pg_ctl_bin: default_pg_ctl_bin(),
            socket_dir: default_socket_dir(),
            database: default_database(),
            privileged_role: default_privileged_role(),
            restricted_role: default_restricted_role(),
            startup_timeout_secs: default_engine_startup_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5432
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_directory_table() -> String {
    "deployed_databases".to_string()
}

fn default_directory_timeout() -> u64 {
    10
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("/var/lib/tenantdb-gateway/cache")
}

fn default_cache_max_size_mb() -> u64 {
    10 * 1024
}

fn default_reclaim_interval() -> u64 {
    60
}

fn default_postgres_bin() -> PathBuf {
    PathBuf::from("postgres")
}

fn default_pg_ctl_bin() -> PathBuf {
    PathBuf::from("pg_ctl")
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/tenantdb-gateway")
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_privileged_role() -> String {
    "postgres".to_string()
}

fn default_restricted_role() -> String {
    "readonly_postgres".to_string()
}

fn default_engine_startup_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
