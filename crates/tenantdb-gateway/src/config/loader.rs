//! Configuration loader

use super::{Config, DirectoryConfig};
use crate::error::{GatewayError, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a YAML file
///
/// Also applies TENANTDB_GATEWAY_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
///
/// Also applies TENANTDB_GATEWAY_* env var overrides after loading.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    resolve_config_env_vars(&mut config);
    apply_env_overrides(&mut config);
    config.validate().map_err(GatewayError::Config)?;
    Ok(config)
}

/// Apply TENANTDB_GATEWAY_* environment variable overrides to a config.
///
/// Supported env vars:
/// - `TENANTDB_GATEWAY_LISTEN_ADDRESS` - Override listen address
/// - `TENANTDB_GATEWAY_LISTEN_PORT` - Override listen port
/// - `TENANTDB_GATEWAY_LOG_LEVEL` - Override log level
/// - `TENANTDB_GATEWAY_HANDSHAKE_TIMEOUT_SECS` - Override handshake timeout
/// - `TENANTDB_GATEWAY_IDLE_TIMEOUT_SECS` - Override session idle timeout
/// - `TENANTDB_GATEWAY_MAX_CONNECTIONS` - Override max connections
/// - `TENANTDB_GATEWAY_WILDCARD_DOMAIN` - Override the serving domain
/// - `TENANTDB_GATEWAY_CACHE_ROOT` - Override cache directory
/// - `TENANTDB_GATEWAY_CACHE_MAX_SIZE_MB` - Override cache disk budget
/// - `TENANTDB_GATEWAY_ARCHIVE_ROOT` - Override archive directory
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_LISTEN_ADDRESS") {
        debug!("Overriding listen_address from TENANTDB_GATEWAY_LISTEN_ADDRESS");
        config.server.listen_address = val;
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_LISTEN_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            debug!("Overriding listen_port from TENANTDB_GATEWAY_LISTEN_PORT");
            config.server.listen_port = port;
        }
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_LOG_LEVEL") {
        debug!("Overriding log level from TENANTDB_GATEWAY_LOG_LEVEL");
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding handshake_timeout from TENANTDB_GATEWAY_HANDSHAKE_TIMEOUT_SECS");
            config.server.handshake_timeout_secs = secs;
        }
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_IDLE_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding idle_timeout from TENANTDB_GATEWAY_IDLE_TIMEOUT_SECS");
            config.server.idle_timeout_secs = secs;
        }
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_MAX_CONNECTIONS") {
        if let Ok(max) = val.parse::<usize>() {
            debug!("Overriding max_connections from TENANTDB_GATEWAY_MAX_CONNECTIONS");
            config.server.max_connections = max;
        }
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_WILDCARD_DOMAIN") {
        debug!("Overriding tls.wildcard_domain from TENANTDB_GATEWAY_WILDCARD_DOMAIN");
        config.tls.wildcard_domain = val;
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_CACHE_ROOT") {
        debug!("Overriding cache.root from TENANTDB_GATEWAY_CACHE_ROOT");
        config.cache.root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_CACHE_MAX_SIZE_MB") {
        if let Ok(mb) = val.parse::<u64>() {
            debug!("Overriding cache.max_size_mb from TENANTDB_GATEWAY_CACHE_MAX_SIZE_MB");
            config.cache.max_size_mb = mb;
        }
    }
    if let Ok(val) = std::env::var("TENANTDB_GATEWAY_ARCHIVE_ROOT") {
        debug!("Overriding archive.root from TENANTDB_GATEWAY_ARCHIVE_ROOT");
        config.archive.root = PathBuf::from(val);
    }
}

/// Resolve environment variables in a string value
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - curly brace syntax
/// - `$VAR_NAME` - simple syntax (whole value must be the reference)
///
/// If the environment variable is not set, the original value is preserved.
fn resolve_env_var(value: &str) -> String {
    let var_name = if let Some(inner) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        inner
    } else if let Some(inner) = value.strip_prefix('$') {
        if inner.is_empty() || inner.contains(' ') {
            return value.to_string();
        }
        inner
    } else {
        return value.to_string();
    };

    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            env_value
        }
        Err(_) => {
            debug!("Env var {} not set, keeping original value", var_name);
            value.to_string()
        }
    }
}

/// Resolve environment variables in all config fields that support it
fn resolve_config_env_vars(config: &mut Config) {
    if let DirectoryConfig::Rest(ref mut rest) = config.directory {
        rest.url = resolve_env_var(&rest.url);
        rest.service_key = resolve_env_var(&rest.service_key);
    }
}
