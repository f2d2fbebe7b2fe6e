//! Configuration module for tenantdb-gateway
//!
//! ```yaml
//! server:
//!   listen_address: "0.0.0.0"
//!   listen_port: 5432
//!
//! tls:
//!   cert_path: "/etc/tenantdb/wildcard.crt"
//!   key_path: "/etc/tenantdb/wildcard.key"
//!   wildcard_domain: "db.example.com"
//!
//! directory:
//!   kind: rest
//!   url: "${SUPABASE_URL}"
//!   service_key: "${SUPABASE_SERVICE_ROLE_KEY}"
//!
//! archive:
//!   root: "/mnt/s3/dbs"
//!
//! cache:
//!   root: "/var/lib/tenantdb-gateway/cache"
//!   max_size_mb: 10240
//! ```

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str};
pub use types::*;
