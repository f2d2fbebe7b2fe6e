//! Logging macros that set target to "tenantdb_gateway" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "tenantdb_gateway::cache::manager"), which makes `RUST_LOG`
//! filters awkward to write. These macros keep every event from this crate
//! under a single "tenantdb_gateway" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "tenantdb_gateway", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "tenantdb_gateway", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "tenantdb_gateway", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "tenantdb_gateway", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "tenantdb_gateway", $($arg)*) };
}
