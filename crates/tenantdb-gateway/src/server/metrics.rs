//! Gateway metrics.
//!
//! Atomic counters recorded along the connection path, readable as a
//! point-in-time [`MetricsSnapshot`] or in Prometheus exposition format.
//!
//! # Metric Categories
//!
//! ## Connection Metrics
//! - `connections_accepted`, `connections_active`, `connections_rejected_limit`
//!
//! ## Handshake Metrics
//! - `tls_handshakes`: Completed TLS handshakes
//! - `sni_rejections`: Missing or foreign server names
//! - `plaintext_rejections`: Startup packets sent without TLS
//!
//! ## Authentication Metrics
//! - `auth_successes`, `auth_failures`
//! - `lookup_failures`: Directory errors, unknown tenants, unsupported methods
//! - `preauth_frames_dropped`: Frames discarded before authentication
//!
//! ## Provisioning Metrics
//! - `provisioning_failures`: Materialization or engine bind failures
//! - `engine_binds`: Engine sessions handed to clients
//!
//! ## Relay Metrics
//! - `frames_to_engine`, `frames_to_client`, `engine_errors_relayed`
//!
//! ## Cache Metrics
//! - Folded in from [`CacheStats`] with [`MetricsSnapshot::with_cache`]:
//!   hits, materializations, materialization failures, evictions
//!
//! ## Session Metrics
//! - `sessions_ended_normal`, `sessions_ended_idle_timeout`,
//!   `sessions_ended_shutdown`, `sessions_ended_error`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::relay::DisconnectReason;
use crate::cache::CacheStats;

/// Atomic ordering used for metrics (Relaxed is sufficient for counters).
const METRIC_ORDERING: Ordering = Ordering::Relaxed;

/// Centralized metrics collection for the gateway.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Total connections accepted since startup
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections rejected due to max connections limit
    pub connections_rejected_limit: AtomicU64,

    /// Completed TLS handshakes
    pub tls_handshakes: AtomicU64,
    /// Handshakes rejected for their server name
    pub sni_rejections: AtomicU64,
    /// Startup packets received without TLS
    pub plaintext_rejections: AtomicU64,

    /// Successful SCRAM exchanges
    pub auth_successes: AtomicU64,
    /// Failed SCRAM exchanges
    pub auth_failures: AtomicU64,
    /// Credential lookups that ended the connection
    pub lookup_failures: AtomicU64,
    /// Non-password frames discarded during authentication
    pub preauth_frames_dropped: AtomicU64,

    /// Materialization or engine bind failures
    pub provisioning_failures: AtomicU64,
    /// Engine sessions handed to clients
    pub engine_binds: AtomicU64,

    /// Frames relayed client -> engine
    pub frames_to_engine: AtomicU64,
    /// Frames relayed engine -> client
    pub frames_to_client: AtomicU64,
    /// ErrorResponse frames relayed from engines
    pub engine_errors_relayed: AtomicU64,

    /// Sessions ended by either side closing
    pub sessions_ended_normal: AtomicU64,
    /// Sessions ended by the idle timeout
    pub sessions_ended_idle_timeout: AtomicU64,
    /// Sessions ended by gateway shutdown
    pub sessions_ended_shutdown: AtomicU64,
    /// Sessions ended by an I/O or protocol error
    pub sessions_ended_error: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, METRIC_ORDERING);
        self.connections_active.fetch_add(1, METRIC_ORDERING);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, METRIC_ORDERING);
    }

    pub fn connection_rejected_limit(&self) {
        self.connections_rejected_limit.fetch_add(1, METRIC_ORDERING);
    }

    pub fn tls_handshake(&self) {
        self.tls_handshakes.fetch_add(1, METRIC_ORDERING);
    }

    pub fn sni_rejected(&self) {
        self.sni_rejections.fetch_add(1, METRIC_ORDERING);
    }

    pub fn plaintext_rejected(&self) {
        self.plaintext_rejections.fetch_add(1, METRIC_ORDERING);
    }

    pub fn auth_success(&self) {
        self.auth_successes.fetch_add(1, METRIC_ORDERING);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, METRIC_ORDERING);
    }

    pub fn lookup_failed(&self) {
        self.lookup_failures.fetch_add(1, METRIC_ORDERING);
    }

    pub fn preauth_frame_dropped(&self) {
        self.preauth_frames_dropped.fetch_add(1, METRIC_ORDERING);
    }

    pub fn provisioning_failed(&self) {
        self.provisioning_failures.fetch_add(1, METRIC_ORDERING);
    }

    pub fn engine_bound(&self) {
        self.engine_binds.fetch_add(1, METRIC_ORDERING);
    }

    pub fn frame_to_engine(&self) {
        self.frames_to_engine.fetch_add(1, METRIC_ORDERING);
    }

    pub fn frame_to_client(&self) {
        self.frames_to_client.fetch_add(1, METRIC_ORDERING);
    }

    pub fn engine_error_relayed(&self) {
        self.engine_errors_relayed.fetch_add(1, METRIC_ORDERING);
    }

    /// Record how a relayed session ended.
    pub fn session_ended(&self, reason: &DisconnectReason) {
        let counter = match reason {
            DisconnectReason::ClientTerminate
            | DisconnectReason::ClientDisconnect
            | DisconnectReason::EngineDisconnect => &self.sessions_ended_normal,
            DisconnectReason::IdleTimeout { .. } => &self.sessions_ended_idle_timeout,
            DisconnectReason::Shutdown => &self.sessions_ended_shutdown,
            DisconnectReason::Error(_) => &self.sessions_ended_error,
        };
        counter.fetch_add(1, METRIC_ORDERING);
    }

    /// Get a snapshot of all current metric values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(METRIC_ORDERING),
            connections_active: self.connections_active.load(METRIC_ORDERING),
            connections_rejected_limit: self.connections_rejected_limit.load(METRIC_ORDERING),
            tls_handshakes: self.tls_handshakes.load(METRIC_ORDERING),
            sni_rejections: self.sni_rejections.load(METRIC_ORDERING),
            plaintext_rejections: self.plaintext_rejections.load(METRIC_ORDERING),
            auth_successes: self.auth_successes.load(METRIC_ORDERING),
            auth_failures: self.auth_failures.load(METRIC_ORDERING),
            lookup_failures: self.lookup_failures.load(METRIC_ORDERING),
            preauth_frames_dropped: self.preauth_frames_dropped.load(METRIC_ORDERING),
            provisioning_failures: self.provisioning_failures.load(METRIC_ORDERING),
            engine_binds: self.engine_binds.load(METRIC_ORDERING),
            frames_to_engine: self.frames_to_engine.load(METRIC_ORDERING),
            frames_to_client: self.frames_to_client.load(METRIC_ORDERING),
            engine_errors_relayed: self.engine_errors_relayed.load(METRIC_ORDERING),
            sessions_ended_normal: self.sessions_ended_normal.load(METRIC_ORDERING),
            sessions_ended_idle_timeout: self.sessions_ended_idle_timeout.load(METRIC_ORDERING),
            sessions_ended_shutdown: self.sessions_ended_shutdown.load(METRIC_ORDERING),
            sessions_ended_error: self.sessions_ended_error.load(METRIC_ORDERING),
            ..MetricsSnapshot::default()
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        self.snapshot().to_prometheus()
    }
}

/// Point-in-time copy of [`GatewayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected_limit: u64,

    pub tls_handshakes: u64,
    pub sni_rejections: u64,
    pub plaintext_rejections: u64,

    pub auth_successes: u64,
    pub auth_failures: u64,
    pub lookup_failures: u64,
    pub preauth_frames_dropped: u64,

    pub provisioning_failures: u64,
    pub engine_binds: u64,

    pub frames_to_engine: u64,
    pub frames_to_client: u64,
    pub engine_errors_relayed: u64,

    pub sessions_ended_normal: u64,
    pub sessions_ended_idle_timeout: u64,
    pub sessions_ended_shutdown: u64,
    pub sessions_ended_error: u64,

    pub cache_hits: u64,
    pub cache_materializations: u64,
    pub cache_failures: u64,
    pub cache_evictions: u64,
}

impl MetricsSnapshot {
    /// Fold the cache manager's counters into this snapshot.
    pub fn with_cache(mut self, stats: &CacheStats) -> Self {
        self.cache_hits = stats.hits.load(METRIC_ORDERING);
        self.cache_materializations = stats.materializations.load(METRIC_ORDERING);
        self.cache_failures = stats.failures.load(METRIC_ORDERING);
        self.cache_evictions = stats.evictions.load(METRIC_ORDERING);
        self
    }

    /// Format metrics in Prometheus exposition format.
    ///
    /// ```text
    /// # HELP tenantdb_gateway_connections_accepted_total Total connections accepted
    /// # TYPE tenantdb_gateway_connections_accepted_total counter
    /// tenantdb_gateway_connections_accepted_total 1234
    /// ```
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        let mut metric = |name: &str, kind: &str, help: &str, samples: &[(&str, u64)]| {
            out.push_str(&format!("# HELP tenantdb_gateway_{} {}\n", name, help));
            out.push_str(&format!("# TYPE tenantdb_gateway_{} {}\n", name, kind));
            for (labels, value) in samples {
                out.push_str(&format!("tenantdb_gateway_{}{} {}\n", name, labels, value));
            }
        };

        metric(
            "connections_accepted_total",
            "counter",
            "Total connections accepted",
            &[("", self.connections_accepted)],
        );
        metric(
            "connections_active",
            "gauge",
            "Current active connections",
            &[("", self.connections_active)],
        );
        metric(
            "connections_rejected_total",
            "counter",
            "Connections rejected due to limit",
            &[("", self.connections_rejected_limit)],
        );
        metric(
            "handshake_rejections_total",
            "counter",
            "Handshakes rejected before authentication",
            &[
                ("{reason=\"sni\"}", self.sni_rejections),
                ("{reason=\"plaintext\"}", self.plaintext_rejections),
            ],
        );
        metric(
            "auth_total",
            "counter",
            "SCRAM authentication attempts by result",
            &[
                ("{result=\"success\"}", self.auth_successes),
                ("{result=\"failure\"}", self.auth_failures),
                ("{result=\"lookup_failed\"}", self.lookup_failures),
            ],
        );
        metric(
            "preauth_frames_dropped_total",
            "counter",
            "Frames discarded before authentication",
            &[("", self.preauth_frames_dropped)],
        );
        metric(
            "provisioning_failures_total",
            "counter",
            "Materialization or engine bind failures",
            &[("", self.provisioning_failures)],
        );
        metric(
            "engine_binds_total",
            "counter",
            "Engine sessions handed to clients",
            &[("", self.engine_binds)],
        );
        metric(
            "frames_relayed_total",
            "counter",
            "Protocol frames relayed by direction",
            &[
                ("{direction=\"to_engine\"}", self.frames_to_engine),
                ("{direction=\"to_client\"}", self.frames_to_client),
            ],
        );
        metric(
            "engine_errors_relayed_total",
            "counter",
            "ErrorResponse frames relayed from engines",
            &[("", self.engine_errors_relayed)],
        );
        metric(
            "cache_total",
            "counter",
            "Cache activity by outcome",
            &[
                ("{outcome=\"hit\"}", self.cache_hits),
                ("{outcome=\"materialized\"}", self.cache_materializations),
                ("{outcome=\"failed\"}", self.cache_failures),
                ("{outcome=\"evicted\"}", self.cache_evictions),
            ],
        );
        metric(
            "sessions_ended_total",
            "counter",
            "Relayed sessions by end reason",
            &[
                ("{reason=\"normal\"}", self.sessions_ended_normal),
                ("{reason=\"idle_timeout\"}", self.sessions_ended_idle_timeout),
                ("{reason=\"shutdown\"}", self.sessions_ended_shutdown),
                ("{reason=\"error\"}", self.sessions_ended_error),
            ],
        );

        out
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Gateway Metrics ===")?;
        writeln!(f)?;
        writeln!(f, "Connections:")?;
        writeln!(f, "  Accepted:  {}", self.connections_accepted)?;
        writeln!(f, "  Active:    {}", self.connections_active)?;
        writeln!(f, "  Rejected:  {}", self.connections_rejected_limit)?;
        writeln!(f)?;
        writeln!(f, "Handshake:")?;
        writeln!(f, "  TLS:        {}", self.tls_handshakes)?;
        writeln!(f, "  Bad SNI:    {}", self.sni_rejections)?;
        writeln!(f, "  Plaintext:  {}", self.plaintext_rejections)?;
        writeln!(f)?;
        writeln!(f, "Authentication:")?;
        writeln!(f, "  Successes: {}", self.auth_successes)?;
        writeln!(f, "  Failures:  {}", self.auth_failures)?;
        writeln!(f, "  Lookups:   {}", self.lookup_failures)?;
        writeln!(f, "  Dropped:   {}", self.preauth_frames_dropped)?;
        writeln!(f)?;
        writeln!(f, "Provisioning:")?;
        writeln!(f, "  Binds:     {}", self.engine_binds)?;
        writeln!(f, "  Failures:  {}", self.provisioning_failures)?;
        writeln!(f)?;
        writeln!(f, "Relay:")?;
        writeln!(f, "  To engine:     {}", self.frames_to_engine)?;
        writeln!(f, "  To client:     {}", self.frames_to_client)?;
        writeln!(f, "  Engine errors: {}", self.engine_errors_relayed)?;
        writeln!(f)?;
        writeln!(f, "Cache:")?;
        writeln!(f, "  Hits:         {}", self.cache_hits)?;
        writeln!(f, "  Materialized: {}", self.cache_materializations)?;
        writeln!(f, "  Failed:       {}", self.cache_failures)?;
        writeln!(f, "  Evicted:      {}", self.cache_evictions)?;
        writeln!(f)?;
        writeln!(f, "Sessions Ended:")?;
        writeln!(f, "  Normal:       {}", self.sessions_ended_normal)?;
        writeln!(f, "  Idle Timeout: {}", self.sessions_ended_idle_timeout)?;
        writeln!(f, "  Shutdown:     {}", self.sessions_ended_shutdown)?;
        writeln!(f, "  Error:        {}", self.sessions_ended_error)?;
        Ok(())
    }
}
