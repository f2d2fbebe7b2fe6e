//! Refcounted engine instances and per-connection handles

use dashmap::DashMap;
use std::sync::Arc;

use super::{EngineBackend, EngineSession, EngineStream};
use crate::cache::{CacheLease, KeyedLocks};
use crate::config::EngineConfig;
use crate::error::{GatewayError, Result};
use crate::tls::TenantId;

/// Roles and database used for engine sessions.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub database: String,
    pub privileged_role: String,
    pub restricted_role: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            database: config.database.clone(),
            privileged_role: config.privileged_role.clone(),
            restricted_role: config.restricted_role.clone(),
        }
    }
}

/// Binds connections to per-tenant engine instances.
pub struct EnginePool {
    backend: Arc<dyn EngineBackend>,
    settings: EngineSettings,
    /// Live handles per running instance
    instances: DashMap<String, usize>,
    /// Cache generation each tenant was last bootstrapped for
    bootstrapped: DashMap<String, u64>,
    locks: KeyedLocks,
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("settings", &self.settings)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl EnginePool {
    pub fn new(backend: Arc<dyn EngineBackend>, settings: EngineSettings) -> Arc<Self> {
        Arc::new(Self {
            backend,
            settings,
            instances: DashMap::new(),
            bootstrapped: DashMap::new(),
            locks: KeyedLocks::new(),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Number of running instances.
    pub fn running(&self) -> usize {
        self.instances.len()
    }

    /// Live handles on `tenant`'s instance.
    pub fn handles(&self, tenant: &TenantId) -> usize {
        self.instances.get(tenant.as_str()).map(|r| *r).unwrap_or(0)
    }

    /// Give the connection holding `lease` its own restricted session.
    ///
    /// Starts the tenant's instance if needed and makes sure the restricted
    /// role exists before any client traffic flows.
    pub async fn bind(self: &Arc<Self>, lease: &CacheLease) -> Result<EngineHandle> {
        let tenant = lease.tenant();
        self.acquire_instance(lease).await?;

        let session = async {
            self.bootstrap_once(tenant, lease.generation()).await?;
            self.open_restricted(tenant).await
        }
        .await;

        match session {
            Ok(session) => Ok(EngineHandle {
                pool: Arc::clone(self),
                tenant: tenant.clone(),
                session: Some(session),
                released: false,
            }),
            Err(e) => {
                self.release(tenant).await;
                Err(e)
            }
        }
    }

    async fn acquire_instance(&self, lease: &CacheLease) -> Result<()> {
        let tenant = lease.tenant();
        let _guard = self.locks.lock(tenant.as_str()).await;

        if let Some(mut refs) = self.instances.get_mut(tenant.as_str()) {
            *refs += 1;
            return Ok(());
        }

        info!("Starting engine for {}", tenant);
        self.backend.start(tenant, lease.path()).await?;
        self.instances.insert(tenant.as_str().to_string(), 1);
        Ok(())
    }

    /// Drop one reference; stop the instance when none remain.
    async fn release(&self, tenant: &TenantId) {
        let _guard = self.locks.lock(tenant.as_str()).await;

        let remaining = match self.instances.get_mut(tenant.as_str()) {
            Some(mut refs) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            None => return,
        };

        if remaining == 0 {
            self.instances.remove(tenant.as_str());
            info!("Stopping engine for {}", tenant);
            if let Err(e) = self.backend.stop(tenant).await {
                warn!("Failed to stop engine for {}: {}", tenant, e);
            }
        }
    }

    /// Stop every running instance, live handles or not.
    ///
    /// Handles released afterwards find no instance and do nothing.
    pub async fn shutdown(&self) {
        let tenants: Vec<String> = self.instances.iter().map(|r| r.key().clone()).collect();
        for tenant in tenants {
            let _guard = self.locks.lock(&tenant).await;
            if let Some((_, refs)) = self.instances.remove(&tenant) {
                let tenant = TenantId::new(tenant);
                info!("Stopping engine for {} ({} handles open)", tenant, refs);
                if let Err(e) = self.backend.stop(&tenant).await {
                    warn!("Failed to stop engine for {}: {}", tenant, e);
                }
            }
        }
    }

    /// Create the restricted role once per materialized generation.
    pub async fn bootstrap_once(&self, tenant: &TenantId, generation: u64) -> Result<()> {
        if self.is_bootstrapped(tenant, generation) {
            return Ok(());
        }

        let _guard = self.locks.lock(tenant.as_str()).await;
        if self.is_bootstrapped(tenant, generation) {
            return Ok(());
        }

        let stream = self.backend.connect(tenant).await?;
        let mut session =
            EngineSession::open(stream, &self.settings.privileged_role, &self.settings.database)
                .await?;

        let role = &self.settings.restricted_role;
        let existing = session
            .simple_query(&format!(
                "SELECT 1 FROM pg_roles WHERE rolname = '{}'",
                role
            ))
            .await?;
        if existing.rows.is_empty() {
            info!("Creating role {} for {}", role, tenant);
            session
                .simple_query(&format!(
                    "CREATE USER {}; GRANT pg_read_all_data TO {};",
                    role, role
                ))
                .await?;
        }
        if let Err(e) = session.close().await {
            debug!("Bootstrap session close for {}: {}", tenant, e);
        }

        self.bootstrapped
            .insert(tenant.as_str().to_string(), generation);
        Ok(())
    }

    fn is_bootstrapped(&self, tenant: &TenantId, generation: u64) -> bool {
        self.bootstrapped
            .get(tenant.as_str())
            .map(|g| *g == generation)
            .unwrap_or(false)
    }

    /// Open a client-facing session as the restricted role.
    pub async fn open_restricted(&self, tenant: &TenantId) -> Result<EngineSession> {
        let stream = self.backend.connect(tenant).await?;
        EngineSession::open(stream, &self.settings.restricted_role, &self.settings.database).await
    }
}

/// One connection's engine session.
///
/// Keeps the tenant's instance running until closed.
pub struct EngineHandle {
    pool: Arc<EnginePool>,
    tenant: TenantId,
    session: Option<EngineSession>,
    released: bool,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("tenant", &self.tenant)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl EngineHandle {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The session, while the handle is open.
    pub fn session(&self) -> Result<&EngineSession> {
        self.session
            .as_ref()
            .ok_or_else(|| GatewayError::Engine("engine handle already closed".into()))
    }

    /// The session's stream, for relaying.
    pub fn stream_mut(&mut self) -> Result<&mut EngineStream> {
        self.session
            .as_mut()
            .map(EngineSession::stream_mut)
            .ok_or_else(|| GatewayError::Engine("engine handle already closed".into()))
    }

    /// Terminate the session and release the instance reference.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!("Engine session close for {}: {}", self.tenant, e);
            }
        }
        self.pool.release(&self.tenant).await;
        self.released = true;
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        drop(self.session.take());
        let pool = Arc::clone(&self.pool);
        let tenant = self.tenant.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { pool.release(&tenant).await });
            }
            Err(_) => warn!("Engine handle for {} dropped outside a runtime", tenant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FsArchiveStore;
    use crate::cache::{CacheLimits, CacheManager};
    use crate::protocol::postgres::{
        build_authentication, build_command_complete, build_data_row, build_parameter_status,
        build_ready_for_query, build_row_description, encode_message, parse_query, read_message,
        read_startup_message, AuthenticationMessage, DataRow, FieldDescription, RowDescription,
        StartupPacket, TransactionStatus, MSG_AUTH_REQUEST, MSG_COMMAND_COMPLETE, MSG_DATA_ROW,
        MSG_PARAMETER_STATUS, MSG_QUERY, MSG_READY_FOR_QUERY, MSG_ROW_DESCRIPTION,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct FakeState {
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail_start: bool,
        roles: Mutex<HashSet<String>>,
        queries: Mutex<Vec<String>>,
    }

    impl FakeState {
        fn count(&self, prefix: &str) -> usize {
            self.queries
                .lock()
                .unwrap()
                .iter()
                .filter(|q| q.starts_with(prefix))
                .count()
        }
    }

    struct FakeBackend(Arc<FakeState>);

    #[async_trait]
    impl EngineBackend for FakeBackend {
        async fn start(&self, _tenant: &TenantId, _data_dir: &Path) -> Result<()> {
            if self.0.fail_start {
                return Err(GatewayError::Engine("no postgres binary".into()));
            }
            self.0.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect(&self, _tenant: &TenantId) -> Result<EngineStream> {
            let (client, engine) = duplex(16 * 1024);
            tokio::spawn(serve(engine, Arc::clone(&self.0)));
            Ok(Box::new(client))
        }

        async fn stop(&self, _tenant: &TenantId) -> Result<()> {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn send(stream: &mut DuplexStream, msg_type: u8, payload: Vec<u8>) {
        let _ = stream.write_all(&encode_message(msg_type, &payload)).await;
    }

    async fn serve(mut stream: DuplexStream, state: Arc<FakeState>) {
        if !matches!(read_startup_message(&mut stream).await, Ok(StartupPacket::Startup(_))) {
            return;
        }
        send(&mut stream, MSG_AUTH_REQUEST, build_authentication(&AuthenticationMessage::Ok)).await;
        send(
            &mut stream,
            MSG_PARAMETER_STATUS,
            build_parameter_status("server_version", "16.4"),
        )
        .await;
        send(
            &mut stream,
            MSG_READY_FOR_QUERY,
            build_ready_for_query(TransactionStatus::Idle),
        )
        .await;

        while let Ok((msg_type, payload)) = read_message(&mut stream).await {
            if msg_type != MSG_QUERY {
                break;
            }
            let sql = parse_query(&payload).unwrap_or_default();
            state.queries.lock().unwrap().push(sql.clone());

            if sql.starts_with("SELECT 1 FROM pg_roles") {
                send(
                    &mut stream,
                    MSG_ROW_DESCRIPTION,
                    build_row_description(&RowDescription {
                        fields: vec![FieldDescription::text("?column?")],
                    }),
                )
                .await;
                let exists = state
                    .roles
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|r| sql.contains(&format!("'{}'", r)));
                if exists {
                    send(
                        &mut stream,
                        MSG_DATA_ROW,
                        build_data_row(&DataRow {
                            values: vec![Some(b"1".to_vec())],
                        }),
                    )
                    .await;
                }
                let tag = if exists { "SELECT 1" } else { "SELECT 0" };
                send(&mut stream, MSG_COMMAND_COMPLETE, build_command_complete(tag)).await;
            } else if let Some(rest) = sql.strip_prefix("CREATE USER ") {
                let role = rest.split(';').next().unwrap_or_default().trim().to_string();
                state.roles.lock().unwrap().insert(role);
                send(
                    &mut stream,
                    MSG_COMMAND_COMPLETE,
                    build_command_complete("CREATE ROLE"),
                )
                .await;
                send(&mut stream, MSG_COMMAND_COMPLETE, build_command_complete("GRANT ROLE")).await;
            }
            send(
                &mut stream,
                MSG_READY_FOR_QUERY,
                build_ready_for_query(TransactionStatus::Idle),
            )
            .await;
        }
    }

    struct Fixture {
        _cache: tempfile::TempDir,
        manager: Arc<CacheManager>,
        state: Arc<FakeState>,
        pool: Arc<EnginePool>,
    }

    async fn fixture(state: FakeState) -> Fixture {
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir(cache.path().join("t1")).unwrap();
        let manager = CacheManager::open_with_limits(
            cache.path(),
            Arc::new(FsArchiveStore::new(cache.path().join("archives"))),
            CacheLimits::default(),
        )
        .await
        .unwrap();
        let state = Arc::new(state);
        let pool = EnginePool::new(
            Arc::new(FakeBackend(Arc::clone(&state))),
            EngineSettings::default(),
        );
        Fixture {
            _cache: cache,
            manager,
            state,
            pool,
        }
    }

    #[tokio::test]
    async fn test_bind_shares_instance_and_bootstraps_once() {
        let fx = fixture(FakeState::default()).await;
        let tenant = TenantId::new("t1");
        let lease = fx.manager.ensure_materialized(&tenant).await.unwrap();

        let first = fx.pool.bind(&lease).await.unwrap();
        let second = fx.pool.bind(&lease).await.unwrap();

        assert_eq!(fx.state.started.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pool.handles(&tenant), 2);
        assert_eq!(fx.state.count("SELECT 1 FROM pg_roles"), 1);
        assert_eq!(fx.state.count("CREATE USER readonly_postgres"), 1);
        assert_eq!(first.session().unwrap().role(), "readonly_postgres");

        first.close().await;
        assert_eq!(fx.state.stopped.load(Ordering::SeqCst), 0);
        second.close().await;
        assert_eq!(fx.state.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(fx.pool.running(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_reruns_for_new_generation_only() {
        let fx = fixture(FakeState::default()).await;
        let tenant = TenantId::new("t1");

        fx.pool.bootstrap_once(&tenant, 1).await.unwrap();
        fx.pool.bootstrap_once(&tenant, 1).await.unwrap();
        assert_eq!(fx.state.count("SELECT 1 FROM pg_roles"), 1);

        fx.pool.bootstrap_once(&tenant, 2).await.unwrap();
        assert_eq!(fx.state.count("SELECT 1 FROM pg_roles"), 2);
        // The role already exists in the second generation.
        assert_eq!(fx.state.count("CREATE USER"), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_released() {
        let fx = fixture(FakeState::default()).await;
        let lease = fx
            .manager
            .ensure_materialized(&TenantId::new("t1"))
            .await
            .unwrap();

        drop(fx.pool.bind(&lease).await.unwrap());

        for _ in 0..100 {
            if fx.state.stopped.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.pool.running(), 0);
        assert_eq!(fx.state.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_instances_with_open_handles() {
        let fx = fixture(FakeState::default()).await;
        let lease = fx
            .manager
            .ensure_materialized(&TenantId::new("t1"))
            .await
            .unwrap();
        let handle = fx.pool.bind(&lease).await.unwrap();

        fx.pool.shutdown().await;
        assert_eq!(fx.pool.running(), 0);
        assert_eq!(fx.state.stopped.load(Ordering::SeqCst), 1);

        handle.close().await;
        assert_eq!(fx.state.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_instance() {
        let fx = fixture(FakeState {
            fail_start: true,
            ..FakeState::default()
        })
        .await;
        let lease = fx
            .manager
            .ensure_materialized(&TenantId::new("t1"))
            .await
            .unwrap();

        let err = fx.pool.bind(&lease).await.unwrap_err();
        assert!(matches!(err, GatewayError::Engine(_)));
        assert_eq!(fx.pool.running(), 0);
    }
}
