//! Engine backend running one `postgres` server process per tenant
//!
//! Each instance listens only on a private unix socket directory
//! (`<socket_dir>/<tenant>/.s.PGSQL.5432`); TCP is disabled.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use super::{EngineBackend, EngineStream};
use crate::config::EngineConfig;
use crate::error::{GatewayError, Result};
use crate::tls::TenantId;

const SOCKET_NAME: &str = ".s.PGSQL.5432";
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningEngine {
    child: Child,
    data_dir: PathBuf,
    socket_dir: PathBuf,
}

/// Spawns `postgres` with `tokio::process`.
pub struct PostgresProcessBackend {
    config: EngineConfig,
    running: DashMap<String, RunningEngine>,
}

impl std::fmt::Debug for PostgresProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProcessBackend")
            .field("postgres_bin", &self.config.postgres_bin)
            .field("running", &self.running.len())
            .finish()
    }
}

impl PostgresProcessBackend {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            running: DashMap::new(),
        }
    }

    /// Private socket directory for `tenant`.
    pub fn socket_dir(&self, tenant: &TenantId) -> PathBuf {
        self.config.socket_dir.join(tenant.as_str())
    }

    fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.config.startup_timeout_secs)
    }

    /// Wait until the server accepts connections on its socket.
    async fn wait_ready(
        &self,
        child: &mut Child,
        socket: &Path,
        tenant: &TenantId,
    ) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout();
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(GatewayError::Engine(format!(
                    "postgres for {} exited during startup ({})",
                    tenant, status
                )));
            }
            if UnixStream::connect(socket).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::Timeout(format!(
                    "postgres for {} did not start within {:?}",
                    tenant,
                    self.startup_timeout()
                )));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn shutdown(&self, tenant: &TenantId, mut engine: RunningEngine) -> Result<()> {
        let output = Command::new(&self.config.pg_ctl_bin)
            .arg("-D")
            .arg(&engine.data_dir)
            .args(["-m", "fast", "-w", "stop"])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    "pg_ctl stop for {} failed: {}",
                    tenant,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                engine.child.start_kill()?;
            }
            Err(e) => {
                warn!("Could not run pg_ctl for {}: {}", tenant, e);
                engine.child.start_kill()?;
            }
        }

        match tokio::time::timeout(STOP_TIMEOUT, engine.child.wait()).await {
            Ok(status) => debug!("postgres for {} exited ({})", tenant, status?),
            Err(_) => {
                warn!("postgres for {} ignored shutdown, killing", tenant);
                engine.child.kill().await?;
            }
        }

        let _ = tokio::fs::remove_dir_all(&engine.socket_dir).await;
        Ok(())
    }
}

#[async_trait]
impl EngineBackend for PostgresProcessBackend {
    async fn start(&self, tenant: &TenantId, data_dir: &Path) -> Result<()> {
        let socket_dir = self.socket_dir(tenant);
        tokio::fs::create_dir_all(&socket_dir).await?;
        set_owner_only(&socket_dir).await?;
        // postgres refuses a data directory readable by others.
        set_owner_only(data_dir).await?;

        // Stale lock files come from archives of a running server.
        for stale in [socket_dir.join(SOCKET_NAME), data_dir.join("postmaster.pid")] {
            match tokio::fs::remove_file(&stale).await {
                Ok(()) => debug!("Removed stale {}", stale.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut child = Command::new(&self.config.postgres_bin)
            .arg("-D")
            .arg(data_dir)
            .arg("-k")
            .arg(&socket_dir)
            .args(["-c", "listen_addresses="])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::Engine(format!(
                    "failed to spawn {}: {}",
                    self.config.postgres_bin.display(),
                    e
                ))
            })?;

        if let Some(stderr) = child.stderr.take() {
            let tenant = tenant.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("postgres[{}]: {}", tenant, line);
                }
            });
        }

        let socket = socket_dir.join(SOCKET_NAME);
        if let Err(e) = self.wait_ready(&mut child, &socket, tenant).await {
            let _ = child.kill().await;
            return Err(e);
        }

        info!("postgres for {} listening in {}", tenant, socket_dir.display());
        self.running.insert(
            tenant.as_str().to_string(),
            RunningEngine {
                child,
                data_dir: data_dir.to_path_buf(),
                socket_dir,
            },
        );
        Ok(())
    }

    async fn connect(&self, tenant: &TenantId) -> Result<EngineStream> {
        let socket = self
            .running
            .get(tenant.as_str())
            .map(|e| e.socket_dir.join(SOCKET_NAME))
            .ok_or_else(|| GatewayError::Engine(format!("no engine running for {}", tenant)))?;

        let stream = UnixStream::connect(&socket).await.map_err(|e| {
            GatewayError::Engine(format!("connect to {}: {}", socket.display(), e))
        })?;
        Ok(Box::new(stream))
    }

    async fn stop(&self, tenant: &TenantId) -> Result<()> {
        match self.running.remove(tenant.as_str()) {
            Some((_, engine)) => self.shutdown(tenant, engine).await,
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
