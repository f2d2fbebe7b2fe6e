//! TCP listener for incoming client connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use super::connection::{Connection, GatewayContext};
use super::metrics::{GatewayMetrics, MetricsSnapshot};
use super::GatewayServices;
use crate::cache::{start_reclaimer, CacheManager};
use crate::config::Config;
use crate::engine::{EnginePool, EngineSettings};
use crate::error::Result;
use crate::tls::TlsAcceptor;

/// TCP listener that accepts client connections and spawns one task each
pub struct Listener {
    /// TCP listener
    listener: TcpListener,
    /// Configuration
    config: Arc<Config>,
    /// State shared with every connection
    ctx: Arc<GatewayContext>,
    /// Shutdown signal receiver
    shutdown_rx: broadcast::Receiver<()>,
    /// Connection limit semaphore (None = unlimited)
    connection_semaphore: Option<Arc<Semaphore>>,
    /// Live connection tasks, drained on shutdown
    connections: JoinSet<()>,
}

impl Listener {
    /// Bind to the configured address.
    ///
    /// Loads the TLS identity, opens the cache (purging staging leftovers)
    /// and sets up the engine pool before accepting anything.
    pub async fn bind(
        config: Arc<Config>,
        services: GatewayServices,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let acceptor = TlsAcceptor::new(&config.tls)?;
        let cache = CacheManager::open(&config.cache, services.archives).await?;
        let pool = EnginePool::new(services.engine, EngineSettings::from(&config.engine));

        let ctx = Arc::new(GatewayContext {
            acceptor,
            directory: services.directory,
            cache,
            pool,
            metrics: GatewayMetrics::shared(),
            handshake_timeout: config.server.handshake_timeout(),
            idle_timeout: config.server.idle_timeout(),
        });

        let addr = format!(
            "{}:{}",
            config.server.listen_address, config.server.listen_port
        );
        let listener = TcpListener::bind(&addr).await?;

        let connection_semaphore = if config.server.max_connections > 0 {
            info!(
                "Listening on {} for *.{} (max {} connections)",
                addr,
                ctx.acceptor.resolver().domain(),
                config.server.max_connections
            );
            Some(Arc::new(Semaphore::new(config.server.max_connections)))
        } else {
            info!(
                "Listening on {} for *.{} (unlimited connections)",
                addr,
                ctx.acceptor.resolver().domain()
            );
            None
        };

        Ok(Self {
            listener,
            config,
            ctx,
            shutdown_rx,
            connection_semaphore,
            connections: JoinSet::new(),
        })
    }

    /// Gateway metrics
    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Metrics including cache counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.ctx
            .metrics
            .snapshot()
            .with_cache(self.ctx.cache.stats())
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        Arc::clone(&self.ctx.cache)
    }

    pub fn pool(&self) -> Arc<EnginePool> {
        Arc::clone(&self.ctx.pool)
    }

    /// Get the local address the listener is bound to.
    ///
    /// This is useful when binding to port 0 to get an OS-assigned port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown is signalled.
    ///
    /// On shutdown, open connections get `server.shutdown_grace_secs` to
    /// finish (relaying sessions are told to go away), then the rest are
    /// aborted and every remaining engine instance is stopped.
    pub async fn run(mut self) -> Result<()> {
        let reclaimer =
            start_reclaimer(Arc::clone(&self.ctx.cache), self.shutdown_rx.resubscribe());
        debug!("Started cache reclaimer");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }

                Some(joined) = self.connections.join_next(), if !self.connections.is_empty() => {
                    log_task_end(joined);
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        if let Err(e) = reclaimer.await {
            warn!("Cache reclaimer ended abnormally: {}", e);
        }

        self.drain_connections().await;
        self.ctx.pool.shutdown().await;

        let snapshot = self.snapshot();
        info!(
            "Listener stopped. Total: {}, Active: {}, Rejected: {}",
            snapshot.connections_accepted,
            snapshot.connections_active,
            snapshot.connections_rejected_limit
        );
        debug!("Final metrics:\n{}", snapshot);

        Ok(())
    }

    async fn drain_connections(&mut self) {
        let grace = self.config.server.shutdown_grace();
        if !self.connections.is_empty() {
            info!(
                "Waiting up to {:?} for {} connections to close",
                grace,
                self.connections.len()
            );
        }

        let connections = &mut self.connections;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = connections.join_next().await {
                log_task_end(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Aborting {} connections still open after {:?}",
                self.connections.len(),
                grace
            );
            self.connections.shutdown().await;
        }
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let permit = match &self.connection_semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        "Connection from {} rejected: max connections ({}) reached",
                        addr, self.config.server.max_connections
                    );
                    self.ctx.metrics.connection_rejected_limit();
                    drop(stream);
                    return;
                }
            },
            None => None,
        };

        debug!("Accepted connection from {}", addr);
        self.ctx.metrics.connection_accepted();
        self.ctx.cache.nudge();

        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay for {}: {}", addr, e);
        }

        let ctx = Arc::clone(&self.ctx);
        let shutdown_rx = self.shutdown_rx.resubscribe();
        self.connections.spawn(async move {
            // Held for the connection's lifetime
            let _permit = permit;
            let metrics = Arc::clone(&ctx.metrics);

            let connection = Connection::new(stream, addr, ctx, shutdown_rx);
            if let Err(e) = connection.handle().await {
                warn!("Connection from {} error: {}", addr, e);
            }
            metrics.connection_closed();
            debug!("Connection from {} closed", addr);
        });
    }
}

fn log_task_end(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        }
    }
}
