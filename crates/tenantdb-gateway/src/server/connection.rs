//! Per-connection state machine
//!
//! ```text
//! Connecting -> TlsHandshake -> Authenticating -> Bound -> Relaying -> Closed
//!      \             \               \              \
//!       `-------------`---------------`--------------`--> Closed (FATAL notice)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{span, Instrument, Level};

use super::metrics::GatewayMetrics;
use super::relay::relay;
use crate::cache::{CacheLease, CacheManager};
use crate::directory::{resolve_verifier, TenantDirectory};
use crate::engine::{EngineHandle, EnginePool};
use crate::error::{GatewayError, Result};
use crate::protocol::postgres::{
    build_authentication, build_parameter_status, build_ready_for_query, encode_message,
    frontend_message_name, parse_parameter_status, parse_sasl_initial_response, read_message,
    read_startup_message, write_authentication, write_error, AuthenticationMessage,
    ErrorNoticeResponse, ScramServer, ScramVerifier, StartupMessage, StartupPacket,
    TransactionStatus, MSG_AUTH_REQUEST, MSG_PARAMETER_STATUS, MSG_PASSWORD,
    MSG_READY_FOR_QUERY, MSG_TERMINATE, SASL_MECHANISM_SCRAM_SHA_256,
    SQLSTATE_INVALID_AUTHORIZATION, SSL_ACCEPTED, SSL_REFUSED,
};
use crate::tls::{SniRejection, TenantId, TlsAcceptor};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading the first startup packet
    Connecting,
    /// Negotiating TLS and routing by server name
    TlsHandshake,
    /// Running the SCRAM exchange
    Authenticating,
    /// Materializing data and binding an engine session
    Bound,
    /// Relaying frames between client and engine
    Relaying,
    /// Connection closed
    Closed,
}

/// Everything a connection needs from the running gateway.
pub struct GatewayContext {
    pub acceptor: TlsAcceptor,
    pub directory: Arc<dyn TenantDirectory>,
    pub cache: Arc<CacheManager>,
    pub pool: Arc<EnginePool>,
    pub metrics: Arc<GatewayMetrics>,
    /// Deadline for every client read before authentication completes
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

/// A client connection to the gateway
pub struct Connection<S> {
    stream: Option<S>,
    client_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    state: ConnectionState,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        client_addr: SocketAddr,
        ctx: Arc<GatewayContext>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream: Some(stream),
            client_addr,
            ctx,
            state: ConnectionState::Connecting,
            shutdown_rx,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the connection until it closes.
    pub async fn handle(self) -> Result<()> {
        let span = span!(
            target: "tenantdb_gateway",
            Level::INFO,
            "connection",
            client = %self.client_addr
        );
        self.run().instrument(span).await
    }

    async fn run(mut self) -> Result<()> {
        debug!("New connection");
        let deadline = Instant::now() + self.ctx.handshake_timeout;

        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| GatewayError::Connection("connection already handled".into()))?;

        // Connecting
        if !self.negotiate_encryption(&mut stream, deadline).await? {
            self.transition(ConnectionState::Closed);
            return Ok(());
        }

        // TlsHandshake
        self.transition(ConnectionState::TlsHandshake);
        let handshake = before(deadline, "TLS handshake", async {
            self.ctx.acceptor.accept(stream).await.map_err(GatewayError::from)
        })
        .await?;
        self.ctx.metrics.tls_handshake();

        let mut tls = handshake.stream;
        let tenant = match handshake.tenant {
            Ok(tenant) => tenant,
            Err(rejection) => {
                self.reject_server_name(&mut tls, &rejection, handshake.server_name.as_deref())
                    .await;
                return Ok(());
            }
        };

        let startup = match before(deadline, "startup message", read_startup_message(&mut tls))
            .await?
        {
            StartupPacket::Startup(startup) => startup,
            other => {
                let notice = ErrorNoticeResponse::protocol_error("unexpected packet after TLS");
                debug!("Unexpected {:?} over TLS", other);
                self.reject(&mut tls, notice).await;
                return Ok(());
            }
        };
        let Some(user) = startup.user().map(str::to_owned) else {
            let notice = ErrorNoticeResponse::fatal(
                SQLSTATE_INVALID_AUTHORIZATION,
                "no user name specified in startup packet",
            );
            self.reject(&mut tls, notice).await;
            return Ok(());
        };
        log_ignored_parameters(&startup);

        // Authenticating
        self.transition(ConnectionState::Authenticating);
        info!("Connection for database {} as {}", tenant, user);

        let verifier = match resolve_verifier(self.ctx.directory.as_ref(), &tenant).await {
            Ok(verifier) => verifier,
            Err(e) => {
                warn!("Credential lookup for {} failed: {:?}", tenant, e);
                self.ctx.metrics.lookup_failed();
                let notice = ErrorNoticeResponse::connection_exception(&e.client_message(&tenant));
                self.reject(&mut tls, notice).await;
                return Ok(());
            }
        };

        if !self.authenticate(&mut tls, verifier, &user, deadline).await? {
            return Ok(());
        }

        // Bound
        self.transition(ConnectionState::Bound);
        let Some((lease, mut handle)) = self.activate(&mut tls, &tenant).await else {
            return Ok(());
        };

        // Relaying
        let result = self.serve(&mut tls, &mut handle).await;

        // Closed: engine first, then the cache pin
        self.transition(ConnectionState::Closed);
        handle.close().await;
        drop(lease);
        if let Err(e) = tls.shutdown().await {
            trace!("TLS shutdown: {}", e);
        }

        result
    }

    /// Answer encryption requests until the client asks for TLS.
    ///
    /// Returns `false` when the connection should be closed instead.
    async fn negotiate_encryption(&mut self, stream: &mut S, deadline: Instant) -> Result<bool> {
        loop {
            match before(deadline, "startup packet", read_startup_message(stream)).await? {
                StartupPacket::SslRequest => {
                    stream.write_all(&[SSL_ACCEPTED]).await?;
                    stream.flush().await?;
                    return Ok(true);
                }
                StartupPacket::GssEncRequest => {
                    trace!("Refusing GSSENCRequest");
                    stream.write_all(&[SSL_REFUSED]).await?;
                    stream.flush().await?;
                }
                StartupPacket::CancelRequest(_) => {
                    debug!("CancelRequest not supported, closing");
                    return Ok(false);
                }
                StartupPacket::Startup(_) => {
                    self.ctx.metrics.plaintext_rejected();
                    let message = SniRejection::Missing.to_string();
                    let notice = ErrorNoticeResponse::connection_exception(&message);
                    self.reject(stream, notice).await;
                    return Ok(false);
                }
            }
        }
    }

    async fn reject_server_name<T>(
        &mut self,
        stream: &mut T,
        rejection: &SniRejection,
        server_name: Option<&str>,
    ) where
        T: AsyncWrite + Unpin,
    {
        info!("Rejecting server name {:?}: {}", server_name, rejection);
        self.ctx.metrics.sni_rejected();
        let notice = ErrorNoticeResponse::connection_exception(&rejection.to_string());
        self.reject(stream, notice).await;
    }

    /// Run the SCRAM-SHA-256 exchange.
    ///
    /// Returns `false` when the client was rejected or went away.
    async fn authenticate<T>(
        &mut self,
        stream: &mut T,
        verifier: ScramVerifier,
        user: &str,
        deadline: Instant,
    ) -> Result<bool>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mechanisms = vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()];
        write_authentication(stream, &AuthenticationMessage::Sasl { mechanisms }).await?;

        let mut scram = ScramServer::new(verifier);

        let Some(payload) = self.next_password_frame(stream, deadline).await? else {
            return Ok(false);
        };
        let initial = match parse_sasl_initial_response(&payload) {
            Ok(initial) => initial,
            Err(e) => {
                self.auth_failed(stream, user, e).await;
                return Ok(false);
            }
        };
        let client_first = initial.data.unwrap_or_default();
        let server_first = match scram.handle_client_first(&initial.mechanism, &client_first) {
            Ok(server_first) => server_first,
            Err(e) => {
                self.auth_failed(stream, user, e).await;
                return Ok(false);
            }
        };
        write_authentication(
            stream,
            &AuthenticationMessage::SaslContinue { data: server_first },
        )
        .await?;

        let Some(client_final) = self.next_password_frame(stream, deadline).await? else {
            return Ok(false);
        };
        let server_final = match scram.handle_client_final(&client_final) {
            Ok(server_final) => server_final,
            Err(e) => {
                self.auth_failed(stream, user, e).await;
                return Ok(false);
            }
        };
        write_authentication(stream, &AuthenticationMessage::SaslFinal { data: server_final })
            .await?;

        self.ctx.metrics.auth_success();
        debug!("SCRAM exchange complete for {}", user);
        Ok(scram.is_complete())
    }

    /// Next password-class frame. Anything else is dropped unseen.
    ///
    /// Returns `None` if the client sends Terminate.
    async fn next_password_frame<T>(
        &mut self,
        stream: &mut T,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>>
    where
        T: AsyncRead + Unpin,
    {
        loop {
            let (msg_type, payload) =
                before(deadline, "authentication message", read_message(stream)).await?;
            match msg_type {
                MSG_PASSWORD => return Ok(Some(payload)),
                MSG_TERMINATE => {
                    debug!("Client terminated during authentication");
                    self.transition(ConnectionState::Closed);
                    return Ok(None);
                }
                other => {
                    debug!(
                        "Dropping {} received before authentication",
                        frontend_message_name(other)
                    );
                    self.ctx.metrics.preauth_frame_dropped();
                }
            }
        }
    }

    async fn auth_failed<T>(&mut self, stream: &mut T, user: &str, err: GatewayError)
    where
        T: AsyncWrite + Unpin,
    {
        self.ctx.metrics.auth_failure();
        let notice = match &err {
            GatewayError::Auth(_) => ErrorNoticeResponse::authentication_failed(user),
            _ => ErrorNoticeResponse::protocol_error(&err.to_string()),
        };
        info!("Authentication failed for {}: {}", user, err);
        self.reject(stream, notice).await;
    }

    /// Materialize the tenant's data and bind an engine session.
    ///
    /// On failure the client has already been sent a FATAL notice.
    async fn activate<T>(
        &mut self,
        stream: &mut T,
        tenant: &TenantId,
    ) -> Option<(CacheLease, EngineHandle)>
    where
        T: AsyncWrite + Unpin,
    {
        let lease = match self.ctx.cache.ensure_materialized(tenant).await {
            Ok(lease) => lease,
            Err(e) => {
                error!("Materializing database {} failed: {}", tenant, e);
                self.ctx.metrics.provisioning_failed();
                let message = match e {
                    GatewayError::NotFound(_) => format!("database {} not found", tenant),
                    GatewayError::Extraction(_) => "Error extracting database".to_string(),
                    _ => "Error preparing database".to_string(),
                };
                self.reject(stream, ErrorNoticeResponse::internal_error(&message))
                    .await;
                return None;
            }
        };

        match self.ctx.pool.bind(&lease).await {
            Ok(handle) => {
                self.ctx.metrics.engine_bound();
                Some((lease, handle))
            }
            Err(e) => {
                error!("Starting engine for {} failed: {}", tenant, e);
                self.ctx.metrics.provisioning_failed();
                let notice = ErrorNoticeResponse::internal_error("Error starting database");
                self.reject(stream, notice).await;
                None
            }
        }
    }

    /// Complete the client's startup, then relay until the session ends.
    async fn serve<T>(&mut self, stream: &mut T, handle: &mut EngineHandle) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let ready = ready_frames(handle)?;
        stream.write_all(&ready).await?;
        stream.flush().await?;

        self.transition(ConnectionState::Relaying);
        let engine = handle.stream_mut()?;
        let reason = relay(
            stream,
            engine,
            self.ctx.idle_timeout,
            &mut self.shutdown_rx,
            &self.ctx.metrics,
        )
        .await;

        self.ctx.metrics.session_ended(&reason);
        info!("Session for {} ended: {}", handle.tenant(), reason.message());
        Ok(())
    }

    /// Send a FATAL notice and close.
    async fn reject<T>(&mut self, stream: &mut T, notice: ErrorNoticeResponse)
    where
        T: AsyncWrite + Unpin,
    {
        self.transition(ConnectionState::Closed);
        if let Err(e) = write_error(stream, &notice).await {
            debug!("Failed to deliver FATAL notice: {}", e);
            return;
        }
        if let Err(e) = stream.shutdown().await {
            trace!("Shutdown after FATAL notice: {}", e);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// AuthenticationOk, the engine's startup parameters and ReadyForQuery.
fn ready_frames(handle: &EngineHandle) -> Result<Vec<u8>> {
    let mut out = encode_message(
        MSG_AUTH_REQUEST,
        &build_authentication(&AuthenticationMessage::Ok),
    );

    for (msg_type, payload) in handle.session()?.startup_frames() {
        if *msg_type == MSG_PARAMETER_STATUS {
            let status = parse_parameter_status(payload)?;
            if status.name == "server_version" {
                let tagged = tagged_server_version(&status.value);
                out.extend(encode_message(
                    MSG_PARAMETER_STATUS,
                    &build_parameter_status(&status.name, &tagged),
                ));
                continue;
            }
        }
        out.extend(encode_message(*msg_type, payload));
    }

    out.extend(encode_message(
        MSG_READY_FOR_QUERY,
        &build_ready_for_query(TransactionStatus::Idle),
    ));
    Ok(out)
}

fn tagged_server_version(version: &str) -> String {
    format!("{} (tenantdb-gateway {})", version, env!("CARGO_PKG_VERSION"))
}

fn log_ignored_parameters(startup: &StartupMessage) {
    if let Some(database) = startup.database() {
        trace!("Ignoring requested database {}", database);
    }
}

async fn before<T, F>(deadline: Instant, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| GatewayError::Timeout(format!("{} not received in time", what)))?
}
