//! TLS acceptor with server-name routing
//!
//! Uses `LazyConfigAcceptor` so the ClientHello can be inspected before the
//! handshake is completed. The tenant decision is made from the ClientHello
//! alone; the handshake is then finished with the wildcard identity so a
//! refusal can be delivered to the client as a protocol error notice.

use std::sync::Arc;

use rustls::server::Acceptor;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::tls::{
    load_certificates, load_private_key, SniRejection, SniResolver, TenantId, TlsError,
    TlsServerConfig,
};

/// Outcome of a completed TLS handshake
pub struct SniHandshake<S> {
    /// Encrypted stream to the client
    pub stream: TlsStream<S>,
    /// Server name offered in the ClientHello, if any
    pub server_name: Option<String>,
    /// Routing decision made from the ClientHello
    pub tenant: Result<TenantId, SniRejection>,
}

/// TLS acceptor for client connections
///
/// # Example
///
/// ```ignore
/// let acceptor = TlsAcceptor::new(&config.tls)?;
/// let handshake = acceptor.accept(tcp_stream).await?;
/// match handshake.tenant {
///     Ok(tenant) => { /* continue with startup */ }
///     Err(rejection) => { /* send FATAL 08000 and close */ }
/// }
/// ```
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    resolver: SniResolver,
}

impl TlsAcceptor {
    /// Create a new TLS acceptor from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - Certificate file cannot be read or parsed
    /// - Private key file cannot be read or parsed
    pub fn new(config: &TlsServerConfig) -> Result<Self, TlsError> {
        config.validate().map_err(TlsError::config)?;

        let certs = load_certificates(&config.cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::cert_load(
                &config.cert_path,
                "no certificates found in file",
            ));
        }

        let key = load_private_key(&config.key_path)?;

        let provider = rustls::crypto::ring::default_provider();

        let server_config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build TLS config: {}", e)))?;

        Ok(Self {
            config: Arc::new(server_config),
            resolver: SniResolver::new(config.serving_domain()),
        })
    }

    /// Resolver used to route server names
    pub fn resolver(&self) -> &SniResolver {
        &self.resolver
    }

    /// Run the TLS handshake and route the connection by server name.
    ///
    /// A routing refusal is not an error here: the handshake still completes
    /// and the caller decides how to report `SniHandshake::tenant`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client sends invalid TLS data or disconnects
    /// during the handshake.
    pub async fn accept<S>(&self, stream: S) -> Result<SniHandshake<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))?;

        let server_name = start.client_hello().server_name().map(str::to_owned);
        let tenant = self.resolver.resolve(server_name.as_deref());
        match &tenant {
            Ok(tenant) => trace!("ClientHello routed to tenant {}", tenant),
            Err(rejection) => debug!("Refusing ClientHello: {}", rejection),
        }

        let stream = start
            .into_stream(self.config.clone())
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))?;

        Ok(SniHandshake {
            stream,
            server_name,
            tenant,
        })
    }
}
