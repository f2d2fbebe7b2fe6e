//! Shared harness for gateway integration tests
//!
//! Starts a real listener on 127.0.0.1 with a generated wildcard identity,
//! a static tenant directory, archives on disk and an in-process engine that
//! speaks just enough of the PostgreSQL protocol.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tenantdb_gateway::cache::CacheManager;
use tenantdb_gateway::config::load_config_from_str;
use tenantdb_gateway::directory::SCRAM_SHA_256;
use tenantdb_gateway::engine::{EngineBackend, EngineStream};
use tenantdb_gateway::protocol::postgres::*;
use tenantdb_gateway::{
    CredentialRecord, FsArchiveStore, GatewayError, GatewayMetrics, GatewayServices, Listener,
    StaticTenantDirectory, TenantId,
};

/// Default test timeout
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DOMAIN: &str = "db.example.com";
pub const RESTRICTED_ROLE: &str = "readonly_postgres";
pub const PASSWORD: &str = "correct horse battery staple";

/// Helper macro to run test with timeout
#[macro_export]
macro_rules! with_timeout {
    ($body:expr) => {
        match tokio::time::timeout($crate::common::TEST_TIMEOUT, async { $body }).await {
            Ok(result) => result,
            Err(_) => panic!("Test timed out after {:?}", $crate::common::TEST_TIMEOUT),
        }
    };
}

// ============================================================================
// Fake engine
// ============================================================================

/// A query as seen by the fake engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenQuery {
    pub tenant: String,
    pub role: String,
    pub sql: String,
}

#[derive(Default)]
pub struct FakeEngineState {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub connects: AtomicUsize,
    data_dirs: Mutex<HashMap<String, PathBuf>>,
    roles: Mutex<HashMap<String, HashSet<String>>>,
    queries: Mutex<Vec<SeenQuery>>,
}

impl FakeEngineState {
    pub fn queries(&self) -> Vec<SeenQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn queries_matching(&self, sql: &str) -> usize {
        self.queries().iter().filter(|q| q.sql == sql).count()
    }
}

/// Engine backend serving sessions over in-memory pipes.
pub struct FakeEngine(pub Arc<FakeEngineState>);

#[async_trait]
impl EngineBackend for FakeEngine {
    async fn start(&self, tenant: &TenantId, data_dir: &Path) -> tenantdb_gateway::Result<()> {
        self.0.started.fetch_add(1, Ordering::SeqCst);
        self.0
            .data_dirs
            .lock()
            .unwrap()
            .insert(tenant.as_str().to_string(), data_dir.to_path_buf());
        Ok(())
    }

    async fn connect(&self, tenant: &TenantId) -> tenantdb_gateway::Result<EngineStream> {
        let data_dir = self
            .0
            .data_dirs
            .lock()
            .unwrap()
            .get(tenant.as_str())
            .cloned()
            .ok_or_else(|| GatewayError::Engine(format!("{} is not running", tenant)))?;
        self.0.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve_session(
            server,
            tenant.as_str().to_string(),
            data_dir,
            Arc::clone(&self.0),
        ));
        Ok(Box::new(client))
    }

    async fn stop(&self, tenant: &TenantId) -> tenantdb_gateway::Result<()> {
        self.0.data_dirs.lock().unwrap().remove(tenant.as_str());
        self.0.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn send(stream: &mut DuplexStream, msg_type: u8, payload: Vec<u8>) {
    let _ = stream.write_all(&encode_message(msg_type, &payload)).await;
}

async fn ready(stream: &mut DuplexStream) {
    send(stream, MSG_READY_FOR_QUERY, build_ready_for_query(TransactionStatus::Idle)).await;
}

async fn serve_session(
    mut stream: DuplexStream,
    tenant: String,
    data_dir: PathBuf,
    state: Arc<FakeEngineState>,
) {
    let role = match read_startup_message(&mut stream).await {
        Ok(StartupPacket::Startup(startup)) => startup.user().unwrap_or_default().to_string(),
        _ => return,
    };

    let known = role == "postgres"
        || state
            .roles
            .lock()
            .unwrap()
            .get(&tenant)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false);
    if !known {
        let notice = ErrorNoticeResponse::fatal(
            "28000",
            &format!("role \"{}\" does not exist", role),
        );
        send(&mut stream, MSG_ERROR_RESPONSE, build_error_response(&notice)).await;
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
        MSG_PARAMETER_STATUS,
        build_parameter_status("client_encoding", "UTF8"),
    )
    .await;
    send(
        &mut stream,
        MSG_BACKEND_KEY_DATA,
        build_backend_key_data(&BackendKeyData {
            process_id: 4242,
            secret_key: 7,
        }),
    )
    .await;
    ready(&mut stream).await;

    while let Ok((msg_type, payload)) = read_message(&mut stream).await {
        if msg_type != MSG_QUERY {
            break;
        }
        let sql = parse_query(&payload).unwrap_or_default();
        state.queries.lock().unwrap().push(SeenQuery {
            tenant: tenant.clone(),
            role: role.clone(),
            sql: sql.clone(),
        });

        if let Some(rest) = sql.strip_prefix("SELECT 1 FROM pg_roles WHERE rolname = ") {
            let wanted = rest.trim_matches('\'');
            let exists = state
                .roles
                .lock()
                .unwrap()
                .get(&tenant)
                .map(|roles| roles.contains(wanted))
                .unwrap_or(false);
            send_rows(&mut stream, "?column?", if exists { vec!["1".into()] } else { vec![] })
                .await;
        } else if let Some(rest) = sql.strip_prefix("CREATE USER ") {
            let created = rest.split(';').next().unwrap_or_default().trim().to_string();
            state
                .roles
                .lock()
                .unwrap()
                .entry(tenant.clone())
                .or_default()
                .insert(created);
            send(&mut stream, MSG_COMMAND_COMPLETE, build_command_complete("CREATE ROLE")).await;
            send(&mut stream, MSG_COMMAND_COMPLETE, build_command_complete("GRANT ROLE")).await;
        } else if sql == "SELECT greeting" {
            let greeting = std::fs::read_to_string(data_dir.join("greeting.txt"))
                .unwrap_or_default()
                .trim()
                .to_string();
            send_rows(&mut stream, "greeting", vec![greeting]).await;
        } else {
            let notice = ErrorNoticeResponse::error(
                "ERROR",
                "42601",
                &format!("syntax error at or near \"{}\"", sql),
            );
            send(&mut stream, MSG_ERROR_RESPONSE, build_error_response(&notice)).await;
        }
        ready(&mut stream).await;
    }
}

async fn send_rows(stream: &mut DuplexStream, column: &str, values: Vec<String>) {
    send(
        stream,
        MSG_ROW_DESCRIPTION,
        build_row_description(&RowDescription {
            fields: vec![FieldDescription::text(column)],
        }),
    )
    .await;
    let count = values.len();
    for value in values {
        send(
            stream,
            MSG_DATA_ROW,
            build_data_row(&DataRow {
                values: vec![Some(value.into_bytes())],
            }),
        )
        .await;
    }
    send(
        stream,
        MSG_COMMAND_COMPLETE,
        build_command_complete(&format!("SELECT {}", count)),
    )
    .await;
}

// ============================================================================
// Fixtures
// ============================================================================

/// Write a gzip-compressed tar archive containing `files`.
pub fn write_archive(path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

pub fn scram_record(password: &str) -> CredentialRecord {
    CredentialRecord {
        auth_method: SCRAM_SHA_256.to_string(),
        auth_data: ScramVerifier::from_password(password, 64).to_bundle(),
    }
}

/// A running gateway and the handles tests inspect.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown_tx: broadcast::Sender<()>,
    pub metrics: Arc<GatewayMetrics>,
    pub cache: Arc<CacheManager>,
    pub engine: Arc<FakeEngineState>,
    pub archive_root: PathBuf,
    pub cache_root: PathBuf,
    listener_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    ca: CertificateDer<'static>,
    _dirs: tempfile::TempDir,
}

impl TestGateway {
    /// Start a gateway with these tenants:
    /// - `t1`, `t2`: SCRAM credentials and an archive holding `greeting.txt`
    /// - `md5db`: a record with an unsupported method
    /// - `noarchive`: SCRAM credentials but nothing in the archive store
    /// - `corrupt`: SCRAM credentials and an archive that is not gzip
    pub async fn start() -> Self {
        let dirs = tempfile::tempdir().unwrap();
        let archive_root = dirs.path().join("archives");
        let cache_root = dirs.path().join("cache");
        std::fs::create_dir_all(&archive_root).unwrap();

        write_archive(
            &archive_root.join("t1.tar.gz"),
            &[("greeting.txt", b"hello from t1\n"), ("base/1/1259", &[0u8; 512])],
        );
        write_archive(&archive_root.join("t2.tar.gz"), &[("greeting.txt", b"hello from t2\n")]);
        std::fs::write(archive_root.join("corrupt.tar.gz"), b"definitely not gzip").unwrap();

        let certified = rcgen::generate_simple_self_signed(vec![
            format!("*.{}", DOMAIN),
            "*.evil.test".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let cert_path = dirs.path().join("server.crt");
        let key_path = dirs.path().join("server.key");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let yaml = format!(
            r#"
server:
  listen_address: "127.0.0.1"
  listen_port: 0
  handshake_timeout_secs: 10
  shutdown_grace_secs: 2
tls:
  cert_path: "{}"
  key_path: "{}"
  wildcard_domain: "*.{}"
directory:
  kind: static
archive:
  root: "{}"
cache:
  root: "{}"
"#,
            cert_path.display(),
            key_path.display(),
            DOMAIN,
            archive_root.display(),
            cache_root.display()
        );
        let config = Arc::new(load_config_from_str(&yaml).unwrap());

        let mut directory = StaticTenantDirectory::new(HashMap::new());
        directory.insert("t1", scram_record(PASSWORD));
        directory.insert("t2", scram_record(PASSWORD));
        directory.insert("noarchive", scram_record(PASSWORD));
        directory.insert("corrupt", scram_record(PASSWORD));
        directory.insert(
            "md5db",
            CredentialRecord {
                auth_method: "md5".to_string(),
                auth_data: serde_json::json!("md5d41d8cd98f00b204e9800998ecf8427e"),
            },
        );

        let engine = Arc::new(FakeEngineState::default());
        let services = GatewayServices {
            directory: Arc::new(directory),
            archives: Arc::new(FsArchiveStore::new(archive_root.clone())),
            engine: Arc::new(FakeEngine(Arc::clone(&engine))),
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let listener = Listener::bind(config, services, shutdown_rx).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = listener.metrics();
        let cache = listener.cache();
        let listener_task = tokio::spawn(async move {
            let _ = listener.run().await;
        });

        Self {
            addr,
            shutdown_tx,
            metrics,
            cache,
            engine,
            archive_root,
            cache_root,
            listener_task: tokio::sync::Mutex::new(Some(listener_task)),
            ca: certified.cert.der().clone(),
            _dirs: dirs,
        }
    }

    fn connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.clone()).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Plain TCP connection to the gateway.
    pub async fn tcp(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// SSLRequest, then a TLS handshake presenting `server_name`.
    pub async fn tls_with_name(&self, server_name: ServerName<'static>) -> TlsStream<TcpStream> {
        let mut tcp = self.tcp().await;
        write_ssl_request(&mut tcp).await.unwrap();
        let mut answer = [0u8; 1];
        tcp.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[0], SSL_ACCEPTED);
        self.connector().connect(server_name, tcp).await.unwrap()
    }

    /// TLS connection routed to `tenant`.
    pub async fn tls(&self, tenant: &str) -> TlsStream<TcpStream> {
        let name = ServerName::try_from(format!("{}.{}", tenant, DOMAIN)).unwrap();
        self.tls_with_name(name).await
    }

    /// Authenticated session for `tenant`.
    pub async fn session(&self, tenant: &str) -> ClientSession {
        let mut stream = self.tls(tenant).await;
        let parameters = login(&mut stream, "app", PASSWORD, &[])
            .await
            .unwrap_or_else(|e| panic!("login to {} failed: {:?}", tenant, e.message()));
        ClientSession { stream, parameters }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Signal shutdown and wait until the listener has drained.
    pub async fn stop(&self) {
        self.shutdown();
        if let Some(task) = self.listener_task.lock().await.take() {
            task.await.unwrap();
        }
    }
}

// ============================================================================
// Client side
// ============================================================================

pub struct ClientSession {
    pub stream: TlsStream<TcpStream>,
    pub parameters: HashMap<String, String>,
}

impl ClientSession {
    pub async fn query(&mut self, sql: &str) -> Result<Vec<String>, ErrorNoticeResponse> {
        simple_query(&mut self.stream, sql).await
    }

    pub async fn terminate(mut self) {
        write_message(&mut self.stream, MSG_TERMINATE, &[]).await.unwrap();
        let _ = self.stream.shutdown().await;
    }
}

/// Startup plus SCRAM-SHA-256.
///
/// `chatter` frames are sent right after the server asks for SASL, before
/// any credentials. Returns the ParameterStatus values on success and the
/// gateway's FATAL notice otherwise.
pub async fn login<S>(
    stream: &mut S,
    user: &str,
    password: &str,
    chatter: &[(u8, Vec<u8>)],
) -> Result<HashMap<String, String>, ErrorNoticeResponse>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    write_startup_message(stream, &StartupMessage::with_database(user, "postgres"))
        .await
        .unwrap();

    let mut scram = ScramClient::new(user, password);
    let mut parameters = HashMap::new();
    loop {
        let (msg_type, payload) = read_message(stream).await.unwrap();
        match msg_type {
            MSG_AUTH_REQUEST => match parse_authentication(&payload).unwrap() {
                AuthenticationMessage::Sasl { mechanisms } => {
                    assert_eq!(mechanisms, vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()]);
                    for (chatter_type, chatter_payload) in chatter {
                        write_message(stream, *chatter_type, chatter_payload).await.unwrap();
                    }
                    let first = scram.client_first_message();
                    let initial = build_sasl_initial_response(SASL_MECHANISM_SCRAM_SHA_256, &first);
                    write_message(stream, MSG_PASSWORD, &initial).await.unwrap();
                }
                AuthenticationMessage::SaslContinue { data } => {
                    let client_final = scram.process_server_first(&data).unwrap();
                    write_message(stream, MSG_PASSWORD, &client_final).await.unwrap();
                }
                AuthenticationMessage::SaslFinal { data } => {
                    scram.verify_server_final(&data).unwrap();
                }
                AuthenticationMessage::Ok => {}
                other => panic!("unexpected authentication request {:?}", other),
            },
            MSG_PARAMETER_STATUS => {
                let status = parse_parameter_status(&payload).unwrap();
                parameters.insert(status.name, status.value);
            }
            MSG_BACKEND_KEY_DATA => {}
            MSG_READY_FOR_QUERY => return Ok(parameters),
            MSG_ERROR_RESPONSE => return Err(parse_error_notice(&payload).unwrap()),
            other => panic!("unexpected message '{}' during login", other as char),
        }
    }
}

/// Run a simple query and collect the first column of every row.
pub async fn simple_query<S>(stream: &mut S, sql: &str) -> Result<Vec<String>, ErrorNoticeResponse>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    write_message(stream, MSG_QUERY, &build_query(sql)).await.unwrap();

    let mut rows = Vec::new();
    let mut error = None;
    loop {
        let (msg_type, payload) = read_message(stream).await.unwrap();
        match msg_type {
            MSG_DATA_ROW => {
                let row = parse_data_row(&payload).unwrap();
                rows.push(row.text(0).unwrap_or_default().to_string());
            }
            MSG_ERROR_RESPONSE => error = Some(parse_error_notice(&payload).unwrap()),
            MSG_READY_FOR_QUERY => break,
            _ => {}
        }
    }
    match error {
        Some(notice) => Err(notice),
        None => Ok(rows),
    }
}

/// Read the FATAL notice the gateway sends before closing.
pub async fn read_fatal<S>(stream: &mut S) -> ErrorNoticeResponse
where
    S: tokio::io::AsyncRead + Unpin,
{
    let (msg_type, payload) = read_message(stream).await.unwrap();
    assert_eq!(msg_type, MSG_ERROR_RESPONSE, "expected ErrorResponse");
    let notice = parse_error_notice(&payload).unwrap();
    assert!(notice.is_fatal(), "expected FATAL, got {:?}", notice);
    notice
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
