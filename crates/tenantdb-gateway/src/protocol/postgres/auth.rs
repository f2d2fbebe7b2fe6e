//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677)
//!
//! The gateway plays the server role towards clients. It never sees a
//! password: each tenant's credential record carries a verifier bundle
//! (salt, iteration count, StoredKey, ServerKey), which is all the server
//! side of SCRAM needs.
//!
//! [`ScramClient`] is the client role. It backs the `scram-verifier`
//! tooling and the integration tests.
//!
//! # Known Limitations
//!
//! - **SASLprep**: passwords are not Unicode-normalized (RFC 4013).
//!   ASCII-only credentials work correctly.
//! - **Channel binding**: only `SCRAM-SHA-256` is advertised; clients that
//!   insist on `p=` channel binding are refused.
//!
//! # References
//!
//! - SCRAM: <https://www.postgresql.org/docs/current/sasl-authentication.html>
//! - RFC 5802: <https://tools.ietf.org/html/rfc5802>

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// PostgreSQL's default iteration count for new verifiers
pub const DEFAULT_SCRAM_ITERATIONS: u32 = 4096;

/// Length of a freshly generated salt
const SALT_LEN: usize = 16;

// ============================================================================
// Stored verifier
// ============================================================================

/// JSON shape of a stored verifier bundle (base64 fields, camelCase keys)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifierBundle {
    salt: String,
    iterations: u32,
    stored_key: String,
    server_key: String,
}

/// Salted SCRAM-SHA-256 verifier for one tenant
///
/// `StoredKey = H(HMAC(SaltedPassword, "Client Key"))` and
/// `ServerKey = HMAC(SaltedPassword, "Server Key")`.
#[derive(Clone)]
pub struct ScramVerifier {
    salt: Vec<u8>,
    iterations: u32,
    stored_key: [u8; 32],
    server_key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for ScramVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramVerifier")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl ScramVerifier {
    /// Parse a stored verifier bundle:
    /// `{"salt": b64, "iterations": n, "storedKey": b64, "serverKey": b64}`
    pub fn from_bundle(bundle: &serde_json::Value) -> Result<Self> {
        let bundle: VerifierBundle = serde_json::from_value(bundle.clone())
            .map_err(|e| GatewayError::Auth(format!("invalid SCRAM verifier: {}", e)))?;

        if bundle.iterations == 0 {
            return Err(GatewayError::Auth(
                "invalid SCRAM verifier: zero iterations".into(),
            ));
        }

        let salt = decode_field("salt", &bundle.salt)?;
        let stored_key = decode_key("storedKey", &bundle.stored_key)?;
        let server_key = decode_key("serverKey", &bundle.server_key)?;

        Ok(Self {
            salt,
            iterations: bundle.iterations,
            stored_key,
            server_key: Zeroizing::new(server_key),
        })
    }

    /// Derive a verifier from a password with a random salt.
    pub fn from_password(password: &str, iterations: u32) -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::from_password_with_salt(password, &salt, iterations)
    }

    /// Derive a verifier from a password and an explicit salt.
    pub fn from_password_with_salt(password: &str, salt: &[u8], iterations: u32) -> Self {
        let salted_password = salt_password(password, salt, iterations);
        let client_key = hmac_sha256(&*salted_password, b"Client Key");
        let server_key = hmac_sha256(&*salted_password, b"Server Key");

        Self {
            salt: salt.to_vec(),
            iterations,
            stored_key: sha256(&client_key),
            server_key: Zeroizing::new(server_key),
        }
    }

    /// Serialize into the stored bundle format.
    pub fn to_bundle(&self) -> serde_json::Value {
        serde_json::json!({
            "salt": BASE64.encode(&self.salt),
            "iterations": self.iterations,
            "storedKey": BASE64.encode(self.stored_key),
            "serverKey": BASE64.encode(*self.server_key),
        })
    }

    /// Iteration count
    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| GatewayError::Auth(format!("invalid SCRAM verifier: bad base64 in {}", name)))
}

fn decode_key(name: &str, value: &str) -> Result<[u8; 32]> {
    decode_field(name, value)?.try_into().map_err(|_| {
        GatewayError::Auth(format!("invalid SCRAM verifier: {} must be 32 bytes", name))
    })
}

// ============================================================================
// Server side
// ============================================================================

/// SCRAM-SHA-256 server state machine.
///
/// # Usage
///
/// ```ignore
/// let mut server = ScramServer::new(verifier);
/// let server_first = server.handle_client_first(&initial.mechanism, &client_first)?;
/// // send AuthenticationSASLContinue(server_first)
/// let server_final = server.handle_client_final(&client_final)?;
/// // send AuthenticationSASLFinal(server_final), then AuthenticationOk
/// ```
pub struct ScramServer {
    verifier: ScramVerifier,
    state: ServerState,
}

enum ServerState {
    /// Waiting for client-first-message
    Initial,
    /// Waiting for client-final-message
    WaitingForClientFinal {
        /// Client-first-message-bare
        client_first_bare: String,
        /// Server-first-message as sent
        server_first: String,
        /// Client nonce + server nonce
        nonce: String,
        /// GS2 header the client must echo back in `c=`
        gs2_header: String,
    },
    /// Client proof verified
    Complete,
    /// Exchange aborted
    Failed,
}

impl ScramServer {
    /// Create a server for one exchange against a stored verifier.
    pub fn new(verifier: ScramVerifier) -> Self {
        Self {
            verifier,
            state: ServerState::Initial,
        }
    }

    /// Process the SASLInitialResponse and produce the server-first-message.
    pub fn handle_client_first(&mut self, mechanism: &str, client_first: &[u8]) -> Result<Vec<u8>> {
        if !matches!(self.state, ServerState::Initial) {
            return self.fail("SCRAM: unexpected client-first-message");
        }
        if mechanism != super::constants::SASL_MECHANISM_SCRAM_SHA_256 {
            return self.fail(&format!("SCRAM: unsupported SASL mechanism {}", mechanism));
        }

        let message = match std::str::from_utf8(client_first) {
            Ok(m) => m,
            Err(_) => return self.fail("SCRAM: invalid UTF-8 in client-first-message"),
        };
        let (gs2_header, client_first_bare) = match split_gs2_header(message) {
            Ok(parts) => parts,
            Err(e) => {
                self.state = ServerState::Failed;
                return Err(e);
            }
        };

        let client_nonce = match client_first_bare
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
        {
            Some(n) if !n.is_empty() => n,
            _ => return self.fail("SCRAM: client nonce missing"),
        };

        let nonce = format!("{}{}", client_nonce, generate_nonce());
        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            BASE64.encode(&self.verifier.salt),
            self.verifier.iterations
        );

        self.state = ServerState::WaitingForClientFinal {
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            nonce,
            gs2_header: gs2_header.to_string(),
        };

        Ok(server_first.into_bytes())
    }

    /// Verify the client-final-message and produce the server-final-message.
    ///
    /// Returns `GatewayError::Auth` when the proof does not match the
    /// stored key, and `GatewayError::Protocol` for malformed input.
    pub fn handle_client_final(&mut self, client_final: &[u8]) -> Result<Vec<u8>> {
        let state = std::mem::replace(&mut self.state, ServerState::Failed);
        let (client_first_bare, server_first, nonce, gs2_header) = match state {
            ServerState::WaitingForClientFinal {
                client_first_bare,
                server_first,
                nonce,
                gs2_header,
            } => (client_first_bare, server_first, nonce, gs2_header),
            _ => {
                return Err(GatewayError::Protocol(
                    "SCRAM: unexpected client-final-message".into(),
                ))
            }
        };

        let message = std::str::from_utf8(client_final).map_err(|_| {
            GatewayError::Protocol("SCRAM: invalid UTF-8 in client-final-message".into())
        })?;

        let (without_proof, proof_b64) = message
            .rsplit_once(",p=")
            .ok_or_else(|| GatewayError::Protocol("SCRAM: client proof missing".into()))?;

        let mut channel_binding = None;
        let mut final_nonce = None;
        for attr in without_proof.split(',') {
            if let Some(v) = attr.strip_prefix("c=") {
                channel_binding = Some(v);
            } else if let Some(v) = attr.strip_prefix("r=") {
                final_nonce = Some(v);
            }
        }

        let binding = channel_binding
            .and_then(|c| BASE64.decode(c).ok())
            .ok_or_else(|| GatewayError::Protocol("SCRAM: invalid channel binding".into()))?;
        if binding != gs2_header.as_bytes() {
            return Err(GatewayError::Protocol(
                "SCRAM: channel binding does not match".into(),
            ));
        }
        if final_nonce != Some(nonce.as_str()) {
            return Err(GatewayError::Protocol("SCRAM: nonce mismatch".into()));
        }

        let proof = BASE64
            .decode(proof_b64)
            .map_err(|_| GatewayError::Protocol("SCRAM: invalid base64 in client proof".into()))?;
        if proof.len() != 32 {
            return Err(GatewayError::Protocol(
                "SCRAM: client proof has wrong length".into(),
            ));
        }

        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        // ClientKey = ClientProof XOR HMAC(StoredKey, AuthMessage); H(ClientKey) must be StoredKey
        let client_signature = hmac_sha256(&self.verifier.stored_key, auth_message.as_bytes());
        let client_key = Zeroizing::new(xor_bytes(&proof, &client_signature));
        let computed = sha256(&client_key);

        if !bool::from(computed[..].ct_eq(&self.verifier.stored_key[..])) {
            return Err(GatewayError::Auth("SCRAM: client proof mismatch".into()));
        }

        let server_signature = hmac_sha256(&*self.verifier.server_key, auth_message.as_bytes());
        self.state = ServerState::Complete;

        Ok(format!("v={}", BASE64.encode(server_signature)).into_bytes())
    }

    /// Check if the client proof was verified.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ServerState::Complete)
    }

    fn fail<T>(&mut self, reason: &str) -> Result<T> {
        self.state = ServerState::Failed;
        Err(GatewayError::Protocol(reason.to_string()))
    }
}

/// Split `gs2-header` from `client-first-message-bare`.
///
/// `n,,` and `y,,` are accepted; `p=...` (channel binding required) is not.
fn split_gs2_header(message: &str) -> Result<(&str, &str)> {
    let mut parts = message.splitn(3, ',');
    let cbind = parts.next().unwrap_or_default();
    let authzid = parts.next();
    let bare = parts.next();

    match (cbind, authzid, bare) {
        ("n" | "y", Some(authzid), Some(bare)) => {
            let header_len = cbind.len() + authzid.len() + 2;
            Ok((&message[..header_len], bare))
        }
        (c, _, _) if c.starts_with("p=") => Err(GatewayError::Protocol(
            "SCRAM: channel binding is not supported".into(),
        )),
        _ => Err(GatewayError::Protocol(
            "SCRAM: malformed client-first-message".into(),
        )),
    }
}

// ============================================================================
// Client side
// ============================================================================

/// SCRAM-SHA-256 client state machine.
///
/// # Usage
///
/// ```ignore
/// let mut client = ScramClient::new("user", "password");
/// let first = client.client_first_message();
/// let final_msg = client.process_server_first(&server_first)?;
/// client.verify_server_final(&server_final)?;
/// ```
pub struct ScramClient {
    username: String,
    password: Zeroizing<String>,
    client_nonce: Zeroizing<String>,
    state: ClientState,
}

enum ClientState {
    Initial,
    WaitingForServerFirst {
        client_first_bare: String,
    },
    WaitingForServerFinal {
        auth_message: String,
        salted_password: Zeroizing<[u8; 32]>,
    },
    Complete,
    Failed,
}

impl ScramClient {
    /// Create a new SCRAM client. PostgreSQL ignores the SCRAM username, so
    /// an empty one is fine.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            client_nonce: Zeroizing::new(generate_nonce()),
            state: ClientState::Initial,
        }
    }

    /// Generate the client-first-message (sent in SASLInitialResponse).
    pub fn client_first_message(&mut self) -> Vec<u8> {
        let client_first_bare = format!("n={},r={}", self.username, &*self.client_nonce);
        let client_first = format!("n,,{}", client_first_bare);
        self.state = ClientState::WaitingForServerFirst { client_first_bare };
        client_first.into_bytes()
    }

    /// Process the server-first-message and generate client-final-message.
    pub fn process_server_first(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let client_first_bare = match &self.state {
            ClientState::WaitingForServerFirst { client_first_bare } => client_first_bare.clone(),
            _ => {
                self.state = ClientState::Failed;
                return Err(GatewayError::Auth(
                    "SCRAM: unexpected state for server-first".into(),
                ));
            }
        };

        let server_first_str = std::str::from_utf8(server_first)
            .map_err(|_| GatewayError::Auth("SCRAM: invalid UTF-8 in server-first".into()))?;

        let (server_nonce, salt, iterations) = parse_server_first(server_first_str)?;

        if !server_nonce.starts_with(&*self.client_nonce) {
            self.state = ClientState::Failed;
            return Err(GatewayError::Auth("SCRAM: server nonce mismatch".into()));
        }

        let salted_password = salt_password(&self.password, &salt, iterations);

        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(b"n,,"), server_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare, server_first_str, client_final_without_proof
        );

        let client_key = hmac_sha256(&*salted_password, b"Client Key");
        let client_signature = hmac_sha256(&sha256(&client_key), auth_message.as_bytes());
        let proof = xor_bytes(&client_key, &client_signature);

        let client_final = format!("{},p={}", client_final_without_proof, BASE64.encode(proof));

        self.state = ClientState::WaitingForServerFinal {
            auth_message,
            salted_password,
        };

        Ok(client_final.into_bytes())
    }

    /// Verify the server-final-message (mutual authentication).
    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ClientState::Failed);
        let (auth_message, salted_password) = match state {
            ClientState::WaitingForServerFinal {
                auth_message,
                salted_password,
            } => (auth_message, salted_password),
            _ => {
                return Err(GatewayError::Auth(
                    "SCRAM: unexpected state for server-final".into(),
                ))
            }
        };

        let server_final_str = std::str::from_utf8(server_final)
            .map_err(|_| GatewayError::Auth("SCRAM: invalid UTF-8 in server-final".into()))?;

        if let Some(error_msg) = server_final_str.strip_prefix("e=") {
            return Err(GatewayError::Auth(format!(
                "SCRAM: server error: {}",
                error_msg
            )));
        }

        let received = server_final_str
            .strip_prefix("v=")
            .ok_or_else(|| GatewayError::Auth("SCRAM: invalid server-final format".into()))
            .and_then(|sig| {
                BASE64.decode(sig).map_err(|_| {
                    GatewayError::Auth("SCRAM: invalid base64 in server signature".into())
                })
            })?;

        let server_key = hmac_sha256(&*salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if received.ct_eq(&expected).into() {
            self.state = ClientState::Complete;
            Ok(())
        } else {
            Err(GatewayError::Auth(
                "SCRAM: server signature verification failed".into(),
            ))
        }
    }

    /// Check if authentication completed successfully.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ClientState::Complete)
    }
}

/// Parse server-first-message: `r=<nonce>,s=<salt>,i=<iterations>[,...]`
fn parse_server_first(msg: &str) -> Result<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|_| GatewayError::Auth("SCRAM: invalid base64 in salt".into()))?,
            );
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = Some(
                value
                    .parse::<u32>()
                    .map_err(|_| GatewayError::Auth("SCRAM: invalid iteration count".into()))?,
            );
        }
    }

    match (nonce, salt, iterations) {
        (Some(n), Some(s), Some(i)) => Ok((n, s, i)),
        _ => Err(GatewayError::Auth(
            "SCRAM: missing required field in server-first".into(),
        )),
    }
}

// ============================================================================
// Primitives
// ============================================================================

/// Generate a random printable nonce.
fn generate_nonce() -> String {
    use rand::Rng;
    let nonce_bytes: [u8; 24] = rand::thread_rng().gen();
    BASE64.encode(nonce_bytes)
}

/// SaltedPassword = PBKDF2-HMAC-SHA256(password, salt, iterations)
fn salt_password(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut salted = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut *salted);
    salted
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}
