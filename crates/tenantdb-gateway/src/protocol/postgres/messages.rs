//! PostgreSQL protocol message structures
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::collections::HashMap;

use super::constants::*;

// ============================================================================
// Startup Messages (no type byte)
// ============================================================================

/// PostgreSQL startup message sent by client to initiate connection.
///
/// Format: Length (4) + Protocol Version (4) + Parameters (null-terminated pairs) + \0
#[derive(Debug, Clone)]
pub struct StartupMessage {
    /// Protocol version (196608 for v3.0)
    pub protocol_version: u32,
    /// Connection parameters (user, database, options, etc.)
    pub parameters: HashMap<String, String>,
}

impl StartupMessage {
    /// Create a new startup message with the given user.
    pub fn new(user: &str) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("user".to_string(), user.to_string());
        Self {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters,
        }
    }

    /// Create a startup message with user and database.
    pub fn with_database(user: &str, database: &str) -> Self {
        let mut msg = Self::new(user);
        msg.set_parameter("database", database);
        msg
    }

    /// Get the username from parameters.
    pub fn user(&self) -> Option<&str> {
        self.parameter("user")
    }

    /// Get the database name from parameters.
    pub fn database(&self) -> Option<&str> {
        self.parameter("database")
    }

    /// Get any parameter by name.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    /// Set a parameter.
    pub fn set_parameter(&mut self, key: &str, value: &str) {
        self.parameters.insert(key.to_string(), value.to_string());
    }
}

/// SSL request message - requests SSL upgrade before startup.
///
/// Format: Length (4, always 8) + SSL Code (4, always 80877103)
#[derive(Debug, Clone, Copy)]
pub struct SSLRequest;

impl SSLRequest {
    /// The fixed length of an SSL request (8 bytes)
    pub const LENGTH: u32 = 8;

    /// The SSL request code
    pub const CODE: u32 = SSL_REQUEST_CODE;
}

/// Cancel request message - requests cancellation of a running query.
///
/// Format: Length (4, always 16) + Cancel Code (4) + Process ID (4) + Secret Key (4)
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    /// Backend process ID
    pub process_id: u32,
    /// Secret key for this connection
    pub secret_key: u32,
}

/// First packet on a new connection.
#[derive(Debug)]
pub enum StartupPacket {
    /// Regular startup message with connection parameters
    Startup(StartupMessage),
    /// SSL upgrade request
    SslRequest,
    /// GSSAPI encryption request
    GssEncRequest,
    /// Query cancellation request
    CancelRequest(CancelRequest),
}

// ============================================================================
// Authentication Messages
// ============================================================================

/// Authentication request/response (type 'R').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication successful (type 0)
    Ok,

    /// Cleartext password required (type 3)
    CleartextPassword,

    /// MD5 password required (type 5)
    Md5Password {
        /// 4-byte salt for MD5 hash
        salt: [u8; 4],
    },

    /// SASL authentication required (type 10), listing mechanisms
    Sasl {
        /// Available SASL mechanism names
        mechanisms: Vec<String>,
    },

    /// SASL continuation (type 11), carrying the server-first-message
    SaslContinue {
        /// Server challenge data
        data: Vec<u8>,
    },

    /// SASL final (type 12), carrying the server signature
    SaslFinal {
        /// Server signature data
        data: Vec<u8>,
    },

    /// Any other method (GSS, SSPI, ...); the gateway never supports these
    Other(u32),
}

impl AuthenticationMessage {
    /// Check if this is a successful authentication.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// The numeric authentication type code.
    pub fn type_code(&self) -> u32 {
        match self {
            Self::Ok => AUTH_OK,
            Self::CleartextPassword => AUTH_CLEARTEXT_PASSWORD,
            Self::Md5Password { .. } => AUTH_MD5_PASSWORD,
            Self::Sasl { .. } => AUTH_SASL,
            Self::SaslContinue { .. } => AUTH_SASL_CONTINUE,
            Self::SaslFinal { .. } => AUTH_SASL_FINAL,
            Self::Other(code) => *code,
        }
    }
}

/// SASL initial response message (sent via 'p' message).
#[derive(Debug, Clone)]
pub struct SASLInitialResponse {
    /// Selected SASL mechanism name
    pub mechanism: String,
    /// Client-first-message data (`None` when the length field is -1)
    pub data: Option<Vec<u8>>,
}

// ============================================================================
// Server Information Messages
// ============================================================================

/// Backend key data message (type 'K').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    /// Backend process ID
    pub process_id: u32,
    /// Secret key for cancellation
    pub secret_key: u32,
}

/// Parameter status message (type 'S').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: String,
}

/// Ready for query message (type 'Z').
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// Current transaction status
    pub transaction_status: TransactionStatus,
}

/// Transaction status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in transaction)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Create from the status byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            TXN_STATUS_IDLE => Some(Self::Idle),
            TXN_STATUS_IN_TRANSACTION => Some(Self::InTransaction),
            TXN_STATUS_FAILED => Some(Self::Failed),
            _ => None,
        }
    }

    /// Convert to status byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Idle => TXN_STATUS_IDLE,
            Self::InTransaction => TXN_STATUS_IN_TRANSACTION,
            Self::Failed => TXN_STATUS_FAILED,
        }
    }
}

// ============================================================================
// Error/Notice Messages
// ============================================================================

/// Error or notice response message (types 'E' and 'N').
///
/// Fields are kept in insertion order so generated notices always go out
/// as severity, code, message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorNoticeResponse {
    /// Error/notice fields as (field type byte, value)
    pub fields: Vec<(u8, String)>,
}

impl ErrorNoticeResponse {
    /// Create a new empty error/notice response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an error response with the basic fields.
    pub fn error(severity: &str, code: &str, message: &str) -> Self {
        let mut resp = Self::new();
        resp.set_field(ERROR_FIELD_SEVERITY, severity);
        resp.set_field(ERROR_FIELD_SEVERITY_V, severity);
        resp.set_field(ERROR_FIELD_CODE, code);
        resp.set_field(ERROR_FIELD_MESSAGE, message);
        resp
    }

    /// Create a FATAL error response.
    pub fn fatal(code: &str, message: &str) -> Self {
        Self::error("FATAL", code, message)
    }

    /// Get the severity (S field).
    pub fn severity(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_SEVERITY)
    }

    /// Get the SQLSTATE code (C field).
    pub fn code(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_CODE)
    }

    /// Get the message (M field).
    pub fn message(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_MESSAGE)
    }

    /// Get the detail (D field).
    pub fn detail(&self) -> Option<&str> {
        self.get_field(ERROR_FIELD_DETAIL)
    }

    /// Check if this is a FATAL error.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Some("FATAL")
    }

    /// Set a field by type byte, replacing an existing value.
    pub fn set_field(&mut self, field_type: u8, value: &str) {
        match self.fields.iter_mut().find(|(t, _)| *t == field_type) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.fields.push((field_type, value.to_string())),
        }
    }

    /// Get a field by type byte.
    pub fn get_field(&self, field_type: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type)
            .map(|(_, v)| v.as_str())
    }
}

// ============================================================================
// Common Error Responses
// ============================================================================

impl ErrorNoticeResponse {
    /// Connection exception (08000): routing, lookup and method refusals.
    pub fn connection_exception(message: &str) -> Self {
        Self::fatal(SQLSTATE_CONNECTION_EXCEPTION, message)
    }

    /// Authentication failed error (28P01).
    pub fn authentication_failed(user: &str) -> Self {
        Self::fatal(
            SQLSTATE_INVALID_PASSWORD,
            &format!("password authentication failed for user \"{}\"", user),
        )
    }

    /// Internal gateway error (XX000).
    pub fn internal_error(message: &str) -> Self {
        Self::fatal(SQLSTATE_INTERNAL_ERROR, message)
    }

    /// Protocol violation (08P01).
    pub fn protocol_error(message: &str) -> Self {
        Self::fatal(SQLSTATE_PROTOCOL_VIOLATION, message)
    }
}

// ============================================================================
// Query Messages
// ============================================================================

/// Command complete message (type 'C').
#[derive(Debug, Clone)]
pub struct CommandComplete {
    /// Command tag (e.g., "SELECT 5", "CREATE ROLE")
    pub tag: String,
}

/// Row description message (type 'T').
#[derive(Debug, Clone)]
pub struct RowDescription {
    /// Field descriptions
    pub fields: Vec<FieldDescription>,
}

/// Description of a single field/column.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: u32,
    /// Column attribute number (0 if not a table column)
    pub column_id: u16,
    /// Data type OID
    pub type_oid: u32,
    /// Data type size (-1 for variable)
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code (0 = text, 1 = binary)
    pub format: i16,
}

impl FieldDescription {
    /// A text-format column of type `text` (OID 25).
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table_oid: 0,
            column_id: 0,
            type_oid: 25,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// Data row message (type 'D').
#[derive(Debug, Clone)]
pub struct DataRow {
    /// Column values (None = NULL)
    pub values: Vec<Option<Vec<u8>>>,
}

impl DataRow {
    /// Column `index` decoded as UTF-8 text; NULL and invalid text give `None`.
    pub fn text(&self, index: usize) -> Option<&str> {
        self.values
            .get(index)?
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}
