//! PostgreSQL message codec (read/write/parse/build)
//!
//! Frames are read and written whole: a type byte, a length that includes
//! itself, and the payload. The relay forwards frames exactly as read.

use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, Result};

use super::constants::*;
use super::messages::*;

// ============================================================================
// Constants
// ============================================================================

/// Maximum message size (100MB, protocol allows up to 1GB)
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Minimum message length (just the 4-byte length field)
pub const MIN_MESSAGE_LENGTH: u32 = 4;

/// Maximum startup packet size, as enforced by PostgreSQL itself
pub const MAX_STARTUP_PACKET_LENGTH: u32 = 10_000;

// ============================================================================
// Low-Level Helpers
// ============================================================================

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0])
}

async fn read_u32_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a null-terminated string from a buffer at the given offset.
/// Returns the string and the number of bytes consumed (including null).
fn read_cstring_from_buf(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let rest = buf
        .get(offset..)
        .ok_or_else(|| GatewayError::Protocol("String offset out of bounds".into()))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| GatewayError::Protocol("Missing null terminator in string".into()))?;

    let s = std::str::from_utf8(&rest[..end])
        .map_err(|_| GatewayError::Protocol("Invalid UTF-8 in string".into()))?;

    Ok((s.to_string(), end + 1))
}

/// Read a big-endian u32 from a buffer at the given offset.
fn u32_at(buf: &[u8], offset: usize, what: &str) -> Result<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| GatewayError::Protocol(format!("{} truncated", what)))
}

fn push_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

// ============================================================================
// Message Reading
// ============================================================================

/// Read the first packet of a connection.
///
/// Startup packets have no type byte: Length (4) + Version/Code (4) + Data.
pub async fn read_startup_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<StartupPacket> {
    let length = read_u32_be(reader).await?;

    if length < 8 {
        return Err(GatewayError::Protocol(format!(
            "Startup message too short: {} bytes",
            length
        )));
    }
    if length > MAX_STARTUP_PACKET_LENGTH {
        return Err(GatewayError::Protocol(format!(
            "Startup message too large: {} bytes",
            length
        )));
    }

    let code = read_u32_be(reader).await?;

    match code {
        SSL_REQUEST_CODE | GSSENC_REQUEST_CODE if length != 8 => {
            return Err(GatewayError::Protocol(format!(
                "Encryption request with invalid length: {}",
                length
            )));
        }
        SSL_REQUEST_CODE => return Ok(StartupPacket::SslRequest),
        GSSENC_REQUEST_CODE => return Ok(StartupPacket::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            if length != 16 {
                return Err(GatewayError::Protocol(format!(
                    "CancelRequest with invalid length: {}",
                    length
                )));
            }
            let process_id = read_u32_be(reader).await?;
            let secret_key = read_u32_be(reader).await?;
            return Ok(StartupPacket::CancelRequest(CancelRequest {
                process_id,
                secret_key,
            }));
        }
        PROTOCOL_VERSION_3_0 => {}
        _ => {
            return Err(GatewayError::Protocol(format!(
                "Unsupported protocol version: {} (expected {})",
                code, PROTOCOL_VERSION_3_0
            )));
        }
    }

    let mut buf = vec![0u8; (length - 8) as usize];
    reader.read_exact(&mut buf).await?;

    // Null-terminated key/value pairs, ending with an empty key
    let mut parameters = HashMap::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (key, key_len) = read_cstring_from_buf(&buf, offset)?;
        offset += key_len;
        if key.is_empty() {
            break;
        }
        if offset >= buf.len() {
            return Err(GatewayError::Protocol("Missing value for parameter".into()));
        }
        let (value, value_len) = read_cstring_from_buf(&buf, offset)?;
        offset += value_len;
        parameters.insert(key, value);
    }

    Ok(StartupPacket::Startup(StartupMessage {
        protocol_version: code,
        parameters,
    }))
}

/// Read a typed message (type byte + length + payload).
///
/// Returns the message type byte and the payload (without the length).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let msg_type = read_u8(reader).await?;
    let length = read_u32_be(reader).await?;

    if length < MIN_MESSAGE_LENGTH {
        return Err(GatewayError::Protocol(format!(
            "Invalid message length: {}",
            length
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(GatewayError::Protocol(format!(
            "Message too large: {} bytes (max: {})",
            length, MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; (length - 4) as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok((msg_type, payload))
}

// ============================================================================
// Message Writing
// ============================================================================

/// Encode a typed message into a single buffer.
pub fn encode_message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(msg_type);
    frame.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Write a typed message (type byte + length + payload) and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> Result<()> {
    writer.write_all(&encode_message(msg_type, payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a FATAL/ERROR notice.
pub async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &ErrorNoticeResponse,
) -> Result<()> {
    write_message(writer, MSG_ERROR_RESPONSE, &build_error_response(response)).await
}

/// Write an authentication request.
pub async fn write_authentication<W: AsyncWrite + Unpin>(
    writer: &mut W,
    auth: &AuthenticationMessage,
) -> Result<()> {
    write_message(writer, MSG_AUTH_REQUEST, &build_authentication(auth)).await
}

/// Write a startup message (engine side or test clients).
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &StartupMessage,
) -> Result<()> {
    let mut content = Vec::new();
    content.extend_from_slice(&msg.protocol_version.to_be_bytes());
    for (key, value) in &msg.parameters {
        push_cstring(&mut content, key);
        push_cstring(&mut content, value);
    }
    content.push(0);

    let length = (content.len() + 4) as u32;
    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&content).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an SSL request.
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&SSLRequest::LENGTH.to_be_bytes());
    buf[4..].copy_from_slice(&SSLRequest::CODE.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Message Parsing (from payload)
// ============================================================================

/// Parse an authentication message from payload.
pub fn parse_authentication(payload: &[u8]) -> Result<AuthenticationMessage> {
    let auth_type = u32_at(payload, 0, "Authentication message")?;
    let body = &payload[4..];

    match auth_type {
        AUTH_OK => Ok(AuthenticationMessage::Ok),
        AUTH_CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
        AUTH_MD5_PASSWORD => {
            let salt: [u8; 4] = body
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| GatewayError::Protocol("MD5 auth message missing salt".into()))?;
            Ok(AuthenticationMessage::Md5Password { salt })
        }
        AUTH_SASL => {
            let mut mechanisms = Vec::new();
            let mut offset = 0;
            while offset < body.len() {
                let (mechanism, len) = read_cstring_from_buf(body, offset)?;
                offset += len;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            Ok(AuthenticationMessage::Sasl { mechanisms })
        }
        AUTH_SASL_CONTINUE => Ok(AuthenticationMessage::SaslContinue {
            data: body.to_vec(),
        }),
        AUTH_SASL_FINAL => Ok(AuthenticationMessage::SaslFinal {
            data: body.to_vec(),
        }),
        other => Ok(AuthenticationMessage::Other(other)),
    }
}

/// Parse a SASLInitialResponse ('p' during SASL) from payload.
///
/// Format: mechanism (cstring) + data length (i32, -1 for none) + data
pub fn parse_sasl_initial_response(payload: &[u8]) -> Result<SASLInitialResponse> {
    let (mechanism, offset) = read_cstring_from_buf(payload, 0)?;
    let len = u32_at(payload, offset, "SASLInitialResponse")? as i32;
    let start = offset + 4;

    let data = if len < 0 {
        None
    } else {
        let end = start + len as usize;
        let bytes = payload.get(start..end).ok_or_else(|| {
            GatewayError::Protocol("SASLInitialResponse data truncated".into())
        })?;
        Some(bytes.to_vec())
    };

    Ok(SASLInitialResponse { mechanism, data })
}

/// Parse an error/notice response from payload.
pub fn parse_error_notice(payload: &[u8]) -> Result<ErrorNoticeResponse> {
    let mut response = ErrorNoticeResponse::new();
    let mut offset = 0;

    while offset < payload.len() {
        let field_type = payload[offset];
        offset += 1;
        if field_type == 0 {
            break;
        }
        let (value, len) = read_cstring_from_buf(payload, offset)?;
        offset += len;
        response.set_field(field_type, &value);
    }

    Ok(response)
}

/// Parse a parameter status message from payload.
pub fn parse_parameter_status(payload: &[u8]) -> Result<ParameterStatus> {
    let (name, name_len) = read_cstring_from_buf(payload, 0)?;
    let (value, _) = read_cstring_from_buf(payload, name_len)?;
    Ok(ParameterStatus { name, value })
}

/// Parse a backend key data message from payload.
pub fn parse_backend_key_data(payload: &[u8]) -> Result<BackendKeyData> {
    Ok(BackendKeyData {
        process_id: u32_at(payload, 0, "BackendKeyData")?,
        secret_key: u32_at(payload, 4, "BackendKeyData")?,
    })
}

/// Parse a ready for query message from payload.
pub fn parse_ready_for_query(payload: &[u8]) -> Result<ReadyForQuery> {
    let byte = *payload
        .first()
        .ok_or_else(|| GatewayError::Protocol("ReadyForQuery message too short".into()))?;

    let status = TransactionStatus::from_byte(byte).ok_or_else(|| {
        GatewayError::Protocol(format!("Invalid transaction status: {:02X}", byte))
    })?;

    Ok(ReadyForQuery {
        transaction_status: status,
    })
}

/// Parse a row description message from payload.
pub fn parse_row_description(payload: &[u8]) -> Result<RowDescription> {
    let count = payload
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
        .ok_or_else(|| GatewayError::Protocol("RowDescription message too short".into()))?;

    let mut fields = Vec::with_capacity(count);
    let mut offset = 2;

    for _ in 0..count {
        let (name, name_len) = read_cstring_from_buf(payload, offset)?;
        offset += name_len;

        let b = payload
            .get(offset..offset + 18)
            .ok_or_else(|| GatewayError::Protocol("RowDescription field data truncated".into()))?;
        offset += 18;

        fields.push(FieldDescription {
            name,
            table_oid: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            column_id: u16::from_be_bytes([b[4], b[5]]),
            type_oid: u32::from_be_bytes([b[6], b[7], b[8], b[9]]),
            type_size: i16::from_be_bytes([b[10], b[11]]),
            type_modifier: i32::from_be_bytes([b[12], b[13], b[14], b[15]]),
            format: i16::from_be_bytes([b[16], b[17]]),
        });
    }

    Ok(RowDescription { fields })
}

/// Parse a data row message from payload.
pub fn parse_data_row(payload: &[u8]) -> Result<DataRow> {
    let count = payload
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
        .ok_or_else(|| GatewayError::Protocol("DataRow message too short".into()))?;

    let mut values = Vec::with_capacity(count);
    let mut offset = 2;

    for _ in 0..count {
        let len = u32_at(payload, offset, "DataRow value length")? as i32;
        offset += 4;

        if len == -1 {
            values.push(None);
            continue;
        }
        let end = offset + len as usize;
        let value = payload
            .get(offset..end)
            .ok_or_else(|| GatewayError::Protocol("DataRow value data truncated".into()))?;
        values.push(Some(value.to_vec()));
        offset = end;
    }

    Ok(DataRow { values })
}

/// Parse a command complete message from payload.
pub fn parse_command_complete(payload: &[u8]) -> Result<CommandComplete> {
    let (tag, _) = read_cstring_from_buf(payload, 0)?;
    Ok(CommandComplete { tag })
}

/// Parse a simple query ('Q') payload.
pub fn parse_query(payload: &[u8]) -> Result<String> {
    let (query, _) = read_cstring_from_buf(payload, 0)?;
    Ok(query)
}

// ============================================================================
// Message Building (to payload)
// ============================================================================

/// Build an authentication request payload.
pub fn build_authentication(auth: &AuthenticationMessage) -> Vec<u8> {
    let mut payload = auth.type_code().to_be_bytes().to_vec();
    match auth {
        AuthenticationMessage::Md5Password { salt } => payload.extend_from_slice(salt),
        AuthenticationMessage::Sasl { mechanisms } => {
            for mechanism in mechanisms {
                push_cstring(&mut payload, mechanism);
            }
            payload.push(0);
        }
        AuthenticationMessage::SaslContinue { data }
        | AuthenticationMessage::SaslFinal { data } => payload.extend_from_slice(data),
        AuthenticationMessage::Ok
        | AuthenticationMessage::CleartextPassword
        | AuthenticationMessage::Other(_) => {}
    }
    payload
}

/// Build a SASL initial response payload.
pub fn build_sasl_initial_response(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    push_cstring(&mut payload, mechanism);

    if data.is_empty() {
        payload.extend_from_slice(&(-1i32).to_be_bytes());
    } else {
        payload.extend_from_slice(&(data.len() as i32).to_be_bytes());
        payload.extend_from_slice(data);
    }

    payload
}

/// Build an error/notice response payload.
pub fn build_error_response(response: &ErrorNoticeResponse) -> Vec<u8> {
    let mut payload = Vec::new();
    for (field_type, value) in &response.fields {
        payload.push(*field_type);
        push_cstring(&mut payload, value);
    }
    payload.push(0);
    payload
}

/// Build a parameter status payload.
pub fn build_parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    push_cstring(&mut payload, name);
    push_cstring(&mut payload, value);
    payload
}

/// Build a backend key data payload.
pub fn build_backend_key_data(key: &BackendKeyData) -> Vec<u8> {
    let mut payload = key.process_id.to_be_bytes().to_vec();
    payload.extend_from_slice(&key.secret_key.to_be_bytes());
    payload
}

/// Build a simple query payload.
pub fn build_query(query: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    push_cstring(&mut payload, query);
    payload
}

/// Build a ready for query payload.
pub fn build_ready_for_query(status: TransactionStatus) -> Vec<u8> {
    vec![status.to_byte()]
}

/// Build a row description payload.
pub fn build_row_description(description: &RowDescription) -> Vec<u8> {
    let mut payload = (description.fields.len() as u16).to_be_bytes().to_vec();
    for field in &description.fields {
        push_cstring(&mut payload, &field.name);
        payload.extend_from_slice(&field.table_oid.to_be_bytes());
        payload.extend_from_slice(&field.column_id.to_be_bytes());
        payload.extend_from_slice(&field.type_oid.to_be_bytes());
        payload.extend_from_slice(&field.type_size.to_be_bytes());
        payload.extend_from_slice(&field.type_modifier.to_be_bytes());
        payload.extend_from_slice(&field.format.to_be_bytes());
    }
    payload
}

/// Build a data row payload.
pub fn build_data_row(row: &DataRow) -> Vec<u8> {
    let mut payload = (row.values.len() as u16).to_be_bytes().to_vec();
    for value in &row.values {
        match value {
            Some(bytes) => {
                payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                payload.extend_from_slice(bytes);
            }
            None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    payload
}

/// Build a command complete payload.
pub fn build_command_complete(tag: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    push_cstring(&mut payload, tag);
    payload
}
