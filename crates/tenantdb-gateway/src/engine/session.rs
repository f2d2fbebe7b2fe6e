//! Wire-level session with an engine instance

use tokio::io::AsyncWriteExt;

use super::EngineStream;
use crate::error::{GatewayError, Result};
use crate::protocol::postgres::{
    build_query, parse_authentication, parse_command_complete, parse_data_row, parse_error_notice,
    parse_parameter_status, parse_row_description, read_message, write_message,
    write_startup_message, AuthenticationMessage, DataRow, StartupMessage, MSG_AUTH_REQUEST,
    MSG_BACKEND_KEY_DATA, MSG_COMMAND_COMPLETE, MSG_DATA_ROW, MSG_EMPTY_QUERY, MSG_ERROR_RESPONSE,
    MSG_NOTICE_RESPONSE, MSG_PARAMETER_STATUS, MSG_QUERY, MSG_READY_FOR_QUERY,
    MSG_ROW_DESCRIPTION, MSG_TERMINATE,
};

/// Rows and tags returned by a simple query.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<DataRow>,
    pub tags: Vec<String>,
}

/// An authenticated engine connection.
///
/// Instances trust local connections, so startup expects `AuthenticationOk`
/// straight away.
pub struct EngineSession {
    stream: EngineStream,
    role: String,
    /// ParameterStatus and BackendKeyData frames seen during startup
    startup_frames: Vec<(u8, Vec<u8>)>,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("role", &self.role)
            .field("startup_frames", &self.startup_frames.len())
            .finish()
    }
}

impl EngineSession {
    /// Run the startup exchange as `role` on `database`.
    pub async fn open(mut stream: EngineStream, role: &str, database: &str) -> Result<Self> {
        write_startup_message(&mut stream, &StartupMessage::with_database(role, database)).await?;

        let mut startup_frames = Vec::new();
        loop {
            let (msg_type, payload) = read_message(&mut stream).await?;
            match msg_type {
                MSG_AUTH_REQUEST => match parse_authentication(&payload)? {
                    AuthenticationMessage::Ok => {}
                    other => {
                        return Err(GatewayError::Engine(format!(
                            "engine requested authentication type {} for {}",
                            other.type_code(),
                            role
                        )))
                    }
                },
                MSG_PARAMETER_STATUS | MSG_BACKEND_KEY_DATA => {
                    startup_frames.push((msg_type, payload));
                }
                MSG_NOTICE_RESPONSE => {}
                MSG_ERROR_RESPONSE => {
                    let notice = parse_error_notice(&payload)?;
                    return Err(GatewayError::Engine(format!(
                        "engine rejected {}: {}",
                        role,
                        notice.message().unwrap_or("unknown error")
                    )));
                }
                MSG_READY_FOR_QUERY => break,
                other => {
                    return Err(GatewayError::Protocol(format!(
                        "unexpected engine message '{}' during startup",
                        other as char
                    )))
                }
            }
        }

        trace!("Engine session open as {}", role);
        Ok(Self {
            stream,
            role: role.to_string(),
            startup_frames,
        })
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// ParameterStatus and BackendKeyData frames, in arrival order.
    pub fn startup_frames(&self) -> &[(u8, Vec<u8>)] {
        &self.startup_frames
    }

    /// Value of a ParameterStatus reported at startup.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.startup_frames
            .iter()
            .filter(|(t, _)| *t == MSG_PARAMETER_STATUS)
            .filter_map(|(_, p)| parse_parameter_status(p).ok())
            .find(|s| s.name == name)
            .map(|s| s.value)
    }

    /// Run one simple query and collect its result.
    ///
    /// An engine error is returned after the engine is ready again, so the
    /// session stays usable.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        write_message(&mut self.stream, MSG_QUERY, &build_query(sql)).await?;

        let mut result = QueryResult::default();
        let mut error = None;
        loop {
            let (msg_type, payload) = read_message(&mut self.stream).await?;
            match msg_type {
                MSG_ROW_DESCRIPTION => {
                    result.columns = parse_row_description(&payload)?
                        .fields
                        .into_iter()
                        .map(|f| f.name)
                        .collect();
                }
                MSG_DATA_ROW => result.rows.push(parse_data_row(&payload)?),
                MSG_COMMAND_COMPLETE => result.tags.push(parse_command_complete(&payload)?.tag),
                MSG_ERROR_RESPONSE => {
                    let notice = parse_error_notice(&payload)?;
                    error = Some(notice.message().unwrap_or("unknown error").to_string());
                }
                MSG_READY_FOR_QUERY => break,
                MSG_EMPTY_QUERY | MSG_NOTICE_RESPONSE | MSG_PARAMETER_STATUS => {}
                other => {
                    return Err(GatewayError::Protocol(format!(
                        "unexpected engine message '{}' in query response",
                        other as char
                    )))
                }
            }
        }

        match error {
            Some(message) => Err(GatewayError::Engine(message)),
            None => Ok(result),
        }
    }

    /// The underlying stream, for relaying.
    pub fn stream_mut(&mut self) -> &mut EngineStream {
        &mut self.stream
    }

    /// Send Terminate and shut the stream down.
    pub async fn close(mut self) -> Result<()> {
        write_message(&mut self.stream, MSG_TERMINATE, &[]).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
