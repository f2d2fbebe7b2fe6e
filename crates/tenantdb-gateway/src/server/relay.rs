//! Post-authentication relay between a client and its engine session
//!
//! Two frame pumps run concurrently, one per direction, and whichever side
//! produces the next frame is forwarded first. Frames are re-emitted exactly
//! as received and never coalesced or reordered within a direction. The
//! relay only looks at frame type bytes:
//! - a client `Terminate` ends the session (the engine handle sends its own)
//! - engine `ErrorResponse` frames are counted and logged, then forwarded

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::metrics::GatewayMetrics;
use crate::error::GatewayError;
use crate::protocol::postgres::{
    backend_message_name, is_terminate_command, parse_error_notice, read_message, write_error,
    write_message, ErrorNoticeResponse, MSG_ERROR_RESPONSE, SQLSTATE_ADMIN_SHUTDOWN,
    SQLSTATE_IDLE_SESSION_TIMEOUT,
};

/// Reason a relayed session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent Terminate.
    ClientTerminate,

    /// Client closed the socket.
    ClientDisconnect,

    /// Engine closed its stream.
    EngineDisconnect,

    /// No frame in either direction for the configured duration.
    IdleTimeout {
        /// The configured idle timeout.
        duration: Duration,
    },

    /// Gateway is shutting down.
    Shutdown,

    /// I/O or framing error during relay.
    Error(String),
}

impl DisconnectReason {
    /// Human-readable message for logs.
    pub fn message(&self) -> String {
        match self {
            Self::ClientTerminate => "Client terminated session".to_string(),
            Self::ClientDisconnect => "Client disconnected".to_string(),
            Self::EngineDisconnect => "Engine closed the session".to_string(),
            Self::IdleTimeout { duration } => {
                format!("Session idle for {} seconds", duration.as_secs())
            }
            Self::Shutdown => "Gateway shutting down".to_string(),
            Self::Error(msg) => format!("Relay error: {}", msg),
        }
    }

    /// FATAL notice to send the client before closing, if any.
    pub fn client_notice(&self) -> Option<ErrorNoticeResponse> {
        match self {
            Self::IdleTimeout { .. } => Some(ErrorNoticeResponse::fatal(
                SQLSTATE_IDLE_SESSION_TIMEOUT,
                "terminating connection due to idle-session timeout",
            )),
            Self::Shutdown => Some(ErrorNoticeResponse::fatal(
                SQLSTATE_ADMIN_SHUTDOWN,
                "terminating connection due to administrator command",
            )),
            _ => None,
        }
    }
}

/// Time of the most recent frame in either direction.
struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Relay frames between `client` and `engine` until one side ends the
/// session, the idle timeout fires or shutdown is signalled.
pub async fn relay<C, E>(
    client: &mut C,
    engine: &mut E,
    idle_timeout: Option<Duration>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    metrics: &GatewayMetrics,
) -> DisconnectReason
where
    C: AsyncRead + AsyncWrite + Unpin,
    E: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Starting relay with idle_timeout={:?}", idle_timeout);

    let (mut client_rd, mut client_wr) = split(client);
    let (mut engine_rd, mut engine_wr) = split(engine);
    let activity = ActivityClock::new();

    let reason = {
        let upstream = pump_client(&mut client_rd, &mut engine_wr, &activity, metrics);
        let downstream = pump_engine(&mut engine_rd, &mut client_wr, &activity, metrics);
        let watchdog = idle_watchdog(idle_timeout, &activity);

        tokio::select! {
            reason = upstream => reason,
            reason = downstream => reason,
            duration = watchdog => DisconnectReason::IdleTimeout { duration },
            _ = shutdown_rx.recv() => DisconnectReason::Shutdown,
        }
    };

    if let Some(notice) = reason.client_notice() {
        if let Err(e) = write_error(&mut client_wr, &notice).await {
            debug!("Failed to deliver disconnect notice: {}", e);
        }
    }

    debug!("Relay ended: {}", reason.message());
    reason
}

async fn pump_client<R, W>(
    reader: &mut R,
    engine: &mut W,
    activity: &ActivityClock,
    metrics: &GatewayMetrics,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (msg_type, payload) = match read_message(reader).await {
            Ok(frame) => frame,
            Err(e) => return classify(e, DisconnectReason::ClientDisconnect),
        };
        activity.touch();

        if is_terminate_command(msg_type) {
            return DisconnectReason::ClientTerminate;
        }

        if let Err(e) = write_message(engine, msg_type, &payload).await {
            return classify(e, DisconnectReason::EngineDisconnect);
        }
        metrics.frame_to_engine();
    }
}

async fn pump_engine<R, W>(
    reader: &mut R,
    client: &mut W,
    activity: &ActivityClock,
    metrics: &GatewayMetrics,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (msg_type, payload) = match read_message(reader).await {
            Ok(frame) => frame,
            Err(e) => return classify(e, DisconnectReason::EngineDisconnect),
        };
        activity.touch();

        if msg_type == MSG_ERROR_RESPONSE {
            metrics.engine_error_relayed();
            match parse_error_notice(&payload) {
                Ok(notice) => debug!(
                    "Engine reported {}: {}",
                    notice.code().unwrap_or("?????"),
                    notice.message().unwrap_or("")
                ),
                Err(_) => debug!("Engine sent an unparseable {}", backend_message_name(msg_type)),
            }
        }

        if let Err(e) = write_message(client, msg_type, &payload).await {
            return classify(e, DisconnectReason::ClientDisconnect);
        }
        metrics.frame_to_client();
    }
}

async fn idle_watchdog(limit: Option<Duration>, activity: &ActivityClock) -> Duration {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            return limit;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Map a pump error to a reason; a closed peer maps to `closed`.
fn classify(err: GatewayError, closed: DisconnectReason) -> DisconnectReason {
    match &err {
        GatewayError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) =>
        {
            closed
        }
        _ => DisconnectReason::Error(err.to_string()),
    }
}
