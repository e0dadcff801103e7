//! WebSocket connection handling.
//!
//! Each accepted socket is split into a read pump, which runs in the upgrade
//! task and forwards frames to the session, and a write pump, which drains the
//! connection's outbound queue and sends keepalive pings.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use collab_core::{Role, User};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::hub::{Hub, HubError};
use crate::metrics::{
    dec_ws_connections, inc_ws_connections, record_rate_limited, record_validation_failure,
};
use crate::protocol::{codes, ServerMessage};
use crate::ratelimit::{RateLimiter, DEFAULT_RATE_LIMIT_BURST, DEFAULT_RATE_LIMIT_SUSTAINED};
use crate::session::{ClientHandle, ConnectionId, Outbound, DEFAULT_CLIENT_BUFFER};
use crate::validation::{validate_message_size, DEFAULT_MAX_MESSAGE_SIZE};

/// Default interval between keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long a single socket write may take before the connection is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue capacity.
    pub client_buffer: usize,
    /// Largest accepted text frame, in bytes.
    pub max_message_size: usize,
    /// Rate limiter burst.
    pub rate_limit_burst: u32,
    /// Rate limiter sustained messages per second.
    pub rate_limit_sustained: u32,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_buffer: DEFAULT_CLIENT_BUFFER,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            rate_limit_sustained: DEFAULT_RATE_LIMIT_SUSTAINED,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Which session a connection wants.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    /// Diagram id.
    pub diagram_id: String,
    /// Threat model id, empty for unscoped diagrams.
    pub threat_model_id: String,
}

/// Handle an upgraded collaboration socket until it closes.
pub async fn handle_collab_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    target: SessionTarget,
    user: User,
    role: Role,
    config: ConnectionConfig,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(config.client_buffer.max(1));
    let local = tx.downgrade();
    let client = ClientHandle::new(user.clone(), role, tx);
    let connection_id = client.connection_id;

    let session = match hub
        .join(&target.diagram_id, &target.threat_model_id, client)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(
                diagram_id = %target.diagram_id,
                user_id = %user.user_id(),
                error = %e,
                "Join refused"
            );
            let code = match &e {
                HubError::Join(rejection) => rejection.code(),
                HubError::DiagramNotFound(_) | HubError::ThreatModelMismatch { .. } => {
                    codes::INVALID_REQUEST
                }
                HubError::Store(_) => codes::INTERNAL_ERROR,
            };
            refuse(&mut sink, code, &e.to_string()).await;
            return;
        }
    };

    inc_ws_connections();
    tracing::info!(
        connection_id = %connection_id,
        diagram_id = %target.diagram_id,
        user_id = %user.user_id(),
        "Collaboration socket connected"
    );

    let mut writer = tokio::spawn(write_pump(sink, rx, config.ping_interval, connection_id));
    let mut writer_done = false;
    let mut rate_limiter = RateLimiter::new(config.rate_limit_burst, config.rate_limit_sustained);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(wait) = rate_limiter.check() {
                        tracing::warn!(connection_id = %connection_id, "Rate limit exceeded");
                        record_rate_limited("websocket");
                        let message = format!(
                            "Rate limit exceeded. Retry after {}ms",
                            wait.as_millis()
                        );
                        notify(&local, &ServerMessage::error(codes::RATE_LIMITED, message));
                        continue;
                    }

                    if let Err(e) = validate_message_size(text.len(), config.max_message_size) {
                        tracing::warn!(connection_id = %connection_id, "Message rejected: {}", e);
                        record_validation_failure("message_size");
                        notify(&local, &ServerMessage::error(codes::MESSAGE_TOO_LARGE, e.to_string()));
                        continue;
                    }

                    if session.deliver(connection_id, text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    notify(
                        &local,
                        &ServerMessage::error(codes::INVALID_MESSAGE, "Binary frames are not supported"),
                    );
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, "WebSocket read error: {}", e);
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    session.unregister(connection_id).await;
    drop(local);
    if !writer_done && tokio::time::timeout(WRITE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    dec_ws_connections();
    tracing::info!(connection_id = %connection_id, user_id = %user.user_id(), "Collaboration socket disconnected");
}

/// Queue a frame for this connection without going through the session.
fn notify(local: &mpsc::WeakSender<Outbound>, message: &ServerMessage) {
    let Some(sender) = local.upgrade() else {
        return;
    };
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = sender.try_send(Outbound::Text(Utf8Bytes::from(json)));
        }
        Err(e) => tracing::error!("Failed to serialize message: {}", e),
    }
}

/// Send an error frame and close a socket that never joined a session.
async fn refuse(sink: &mut SplitSink<WebSocket, Message>, code: &str, message: &str) {
    if let Ok(json) = serde_json::to_string(&ServerMessage::error(code, message)) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static("join refused"),
        })))
        .await;
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    ping_interval: Duration,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Text(text)) => Message::Text(text),
                Some(Outbound::Close { code, reason }) => {
                    close(&mut sink, code, reason).await;
                    return;
                }
                None => {
                    close(&mut sink, close_code::NORMAL, "session ended").await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, "WebSocket write failed: {}", e);
                return;
            }
            Err(_) => {
                tracing::warn!(connection_id = %connection_id, "WebSocket write timed out");
                return;
            }
        }
    }
}

async fn close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }));
    let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connection_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.client_buffer, 256);
        assert_eq!(config.max_message_size, 65_536);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_notify_uses_weak_sender() {
        let (tx, mut rx) = mpsc::channel(4);
        let weak = tx.downgrade();
        notify(&weak, &ServerMessage::error(codes::RATE_LIMITED, "slow down"));
        match rx.recv().await {
            Some(Outbound::Text(text)) => assert!(text.as_str().contains("rate_limited")),
            other => panic!("Expected text frame, got {other:?}"),
        }

        drop(tx);
        notify(&weak, &ServerMessage::error(codes::RATE_LIMITED, "gone"));
        assert!(rx.recv().await.is_none());
    }
}
