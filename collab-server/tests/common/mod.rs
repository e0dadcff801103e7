//! Shared helpers for integration tests.

#![allow(dead_code)]

mod server;

use std::time::Duration;

use collab_core::User;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub use server::TestServer;

/// A connected client socket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn alice() -> User {
    User::new("alice-id")
        .with_email("alice@example.com")
        .with_display_name("Alice")
        .with_provider("test")
}

pub fn bob() -> User {
    User::new("bob-id")
        .with_email("bob@example.com")
        .with_display_name("Bob")
        .with_provider("test")
}

pub fn carol() -> User {
    User::new("carol-id")
        .with_email("carol@example.com")
        .with_display_name("Carol")
        .with_provider("test")
}

/// Open a WebSocket as `user`.
///
/// # Errors
///
/// Returns the handshake error, including HTTP refusals.
pub async fn try_connect(
    url: &str,
    user: &User,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    for (name, value) in [
        ("x-user-id", &user.provider_id),
        ("x-user-email", &user.email),
        ("x-user-name", &user.display_name),
        ("x-user-provider", &user.provider),
    ] {
        if value.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

/// Open a WebSocket as `user`, panicking on failure.
pub async fn connect(url: &str, user: &User) -> WsStream {
    try_connect(url, user)
        .await
        .expect("Failed to connect to WebSocket")
}

/// Helper to receive and parse a JSON message with timeout.
pub async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse JSON");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text message, got {other:?}"),
        }
    }
}

/// Receive messages until one with the given `message_type` arrives.
pub async fn recv_until_type(ws: &mut WsStream, message_type: &str, max_messages: usize) -> Value {
    for _ in 0..max_messages {
        let msg = recv_json(ws).await;
        if msg["message_type"] == message_type {
            return msg;
        }
    }
    panic!("Did not receive message_type={message_type} within {max_messages} messages");
}

/// Assert no text frame arrives within `wait`.
pub async fn expect_silence(ws: &mut WsStream, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(wait, ws.next()).await {
        panic!("Expected no message, got {text}");
    }
}

/// Helper to send a JSON message.
pub async fn send_json(ws: &mut WsStream, value: &Value) {
    let text = serde_json::to_string(value).expect("Failed to serialize");
    ws.send(Message::Text(text))
        .await
        .expect("Failed to send message");
}

/// Read frames until the server closes the socket, returning the close code.
pub async fn recv_close(ws: &mut WsStream) -> Option<u16> {
    loop {
        let next = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}
