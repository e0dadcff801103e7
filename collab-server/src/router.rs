//! Inbound message classification.
//!
//! Every text frame is parsed once here: the `message_type` is peeked,
//! deprecated and server-only names are refused, and the remaining payload is
//! decoded into a typed [`ClientMessage`].

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{
    codes, ClientMessage, CLIENT_MESSAGE_TYPES, DEPRECATED_MESSAGE_TYPES,
    SERVER_ONLY_MESSAGE_TYPES,
};

/// Why an inbound frame could not be routed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Not a JSON object carrying a string `message_type`.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Superseded message type.
    #[error("message type '{0}' is deprecated, use its _request form")]
    Deprecated(String),
    /// Type reserved for server-to-client frames.
    #[error("message type '{0}' cannot be sent by clients")]
    ServerOnly(String),
    /// Type nobody handles.
    #[error("unsupported message type '{0}'")]
    Unsupported(String),
    /// Known type whose payload failed to decode.
    #[error("invalid {message_type} payload: {reason}")]
    InvalidPayload {
        /// The declared type.
        message_type: String,
        /// Decoder error.
        reason: String,
    },
}

impl RouteError {
    /// Error code sent back to the client.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::InvalidPayload { .. } => codes::INVALID_MESSAGE,
            Self::Deprecated(_) => codes::DEPRECATED_MESSAGE_TYPE,
            Self::ServerOnly(_) => codes::INVALID_MESSAGE_TYPE,
            Self::Unsupported(_) => codes::UNSUPPORTED_MESSAGE_TYPE,
        }
    }
}

/// Parse and classify one inbound frame.
///
/// # Errors
///
/// Returns a [`RouteError`] describing why the frame cannot be dispatched.
pub fn route(raw: &str) -> Result<ClientMessage, RouteError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| RouteError::Malformed(e.to_string()))?;
    let message_type = value
        .get("message_type")
        .and_then(Value::as_str)
        .ok_or_else(|| RouteError::Malformed("missing message_type".to_string()))?
        .to_string();

    if DEPRECATED_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(RouteError::Deprecated(message_type));
    }
    if SERVER_ONLY_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(RouteError::ServerOnly(message_type));
    }

    if !CLIENT_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(RouteError::Unsupported(message_type));
    }

    serde_json::from_value::<ClientMessage>(value).map_err(|e| RouteError::InvalidPayload {
        message_type,
        reason: e.to_string(),
    })
}
