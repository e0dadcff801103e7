//! # Saorsa Collab Server Library
//!
//! Real-time collaborative diagram editing over WebSocket. One session task
//! per diagram owns the authoritative cell state and the operation history;
//! the hub routes connections to sessions.
//!
//! This library is used by both the binary and integration tests.

use std::sync::Arc;

pub mod config;
pub mod connection;
mod handlers;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod ratelimit;
pub mod router;
pub mod routes;
pub mod session;
pub mod validation;

pub use config::ServerConfig;
pub use connection::ConnectionConfig;
pub use hub::{Hub, HubError};
pub use session::{SessionConfig, SessionHandle, SessionInfo};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Live session registry.
    pub hub: Arc<Hub>,
    /// Limits applied to each WebSocket connection.
    pub connection: ConnectionConfig,
}

impl AppState {
    /// Create application state.
    #[must_use]
    pub fn new(hub: Arc<Hub>, connection: ConnectionConfig) -> Self {
        Self { hub, connection }
    }

    /// Get a reference to the hub.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}
