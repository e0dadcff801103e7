//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::connection::ConnectionConfig;
use crate::session::SessionConfig;

/// Default port for the collaboration server.
pub const DEFAULT_PORT: u16 = 9474;

/// Saorsa Collab server settings.
#[derive(Debug, Clone, Parser)]
#[command(name = "saorsa-collab", version, about = "Real-time collaborative diagram editing server")]
pub struct ServerConfig {
    /// Address to bind.
    #[arg(long, env = "COLLAB_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "COLLAB_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding diagram JSON files. Diagrams are kept in memory only
    /// when unset.
    #[arg(long, env = "COLLAB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// JSON file of threat-model role grants. Without it every
    /// authenticated user is a writer.
    #[arg(long, env = "COLLAB_ROLES_FILE")]
    pub roles_file: Option<PathBuf>,

    /// Allow edits to diagrams that belong to no threat model.
    #[arg(
        long,
        env = "COLLAB_ALLOW_UNSCOPED_MUTATIONS",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub allow_unscoped_mutations: bool,

    /// Operations kept per session for undo.
    #[arg(long, env = "COLLAB_HISTORY_LIMIT", default_value_t = 100)]
    pub history_limit: usize,

    /// Outbound messages queued per connection before it is dropped.
    #[arg(long, env = "COLLAB_CLIENT_BUFFER", default_value_t = 256)]
    pub client_buffer: usize,

    /// Largest accepted WebSocket text frame, in bytes.
    #[arg(long, env = "COLLAB_MAX_MESSAGE_SIZE", default_value_t = 65_536)]
    pub max_message_size: usize,

    /// Messages a connection may send in a burst.
    #[arg(long, env = "COLLAB_RATE_LIMIT_BURST", default_value_t = 200)]
    pub rate_limit_burst: u32,

    /// Sustained messages per second per connection.
    #[arg(long, env = "COLLAB_RATE_LIMIT_SUSTAINED", default_value_t = 50)]
    pub rate_limit_sustained: u32,

    /// Seconds between keepalive pings.
    #[arg(long, env = "COLLAB_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds between idle session sweeps.
    #[arg(long, env = "COLLAB_CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    pub cleanup_interval_secs: u64,

    /// Seconds an empty session is kept before it is stopped.
    #[arg(long, env = "COLLAB_IDLE_GRACE_SECS", default_value_t = 900)]
    pub idle_grace_secs: u64,
}

impl ServerConfig {
    /// Session settings derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            history_capacity: self.history_limit.max(1),
            allow_unscoped_mutations: self.allow_unscoped_mutations,
        }
    }

    /// Connection settings derived from this configuration.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            client_buffer: self.client_buffer.max(1),
            max_message_size: self.max_message_size,
            rate_limit_burst: self.rate_limit_burst,
            rate_limit_sustained: self.rate_limit_sustained,
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
        }
    }

    /// Interval between idle session sweeps.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Time an empty session is kept.
    #[must_use]
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["saorsa-collab"]).expect("should parse");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.allow_unscoped_mutations);
        assert!(config.data_dir.is_none());
        assert_eq!(config.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(config.idle_grace(), Duration::from_secs(900));

        let session = config.session_config();
        assert_eq!(session.history_capacity, 100);

        let connection = config.connection_config();
        assert_eq!(connection.client_buffer, 256);
        assert_eq!(connection.max_message_size, 65_536);
        assert_eq!(connection.rate_limit_burst, 200);
        assert_eq!(connection.rate_limit_sustained, 50);
        assert_eq!(connection.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "saorsa-collab",
            "--port",
            "8081",
            "--allow-unscoped-mutations",
            "false",
            "--history-limit",
            "0",
            "--data-dir",
            "/tmp/diagrams",
        ])
        .expect("should parse");
        assert_eq!(config.port, 8081);
        assert!(!config.allow_unscoped_mutations);
        assert_eq!(config.session_config().history_capacity, 1);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/diagrams")));
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(ServerConfig::try_parse_from(["saorsa-collab", "--port", "not-a-port"]).is_err());
    }
}
