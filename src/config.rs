// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::history::StorageBackend;

/// Chat server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds.
    pub listen_addr: SocketAddr,
    /// Only upgrades at this path are accepted.
    pub ws_path: String,
    /// Address of the metrics/health HTTP server.
    pub metrics_addr: SocketAddr,
    /// Frames larger than this are dropped.
    pub max_message_size: usize,
    /// A session silent for this long is reaped.
    pub heartbeat_timeout_secs: u64,
    /// How often the fault detector sweeps.
    pub heartbeat_interval_secs: u64,
    /// WebSocket handshakes must finish within this.
    pub handshake_timeout_secs: u64,
    /// Packets held per offline user.
    pub offline_queue_capacity: usize,
    /// Messages kept per conversation in history.
    pub history_limit: usize,
    /// Capacity of each session's outbound channel.
    pub outbound_buffer: usize,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            ws_path: "/ws".to_string(),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            max_message_size: 65_536, // 64 KB
            heartbeat_timeout_secs: 30,
            heartbeat_interval_secs: 15,
            handshake_timeout_secs: 10,
            offline_queue_capacity: 100,
            history_limit: 1000,
            outbound_buffer: 256,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(parsed) = val.trim().parse() {
            *target = parsed;
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `NEXCHAT_*` environment variables.
    /// Unparseable values keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("NEXCHAT_LISTEN_ADDR", &mut config.listen_addr);
        env_parse("NEXCHAT_METRICS_ADDR", &mut config.metrics_addr);
        env_parse("NEXCHAT_MAX_MESSAGE_SIZE", &mut config.max_message_size);
        env_parse("NEXCHAT_HEARTBEAT_TIMEOUT", &mut config.heartbeat_timeout_secs);
        env_parse("NEXCHAT_HEARTBEAT_INTERVAL", &mut config.heartbeat_interval_secs);
        env_parse("NEXCHAT_HANDSHAKE_TIMEOUT", &mut config.handshake_timeout_secs);
        env_parse("NEXCHAT_OFFLINE_QUEUE_CAPACITY", &mut config.offline_queue_capacity);
        env_parse("NEXCHAT_HISTORY_LIMIT", &mut config.history_limit);
        env_parse("NEXCHAT_OUTBOUND_BUFFER", &mut config.outbound_buffer);

        if let Ok(val) = std::env::var("NEXCHAT_WS_PATH") {
            if val.starts_with('/') {
                config.ws_path = val;
            }
        }

        if let Ok(val) = std::env::var("NEXCHAT_STORAGE_BACKEND") {
            if let Some(backend) = StorageBackend::parse(&val) {
                config.storage_backend = backend;
            }
        }

        if let Ok(val) = std::env::var("NEXCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Outbound channel capacity per session. Never smaller than a full
    /// offline queue, so a reconnect replay always fits.
    pub fn session_buffer(&self) -> usize {
        self.outbound_buffer.max(self.offline_queue_capacity + 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.listen_addr.port(), 5000);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.metrics_addr.port(), 5001);
        assert_eq!(config.max_message_size, 65_536);
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.offline_queue_capacity, 100);
        assert_eq!(config.history_limit, 1000);
        assert_eq!(config.storage_backend, StorageBackend::Sqlite);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_durations() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = ServerConfig {
            heartbeat_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_session_buffer_fits_offline_queue() {
        let config = ServerConfig {
            outbound_buffer: 8,
            offline_queue_capacity: 100,
            ..ServerConfig::default()
        };
        assert!(config.session_buffer() > config.offline_queue_capacity);

        assert_eq!(ServerConfig::default().session_buffer(), 256);
    }
}
