//! Infrastructure configuration - addresses, timing and logging.

use serde::{Deserialize, Serialize};

/// Port offset of the request/reply socket from the base port.
pub const REPLY_PORT_OFFSET: u16 = 10_000;

/// Port offset of the publish socket from the base port.
pub const PUBLISH_PORT_OFFSET: u16 = 10_001;

/// Socket addresses for this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Base port; the request/reply and publish ports derive from it.
    /// Default: 8000
    #[serde(default = "BindConfig::default_base_port")]
    pub base_port: u16,

    /// Interface the request/reply socket binds to.
    /// Default: *
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Interface the publish socket binds to. This is also the host handed
    /// out by `PUBSUB`, so it must be connectable.
    /// Default: 127.0.0.1
    #[serde(default = "BindConfig::default_publish_host")]
    pub publish_host: String,

    /// Host used by `playd send` / `playd listen` to reach the daemon.
    /// Default: localhost
    #[serde(default = "BindConfig::default_connect_host")]
    pub connect_host: String,

    /// Linger on the request/reply socket at close, in milliseconds.
    /// Default: 5000
    #[serde(default = "BindConfig::default_reply_linger_ms")]
    pub reply_linger_ms: i32,

    /// Linger on the publish socket at close, in milliseconds.
    /// Default: 15000
    #[serde(default = "BindConfig::default_publish_linger_ms")]
    pub publish_linger_ms: i32,
}

impl BindConfig {
    fn default_base_port() -> u16 {
        8000
    }

    fn default_host() -> String {
        "*".to_string()
    }

    fn default_publish_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_connect_host() -> String {
        "localhost".to_string()
    }

    fn default_reply_linger_ms() -> i32 {
        5_000
    }

    fn default_publish_linger_ms() -> i32 {
        15_000
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            base_port: Self::default_base_port(),
            host: Self::default_host(),
            publish_host: Self::default_publish_host(),
            connect_host: Self::default_connect_host(),
            reply_linger_ms: Self::default_reply_linger_ms(),
            publish_linger_ms: Self::default_publish_linger_ms(),
        }
    }
}

/// Server loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Interval between polls of the request/reply socket.
    /// Default: 250
    #[serde(default = "DaemonConfig::default_tick_ms")]
    pub tick_ms: u64,

    /// Upper bound on a `TAGS` probe. 0 waits forever.
    /// Default: 10000
    #[serde(default = "DaemonConfig::default_tags_timeout_ms")]
    pub tags_timeout_ms: u64,

    /// How long `playd send` waits for a reply.
    /// Default: 30000
    #[serde(default = "DaemonConfig::default_client_timeout_ms")]
    pub client_timeout_ms: u64,
}

impl DaemonConfig {
    fn default_tick_ms() -> u64 {
        250
    }

    fn default_tags_timeout_ms() -> u64 {
        10_000
    }

    fn default_client_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_ms: Self::default_tick_ms(),
            tags_timeout_ms: Self::default_tags_timeout_ms(),
            client_timeout_ms: Self::default_client_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
