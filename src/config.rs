//! Network service configuration.
//!
//! [`NetworkConfig`] is handed to [`crate::service::NetworkService::new`]
//! and selects the topology, the transport, and the timing envelope for the
//! whole fabric. Every field carries a serde default so partial JSON
//! configs deserialize cleanly; the crate itself never reads config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default port coordinators bind to.
pub const DEFAULT_PORT: u16 = 8570;

/// Default keepalive ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default silent-connection eviction threshold.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for establishing connections.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for message-level operations.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default certificate lifetime in hours.
pub const DEFAULT_IDENTITY_TTL_HOURS: u64 = 24;

/// Default maximum concurrent peer connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 512;

/// Default interval between decentralized discovery sweeps.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// How messages are routed between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Star topology: one coordinator, agents connect to it.
    #[default]
    Centralized,
    /// Gossip topology: every node holds a partial directory.
    Decentralized,
}

/// Which transport implementation carries frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// JSON frames over WebSocket streams.
    #[default]
    Websocket,
}

/// Configuration for a network service or node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Cosmetic network name, used in logs only.
    #[serde(default = "default_name")]
    pub name: String,

    /// Topology selection.
    #[serde(default)]
    pub mode: TopologyMode,

    /// Transport selection.
    #[serde(default)]
    pub transport: TransportKind,

    /// Host to bind (server) or an informational local host (client).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind in server mode.
    #[serde(default = "default_port")]
    pub port: u16,

    /// In centralized mode, `true` runs the coordinator; `false` runs a
    /// client node that dials `coordinator_url`.
    #[serde(default = "default_server_mode")]
    pub server_mode: bool,

    /// Coordinator address for centralized clients, e.g. `ws://host:port`.
    #[serde(default)]
    pub coordinator_url: Option<String>,

    /// Bootstrap peer addresses for decentralized nodes.
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Stable node identifier for decentralized nodes.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Keepalive ping interval.
    #[serde(default = "default_heartbeat_interval", with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// A connection silent for this long is evicted and its agent
    /// unregistered.
    #[serde(default = "default_agent_timeout", with = "duration_secs")]
    pub agent_timeout: Duration,

    /// Timeout for establishing connections.
    #[serde(default = "default_connection_timeout", with = "duration_secs")]
    pub connection_timeout: Duration,

    /// Timeout for message-level operations.
    #[serde(default = "default_message_timeout", with = "duration_secs")]
    pub message_timeout: Duration,

    /// Whether transport-level encryption is requested. Informational to
    /// the transport; wss endpoints honour it, plain ws ignores it.
    #[serde(default)]
    pub encryption_enabled: bool,

    /// Encryption scheme label, informational.
    #[serde(default)]
    pub encryption_type: Option<String>,

    /// Maximum concurrent peer connections accepted.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Whether decentralized nodes run periodic discovery sweeps.
    #[serde(default = "default_discovery_enabled")]
    pub discovery_enabled: bool,

    /// Interval between discovery sweeps.
    #[serde(default = "default_discovery_interval", with = "duration_secs")]
    pub discovery_interval: Duration,

    /// Certificate lifetime in hours.
    #[serde(default = "default_identity_ttl_hours")]
    pub identity_ttl_hours: u64,
}

fn default_name() -> String {
    "commune".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_server_mode() -> bool {
    true
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_agent_timeout() -> Duration {
    DEFAULT_AGENT_TIMEOUT
}

fn default_connection_timeout() -> Duration {
    DEFAULT_CONNECTION_TIMEOUT
}

fn default_message_timeout() -> Duration {
    DEFAULT_MESSAGE_TIMEOUT
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_discovery_enabled() -> bool {
    true
}

fn default_discovery_interval() -> Duration {
    DEFAULT_DISCOVERY_INTERVAL
}

fn default_identity_ttl_hours() -> u64 {
    DEFAULT_IDENTITY_TTL_HOURS
}

/// Serialize durations as whole seconds on the wire.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            mode: TopologyMode::Centralized,
            transport: TransportKind::Websocket,
            host: default_host(),
            port: DEFAULT_PORT,
            server_mode: true,
            coordinator_url: None,
            bootstrap_nodes: Vec::new(),
            node_id: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            encryption_enabled: false,
            encryption_type: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            discovery_enabled: true,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            identity_ttl_hours: DEFAULT_IDENTITY_TTL_HOURS,
        }
    }
}

impl NetworkConfig {
    /// Validate cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Config` if a centralized client has no
    /// coordinator URL, or any timing value is zero.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.mode == TopologyMode::Centralized
            && !self.server_mode
            && self.coordinator_url.is_none()
        {
            return Err(crate::error::NetworkError::Config(
                "centralized client requires coordinator_url".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.agent_timeout.is_zero() {
            return Err(crate::error::NetworkError::Config(
                "heartbeat_interval and agent_timeout must be non-zero".to_string(),
            ));
        }
        if self.identity_ttl_hours == 0 {
            return Err(crate::error::NetworkError::Config(
                "identity_ttl_hours must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The ws URL a client uses to reach this service.
    #[must_use]
    pub fn local_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}
