//! Stream transport layer.
//!
//! A transport carries [`Frame`]s between peers over reliable,
//! order-preserving streams. The core assumes FIFO delivery per
//! connection — every ordering guarantee upstream (§ per-thread FIFO)
//! rests on it. The transport owns its connections outright; other
//! layers hold only [`ConnectionId`]s.

pub mod websocket;

use crate::error::Result;
use crate::frame::Frame;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use websocket::WebSocketTransport;

/// Opaque identifier for one peer connection. Never serialized: a
/// connection id is meaningful only to the transport that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, peer not yet identified.
    Pending,
    /// Identified and admitted.
    Connected,
    /// Close requested, draining.
    Closing,
    /// Gone.
    Closed,
}

/// Connection transition events published by a transport.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was established (inbound accept or outbound dial).
    Opened {
        connection_id: ConnectionId,
        addr: Option<SocketAddr>,
    },
    /// A connection was bound to an authenticated agent id.
    Identified {
        connection_id: ConnectionId,
        agent_id: String,
    },
    /// A connection went away.
    Closed {
        connection_id: ConnectionId,
        agent_id: Option<String>,
        reason: String,
    },
}

/// Point-in-time view of one connection, for stats surfaces.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub agent_id: Option<String>,
    pub addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub idle: std::time::Duration,
}

/// Receiver of inbound frames.
///
/// Handlers run sequentially on the reader task of the originating
/// connection, so a single connection's frames are processed serially in
/// arrival order.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, connection_id: ConnectionId, frame: Frame);
}

/// Capability set the core requires from any stream transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start background machinery (keepalive, eviction).
    async fn initialize(&self) -> Result<()>;

    /// Close every connection and stop background tasks.
    async fn shutdown(&self) -> Result<()>;

    /// Accept inbound connections (server mode). Returns the bound
    /// address.
    async fn listen(&self) -> Result<SocketAddr>;

    /// Open an outbound connection and write `hello` as its first frame.
    async fn dial(&self, url: &str, hello: Frame) -> Result<ConnectionId>;

    /// Queue one frame to one connection.
    async fn send(&self, connection_id: ConnectionId, frame: Frame) -> Result<()>;

    /// Fan one frame out to every connected peer except `except`.
    /// Returns the number of peers targeted.
    async fn broadcast(&self, frame: Frame, except: Option<ConnectionId>) -> Result<usize>;

    /// Close one connection with a reason.
    async fn close(&self, connection_id: ConnectionId, reason: &str) -> Result<()>;

    /// Register a frame handler. Handlers are invoked in registration
    /// order for every received frame.
    async fn subscribe(&self, handler: Arc<dyn FrameHandler>);

    /// Subscribe to connection transition events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Bind an authenticated agent id to a connection.
    fn identify(&self, connection_id: ConnectionId, agent_id: &str);

    /// The agent bound to a connection, if identified.
    fn agent_of(&self, connection_id: ConnectionId) -> Option<String>;

    /// Snapshot of all live connections.
    fn connections(&self) -> Vec<ConnectionInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_id_display_is_compact() {
        let id = ConnectionId::new();
        let shown = id.to_string();
        assert_eq!(shown.len(), 32);
        assert!(!shown.contains('-'));
    }
}
