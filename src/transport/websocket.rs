//! WebSocket transport.
//!
//! JSON frames over WebSocket streams (tokio-tungstenite). Each
//! connection gets a reader loop and a writer task fed by an mpsc queue;
//! the queue is the per-connection FIFO everything upstream relies on.
//! Keepalive `ping` frames go out at `heartbeat_interval`, and a
//! connection with no inbound activity for `agent_timeout` is evicted.
//!
//! The reader validates frame structure ([`Frame::decode`]) and fans
//! frames out to subscribed handlers sequentially. Envelope validation
//! failures answer with an `error` frame and keep the connection open;
//! structurally malformed frames close it.

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::frame::{ErrorCode, Frame, FrameType};
use crate::transport::{
    ConnectionEvent, ConnectionId, ConnectionInfo, ConnectionState, FrameHandler, Transport,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

/// Outbound queue depth per connection.
const WRITE_QUEUE_DEPTH: usize = 64;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct PeerHandle {
    outbound: mpsc::Sender<WsMessage>,
    last_activity: Arc<AtomicU64>,
    state: ConnectionState,
    agent_id: Option<String>,
    addr: Option<SocketAddr>,
    closer: Arc<Notify>,
}

struct Inner {
    config: NetworkConfig,
    connections: DashMap<ConnectionId, PeerHandle>,
    handlers: RwLock<Vec<Arc<dyn FrameHandler>>>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

/// WebSocket implementation of [`Transport`].
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

impl WebSocketTransport {
    /// Create a transport from network configuration.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                config,
                connections: DashMap::new(),
                handlers: RwLock::new(Vec::new()),
                events,
                shutdown,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

impl Inner {
    /// Register the connection and spawn its reader loop and writer task.
    fn spawn_connection<WS>(
        inner: Arc<Inner>,
        ws: WS,
        addr: Option<SocketAddr>,
    ) -> ConnectionId
    where
        WS: futures::Stream<Item = std::result::Result<WsMessage, WsError>>
            + futures::Sink<WsMessage, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let connection_id = ConnectionId::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(WRITE_QUEUE_DEPTH);
        let last_activity = Arc::new(AtomicU64::new(now_secs()));
        let closer = Arc::new(Notify::new());

        inner.connections.insert(
            connection_id,
            PeerHandle {
                outbound: outbound_tx,
                last_activity: Arc::clone(&last_activity),
                state: ConnectionState::Pending,
                agent_id: None,
                addr,
                closer: Arc::clone(&closer),
            },
        );
        let _ = inner.events.send(ConnectionEvent::Opened {
            connection_id,
            addr,
        });
        debug!(%connection_id, ?addr, "connection opened");

        let (mut sink, mut stream) = ws.split();

        // Writer: drains the outbound queue serially, preserving FIFO.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, WsMessage::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: validates frames and dispatches to handlers in order.
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            let reason = loop {
                tokio::select! {
                    _ = closer.notified() => break "closed locally",
                    _ = shutdown.recv() => break "transport shutdown",
                    next = stream.next() => match next {
                        Some(Ok(message)) => {
                            last_activity.store(now_secs(), Ordering::Relaxed);
                            match message {
                                WsMessage::Text(text) => {
                                    if !inner.handle_payload(connection_id, &text).await {
                                        break "malformed frame";
                                    }
                                }
                                WsMessage::Binary(data) => {
                                    match String::from_utf8(data) {
                                        Ok(text) => {
                                            if !inner.handle_payload(connection_id, &text).await {
                                                break "malformed frame";
                                            }
                                        }
                                        Err(_) => break "malformed frame",
                                    }
                                }
                                WsMessage::Close(_) => break "peer closed",
                                // ws-level ping/pong only refresh activity.
                                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%connection_id, error = %e, "read error");
                            break "read error";
                        }
                        None => break "peer closed",
                    }
                }
            };
            inner.remove_connection(connection_id, reason);
        });

        connection_id
    }

    /// Decode and dispatch one inbound payload. Returns false when the
    /// connection must close (structurally malformed frame).
    async fn handle_payload(&self, connection_id: ConnectionId, text: &str) -> bool {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(NetworkError::BadEnvelope(reason)) => {
                warn!(%connection_id, %reason, "dropping invalid envelope");
                if let Ok(error_frame) = Frame::error(ErrorCode::BadEnvelope, reason) {
                    self.queue(connection_id, &error_frame).await;
                }
                return true;
            }
            Err(e) => {
                warn!(%connection_id, error = %e, "malformed frame, closing");
                return false;
            }
        };

        match frame.frame_type {
            FrameType::Ping => {
                self.queue(connection_id, &Frame::pong()).await;
            }
            FrameType::Pong => {}
            _ => {
                let handlers = self.handlers.read().await.clone();
                for handler in handlers {
                    handler.on_frame(connection_id, frame.clone()).await;
                }
            }
        }
        true
    }

    /// Queue an encoded frame without surfacing errors (keepalive path).
    async fn queue(&self, connection_id: ConnectionId, frame: &Frame) {
        if let Err(e) = self.send_frame(connection_id, frame).await {
            debug!(%connection_id, error = %e, "queue failed");
        }
    }

    async fn send_frame(&self, connection_id: ConnectionId, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        let outbound = self
            .connections
            .get(&connection_id)
            .map(|handle| handle.outbound.clone())
            .ok_or_else(|| {
                NetworkError::Transport(format!("unknown connection {connection_id}"))
            })?;
        outbound
            .send(WsMessage::Text(encoded))
            .await
            .map_err(|_| NetworkError::ConnectionLost)
    }

    /// Drop the connection and emit `Closed` exactly once.
    fn remove_connection(&self, connection_id: ConnectionId, reason: &str) {
        if let Some((_, handle)) = self.connections.remove(&connection_id) {
            let _ = handle.outbound.try_send(WsMessage::Close(None));
            handle.closer.notify_waiters();
            info!(%connection_id, agent_id = ?handle.agent_id, reason, "connection closed");
            let _ = self.events.send(ConnectionEvent::Closed {
                connection_id,
                agent_id: handle.agent_id,
                reason: reason.to_string(),
            });
        }
    }

    /// Keepalive and silent-connection eviction loop.
    async fn keepalive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            let now = now_secs();
            let timeout = self.config.agent_timeout.as_secs();
            let mut stale = Vec::new();
            let mut live = Vec::new();
            for entry in self.connections.iter() {
                let idle = now.saturating_sub(entry.last_activity.load(Ordering::Relaxed));
                if idle > timeout {
                    stale.push(*entry.key());
                } else {
                    live.push(entry.outbound.clone());
                }
            }
            for connection_id in stale {
                warn!(%connection_id, "evicting silent connection");
                self.remove_connection(connection_id, "timeout");
            }
            if let Ok(ping) = Frame::ping().encode() {
                for outbound in live {
                    let _ = outbound.try_send(WsMessage::Text(ping.clone()));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn initialize(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::spawn(Arc::clone(&self.inner).keepalive_loop());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());
        let ids: Vec<ConnectionId> = self
            .inner
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for connection_id in ids {
            self.inner.remove_connection(connection_id, "shutdown");
        }
        Ok(())
    }

    async fn listen(&self) -> Result<SocketAddr> {
        let bind = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(&bind).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "transport listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => {
                        let (socket, peer_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        if inner.connections.len() >= inner.config.max_connections {
                            warn!(%peer_addr, "connection limit reached, refusing");
                            continue;
                        }
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(socket).await {
                                Ok(ws) => {
                                    Inner::spawn_connection(inner, ws, Some(peer_addr));
                                }
                                Err(e) => {
                                    debug!(%peer_addr, error = %e, "ws handshake failed");
                                }
                            }
                        });
                    }
                }
            }
            debug!("accept loop stopped");
        });

        Ok(local_addr)
    }

    async fn dial(&self, url: &str, hello: Frame) -> Result<ConnectionId> {
        let (ws, _response) = tokio::time::timeout(
            self.inner.config.connection_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        .map_err(|_| NetworkError::Timeout(format!("dialing {url}")))??;

        let connection_id = Inner::spawn_connection(Arc::clone(&self.inner), ws, None);
        self.inner.send_frame(connection_id, &hello).await?;
        Ok(connection_id)
    }

    async fn send(&self, connection_id: ConnectionId, frame: Frame) -> Result<()> {
        self.inner.send_frame(connection_id, &frame).await
    }

    async fn broadcast(&self, frame: Frame, except: Option<ConnectionId>) -> Result<usize> {
        let encoded = frame.encode()?;
        let targets: Vec<mpsc::Sender<WsMessage>> = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.agent_id.is_some() && Some(*entry.key()) != except)
            .map(|entry| entry.outbound.clone())
            .collect();
        let count = targets.len();
        let sends = targets
            .into_iter()
            .map(|outbound| {
                let text = encoded.clone();
                async move {
                    let _ = outbound.send(WsMessage::Text(text)).await;
                }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(sends).await;
        Ok(count)
    }

    async fn close(&self, connection_id: ConnectionId, reason: &str) -> Result<()> {
        if let Some(mut handle) = self.inner.connections.get_mut(&connection_id) {
            handle.state = ConnectionState::Closing;
        }
        self.inner.remove_connection(connection_id, reason);
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn FrameHandler>) {
        self.inner.handlers.write().await.push(handler);
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn identify(&self, connection_id: ConnectionId, agent_id: &str) {
        if let Some(mut handle) = self.inner.connections.get_mut(&connection_id) {
            handle.agent_id = Some(agent_id.to_string());
            handle.state = ConnectionState::Connected;
            let _ = self.inner.events.send(ConnectionEvent::Identified {
                connection_id,
                agent_id: agent_id.to_string(),
            });
        }
    }

    fn agent_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.inner
            .connections
            .get(&connection_id)
            .and_then(|handle| handle.agent_id.clone())
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        let now = now_secs();
        self.inner
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                connection_id: *entry.key(),
                agent_id: entry.agent_id.clone(),
                addr: entry.addr,
                state: entry.state,
                idle: std::time::Duration::from_secs(
                    now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)),
                ),
            })
            .collect()
    }
}
