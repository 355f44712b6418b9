//! Agent-side network connector.
//!
//! One connector holds one transport-client association to the
//! coordinator (centralized) or a node (decentralized): it performs the
//! hello handshake, dispatches inbound frames to registered handlers,
//! pairs system requests with their responses by correlation id, and
//! caches the identity certificate presented on reconnect.
//!
//! Sends are not retried at this layer; the caller decides.

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::frame::{
    Frame, FrameType, HelloAckBody, HelloBody, SystemRequestBody, SystemResponseBody,
    COMMAND_CLAIM_AGENT_ID,
};
use crate::identity::AgentCertificate;
use crate::message::{ContentMap, Envelope};
use crate::transport::{ConnectionEvent, ConnectionId, FrameHandler, Transport, WebSocketTransport};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Handshake deadline for `connect`.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Deadline for system request round-trips.
pub const SYSTEM_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Connection lifecycle notifications a caller can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorEvent {
    /// The hello handshake completed and the link is usable.
    Established,
    /// The link is gone (remote close, local disconnect, or error).
    Closed,
}

/// Callback for inbound message envelopes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, envelope: Envelope);
}

/// Callback for connection lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: ConnectorEvent);
}

/// Callback for inbound system requests (server-pushed commands).
#[async_trait]
pub trait SystemHandler: Send + Sync {
    async fn on_request(&self, body: SystemRequestBody);
}

/// Callback for `error` frames from the network.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, body: crate::frame::ErrorBody);
}

struct ConnectorInner {
    agent_id: String,
    transport: WebSocketTransport,
    connection: std::sync::RwLock<Option<ConnectionId>>,
    connected: AtomicBool,
    pending: DashMap<String, oneshot::Sender<SystemResponseBody>>,
    awaiting_ack: Mutex<Option<oneshot::Sender<HelloAckBody>>>,
    message_handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    event_handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    system_handlers: RwLock<Vec<(String, Arc<dyn SystemHandler>)>>,
    error_handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
    certificate: std::sync::RwLock<Option<AgentCertificate>>,
}

/// Agent-side connector to a network service.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("agent_id", &self.inner.agent_id)
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .finish()
    }
}

struct ConnectorFrameHandler {
    inner: Weak<ConnectorInner>,
}

#[async_trait]
impl FrameHandler for ConnectorFrameHandler {
    async fn on_frame(&self, _connection_id: ConnectionId, frame: Frame) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.handle_frame(frame).await;
    }
}

impl Connector {
    /// Create an unconnected connector for `agent_id`.
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::with_config(agent_id, NetworkConfig::default())
    }

    /// Create a connector with explicit timing configuration.
    #[must_use]
    pub fn with_config(agent_id: impl Into<String>, config: NetworkConfig) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                agent_id: agent_id.into(),
                transport: WebSocketTransport::new(config),
                connection: std::sync::RwLock::new(None),
                connected: AtomicBool::new(false),
                pending: DashMap::new(),
                awaiting_ack: Mutex::new(None),
                message_handlers: RwLock::new(Vec::new()),
                event_handlers: RwLock::new(Vec::new()),
                system_handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                certificate: std::sync::RwLock::new(None),
            }),
        }
    }

    /// The agent this connector speaks for.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Whether the link is currently usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The cached identity certificate, if any.
    #[must_use]
    pub fn certificate(&self) -> Option<AgentCertificate> {
        self.inner
            .certificate
            .read()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Cache a certificate to present on the next hello.
    pub fn set_certificate(&self, certificate: AgentCertificate) {
        if let Ok(mut guard) = self.inner.certificate.write() {
            *guard = Some(certificate);
        }
    }

    /// Persist the cached certificate as UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// `NotConnected` when no certificate is cached; I/O errors pass
    /// through.
    pub async fn save_certificate(&self, path: &Path) -> Result<()> {
        let certificate = self.certificate().ok_or(NetworkError::NotConnected)?;
        tokio::fs::write(path, certificate.to_json()?).await?;
        Ok(())
    }

    /// Load and cache a certificate from disk.
    ///
    /// # Errors
    ///
    /// I/O errors and malformed certificates pass through.
    pub async fn load_certificate(&self, path: &Path) -> Result<AgentCertificate> {
        let data = tokio::fs::read_to_string(path).await?;
        let certificate = AgentCertificate::from_json(&data)?;
        self.set_certificate(certificate.clone());
        Ok(certificate)
    }

    /// Register a callback for inbound message envelopes.
    pub async fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.message_handlers.write().await.push(handler);
    }

    /// Register a callback for connection lifecycle events.
    pub async fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.event_handlers.write().await.push(handler);
    }

    /// Register a callback for a server-pushed system command.
    pub async fn register_system_handler(&self, command: &str, handler: Arc<dyn SystemHandler>) {
        self.inner
            .system_handlers
            .write()
            .await
            .push((command.to_string(), handler));
    }

    /// Register a callback for `error` frames from the network.
    pub async fn register_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        self.inner.error_handlers.write().await.push(handler);
    }

    /// Connect to a service and complete the hello handshake.
    ///
    /// The cached certificate, if any, rides along in the hello. On
    /// acceptance any newly issued certificate is cached and
    /// [`ConnectorEvent::Established`] handlers fire.
    ///
    /// # Errors
    ///
    /// `AdmissionDenied` when the service rejects the hello; `Timeout`
    /// when no `hello_ack` arrives within [`HANDSHAKE_TIMEOUT`].
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        metadata: ContentMap,
        capabilities: Vec<String>,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.transport.initialize().await?;
        inner
            .transport
            .subscribe(Arc::new(ConnectorFrameHandler {
                inner: Arc::downgrade(inner),
            }))
            .await;

        let (ack_tx, ack_rx) = oneshot::channel();
        *inner.awaiting_ack.lock().await = Some(ack_tx);

        let hello = Frame::hello(&HelloBody {
            agent_id: inner.agent_id.clone(),
            metadata,
            capabilities,
            certificate: self.certificate(),
        })?;
        let url = format!("ws://{host}:{port}");
        let connection_id = inner.transport.dial(&url, hello).await?;
        if let Ok(mut guard) = inner.connection.write() {
            *guard = Some(connection_id);
        }
        self.spawn_event_watcher();

        let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, ack_rx)
            .await
            .map_err(|_| NetworkError::Timeout("waiting for hello_ack".to_string()))?
            .map_err(|_| NetworkError::ConnectionLost)?;

        if !ack.accepted {
            let reason = ack.reason.unwrap_or_else(|| "rejected".to_string());
            let _ = inner.transport.close(connection_id, &reason).await;
            return Err(NetworkError::AdmissionDenied(reason));
        }

        if let Some(certificate) = ack.certificate {
            self.set_certificate(certificate);
        }
        inner.connected.store(true, Ordering::SeqCst);
        info!(agent_id = %inner.agent_id, %url, "connected to network");
        inner.fire_event(ConnectorEvent::Established).await;
        Ok(())
    }

    /// Write one frame to the link.
    ///
    /// # Errors
    ///
    /// `NotConnected` when the link is down — sends fail fast after a
    /// disconnect.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        let connection = self
            .inner
            .connection
            .read()
            .ok()
            .and_then(|guard| *guard)
            .ok_or(NetworkError::NotConnected)?;
        self.inner.transport.send(connection, frame).await
    }

    /// Serialize and send a message envelope.
    ///
    /// # Errors
    ///
    /// As [`Connector::send`].
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(Frame::message(envelope)?).await
    }

    /// Issue a system request and await its response.
    ///
    /// # Errors
    ///
    /// `Timeout` after [`SYSTEM_REQUEST_TIMEOUT`]; `ConnectionLost`
    /// when the link drops while waiting.
    pub async fn system_request(&self, command: &str, args: Value) -> Result<SystemResponseBody> {
        let correlation_id = crate::message::new_message_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id.clone(), tx);

        let frame = Frame::system_request(correlation_id.clone(), command, args)?;
        if let Err(e) = self.send(frame).await {
            self.inner.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(SYSTEM_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::ConnectionLost),
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                Err(NetworkError::Timeout(format!("system request {command}")))
            }
        }
    }

    /// Claim an agent ID from the service, caching the certificate.
    ///
    /// # Errors
    ///
    /// `AgentIdInUse` when the ID is claimed and `force` is false.
    pub async fn claim_agent_id(&self, agent_id: &str, force: bool) -> Result<AgentCertificate> {
        let response = self
            .system_request(
                COMMAND_CLAIM_AGENT_ID,
                json!({ "agent_id": agent_id, "force": force }),
            )
            .await?;
        if !response.ok {
            let error = response.error.unwrap_or_default();
            return if error == "AgentIDInUse" {
                Err(NetworkError::AgentIdInUse(agent_id.to_string()))
            } else {
                Err(NetworkError::Transport(error))
            };
        }
        let certificate_value = response
            .data
            .as_ref()
            .and_then(|data| data.get("certificate"))
            .cloned()
            .ok_or_else(|| {
                NetworkError::Transport("claim response missing certificate".to_string())
            })?;
        let certificate: AgentCertificate = serde_json::from_value(certificate_value)
            .map_err(|e| NetworkError::InvalidCertificate(e.to_string()))?;
        self.set_certificate(certificate.clone());
        Ok(certificate)
    }

    /// Close the link. Pending system requests fail with
    /// `ConnectionLost`; subsequent sends fail fast.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self.inner.connection.read().ok().and_then(|guard| *guard);
        if let Some(connection) = connection {
            let _ = self.inner.transport.close(connection, "disconnect").await;
        }
        self.inner.mark_disconnected().await;
        self.inner.transport.shutdown().await?;
        Ok(())
    }

    fn spawn_event_watcher(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.inner.transport.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Closed { reason, .. }) => {
                        let Some(inner) = weak.upgrade() else { break };
                        debug!(%reason, "connector link closed");
                        inner.mark_disconnected().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl ConnectorInner {
    async fn handle_frame(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::HelloAck => {
                let body: HelloAckBody = match frame.body_as() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "malformed hello_ack");
                        return;
                    }
                };
                if let Some(tx) = self.awaiting_ack.lock().await.take() {
                    let _ = tx.send(body);
                }
            }
            FrameType::Message => {
                let envelope = match frame.envelope() {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "unparseable inbound message");
                        return;
                    }
                };
                let handlers = self.message_handlers.read().await.clone();
                for handler in handlers {
                    handler.on_message(envelope.clone()).await;
                }
            }
            FrameType::SystemResponse => {
                let Some(correlation_id) = frame.correlation_id.clone() else {
                    warn!("system response without correlation id");
                    return;
                };
                let body: SystemResponseBody = match frame.body_as() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "malformed system response");
                        return;
                    }
                };
                if let Some((_, tx)) = self.pending.remove(&correlation_id) {
                    let _ = tx.send(body);
                }
            }
            FrameType::SystemRequest => {
                let body: SystemRequestBody = match frame.body_as() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "malformed system request");
                        return;
                    }
                };
                let handlers = self.system_handlers.read().await.clone();
                for (command, handler) in handlers {
                    if command == body.command {
                        handler.on_request(body.clone()).await;
                    }
                }
            }
            FrameType::Error => {
                if let Ok(body) = frame.body_as::<crate::frame::ErrorBody>() {
                    warn!(code = ?body.code, message = %body.message, "error frame from network");
                    let handlers = self.error_handlers.read().await.clone();
                    for handler in handlers {
                        handler.on_error(body.clone()).await;
                    }
                }
            }
            FrameType::Hello | FrameType::Ping | FrameType::Pong => {}
        }
    }

    async fn mark_disconnected(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.connection.write() {
            *guard = None;
        }
        // Fail every in-flight system request.
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                drop(tx);
            }
        }
        self.fire_event(ConnectorEvent::Closed).await;
    }

    async fn fire_event(&self, event: ConnectorEvent) {
        let handlers = self.event_handlers.read().await.clone();
        for handler in handlers {
            handler.on_event(event).await;
        }
    }
}
