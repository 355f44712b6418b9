//! Agent client: adapters, pipelines, and message threads.
//!
//! An `AgentClient` owns the connector, an ordered set of mod adapters,
//! and the thread store. Outgoing sends run the adapter chain first — a
//! `None` from any adapter cancels the send — then transmit and append
//! to the local thread, so a sender sees its own messages in context.
//! Inbound envelopes run the symmetric incoming chain and land in the
//! thread named by [`crate::message::thread_key`].
//!
//! The client is single-threaded and cooperative: the connector's
//! reader feeds the incoming pipeline and thread store in arrival
//! order.

use crate::connector::{Connector, MessageHandler};
use crate::error::{NetworkError, Result};
use crate::frame::{COMMAND_LIST_AGENTS, COMMAND_LIST_MODS};
use crate::message::{
    thread_key, BroadcastMessage, ContentMap, DirectMessage, Envelope, MessageThread, ModDirection,
    ModMessage,
};
use crate::mods::{ModAdapter, ModSummary, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, warn};

struct ClientInner {
    agent_id: String,
    connector: Arc<Connector>,
    adapters: RwLock<Vec<Arc<dyn ModAdapter>>>,
    threads: RwLock<HashMap<String, MessageThread>>,
}

/// An agent's view of the network.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("agent_id", &self.inner.agent_id)
            .finish()
    }
}

struct ClientMessageHandler {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl MessageHandler for ClientMessageHandler {
    async fn on_message(&self, envelope: Envelope) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_incoming(envelope).await;
        }
    }
}

impl AgentClient {
    /// Create a client for `agent_id` with a fresh connector.
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self::with_connector(agent_id.clone(), Connector::new(agent_id))
    }

    /// Create a client around an existing connector (custom timing
    /// configuration, tests).
    #[must_use]
    pub fn with_connector(agent_id: impl Into<String>, connector: Connector) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                agent_id: agent_id.into(),
                connector: Arc::new(connector),
                adapters: RwLock::new(Vec::new()),
                threads: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The agent's identifier.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// The owned connector.
    #[must_use]
    pub fn connector(&self) -> Arc<Connector> {
        self.inner.connector.clone()
    }

    /// Connect to a network service and start receiving.
    ///
    /// # Errors
    ///
    /// Handshake failures pass through from
    /// [`Connector::connect`].
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        metadata: ContentMap,
        capabilities: Vec<String>,
    ) -> Result<()> {
        self.inner
            .connector
            .register_message_handler(Arc::new(ClientMessageHandler {
                inner: Arc::downgrade(&self.inner),
            }))
            .await;
        self.inner
            .connector
            .connect(host, port, metadata, capabilities)
            .await?;
        for adapter in self.inner.adapters.read().await.iter() {
            adapter.on_connect().await;
        }
        Ok(())
    }

    /// Disconnect from the network.
    pub async fn disconnect(&self) -> Result<()> {
        for adapter in self.inner.adapters.read().await.iter() {
            adapter.on_disconnect().await;
        }
        self.inner.connector.disconnect().await
    }

    /// Register a mod adapter. Binds it to this client and appends its
    /// hooks to both pipelines in registration order.
    pub async fn register_mod_adapter(&self, adapter: Arc<dyn ModAdapter>) {
        adapter.bind_agent(&self.inner.agent_id).await;
        adapter.bind_connector(self.inner.connector.clone()).await;
        debug!(
            agent_id = %self.inner.agent_id,
            mod_name = adapter.mod_name(),
            "registered mod adapter"
        );
        self.inner.adapters.write().await.push(adapter);
    }

    /// Names of registered adapters, in pipeline order.
    pub async fn adapter_names(&self) -> Vec<String> {
        self.inner
            .adapters
            .read()
            .await
            .iter()
            .map(|adapter| adapter.mod_name().to_string())
            .collect()
    }

    /// The adapter registered under `mod_name`, if any.
    pub async fn adapter(&self, mod_name: &str) -> Option<Arc<dyn ModAdapter>> {
        self.inner
            .adapters
            .read()
            .await
            .iter()
            .find(|adapter| adapter.mod_name() == mod_name)
            .cloned()
    }

    /// Send a direct message. Returns the message id, or `None` when an
    /// outgoing adapter cancelled the send.
    ///
    /// # Errors
    ///
    /// Transport failures pass through.
    pub async fn send_direct_message(
        &self,
        target_agent_id: &str,
        content: ContentMap,
    ) -> Result<Option<String>> {
        let message = DirectMessage::new(self.inner.agent_id.clone(), target_agent_id, content);
        self.inner.send_direct(message).await
    }

    /// Send a broadcast. Returns the message id, or `None` when
    /// cancelled by an adapter.
    ///
    /// # Errors
    ///
    /// Transport failures pass through.
    pub async fn send_broadcast_message(&self, content: ContentMap) -> Result<Option<String>> {
        let message = BroadcastMessage::new(self.inner.agent_id.clone(), content);
        self.inner.send_broadcast(message).await
    }

    /// Send a mod-scoped message. Returns the message id, or `None`
    /// when cancelled by an adapter.
    ///
    /// # Errors
    ///
    /// Transport failures pass through.
    pub async fn send_mod_message(
        &self,
        mod_name: &str,
        direction: ModDirection,
        relevant_agent_id: &str,
        content: ContentMap,
    ) -> Result<Option<String>> {
        let message = ModMessage::new(
            self.inner.agent_id.clone(),
            mod_name,
            direction,
            relevant_agent_id,
            content,
        );
        self.inner.send_mod(message).await
    }

    /// Ask the service for its directory.
    ///
    /// # Errors
    ///
    /// System request failures pass through.
    pub async fn list_agents(&self) -> Result<Vec<Value>> {
        let response = self
            .inner
            .connector
            .system_request(COMMAND_LIST_AGENTS, json!({}))
            .await?;
        if !response.ok {
            return Err(NetworkError::Transport(
                response.error.unwrap_or_else(|| "list_agents failed".to_string()),
            ));
        }
        Ok(response
            .data
            .as_ref()
            .and_then(|data| data.get("agents"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Ask the service which mods it runs.
    ///
    /// # Errors
    ///
    /// System request failures pass through.
    pub async fn list_mods(&self) -> Result<Vec<ModSummary>> {
        let response = self
            .inner
            .connector
            .system_request(COMMAND_LIST_MODS, json!({}))
            .await?;
        if !response.ok {
            return Err(NetworkError::Transport(
                response.error.unwrap_or_else(|| "list_mods failed".to_string()),
            ));
        }
        let mods = response
            .data
            .as_ref()
            .and_then(|data| data.get("mods"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(mods)?)
    }

    /// Union of every adapter's advertised tools.
    pub async fn get_tools(&self) -> Vec<ToolDescriptor> {
        let adapters = self.inner.adapters.read().await.clone();
        let mut tools = Vec::new();
        for adapter in adapters {
            tools.extend(adapter.get_tools().await);
        }
        tools
    }

    /// Snapshot of the thread store.
    pub async fn get_message_threads(&self) -> HashMap<String, MessageThread> {
        self.inner.threads.read().await.clone()
    }

    /// Snapshot of one thread.
    pub async fn thread(&self, thread_id: &str) -> Option<MessageThread> {
        self.inner.threads.read().await.get(thread_id).cloned()
    }
}

impl ClientInner {
    async fn send_direct(&self, mut message: DirectMessage) -> Result<Option<String>> {
        let adapters = self.adapters.read().await.clone();
        for adapter in &adapters {
            match adapter.process_outgoing_direct_message(message).await {
                Some(next) => message = next,
                None => {
                    debug!(
                        mod_name = adapter.mod_name(),
                        "outgoing direct cancelled by adapter"
                    );
                    return Ok(None);
                }
            }
        }
        let envelope = Envelope::Direct(message);
        self.connector.send_envelope(&envelope).await?;
        let message_id = envelope.message_id().to_string();
        self.append(envelope).await;
        Ok(Some(message_id))
    }

    async fn send_broadcast(&self, mut message: BroadcastMessage) -> Result<Option<String>> {
        let adapters = self.adapters.read().await.clone();
        for adapter in &adapters {
            match adapter.process_outgoing_broadcast_message(message).await {
                Some(next) => message = next,
                None => {
                    debug!(
                        mod_name = adapter.mod_name(),
                        "outgoing broadcast cancelled by adapter"
                    );
                    return Ok(None);
                }
            }
        }
        let envelope = Envelope::Broadcast(message);
        self.connector.send_envelope(&envelope).await?;
        let message_id = envelope.message_id().to_string();
        self.append(envelope).await;
        Ok(Some(message_id))
    }

    async fn send_mod(&self, mut message: ModMessage) -> Result<Option<String>> {
        let adapters = self.adapters.read().await.clone();
        for adapter in &adapters {
            match adapter.process_outgoing_mod_message(message).await {
                Some(next) => message = next,
                None => {
                    debug!(
                        mod_name = adapter.mod_name(),
                        "outgoing mod message cancelled by adapter"
                    );
                    return Ok(None);
                }
            }
        }
        let envelope = Envelope::Mod(message);
        self.connector.send_envelope(&envelope).await?;
        let message_id = envelope.message_id().to_string();
        self.append(envelope).await;
        Ok(Some(message_id))
    }

    /// Incoming pipeline: adapter chain with short-circuit, then thread
    /// append.
    async fn handle_incoming(&self, envelope: Envelope) {
        let adapters = self.adapters.read().await.clone();
        let processed = match envelope {
            Envelope::Direct(mut message) => {
                for adapter in &adapters {
                    match adapter.process_incoming_direct_message(message).await {
                        Some(next) => message = next,
                        None => {
                            debug!(
                                mod_name = adapter.mod_name(),
                                "incoming direct consumed by adapter"
                            );
                            return;
                        }
                    }
                }
                Envelope::Direct(message)
            }
            Envelope::Broadcast(mut message) => {
                for adapter in &adapters {
                    match adapter.process_incoming_broadcast_message(message).await {
                        Some(next) => message = next,
                        None => {
                            debug!(
                                mod_name = adapter.mod_name(),
                                "incoming broadcast consumed by adapter"
                            );
                            return;
                        }
                    }
                }
                Envelope::Broadcast(message)
            }
            Envelope::Mod(mut message) => {
                for adapter in &adapters {
                    match adapter.process_incoming_mod_message(message).await {
                        Some(next) => message = next,
                        None => {
                            debug!(
                                mod_name = adapter.mod_name(),
                                "incoming mod message consumed by adapter"
                            );
                            return;
                        }
                    }
                }
                Envelope::Mod(message)
            }
        };
        self.append(processed).await;
    }

    async fn append(&self, envelope: Envelope) {
        let key = thread_key(&envelope, &self.agent_id);
        let mut threads = self.threads.write().await;
        let thread = threads.entry(key.clone()).or_default();
        thread.push(envelope);
        if thread.len() % 256 == 0 {
            warn!(thread = %key, len = thread.len(), "message thread growing large");
        }
    }
}
