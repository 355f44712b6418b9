//! Centralized (star) topology.
//!
//! One coordinator holds the authoritative directory; every agent
//! connects to it. Routing is a directory lookup plus a transport send:
//! directs go to the target's connection, broadcasts fan out to everyone
//! but the sender, mod messages go to the connection of their
//! `relevant_agent_id`.

use crate::error::{NetworkError, Result};
use crate::frame::{Frame, SystemRequestBody};
use crate::message::Envelope;
use crate::topology::{AgentInfo, Directory, Topology};
use crate::transport::{ConnectionId, Transport};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Coordinator-side topology: the authoritative directory.
pub struct CentralizedTopology {
    transport: Arc<dyn Transport>,
    directory: Directory,
}

impl CentralizedTopology {
    /// Create a coordinator topology over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            directory: Directory::new(),
        }
    }

    /// The connection currently carrying `agent_id`, if any.
    #[must_use]
    pub fn connection_of(&self, agent_id: &str) -> Option<ConnectionId> {
        self.directory.connection_of(agent_id)
    }
}

#[async_trait]
impl Topology for CentralizedTopology {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn register(&self, info: AgentInfo) -> Result<()> {
        debug!(agent_id = %info.agent_id, "registering agent");
        self.directory.upsert(info);
        Ok(())
    }

    async fn unregister(&self, agent_id: &str) -> Result<()> {
        if self.directory.remove(agent_id).is_some() {
            debug!(agent_id, "unregistered agent");
        }
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.directory.get(agent_id)
    }

    async fn list(&self, capabilities: Option<&[String]>) -> Vec<AgentInfo> {
        self.directory.list(capabilities)
    }

    async fn route(&self, envelope: Envelope) -> Result<()> {
        match &envelope {
            Envelope::Direct(message) => {
                let Some(connection) = self.directory.connection_of(&message.target_agent_id)
                else {
                    return Err(NetworkError::Undeliverable(
                        message.target_agent_id.clone(),
                    ));
                };
                self.transport
                    .send(connection, Frame::message(&envelope)?)
                    .await
            }
            Envelope::Broadcast(message) => {
                let except = self.directory.connection_of(&message.sender_id);
                let frame = Frame::message(&envelope)?;
                let reached = self.transport.broadcast(frame, except).await?;
                debug!(
                    sender = %message.sender_id,
                    reached,
                    "broadcast routed"
                );
                Ok(())
            }
            Envelope::Mod(message) => {
                let Some(connection) =
                    self.directory.connection_of(&message.relevant_agent_id)
                else {
                    return Err(NetworkError::Undeliverable(
                        message.relevant_agent_id.clone(),
                    ));
                };
                self.transport
                    .send(connection, Frame::message(&envelope)?)
                    .await
            }
        }
    }

    async fn discover_peers(&self, capabilities: Option<&[String]>) -> Result<Vec<AgentInfo>> {
        Ok(self.directory.list(capabilities))
    }

    async fn handle_inbound(
        &self,
        _connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<Option<Envelope>> {
        Ok(Some(envelope))
    }

    async fn handle_system(
        &self,
        _connection_id: ConnectionId,
        _body: &SystemRequestBody,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn handle_disconnect(&self, connection_id: ConnectionId) {
        self.directory.detach_connection(connection_id);
    }
}

/// Client-side topology for centralized mode: a thin upstream forwarder.
///
/// Registers on connect, forwards every outbound envelope to the
/// coordinator connection, and keeps a local directory cache for
/// offline listing.
pub struct CentralizedClientTopology {
    transport: Arc<dyn Transport>,
    upstream: RwLock<Option<ConnectionId>>,
    directory: Directory,
}

impl CentralizedClientTopology {
    /// Create a client topology over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            upstream: RwLock::new(None),
            directory: Directory::new(),
        }
    }

    /// Bind the coordinator connection after a successful hello.
    pub fn set_upstream(&self, connection_id: ConnectionId) {
        if let Ok(mut upstream) = self.upstream.write() {
            *upstream = Some(connection_id);
        }
    }

    fn upstream(&self) -> Result<ConnectionId> {
        self.upstream
            .read()
            .ok()
            .and_then(|guard| *guard)
            .ok_or(NetworkError::NotConnected)
    }
}

#[async_trait]
impl Topology for CentralizedClientTopology {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn register(&self, info: AgentInfo) -> Result<()> {
        self.directory.upsert(info);
        Ok(())
    }

    async fn unregister(&self, agent_id: &str) -> Result<()> {
        self.directory.remove(agent_id);
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.directory.get(agent_id)
    }

    async fn list(&self, capabilities: Option<&[String]>) -> Vec<AgentInfo> {
        self.directory.list(capabilities)
    }

    async fn route(&self, envelope: Envelope) -> Result<()> {
        let upstream = self.upstream()?;
        self.transport
            .send(upstream, Frame::message(&envelope)?)
            .await
    }

    async fn discover_peers(&self, capabilities: Option<&[String]>) -> Result<Vec<AgentInfo>> {
        Ok(self.directory.list(capabilities))
    }

    async fn handle_inbound(
        &self,
        _connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<Option<Envelope>> {
        Ok(Some(envelope))
    }

    async fn handle_system(
        &self,
        _connection_id: ConnectionId,
        _body: &SystemRequestBody,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn handle_disconnect(&self, connection_id: ConnectionId) {
        if let Ok(mut upstream) = self.upstream.write() {
            if *upstream == Some(connection_id) {
                *upstream = None;
            }
        }
        self.directory.detach_connection(connection_id);
    }
}
