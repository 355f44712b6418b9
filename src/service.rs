//! The network service: owner of transport, topology, and identity.
//!
//! One `NetworkService` value wires the subsystems together — there are
//! no process-wide globals. On start it initializes the identity
//! manager, the transport, and the topology in that order, then begins
//! listening (server/node) or dials the coordinator (centralized
//! client), and finally binds registered server-side mods.
//!
//! Admission, the ingress/egress mod pipelines, and the system command
//! surface all live here. Mod pipelines run on the reader task of the
//! originating connection, so per-connection messages are processed
//! serially in arrival order.

use crate::config::{NetworkConfig, TopologyMode};
use crate::error::{NetworkError, Result};
use crate::frame::{
    ErrorCode, Frame, FrameType, HelloAckBody, HelloBody, SystemRequestBody, SystemResponseBody,
    COMMAND_CLAIM_AGENT_ID, COMMAND_LIST_AGENTS, COMMAND_LIST_MODS,
};
use crate::identity::{IdentityManager, IdentityStats};
use crate::message::Envelope;
use crate::mods::{ModLoadFailure, ModRegistry, ModSummary, NetworkMod};
use crate::topology::decentralized::is_node_metadata;
use crate::topology::{
    AgentInfo, CentralizedClientTopology, CentralizedTopology, DecentralizedTopology,
    LocalDelivery, Topology,
};
use crate::transport::{ConnectionEvent, ConnectionId, Transport, WebSocketTransport};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Topology selected at start-up.
enum TopologyKind {
    Server(Arc<CentralizedTopology>),
    Client(Arc<CentralizedClientTopology>),
    Gossip(Arc<DecentralizedTopology>),
}

impl TopologyKind {
    fn as_dyn(&self) -> Arc<dyn Topology> {
        match self {
            TopologyKind::Server(t) => t.clone(),
            TopologyKind::Client(t) => t.clone(),
            TopologyKind::Gossip(t) => t.clone(),
        }
    }
}

/// Point-in-time service counters.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub connections: usize,
    pub agents: usize,
    pub mods: usize,
    pub identity: IdentityStats,
}

struct ServiceInner {
    config: NetworkConfig,
    identity: Arc<IdentityManager>,
    transport: Arc<WebSocketTransport>,
    kind: TopologyKind,
    topology: Arc<dyn Topology>,
    mods: RwLock<Vec<Arc<dyn NetworkMod>>>,
    local_messages: broadcast::Sender<Envelope>,
    running: AtomicBool,
}

/// Non-owning handle a mod uses to reach its network.
#[derive(Clone)]
pub struct NetworkHandle {
    inner: Weak<ServiceInner>,
    name: String,
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle").field("name", &self.name).finish()
    }
}

impl NetworkHandle {
    /// The owning network's cosmetic name.
    #[must_use]
    pub fn network_name(&self) -> String {
        self.name.clone()
    }

    /// Send a mod-originated envelope through the egress pipeline.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the service is gone; routing errors pass
    /// through.
    pub async fn send_from_mod(&self, envelope: Envelope) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(NetworkError::ConnectionLost)?;
        inner.send_outbound(envelope).await
    }

    /// Current directory listing.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        match self.inner.upgrade() {
            Some(inner) => inner.topology.list(None).await,
            None => Vec::new(),
        }
    }
}

/// The network service.
pub struct NetworkService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for NetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService")
            .field("name", &self.inner.config.name)
            .field("mode", &self.inner.config.mode)
            .finish()
    }
}

impl NetworkService {
    /// Build a service from configuration. Nothing touches the network
    /// until [`NetworkService::start`].
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Config` on inconsistent configuration.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        let identity = Arc::new(IdentityManager::new(config.identity_ttl_hours));
        let transport = Arc::new(WebSocketTransport::new(config.clone()));
        let transport_dyn: Arc<dyn Transport> = transport.clone();

        let kind = match (config.mode, config.server_mode) {
            (TopologyMode::Centralized, true) => {
                TopologyKind::Server(Arc::new(CentralizedTopology::new(transport_dyn)))
            }
            (TopologyMode::Centralized, false) => {
                TopologyKind::Client(Arc::new(CentralizedClientTopology::new(transport_dyn)))
            }
            (TopologyMode::Decentralized, _) => TopologyKind::Gossip(Arc::new(
                DecentralizedTopology::new(config.clone(), transport_dyn),
            )),
        };
        let topology = kind.as_dyn();
        let (local_messages, _) = broadcast::channel(256);

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                identity,
                transport,
                kind,
                topology,
                mods: RwLock::new(Vec::new()),
                local_messages,
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Start the service: identity, transport, topology, mods, in that
    /// order.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot bind or the coordinator cannot be
    /// reached.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        inner.transport.initialize().await?;
        inner
            .transport
            .subscribe(Arc::new(ServiceFrameHandler {
                inner: Arc::downgrade(inner),
            }))
            .await;
        self.spawn_event_watcher();
        self.spawn_identity_sweeper();

        let mut local_addr = None;
        let is_listener = inner.config.server_mode
            || inner.config.mode == TopologyMode::Decentralized;
        if is_listener {
            local_addr = Some(inner.transport.listen().await?);
        }

        if let TopologyKind::Gossip(gossip) = &inner.kind {
            gossip
                .set_local_delivery(Arc::new(LocalSink {
                    sender: inner.local_messages.clone(),
                }))
                .await;
            if inner.config.discovery_enabled {
                self.spawn_discovery_sweeper(gossip);
            }
        }
        inner.topology.start().await?;

        if let TopologyKind::Client(client) = &inner.kind {
            let url = inner
                .config
                .coordinator_url
                .clone()
                .ok_or_else(|| {
                    NetworkError::Config("centralized client requires coordinator_url".to_string())
                })?;
            let hello = Frame::hello(&HelloBody {
                agent_id: inner
                    .config
                    .node_id
                    .clone()
                    .unwrap_or_else(|| format!("{}-client", inner.config.name)),
                metadata: crate::topology::decentralized::node_metadata(),
                capabilities: Vec::new(),
                certificate: None,
            })?;
            let upstream = inner.transport.dial(&url, hello).await?;
            client.set_upstream(upstream);
            info!(%url, "connected to coordinator");
        }

        // Bind mods registered before start.
        let mods = inner.mods.read().await.clone();
        for network_mod in mods {
            network_mod.bind_network(self.handle()).await;
            if let Err(e) = network_mod.initialize().await {
                warn!(mod_name = network_mod.mod_name(), error = %e, "mod initialize failed");
            }
        }

        info!(
            name = %inner.config.name,
            mode = ?inner.config.mode,
            addr = ?local_addr,
            "network service started"
        );
        Ok(local_addr)
    }

    /// Graceful stop: mods, topology, transport.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for network_mod in inner.mods.read().await.iter() {
            if let Err(e) = network_mod.shutdown().await {
                warn!(mod_name = network_mod.mod_name(), error = %e, "mod shutdown failed");
            }
        }
        inner.topology.stop().await?;
        inner.transport.shutdown().await?;
        info!(name = %inner.config.name, "network service stopped");
        Ok(())
    }

    /// A non-owning handle for mods and embedders.
    #[must_use]
    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            inner: Arc::downgrade(&self.inner),
            name: self.inner.config.name.clone(),
        }
    }

    /// Register a server-side mod. Chain order is registration order.
    pub async fn register_mod(&self, network_mod: Arc<dyn NetworkMod>) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            network_mod.bind_network(self.handle()).await;
            network_mod.initialize().await?;
        }
        info!(mod_name = network_mod.mod_name(), "registered network mod");
        self.inner.mods.write().await.push(network_mod);
        Ok(())
    }

    /// Load and register server-side mods by name from a registry.
    /// Per-mod failures are returned, never fatal.
    pub async fn load_mods(
        &self,
        registry: &ModRegistry,
        names: &[String],
    ) -> Vec<ModLoadFailure> {
        let (loaded, failures) = registry.load_network_mods(names);
        for network_mod in loaded {
            if let Err(e) = self.register_mod(network_mod).await {
                warn!(error = %e, "mod registration failed");
            }
        }
        failures
    }

    /// Send a locally-originated envelope through the egress pipeline.
    ///
    /// # Errors
    ///
    /// Routing errors pass through.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.inner.send_outbound(envelope).await
    }

    /// Envelopes that terminate at this service (centralized-client
    /// inbound, relayed local deliveries).
    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Envelope> {
        self.inner.local_messages.subscribe()
    }

    /// The identity manager (shared-secret set-ups, tests).
    #[must_use]
    pub fn identity(&self) -> Arc<IdentityManager> {
        self.inner.identity.clone()
    }

    /// Directory listing.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        self.inner.topology.list(None).await
    }

    /// Discover peers, optionally by capability.
    pub async fn discover_peers(
        &self,
        capabilities: Option<&[String]>,
    ) -> Result<Vec<AgentInfo>> {
        self.inner.topology.discover_peers(capabilities).await
    }

    /// Service counters.
    pub async fn stats(&self) -> NetworkStats {
        NetworkStats {
            connections: self.inner.transport.connection_count(),
            agents: self.inner.topology.list(None).await.len(),
            mods: self.inner.mods.read().await.len(),
            identity: self.inner.identity.stats(),
        }
    }

    fn spawn_event_watcher(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.inner.transport.events();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                if let ConnectionEvent::Closed {
                    connection_id,
                    agent_id,
                    reason,
                } = event
                {
                    inner.topology.handle_disconnect(connection_id).await;
                    if let Some(agent_id) = agent_id {
                        debug!(%agent_id, %reason, "agent connection closed");
                        let _ = inner.topology.unregister(&agent_id).await;
                        for network_mod in inner.mods.read().await.iter() {
                            network_mod.handle_unregister_agent(&agent_id).await;
                        }
                    }
                }
            }
        });
    }

    /// Periodic gossip discovery keeps the partial directory warm.
    fn spawn_discovery_sweeper(&self, gossip: &Arc<DecentralizedTopology>) {
        let weak_service = Arc::downgrade(&self.inner);
        let weak_gossip = Arc::downgrade(gossip);
        let period = self.inner.config.discovery_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so bootstrap
            // dials settle first.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak_service.upgrade() else { break };
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(gossip) = weak_gossip.upgrade() else { break };
                match gossip.discover_peers(None).await {
                    Ok(found) => debug!(peers = found.len(), "discovery sweep"),
                    Err(e) => debug!(error = %e, "discovery sweep failed"),
                }
            }
        });
    }

    fn spawn_identity_sweeper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.identity.ttl() / 10;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                inner.identity.sweep();
            }
        });
    }
}

struct LocalSink {
    sender: broadcast::Sender<Envelope>,
}

#[async_trait]
impl LocalDelivery for LocalSink {
    async fn deliver(&self, envelope: Envelope) {
        let _ = self.sender.send(envelope);
    }
}

struct ServiceFrameHandler {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl crate::transport::FrameHandler for ServiceFrameHandler {
    async fn on_frame(&self, connection_id: ConnectionId, frame: Frame) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match frame.frame_type {
            FrameType::Hello => inner.handle_hello(connection_id, &frame).await,
            FrameType::Message => inner.handle_message(connection_id, &frame).await,
            FrameType::SystemRequest => inner.handle_system_request(connection_id, &frame).await,
            FrameType::HelloAck => {
                debug!(%connection_id, "hello_ack received");
            }
            FrameType::SystemResponse | FrameType::Error => {
                debug!(%connection_id, frame_type = ?frame.frame_type, "frame ignored by service");
            }
            FrameType::Ping | FrameType::Pong => {}
        }
    }
}

impl ServiceInner {
    /// Admission: decide whether a hello may join, per the certificate
    /// rules, then register the peer.
    async fn handle_hello(&self, connection_id: ConnectionId, frame: &Frame) {
        let body: HelloBody = match frame.body_as() {
            Ok(body) => body,
            Err(e) => {
                warn!(%connection_id, error = %e, "malformed hello");
                self.reject(connection_id, "malformed hello").await;
                return;
            }
        };

        let mut issued_certificate = None;
        match &body.certificate {
            Some(certificate) => {
                let valid = certificate.agent_id == body.agent_id
                    && self.identity.validate(certificate);
                if !valid {
                    // Certificate-override reconnect only works with the
                    // exact certificate the ID is claimed under.
                    self.reject(connection_id, "invalid certificate").await;
                    return;
                }
            }
            None => {
                if self.identity.is_claimed(&body.agent_id) {
                    self.reject(connection_id, "agent id already in use").await;
                    return;
                }
                match self.identity.claim(&body.agent_id, false) {
                    Some(certificate) => issued_certificate = Some(certificate),
                    None => {
                        self.reject(connection_id, "agent id already in use").await;
                        return;
                    }
                }
            }
        }

        self.transport.identify(connection_id, &body.agent_id);

        let mut info = AgentInfo::new(&body.agent_id);
        info.metadata = body.metadata.clone();
        info.capabilities = body.capabilities.clone();
        info.connection_id = Some(connection_id);
        if let Err(e) = self.topology.register(info).await {
            warn!(agent_id = %body.agent_id, error = %e, "registration failed");
        }

        if is_node_metadata(&body.metadata) {
            let mods = body
                .metadata
                .get("mods")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            self.topology
                .add_peer_link(connection_id, &body.agent_id, mods)
                .await;
        }

        for network_mod in self.mods.read().await.iter() {
            network_mod
                .handle_register_agent(&body.agent_id, &body.metadata)
                .await;
        }

        let ack = HelloAckBody {
            accepted: true,
            reason: None,
            certificate: issued_certificate,
        };
        match Frame::hello_ack(&ack) {
            Ok(frame) => {
                if let Err(e) = self.transport.send(connection_id, frame).await {
                    warn!(%connection_id, error = %e, "hello_ack send failed");
                }
            }
            Err(e) => warn!(error = %e, "hello_ack encode failed"),
        }
        info!(agent_id = %body.agent_id, %connection_id, "agent admitted");
    }

    async fn reject(&self, connection_id: ConnectionId, reason: &str) {
        let ack = HelloAckBody {
            accepted: false,
            reason: Some(reason.to_string()),
            certificate: None,
        };
        if let Ok(frame) = Frame::hello_ack(&ack) {
            let _ = self.transport.send(connection_id, frame).await;
        }
        // Give the ack a moment to flush before tearing the stream down.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = self.transport.close(connection_id, reason).await;
        info!(%connection_id, reason, "admission rejected");
    }

    /// Ingress pipeline: authenticate, dedup, mod chain, route.
    async fn handle_message(&self, connection_id: ConnectionId, frame: &Frame) {
        let envelope = match frame.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%connection_id, error = %e, "unparseable message frame");
                return;
            }
        };

        // Sender must match the identified peer. Node links and the
        // centralized-client upstream carry third-party envelopes and
        // are exempt.
        let exempt = self.is_peer_link(connection_id)
            || matches!(self.kind, TopologyKind::Client(_));
        if !exempt {
            match self.transport.agent_of(connection_id) {
                Some(agent_id) if agent_id == envelope.sender_id() => {}
                identified => {
                    warn!(
                        %connection_id,
                        claimed = %envelope.sender_id(),
                        ?identified,
                        "sender mismatch, dropping message"
                    );
                    return;
                }
            }
        }

        let envelope = match self.topology.handle_inbound(connection_id, envelope).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                debug!(%connection_id, error = %e, "topology consumed message with error");
                return;
            }
        };

        let Some(envelope) = self.run_server_chain(envelope).await else {
            return;
        };

        if matches!(self.kind, TopologyKind::Client(_)) {
            // Centralized client: inbound traffic terminates here.
            let _ = self.local_messages.send(envelope);
            return;
        }

        match &envelope {
            Envelope::Mod(message) => {
                // Outbound-scoped messages terminate at the named mod;
                // inbound-scoped ones are deliveries toward an agent.
                if message.direction == crate::message::ModDirection::Inbound {
                    self.route_or_report(connection_id, envelope.clone()).await;
                    return;
                }
                let target = self.find_mod(&message.mod_name).await;
                match target {
                    Some(network_mod) => {
                        let call = std::panic::AssertUnwindSafe(
                            network_mod.process_mod_message(message.clone()),
                        )
                        .catch_unwind()
                        .await;
                        if call.is_err() {
                            warn!(
                                mod_name = %message.mod_name,
                                message_id = %message.message_id,
                                "mod panicked in process_mod_message"
                            );
                        }
                    }
                    None => {
                        let reply = Frame::error(
                            ErrorCode::ModUnknown,
                            format!("no mod named {}", message.mod_name),
                        );
                        if let Ok(reply) = reply {
                            let _ = self.transport.send(connection_id, reply).await;
                        }
                    }
                }
            }
            _ => {
                self.route_or_report(connection_id, envelope).await;
            }
        }
    }

    async fn route_or_report(&self, source: ConnectionId, envelope: Envelope) {
        match self.topology.route(envelope).await {
            Ok(()) => {}
            Err(NetworkError::Undeliverable(target)) => {
                debug!(%target, "undeliverable message");
                if let Ok(reply) = Frame::error(
                    ErrorCode::Undeliverable,
                    format!("no agent {target} in directory"),
                ) {
                    let _ = self.transport.send(source, reply).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "routing failed");
            }
        }
    }

    /// Egress pipeline for mod- and service-originated sends.
    async fn send_outbound(&self, envelope: Envelope) -> Result<()> {
        let Some(envelope) = self.run_server_chain(envelope).await else {
            return Ok(());
        };
        self.topology.route(envelope).await
    }

    /// The ordered server-mod chain. Returns `None` when a mod consumed
    /// the message; mod panics drop the message and the chain survives.
    async fn run_server_chain(&self, envelope: Envelope) -> Option<Envelope> {
        let mods = self.mods.read().await.clone();
        match envelope {
            Envelope::Direct(mut message) => {
                for network_mod in &mods {
                    let message_id = message.message_id.clone();
                    let call = std::panic::AssertUnwindSafe(
                        network_mod.process_direct_message(message),
                    )
                    .catch_unwind()
                    .await;
                    match call {
                        Ok(Some(next)) => message = next,
                        Ok(None) => {
                            debug!(
                                mod_name = network_mod.mod_name(),
                                %message_id,
                                "direct message consumed by mod"
                            );
                            return None;
                        }
                        Err(_) => {
                            warn!(
                                mod_name = network_mod.mod_name(),
                                %message_id,
                                "mod panicked, dropping message"
                            );
                            return None;
                        }
                    }
                }
                Some(Envelope::Direct(message))
            }
            Envelope::Broadcast(mut message) => {
                for network_mod in &mods {
                    let message_id = message.message_id.clone();
                    let call = std::panic::AssertUnwindSafe(
                        network_mod.process_broadcast_message(message),
                    )
                    .catch_unwind()
                    .await;
                    match call {
                        Ok(Some(next)) => message = next,
                        Ok(None) => {
                            debug!(
                                mod_name = network_mod.mod_name(),
                                %message_id,
                                "broadcast consumed by mod"
                            );
                            return None;
                        }
                        Err(_) => {
                            warn!(
                                mod_name = network_mod.mod_name(),
                                %message_id,
                                "mod panicked, dropping message"
                            );
                            return None;
                        }
                    }
                }
                Some(Envelope::Broadcast(message))
            }
            Envelope::Mod(message) => Some(Envelope::Mod(message)),
        }
    }

    async fn find_mod(&self, mod_name: &str) -> Option<Arc<dyn NetworkMod>> {
        self.mods
            .read()
            .await
            .iter()
            .find(|network_mod| network_mod.mod_name() == mod_name)
            .cloned()
    }

    fn is_peer_link(&self, connection_id: ConnectionId) -> bool {
        match &self.kind {
            TopologyKind::Gossip(gossip) => gossip.is_peer_link(connection_id),
            _ => false,
        }
    }

    /// System commands: topology control first, then the public surface.
    async fn handle_system_request(&self, connection_id: ConnectionId, frame: &Frame) {
        let body: SystemRequestBody = match frame.body_as() {
            Ok(body) => body,
            Err(e) => {
                warn!(%connection_id, error = %e, "malformed system request");
                return;
            }
        };

        match self.topology.handle_system(connection_id, &body).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                debug!(%connection_id, error = %e, "topology control error");
                return;
            }
        }

        let Some(correlation_id) = frame.correlation_id.clone() else {
            warn!(%connection_id, command = %body.command, "system request without correlation id");
            return;
        };

        let response = match body.command.as_str() {
            COMMAND_LIST_AGENTS => {
                let agents = self.topology.list(None).await;
                let rows: Vec<Value> = agents
                    .iter()
                    .map(|info| {
                        json!({
                            "agent_id": info.agent_id,
                            "metadata": info.metadata,
                            "capabilities": info.capabilities,
                            "connected": info.connection_id.is_some(),
                        })
                    })
                    .collect();
                SystemResponseBody {
                    ok: true,
                    data: Some(json!({ "agents": rows })),
                    error: None,
                }
            }
            COMMAND_LIST_MODS => {
                let mods = self.mods.read().await;
                let rows: Vec<ModSummary> = mods
                    .iter()
                    .map(|network_mod| ModSummary {
                        name: network_mod.mod_name().to_string(),
                        version: network_mod.version().to_string(),
                        requires_adapter: network_mod.requires_adapter(),
                    })
                    .collect();
                SystemResponseBody {
                    ok: true,
                    data: serde_json::to_value(rows)
                        .ok()
                        .map(|mods| json!({ "mods": mods })),
                    error: None,
                }
            }
            COMMAND_CLAIM_AGENT_ID => {
                let agent_id = body.args.get("agent_id").and_then(Value::as_str);
                let force = body
                    .args
                    .get("force")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match agent_id {
                    Some(agent_id) => match self.identity.claim(agent_id, force) {
                        Some(certificate) => SystemResponseBody {
                            ok: true,
                            data: serde_json::to_value(&certificate)
                                .ok()
                                .map(|cert| json!({ "certificate": cert })),
                            error: None,
                        },
                        None => SystemResponseBody {
                            ok: false,
                            data: None,
                            error: Some("AgentIDInUse".to_string()),
                        },
                    },
                    None => SystemResponseBody {
                        ok: false,
                        data: None,
                        error: Some("missing agent_id".to_string()),
                    },
                }
            }
            other => SystemResponseBody {
                ok: false,
                data: None,
                error: Some(format!("unknown command: {other}")),
            },
        };

        match Frame::system_response(correlation_id, &response) {
            Ok(frame) => {
                if let Err(e) = self.transport.send(connection_id, frame).await {
                    debug!(%connection_id, error = %e, "system response send failed");
                }
            }
            Err(e) => warn!(error = %e, "system response encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn server_config(port: u16) -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.port = port;
        config
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let service = NetworkService::new(server_config(18580)).unwrap();
        let addr = service.start().await.unwrap();
        assert!(addr.is_some());
        assert!(service.start().await.unwrap().is_none());
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stats_reflect_registered_mods() {
        let service = NetworkService::new(server_config(18581)).unwrap();
        service
            .register_mod(Arc::new(crate::mods::RegistrationMod::new()))
            .await
            .unwrap();
        let stats = service.stats().await;
        assert_eq!(stats.mods, 1);
        assert_eq!(stats.agents, 0);
    }

    #[tokio::test]
    async fn load_mods_reports_unknown_names() {
        let service = NetworkService::new(server_config(18582)).unwrap();
        let registry = ModRegistry::with_builtins();
        let failures = service
            .load_mods(
                &registry,
                &["registration".to_string(), "ghost".to_string()],
            )
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "ghost");
        assert_eq!(service.stats().await.mods, 1);
    }

    #[tokio::test]
    async fn client_mode_requires_coordinator_url() {
        let mut config = server_config(0);
        config.server_mode = false;
        assert!(NetworkService::new(config).is_err());
    }
}
