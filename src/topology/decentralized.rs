//! Decentralized (gossip) topology.
//!
//! Every node holds a partial directory and a set of peer links. Control
//! traffic — announces, discovery queries, direct-message relays — rides
//! on `system_request` frames with reserved `gossip_*` commands that only
//! node-to-node links carry. Announce floods are TTL-bounded and
//! deduplicated by `(agent_id, issued_at)`; broadcast gossip is
//! deduplicated by `message_id`; directs fall back to a bounded-hop
//! relay when the target is not locally connected.

use crate::config::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::frame::{Frame, SystemRequestBody};
use crate::message::{parse_envelope, Envelope};
use crate::topology::{AgentInfo, Directory, LocalDelivery, Topology};
use crate::transport::{ConnectionId, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

/// Hop budget for broadcast gossip.
pub const GOSSIP_TTL: u64 = 3;
/// Hop budget for directory announce floods.
pub const ANNOUNCE_TTL: u64 = 3;
/// Hop budget for direct-message relays.
pub const RELAY_HOPS: u64 = 3;

/// Envelope metadata key carrying the remaining gossip budget.
pub const GOSSIP_TTL_KEY: &str = "gossip_ttl";

const COMMAND_ANNOUNCE: &str = "gossip_announce";
const COMMAND_DISCOVER: &str = "gossip_discover";
const COMMAND_DISCOVER_REPLY: &str = "gossip_discover_reply";
const COMMAND_RELAY: &str = "gossip_relay";

/// Bound on remembered gossip ids.
const SEEN_CAP: usize = 4096;

/// Ceiling on the discovery aggregation window.
const DISCOVERY_WINDOW_CAP: std::time::Duration = std::time::Duration::from_secs(2);

/// Whether a system command is reserved gossip control traffic.
#[must_use]
pub fn is_gossip_command(command: &str) -> bool {
    matches!(
        command,
        COMMAND_ANNOUNCE | COMMAND_DISCOVER | COMMAND_DISCOVER_REPLY | COMMAND_RELAY
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct AnnounceArgs {
    info: AgentInfo,
    issued_at: f64,
    ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiscoverArgs {
    query_id: String,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiscoverReplyArgs {
    query_id: String,
    agents: Vec<AgentInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayArgs {
    envelope: Value,
    hops: u64,
}

/// Bounded first-seen set.
#[derive(Debug, Default)]
struct SeenSet {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenSet {
    /// Record `key`; returns true the first time it is seen.
    fn first_sight(&mut self, key: &str) -> bool {
        if !self.set.insert(key.to_string()) {
            return false;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > SEEN_CAP {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct PeerLink {
    node_id: String,
    mods: HashSet<String>,
}

/// Gossip topology node.
pub struct DecentralizedTopology {
    node_id: String,
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    directory: Directory,
    peers: Mutex<HashMap<ConnectionId, PeerLink>>,
    seen_messages: Mutex<SeenSet>,
    seen_announces: Mutex<SeenSet>,
    query_origins: Mutex<HashMap<String, ConnectionId>>,
    pending_queries: Mutex<HashMap<String, mpsc::Sender<Vec<AgentInfo>>>>,
    local_delivery: RwLock<Option<Arc<dyn LocalDelivery>>>,
    shutdown: broadcast::Sender<()>,
}

impl DecentralizedTopology {
    /// Create a gossip node from configuration.
    #[must_use]
    pub fn new(config: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            node_id,
            config,
            transport,
            directory: Directory::new(),
            peers: Mutex::new(HashMap::new()),
            seen_messages: Mutex::new(SeenSet::default()),
            seen_announces: Mutex::new(SeenSet::default()),
            query_origins: Mutex::new(HashMap::new()),
            pending_queries: Mutex::new(HashMap::new()),
            local_delivery: RwLock::new(None),
            shutdown,
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether a connection is a node-to-node peer link.
    #[must_use]
    pub fn is_peer_link(&self, connection_id: ConnectionId) -> bool {
        self.lock_peers().contains_key(&connection_id)
    }

    /// Attach the sink for envelopes that terminate at this node.
    pub async fn set_local_delivery(&self, sink: Arc<dyn LocalDelivery>) {
        *self.local_delivery.write().await = Some(sink);
    }

    fn peer_connections(&self, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.lock_peers()
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect()
    }

    fn peer_connections_with_mod(&self, mod_name: &str, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.lock_peers()
            .iter()
            .filter(|(id, link)| Some(**id) != except && link.mods.contains(mod_name))
            .map(|(id, _)| *id)
            .collect()
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, PeerLink>> {
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn first_sight_message(&self, message_id: &str) -> bool {
        match self.seen_messages.lock() {
            Ok(mut seen) => seen.first_sight(message_id),
            Err(poisoned) => poisoned.into_inner().first_sight(message_id),
        }
    }

    fn first_sight_announce(&self, key: &str) -> bool {
        match self.seen_announces.lock() {
            Ok(mut seen) => seen.first_sight(key),
            Err(poisoned) => poisoned.into_inner().first_sight(key),
        }
    }

    async fn send_system(
        &self,
        connection_id: ConnectionId,
        command: &str,
        args: Value,
    ) -> Result<()> {
        let frame = Frame::system_request(crate::message::new_message_id(), command, args)?;
        self.transport.send(connection_id, frame).await
    }

    async fn flood_system(
        &self,
        command: &str,
        args: Value,
        except: Option<ConnectionId>,
    ) -> usize {
        let peers = self.peer_connections(except);
        let count = peers.len();
        for connection_id in peers {
            if let Err(e) = self.send_system(connection_id, command, args.clone()).await {
                debug!(%connection_id, error = %e, "gossip send failed");
            }
        }
        count
    }

    async fn flood_announce(&self, info: &AgentInfo, issued_at: f64, ttl: u64, except: Option<ConnectionId>) {
        let mut announced = info.clone();
        announced.connection_id = None;
        let Ok(args) = serde_json::to_value(AnnounceArgs {
            info: announced,
            issued_at,
            ttl,
        }) else {
            return;
        };
        let reached = self.flood_system(COMMAND_ANNOUNCE, args, except).await;
        debug!(agent_id = %info.agent_id, ttl, reached, "flooded announce");
    }

    /// Connections of locally attached agents, excluding `except_agent`.
    /// Peer nodes registered through node hellos are reached by gossip,
    /// not local fanout.
    fn local_agent_connections(&self, except_agent: &str) -> Vec<ConnectionId> {
        self.directory
            .list(None)
            .into_iter()
            .filter(|info| info.agent_id != except_agent && !is_node_metadata(&info.metadata))
            .filter_map(|info| info.connection_id)
            .collect()
    }

    /// Fan a broadcast/mod envelope to local agents and gossip it to
    /// peers with a decremented TTL.
    async fn fan_out(&self, mut envelope: Envelope) -> Result<()> {
        self.first_sight_message(envelope.message_id());
        let ttl = envelope
            .metadata()
            .get(GOSSIP_TTL_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(GOSSIP_TTL);
        envelope
            .metadata_mut()
            .insert(GOSSIP_TTL_KEY.to_string(), Value::from(ttl));

        let local = match &envelope {
            Envelope::Mod(message) => {
                // Inbound-scoped mod deliveries target one agent.
                match self.directory.connection_of(&message.relevant_agent_id) {
                    Some(connection) => vec![connection],
                    None => Vec::new(),
                }
            }
            _ => self.local_agent_connections(envelope.sender_id()),
        };
        let frame = Frame::message(&envelope)?;
        for connection_id in local {
            if let Err(e) = self.transport.send(connection_id, frame.clone()).await {
                debug!(%connection_id, error = %e, "local fanout send failed");
            }
        }

        if ttl == 0 {
            return Ok(());
        }
        envelope
            .metadata_mut()
            .insert(GOSSIP_TTL_KEY.to_string(), Value::from(ttl - 1));
        let peers = match &envelope {
            Envelope::Mod(message) => self.peer_connections_with_mod(&message.mod_name, None),
            _ => self.peer_connections(None),
        };
        let frame = Frame::message(&envelope)?;
        for connection_id in peers {
            if let Err(e) = self.transport.send(connection_id, frame.clone()).await {
                debug!(%connection_id, error = %e, "gossip send failed");
            }
        }
        Ok(())
    }

    async fn handle_relay(&self, source: ConnectionId, args: RelayArgs) {
        let envelope = match parse_envelope(args.envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping relay with bad envelope");
                return;
            }
        };
        if !self.first_sight_message(envelope.message_id()) {
            return;
        }
        let Envelope::Direct(ref message) = envelope else {
            warn!("dropping relay carrying non-direct envelope");
            return;
        };

        if let Some(connection) = self.directory.connection_of(&message.target_agent_id) {
            if let Ok(frame) = Frame::message(&envelope) {
                if let Err(e) = self.transport.send(connection, frame).await {
                    debug!(error = %e, "relay local delivery failed");
                }
            }
            return;
        }

        let delivery = self.local_delivery.read().await.clone();
        if let Some(sink) = delivery {
            if self.directory.get(&message.target_agent_id).is_some() {
                sink.deliver(envelope).await;
                return;
            }
        }

        if args.hops == 0 {
            debug!(target = %message.target_agent_id, "relay hop budget exhausted");
            return;
        }
        let Ok(value) = envelope.to_value() else {
            return;
        };
        let Ok(forward) = serde_json::to_value(RelayArgs {
            envelope: value,
            hops: args.hops - 1,
        }) else {
            return;
        };
        self.flood_system(COMMAND_RELAY, forward, Some(source)).await;
    }

    async fn handle_discover(&self, source: ConnectionId, args: DiscoverArgs) {
        // Loop guard: each query id is handled once per node.
        if !self.first_sight_announce(&format!("query:{}", args.query_id)) {
            return;
        }
        if let Ok(mut origins) = self.query_origins.lock() {
            origins.insert(args.query_id.clone(), source);
            if origins.len() > SEEN_CAP {
                origins.clear();
            }
        }

        let matches = self.directory.list(args.capabilities.as_deref());
        if !matches.is_empty() {
            let reply = DiscoverReplyArgs {
                query_id: args.query_id.clone(),
                agents: matches
                    .into_iter()
                    .map(|mut info| {
                        info.connection_id = None;
                        info
                    })
                    .collect(),
            };
            if let Ok(value) = serde_json::to_value(&reply) {
                let _ = self.send_system(source, COMMAND_DISCOVER_REPLY, value).await;
            }
        }

        if args.ttl > 0 {
            let forward = DiscoverArgs {
                query_id: args.query_id,
                capabilities: args.capabilities,
                ttl: args.ttl - 1,
            };
            if let Ok(value) = serde_json::to_value(&forward) {
                self.flood_system(COMMAND_DISCOVER, value, Some(source)).await;
            }
        }
    }

    async fn handle_discover_reply(&self, args: DiscoverReplyArgs) {
        let pending = match self.pending_queries.lock() {
            Ok(pending) => pending.get(&args.query_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&args.query_id).cloned(),
        };
        if let Some(tx) = pending {
            let _ = tx.try_send(args.agents);
            return;
        }
        // Not ours: relay back toward the querying node.
        let origin = match self.query_origins.lock() {
            Ok(origins) => origins.get(&args.query_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(&args.query_id).copied(),
        };
        if let Some(connection) = origin {
            if let Ok(value) = serde_json::to_value(&args) {
                let _ = self.send_system(connection, COMMAND_DISCOVER_REPLY, value).await;
            }
        }
    }
}

#[async_trait]
impl Topology for DecentralizedTopology {
    async fn start(&self) -> Result<()> {
        for url in self.config.bootstrap_nodes.clone() {
            let hello = Frame::hello(&crate::frame::HelloBody {
                agent_id: self.node_id.clone(),
                metadata: node_metadata(),
                capabilities: Vec::new(),
                certificate: None,
            })?;
            match self.transport.dial(&url, hello).await {
                Ok(connection_id) => {
                    info!(%url, %connection_id, "connected to bootstrap node");
                    self.add_peer_link(connection_id, &format!("bootstrap:{url}"), Vec::new())
                        .await;
                }
                Err(e) => warn!(%url, error = %e, "bootstrap dial failed"),
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        Ok(())
    }

    async fn register(&self, info: AgentInfo) -> Result<()> {
        let issued_at = crate::message::now_timestamp();
        self.directory.upsert(info.clone());
        let key = format!("{}:{:x}", info.agent_id, issued_at.to_bits());
        self.first_sight_announce(&key);
        self.flood_announce(&info, issued_at, ANNOUNCE_TTL, None).await;
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
        match &envelope {
            Envelope::Direct(message) => {
                if let Some(connection) = self.directory.connection_of(&message.target_agent_id) {
                    return self
                        .transport
                        .send(connection, Frame::message(&envelope)?)
                        .await;
                }
                self.first_sight_message(envelope.message_id());
                let args = serde_json::to_value(RelayArgs {
                    envelope: envelope.to_value()?,
                    hops: RELAY_HOPS,
                })?;
                let reached = self.flood_system(COMMAND_RELAY, args, None).await;
                if reached == 0 {
                    return Err(NetworkError::Undeliverable(
                        message.target_agent_id.clone(),
                    ));
                }
                Ok(())
            }
            Envelope::Broadcast(_) | Envelope::Mod(_) => self.fan_out(envelope).await,
        }
    }

    async fn discover_peers(&self, capabilities: Option<&[String]>) -> Result<Vec<AgentInfo>> {
        let query_id = crate::message::new_message_id();
        let (tx, mut rx) = mpsc::channel::<Vec<AgentInfo>>(16);
        if let Ok(mut pending) = self.pending_queries.lock() {
            pending.insert(query_id.clone(), tx);
        }

        let args = serde_json::to_value(DiscoverArgs {
            query_id: query_id.clone(),
            capabilities: capabilities.map(|wanted| wanted.to_vec()),
            ttl: ANNOUNCE_TTL,
        })?;
        let reached = self.flood_system(COMMAND_DISCOVER, args, None).await;

        let mut found: HashMap<String, AgentInfo> = self
            .directory
            .list(capabilities)
            .into_iter()
            .map(|info| (info.agent_id.clone(), info))
            .collect();

        if reached > 0 {
            let window = self.config.discovery_interval.min(DISCOVERY_WINDOW_CAP);
            let deadline = tokio::time::Instant::now() + window;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(agents)) => {
                        for info in agents {
                            self.directory.upsert(info.clone());
                            found.entry(info.agent_id.clone()).or_insert(info);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        if let Ok(mut pending) = self.pending_queries.lock() {
            pending.remove(&query_id);
        }

        let mut agents: Vec<AgentInfo> = found.into_values().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn handle_inbound(
        &self,
        _connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<Option<Envelope>> {
        match &envelope {
            Envelope::Direct(_) => Ok(Some(envelope)),
            // First sight passes (and will be re-propagated by the
            // caller's route); duplicates stop here.
            Envelope::Broadcast(_) | Envelope::Mod(_) => {
                if !self.first_sight_message(envelope.message_id()) {
                    return Ok(None);
                }
                Ok(Some(envelope))
            }
        }
    }

    async fn handle_system(
        &self,
        connection_id: ConnectionId,
        body: &SystemRequestBody,
    ) -> Result<bool> {
        if !is_gossip_command(&body.command) {
            return Ok(false);
        }
        // Gossip control is node-to-node traffic; agent connections do
        // not speak it.
        if !self.is_peer_link(connection_id) {
            warn!(%connection_id, command = %body.command, "gossip command from non-peer link");
            return Ok(false);
        }
        match body.command.as_str() {
            COMMAND_ANNOUNCE => {
                let args: AnnounceArgs = serde_json::from_value(body.args.clone())
                    .map_err(|e| NetworkError::BadFrame(format!("announce args: {e}")))?;
                let key = format!("{}:{:x}", args.info.agent_id, args.issued_at.to_bits());
                if self.first_sight_announce(&key) {
                    debug!(agent_id = %args.info.agent_id, "learned agent via announce");
                    let mut info = args.info.clone();
                    info.connection_id = None;
                    self.directory.upsert(info);
                    if args.ttl > 0 {
                        self.flood_announce(
                            &args.info,
                            args.issued_at,
                            args.ttl - 1,
                            Some(connection_id),
                        )
                        .await;
                    }
                }
            }
            COMMAND_DISCOVER => {
                let args: DiscoverArgs = serde_json::from_value(body.args.clone())
                    .map_err(|e| NetworkError::BadFrame(format!("discover args: {e}")))?;
                self.handle_discover(connection_id, args).await;
            }
            COMMAND_DISCOVER_REPLY => {
                let args: DiscoverReplyArgs = serde_json::from_value(body.args.clone())
                    .map_err(|e| NetworkError::BadFrame(format!("discover reply args: {e}")))?;
                self.handle_discover_reply(args).await;
            }
            COMMAND_RELAY => {
                let args: RelayArgs = serde_json::from_value(body.args.clone())
                    .map_err(|e| NetworkError::BadFrame(format!("relay args: {e}")))?;
                self.handle_relay(connection_id, args).await;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn handle_disconnect(&self, connection_id: ConnectionId) {
        if let Some(link) = self.lock_peers().remove(&connection_id) {
            debug!(%connection_id, node_id = %link.node_id, "peer link lost");
        }
        self.directory.detach_connection(connection_id);
    }

    async fn add_peer_link(
        &self,
        connection_id: ConnectionId,
        node_id: &str,
        mods: Vec<String>,
    ) {
        debug!(%connection_id, node_id, "peer link added");
        self.lock_peers().insert(
            connection_id,
            PeerLink {
                node_id: node_id.to_string(),
                mods: mods.into_iter().collect(),
            },
        );
    }
}

/// Metadata marking a hello as a node-to-node peer link.
#[must_use]
pub fn node_metadata() -> crate::message::ContentMap {
    let mut metadata = crate::message::ContentMap::new();
    metadata.insert("role".to_string(), Value::from("node"));
    metadata
}

/// Whether hello metadata identifies a peer node rather than an agent.
#[must_use]
pub fn is_node_metadata(metadata: &crate::message::ContentMap) -> bool {
    metadata.get("role").and_then(Value::as_str) == Some("node")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::message::{BroadcastMessage, ContentMap, DirectMessage};
    use crate::transport::{ConnectionEvent, ConnectionInfo, FrameHandler};
    use std::net::SocketAddr;

    struct RecordingTransport {
        sent: tokio::sync::Mutex<Vec<(ConnectionId, Frame)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        async fn listen(&self) -> Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().expect("valid addr"))
        }
        async fn dial(&self, _url: &str, _hello: Frame) -> Result<ConnectionId> {
            Ok(ConnectionId::new())
        }
        async fn send(&self, connection_id: ConnectionId, frame: Frame) -> Result<()> {
            self.sent.lock().await.push((connection_id, frame));
            Ok(())
        }
        async fn broadcast(&self, _frame: Frame, _except: Option<ConnectionId>) -> Result<usize> {
            Ok(0)
        }
        async fn close(&self, _connection_id: ConnectionId, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _handler: Arc<dyn FrameHandler>) {}
        fn events(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
            let (tx, rx) = tokio::sync::broadcast::channel(1);
            drop(tx);
            rx
        }
        fn identify(&self, _connection_id: ConnectionId, _agent_id: &str) {}
        fn agent_of(&self, _connection_id: ConnectionId) -> Option<String> {
            None
        }
        fn connections(&self) -> Vec<ConnectionInfo> {
            Vec::new()
        }
    }

    fn topology_with_peer() -> (DecentralizedTopology, Arc<RecordingTransport>, ConnectionId) {
        let transport = Arc::new(RecordingTransport::new());
        let mut config = NetworkConfig::default();
        config.node_id = Some("node-a".to_string());
        let topology = DecentralizedTopology::new(config, transport.clone());
        let peer = ConnectionId::new();
        (topology, transport, peer)
    }

    #[tokio::test]
    async fn register_floods_announce_to_peers() {
        let (topology, transport, peer) = topology_with_peer();
        topology.add_peer_link(peer, "node-b", Vec::new()).await;

        topology.register(AgentInfo::new("a1")).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        let body: SystemRequestBody = sent[0].1.body_as().unwrap();
        assert_eq!(body.command, COMMAND_ANNOUNCE);
    }

    #[tokio::test]
    async fn duplicate_announce_is_not_reflooded() {
        let (topology, transport, peer) = topology_with_peer();
        let other = ConnectionId::new();
        topology.add_peer_link(peer, "node-b", Vec::new()).await;
        topology.add_peer_link(other, "node-c", Vec::new()).await;

        let args = serde_json::to_value(AnnounceArgs {
            info: AgentInfo::new("a1"),
            issued_at: 1000.0,
            ttl: 2,
        })
        .unwrap();
        let body = SystemRequestBody {
            command: COMMAND_ANNOUNCE.to_string(),
            args,
        };

        assert!(topology.handle_system(peer, &body).await.unwrap());
        let first_wave = transport.sent.lock().await.len();
        assert_eq!(first_wave, 1); // forwarded only to `other`

        assert!(topology.handle_system(peer, &body).await.unwrap());
        assert_eq!(transport.sent.lock().await.len(), first_wave);
        assert!(topology.get("a1").await.is_some());
    }

    #[tokio::test]
    async fn duplicate_gossip_broadcast_is_dropped() {
        let (topology, _transport, peer) = topology_with_peer();
        let envelope = Envelope::Broadcast(BroadcastMessage::new("a1", ContentMap::new()));

        let first = topology
            .handle_inbound(peer, envelope.clone())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = topology.handle_inbound(peer, envelope).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn broadcast_route_decrements_ttl_toward_peers() {
        let (topology, transport, peer) = topology_with_peer();
        topology.add_peer_link(peer, "node-b", Vec::new()).await;

        let mut message = BroadcastMessage::new("a1", ContentMap::new());
        message
            .metadata
            .insert(GOSSIP_TTL_KEY.to_string(), Value::from(2));
        topology.route(Envelope::Broadcast(message)).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        let relayed = sent[0].1.envelope().unwrap();
        assert_eq!(relayed.metadata()[GOSSIP_TTL_KEY], 1);
    }

    #[tokio::test]
    async fn exhausted_ttl_still_delivers_locally_but_not_to_peers() {
        let (topology, transport, peer) = topology_with_peer();
        topology.add_peer_link(peer, "node-b", Vec::new()).await;
        let local = ConnectionId::new();
        let mut info = AgentInfo::new("local-agent");
        info.connection_id = Some(local);
        topology.directory.upsert(info);

        let mut message = BroadcastMessage::new("a1", ContentMap::new());
        message
            .metadata
            .insert(GOSSIP_TTL_KEY.to_string(), Value::from(0));
        topology.route(Envelope::Broadcast(message)).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, local);
    }

    #[tokio::test]
    async fn broadcast_route_skips_local_sender_connection() {
        let (topology, transport, _peer) = topology_with_peer();
        let sender_conn = ConnectionId::new();
        let other_conn = ConnectionId::new();
        let mut sender = AgentInfo::new("a1");
        sender.connection_id = Some(sender_conn);
        topology.directory.upsert(sender);
        let mut other = AgentInfo::new("a2");
        other.connection_id = Some(other_conn);
        topology.directory.upsert(other);

        let message = BroadcastMessage::new("a1", ContentMap::new());
        topology.route(Envelope::Broadcast(message)).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, other_conn);
    }

    #[tokio::test]
    async fn unknown_direct_target_relays_to_peers() {
        let (topology, transport, peer) = topology_with_peer();
        topology.add_peer_link(peer, "node-b", Vec::new()).await;

        let envelope = Envelope::Direct(DirectMessage::new("a1", "far-agent", ContentMap::new()));
        topology.route(envelope).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let body: SystemRequestBody = sent[0].1.body_as().unwrap();
        assert_eq!(body.command, COMMAND_RELAY);
        let args: RelayArgs = serde_json::from_value(body.args).unwrap();
        assert_eq!(args.hops, RELAY_HOPS);
    }

    #[tokio::test]
    async fn direct_with_no_peers_is_undeliverable() {
        let transport = Arc::new(RecordingTransport::new());
        let topology = DecentralizedTopology::new(NetworkConfig::default(), transport);
        let envelope = Envelope::Direct(DirectMessage::new("a1", "ghost", ContentMap::new()));
        assert!(matches!(
            topology.route(envelope).await.unwrap_err(),
            NetworkError::Undeliverable(_)
        ));
    }

    #[tokio::test]
    async fn mod_gossip_targets_only_peers_with_mod() {
        let (topology, transport, peer) = topology_with_peer();
        let with_mod = ConnectionId::new();
        topology.add_peer_link(peer, "node-b", Vec::new()).await;
        topology
            .add_peer_link(with_mod, "node-c", vec!["registration".to_string()])
            .await;

        let envelope = Envelope::Mod(crate::message::ModMessage::new(
            "a1",
            "registration",
            crate::message::ModDirection::Outbound,
            "a1",
            ContentMap::new(),
        ));
        topology.route(envelope).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, with_mod);
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = SeenSet::default();
        for i in 0..(SEEN_CAP + 10) {
            assert!(seen.first_sight(&format!("id-{i}")));
        }
        assert!(seen.set.len() <= SEEN_CAP);
        // The oldest entries were evicted and read as fresh again.
        assert!(seen.first_sight("id-0"));
    }

    #[test]
    fn node_metadata_round_trip() {
        assert!(is_node_metadata(&node_metadata()));
        assert!(!is_node_metadata(&ContentMap::new()));
    }
}
