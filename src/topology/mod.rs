//! Topology layer: the agent directory and routing strategy.
//!
//! Two strategies share one [`Topology`] interface. The centralized
//! topology runs a star around one coordinator; the decentralized
//! topology gossips a partial directory between nodes. The service picks
//! one at start-up from [`crate::config::TopologyMode`].
//!
//! The directory is the only topology-owned shared state and sits behind
//! a single coarse mutex; nothing suspends while holding it.

pub mod centralized;
pub mod decentralized;

use crate::error::Result;
use crate::frame::SystemRequestBody;
use crate::message::{ContentMap, Envelope};
use crate::transport::ConnectionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

pub use centralized::{CentralizedClientTopology, CentralizedTopology};
pub use decentralized::DecentralizedTopology;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default)]
    pub metadata: ContentMap,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_transport_type")]
    pub transport_type: String,
    #[serde(default)]
    pub address: Option<String>,
    /// Unix timestamp of the last sign of life.
    pub last_seen: f64,
    /// Live connection carrying this agent, when directly attached.
    /// Local to this process; never crosses the wire.
    #[serde(skip)]
    pub connection_id: Option<ConnectionId>,
}

fn default_transport_type() -> String {
    "websocket".to_string()
}

impl AgentInfo {
    /// A minimal entry for a newly admitted agent.
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            metadata: ContentMap::new(),
            capabilities: Vec::new(),
            transport_type: default_transport_type(),
            address: None,
            last_seen: crate::message::now_timestamp(),
            connection_id: None,
        }
    }

    /// Whether this agent advertises every capability in `wanted`.
    #[must_use]
    pub fn has_capabilities(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Local delivery sink for envelopes that terminate at this node.
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    async fn deliver(&self, envelope: Envelope);
}

/// Routing and directory strategy shared by both topology variants.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Start background machinery (bootstrap dials, discovery sweeps).
    async fn start(&self) -> Result<()>;

    /// Stop background machinery.
    async fn stop(&self) -> Result<()>;

    /// Insert or refresh a directory entry.
    async fn register(&self, info: AgentInfo) -> Result<()>;

    /// Remove a directory entry. Idempotent.
    async fn unregister(&self, agent_id: &str) -> Result<()>;

    /// Look up one agent.
    async fn get(&self, agent_id: &str) -> Option<AgentInfo>;

    /// List agents, optionally filtered to those advertising every
    /// capability given.
    async fn list(&self, capabilities: Option<&[String]>) -> Vec<AgentInfo>;

    /// Deliver an envelope to its destination(s).
    ///
    /// # Errors
    ///
    /// `Undeliverable` when a direct target is absent from the
    /// directory; transport errors pass through.
    async fn route(&self, envelope: Envelope) -> Result<()>;

    /// Find peers, optionally by capability. Centralized reads the
    /// directory; decentralized runs a bounded gossip query.
    async fn discover_peers(&self, capabilities: Option<&[String]>) -> Result<Vec<AgentInfo>>;

    /// Offer an inbound envelope to the topology before local handling.
    ///
    /// Returns the envelope when it should be processed locally, `None`
    /// when the topology consumed it (gossip duplicate). Decentralized
    /// nodes re-propagate here; centralized passes through.
    async fn handle_inbound(
        &self,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<Option<Envelope>>;

    /// Offer a system request to the topology. Returns `true` when it
    /// was topology control traffic (gossip announce/discover/relay) and
    /// has been consumed.
    async fn handle_system(
        &self,
        connection_id: ConnectionId,
        body: &SystemRequestBody,
    ) -> Result<bool>;

    /// Note that a connection disappeared (drop peer links, clear
    /// connection hints).
    async fn handle_disconnect(&self, connection_id: ConnectionId);

    /// Record a node-to-node peer link (decentralized only; centralized
    /// topologies ignore this).
    async fn add_peer_link(&self, _connection_id: ConnectionId, _node_id: &str, _mods: Vec<String>) {
    }
}

/// The shared directory: `agent_id → AgentInfo` behind one coarse lock.
#[derive(Debug, Default)]
pub struct Directory {
    entries: Mutex<HashMap<String, AgentInfo>>,
}

impl Directory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry, bumping `last_seen`.
    pub fn upsert(&self, mut info: AgentInfo) {
        info.last_seen = crate::message::now_timestamp();
        self.lock().insert(info.agent_id.clone(), info);
    }

    /// Remove an entry. Idempotent.
    pub fn remove(&self, agent_id: &str) -> Option<AgentInfo> {
        self.lock().remove(agent_id)
    }

    /// Clone one entry.
    pub fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.lock().get(agent_id).cloned()
    }

    /// The live connection for an agent, if any.
    pub fn connection_of(&self, agent_id: &str) -> Option<ConnectionId> {
        self.lock().get(agent_id).and_then(|info| info.connection_id)
    }

    /// Clone entries, optionally filtered by capability set.
    pub fn list(&self, capabilities: Option<&[String]>) -> Vec<AgentInfo> {
        let entries = self.lock();
        let mut agents: Vec<AgentInfo> = entries
            .values()
            .filter(|info| match capabilities {
                Some(wanted) => info.has_capabilities(wanted),
                None => true,
            })
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Drop the connection hint from every entry carried by
    /// `connection_id`, returning the affected agent ids.
    pub fn detach_connection(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut entries = self.lock();
        let mut detached = Vec::new();
        for info in entries.values_mut() {
            if info.connection_id == Some(connection_id) {
                info.connection_id = None;
                detached.push(info.agent_id.clone());
            }
        }
        detached
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentInfo>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn info(agent_id: &str, capabilities: &[&str]) -> AgentInfo {
        let mut info = AgentInfo::new(agent_id);
        info.capabilities = capabilities.iter().map(|c| (*c).to_string()).collect();
        info
    }

    #[test]
    fn upsert_refreshes_last_seen() {
        let directory = Directory::new();
        let mut entry = info("a1", &[]);
        entry.last_seen = 0.0;
        directory.upsert(entry);
        let stored = directory.get("a1").unwrap();
        assert!(stored.last_seen > 0.0);
    }

    #[test]
    fn list_filters_by_capability() {
        let directory = Directory::new();
        directory.upsert(info("a1", &["translate", "search"]));
        directory.upsert(info("a2", &["search"]));

        let all = directory.list(None);
        assert_eq!(all.len(), 2);

        let wanted = vec!["translate".to_string()];
        let translators = directory.list(Some(&wanted));
        assert_eq!(translators.len(), 1);
        assert_eq!(translators[0].agent_id, "a1");

        let wanted = vec!["translate".to_string(), "search".to_string()];
        assert_eq!(directory.list(Some(&wanted)).len(), 1);
    }

    #[test]
    fn list_is_sorted_by_agent_id() {
        let directory = Directory::new();
        directory.upsert(info("zeta", &[]));
        directory.upsert(info("alpha", &[]));
        let ids: Vec<String> = directory
            .list(None)
            .into_iter()
            .map(|i| i.agent_id)
            .collect();
        assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn detach_connection_clears_hints() {
        let directory = Directory::new();
        let conn = ConnectionId::new();
        let mut entry = info("a1", &[]);
        entry.connection_id = Some(conn);
        directory.upsert(entry);

        let detached = directory.detach_connection(conn);
        assert_eq!(detached, vec!["a1".to_string()]);
        assert!(directory.connection_of("a1").is_none());
        assert!(directory.get("a1").is_some());
    }

    #[test]
    fn remove_is_idempotent() {
        let directory = Directory::new();
        directory.upsert(info("a1", &[]));
        assert!(directory.remove("a1").is_some());
        assert!(directory.remove("a1").is_none());
    }
}
