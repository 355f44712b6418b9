//! Built-in agent registration/discovery mod.
//!
//! The server side keeps a record of every registered agent's metadata
//! and declared capabilities, and answers mod-scoped `search_agents`
//! queries. The agent side contributes a `search_agents` tool and
//! surfaces the reply in the mod's message thread.
//!
//! This is the crate's reference mod: it exercises every extension
//! point of the framework (registration callbacks, terminal mod
//! messages, mod-originated sends, tools).

use crate::connector::Connector;
use crate::error::{NetworkError, Result};
use crate::message::{ContentMap, ModDirection, ModMessage};
use crate::mods::loader::{CONVENTIONAL_ADAPTER_ENTRY, CONVENTIONAL_NETWORK_ENTRY};
use crate::mods::{
    ModAdapter, ModManifest, ModRegistry, NetworkMod, ToolDescriptor, ToolHandler,
};
use crate::service::NetworkHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Canonical name of the registration mod.
pub const REGISTRATION_MOD_NAME: &str = "registration";

const ACTION_SEARCH: &str = "search_agents";
const ACTION_SEARCH_RESULTS: &str = "search_results";
const ACTION_ANNOUNCE: &str = "announce";

/// Register the mod package with a registry.
pub fn register(registry: &mut ModRegistry) {
    registry.register(ModManifest {
        name: REGISTRATION_MOD_NAME.to_string(),
        version: "1.0.0".to_string(),
        requires_adapter: true,
        network_mod: Some(CONVENTIONAL_NETWORK_ENTRY.to_string()),
        mod_adapter: Some(CONVENTIONAL_ADAPTER_ENTRY.to_string()),
    });
    registry.register_network_factory(
        REGISTRATION_MOD_NAME,
        CONVENTIONAL_NETWORK_ENTRY,
        Arc::new(|| Arc::new(RegistrationMod::new()) as Arc<dyn NetworkMod>),
    );
    registry.register_adapter_factory(
        REGISTRATION_MOD_NAME,
        CONVENTIONAL_ADAPTER_ENTRY,
        Arc::new(|| Arc::new(RegistrationAdapter::new()) as Arc<dyn ModAdapter>),
    );
}

#[derive(Debug, Clone)]
struct AgentRecord {
    metadata: ContentMap,
    capabilities: Vec<String>,
    registered_at: f64,
}

fn capabilities_from_metadata(metadata: &ContentMap) -> Vec<String> {
    metadata
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Server-side registration mod.
pub struct RegistrationMod {
    network: RwLock<Option<NetworkHandle>>,
    agents: RwLock<HashMap<String, AgentRecord>>,
}

impl RegistrationMod {
    /// Create an empty registration mod.
    #[must_use]
    pub fn new() -> Self {
        Self {
            network: RwLock::new(None),
            agents: RwLock::new(HashMap::new()),
        }
    }

    async fn matching_agents(&self, capability: Option<&str>) -> Vec<Value> {
        let agents = self.agents.read().await;
        let mut rows: Vec<(String, Value)> = agents
            .iter()
            .filter(|(_, record)| match capability {
                Some(wanted) => record.capabilities.iter().any(|c| c == wanted),
                None => true,
            })
            .map(|(agent_id, record)| {
                (
                    agent_id.clone(),
                    json!({
                        "agent_id": agent_id,
                        "metadata": record.metadata,
                        "capabilities": record.capabilities,
                        "registered_at": record.registered_at,
                    }),
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }
}

impl Default for RegistrationMod {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMod for RegistrationMod {
    fn mod_name(&self) -> &str {
        REGISTRATION_MOD_NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn bind_network(&self, network: NetworkHandle) {
        *self.network.write().await = Some(network);
    }

    async fn handle_register_agent(&self, agent_id: &str, metadata: &ContentMap) {
        debug!(agent_id, "registration mod tracking agent");
        self.agents.write().await.insert(
            agent_id.to_string(),
            AgentRecord {
                metadata: metadata.clone(),
                capabilities: capabilities_from_metadata(metadata),
                registered_at: crate::message::now_timestamp(),
            },
        );
    }

    async fn handle_unregister_agent(&self, agent_id: &str) {
        self.agents.write().await.remove(agent_id);
    }

    async fn process_mod_message(&self, message: ModMessage) {
        let action = message
            .content
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match action.as_str() {
            ACTION_SEARCH => {
                let capability = message.content.get("capability").and_then(Value::as_str);
                let agents = self.matching_agents(capability).await;

                let network = self.network.read().await.clone();
                let Some(network) = network else {
                    warn!("registration mod has no network binding, dropping query");
                    return;
                };
                let mut content = ContentMap::new();
                content.insert("action".to_string(), json!(ACTION_SEARCH_RESULTS));
                content.insert("query_id".to_string(), json!(message.message_id));
                content.insert("agents".to_string(), Value::Array(agents));
                let reply = ModMessage::new(
                    network.network_name(),
                    REGISTRATION_MOD_NAME,
                    ModDirection::Inbound,
                    message.sender_id.clone(),
                    content,
                );
                if let Err(e) = network.send_from_mod(crate::message::Envelope::Mod(reply)).await {
                    warn!(error = %e, "failed to deliver search results");
                }
            }
            ACTION_ANNOUNCE => {
                let mut agents = self.agents.write().await;
                if let Some(record) = agents.get_mut(&message.sender_id) {
                    if let Some(Value::Object(update)) = message.content.get("metadata") {
                        for (key, value) in update {
                            record.metadata.insert(key.clone(), value.clone());
                        }
                        record.capabilities = capabilities_from_metadata(&record.metadata);
                    }
                }
            }
            other => {
                debug!(action = other, "ignoring unknown registration action");
            }
        }
    }

    async fn get_state(&self) -> ContentMap {
        let agents = self.agents.read().await;
        let mut ids: Vec<String> = agents.keys().cloned().collect();
        ids.sort();
        let mut state = ContentMap::new();
        state.insert("registered_agents".to_string(), json!(ids));
        state
    }
}

#[derive(Default)]
struct AdapterState {
    agent_id: Option<String>,
    connector: Option<Arc<Connector>>,
    last_results: Option<Vec<Value>>,
}

/// Agent-side registration adapter.
pub struct RegistrationAdapter {
    state: Arc<RwLock<AdapterState>>,
}

impl RegistrationAdapter {
    /// Create an unbound adapter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(AdapterState::default())),
        }
    }

    /// The most recent `search_agents` result set, if any arrived.
    pub async fn last_results(&self) -> Option<Vec<Value>> {
        self.state.read().await.last_results.clone()
    }
}

impl Default for RegistrationAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModAdapter for RegistrationAdapter {
    fn mod_name(&self) -> &str {
        REGISTRATION_MOD_NAME
    }

    async fn bind_agent(&self, agent_id: &str) {
        self.state.write().await.agent_id = Some(agent_id.to_string());
    }

    async fn bind_connector(&self, connector: Arc<Connector>) {
        self.state.write().await.connector = Some(connector);
    }

    async fn process_incoming_mod_message(&self, message: ModMessage) -> Option<ModMessage> {
        if message.content.get("action").and_then(Value::as_str) == Some(ACTION_SEARCH_RESULTS) {
            let agents = message
                .content
                .get("agents")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            self.state.write().await.last_results = Some(agents);
        }
        Some(message)
    }

    async fn get_tools(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "search_agents".to_string(),
            description: "Search the network directory for agents, optionally by capability"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "capability": {
                        "type": "string",
                        "description": "Only return agents advertising this capability"
                    }
                }
            }),
            handler: Arc::new(SearchAgentsTool {
                state: Arc::clone(&self.state),
            }),
        }]
    }
}

struct SearchAgentsTool {
    state: Arc<RwLock<AdapterState>>,
}

#[async_trait]
impl ToolHandler for SearchAgentsTool {
    async fn call(&self, args: Value) -> Result<Value> {
        let (agent_id, connector) = {
            let state = self.state.read().await;
            (state.agent_id.clone(), state.connector.clone())
        };
        let agent_id = agent_id.ok_or(NetworkError::NotConnected)?;
        let connector = connector.ok_or(NetworkError::NotConnected)?;

        let mut content = ContentMap::new();
        content.insert("action".to_string(), json!(ACTION_SEARCH));
        if let Some(capability) = args.get("capability").and_then(Value::as_str) {
            content.insert("capability".to_string(), json!(capability));
        }
        let query = ModMessage::new(
            agent_id.clone(),
            REGISTRATION_MOD_NAME,
            ModDirection::Outbound,
            agent_id,
            content,
        );
        let query_id = query.message_id.clone();
        connector
            .send_envelope(&crate::message::Envelope::Mod(query))
            .await?;
        Ok(json!({ "status": "requested", "query_id": query_id }))
    }
}
