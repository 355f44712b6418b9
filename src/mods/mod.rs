//! Mod extension framework.
//!
//! A mod extends the network with message processing, state, or tools.
//! It exists as a server-side [`NetworkMod`] (registered with the
//! network service, runs in the ingress/egress pipelines) and/or an
//! agent-side [`ModAdapter`] (registered with an agent client, runs in
//! the incoming/outgoing pipelines). Every callback defaults to
//! pass-through, so a mod implements only the hooks it cares about.
//!
//! Pipeline contract: a processing hook returns the (possibly
//! transformed) message to pass along the chain, or `None` to consume it
//! — no later mod, and no thread append, will see a consumed message.
//! `process_mod_message` is terminal: mods receive their own scoped
//! messages and nothing is routed onward.

pub mod loader;
pub mod registration;

use crate::connector::Connector;
use crate::error::Result;
use crate::message::{BroadcastMessage, ContentMap, DirectMessage, ModMessage};
use crate::service::NetworkHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use loader::{ModLoadFailure, ModRegistry};
pub use registration::{RegistrationAdapter, RegistrationMod, REGISTRATION_MOD_NAME};

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_requires_adapter() -> bool {
    true
}

/// Manifest describing a mod package: its identity and the canonical
/// factory entry names the loader instantiates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModManifest {
    /// Canonical mod name, e.g. `registration`.
    pub name: String,
    /// Mod version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Whether agents need a matching adapter to use this mod.
    #[serde(default = "default_requires_adapter")]
    pub requires_adapter: bool,
    /// Factory entry name for the server-side mod, if the package
    /// provides one.
    #[serde(default)]
    pub network_mod: Option<String>,
    /// Factory entry name for the agent-side adapter, if the package
    /// provides one.
    #[serde(default)]
    pub mod_adapter: Option<String>,
}

impl ModManifest {
    /// A manifest with conventional entry names for both sides.
    #[must_use]
    pub fn conventional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            requires_adapter: true,
            network_mod: Some(loader::CONVENTIONAL_NETWORK_ENTRY.to_string()),
            mod_adapter: Some(loader::CONVENTIONAL_ADAPTER_ENTRY.to_string()),
        }
    }
}

/// Async callable backing an adapter tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value>;
}

/// A tool advertised by an adapter and exposed through the owning
/// client.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Server-side mod contract.
///
/// Registered mods form the ordered ingress/egress pipeline chain;
/// chain order is registration order.
#[async_trait]
pub trait NetworkMod: Send + Sync {
    /// The mod's canonical name.
    fn mod_name(&self) -> &str;

    /// Mod version, surfaced by `list_mods`.
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Whether agents need a matching adapter, surfaced by `list_mods`.
    fn requires_adapter(&self) -> bool {
        true
    }

    /// Stash a handle to the owning network service.
    async fn bind_network(&self, _network: NetworkHandle) {}

    /// One-time setup after binding.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Graceful teardown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// An agent registered with the network.
    async fn handle_register_agent(&self, _agent_id: &str, _metadata: &ContentMap) {}

    /// An agent left the network.
    async fn handle_unregister_agent(&self, _agent_id: &str) {}

    /// Ingress/egress hook for direct messages.
    async fn process_direct_message(&self, message: DirectMessage) -> Option<DirectMessage> {
        Some(message)
    }

    /// Ingress/egress hook for broadcast messages.
    async fn process_broadcast_message(
        &self,
        message: BroadcastMessage,
    ) -> Option<BroadcastMessage> {
        Some(message)
    }

    /// Terminal receiver for this mod's scoped messages.
    async fn process_mod_message(&self, _message: ModMessage) {}

    /// Snapshot of mod state for diagnostics.
    async fn get_state(&self) -> ContentMap {
        ContentMap::new()
    }
}

/// Agent-side adapter contract, symmetric to [`NetworkMod`] plus
/// outgoing hooks and tool advertisement.
#[async_trait]
pub trait ModAdapter: Send + Sync {
    /// The mod's canonical name.
    fn mod_name(&self) -> &str;

    /// Bind to the owning agent's id.
    async fn bind_agent(&self, _agent_id: &str) {}

    /// Bind to the owning client's connector (non-owning reference).
    async fn bind_connector(&self, _connector: Arc<Connector>) {}

    /// The connector reached the network.
    async fn on_connect(&self) {}

    /// The connector lost the network.
    async fn on_disconnect(&self) {}

    async fn process_incoming_direct_message(
        &self,
        message: DirectMessage,
    ) -> Option<DirectMessage> {
        Some(message)
    }

    async fn process_incoming_broadcast_message(
        &self,
        message: BroadcastMessage,
    ) -> Option<BroadcastMessage> {
        Some(message)
    }

    async fn process_incoming_mod_message(&self, message: ModMessage) -> Option<ModMessage> {
        Some(message)
    }

    async fn process_outgoing_direct_message(
        &self,
        message: DirectMessage,
    ) -> Option<DirectMessage> {
        Some(message)
    }

    async fn process_outgoing_broadcast_message(
        &self,
        message: BroadcastMessage,
    ) -> Option<BroadcastMessage> {
        Some(message)
    }

    async fn process_outgoing_mod_message(&self, message: ModMessage) -> Option<ModMessage> {
        Some(message)
    }

    /// Tools this adapter contributes to the owning client.
    async fn get_tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }
}

/// Summary row returned by the `list_mods` system command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModSummary {
    pub name: String,
    pub version: String,
    pub requires_adapter: bool,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    struct Passthrough;

    #[async_trait]
    impl NetworkMod for Passthrough {
        fn mod_name(&self) -> &str {
            "passthrough"
        }
    }

    #[tokio::test]
    async fn default_hooks_pass_messages_through() {
        let passthrough = Passthrough;
        let message = DirectMessage::new("a1", "a2", ContentMap::new());
        let out = passthrough
            .process_direct_message(message.clone())
            .await
            .unwrap();
        assert_eq!(out, message);
        assert!(passthrough.get_state().await.is_empty());
        assert!(passthrough.requires_adapter());
    }

    #[test]
    fn manifest_defaults() {
        let manifest: ModManifest = serde_json::from_str(r#"{"name":"demo"}"#).unwrap();
        assert_eq!(manifest.version, "0.1.0");
        assert!(manifest.requires_adapter);
        assert!(manifest.network_mod.is_none());
    }

    #[test]
    fn conventional_manifest_names_both_entries() {
        let manifest = ModManifest::conventional("demo");
        assert_eq!(manifest.network_mod.as_deref(), Some("network_mod"));
        assert_eq!(manifest.mod_adapter.as_deref(), Some("adapter"));
    }
}
