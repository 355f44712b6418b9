//! Mod loading via an explicit factory registry.
//!
//! A mod package registers a [`ModManifest`] plus factory functions
//! keyed by entry name. `load_*` resolves each requested mod name to the
//! entry its manifest declares, falling back to the conventional entry
//! names when the manifest leaves them unset. Failures are reported per
//! mod and never abort the batch.

use crate::mods::{ModAdapter, ModManifest, NetworkMod};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Conventional entry name for a server-side mod factory.
pub const CONVENTIONAL_NETWORK_ENTRY: &str = "network_mod";

/// Conventional entry name for an agent-side adapter factory.
pub const CONVENTIONAL_ADAPTER_ENTRY: &str = "adapter";

/// Factory for server-side mod instances.
pub type NetworkModFactory = Arc<dyn Fn() -> Arc<dyn NetworkMod> + Send + Sync>;

/// Factory for agent-side adapter instances.
pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn ModAdapter> + Send + Sync>;

/// One failed load: which mod, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModLoadFailure {
    pub name: String,
    pub reason: String,
}

impl std::fmt::Display for ModLoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

struct RegisteredMod {
    manifest: ModManifest,
    network_factories: HashMap<String, NetworkModFactory>,
    adapter_factories: HashMap<String, AdapterFactory>,
}

/// Registry of mod packages available to services and runners.
#[derive(Default)]
pub struct ModRegistry {
    mods: HashMap<String, RegisteredMod>,
}

impl std::fmt::Debug for ModRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModRegistry")
            .field("mods", &self.mods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the crate's built-in mods.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::mods::registration::register(&mut registry);
        registry
    }

    /// Register a mod package by manifest. Replaces any prior
    /// registration under the same name.
    pub fn register(&mut self, manifest: ModManifest) {
        let name = manifest.name.clone();
        self.mods.insert(
            name,
            RegisteredMod {
                manifest,
                network_factories: HashMap::new(),
                adapter_factories: HashMap::new(),
            },
        );
    }

    /// Attach a server-side factory under `entry` to a registered mod.
    pub fn register_network_factory(
        &mut self,
        mod_name: &str,
        entry: &str,
        factory: NetworkModFactory,
    ) {
        if let Some(registered) = self.mods.get_mut(mod_name) {
            registered
                .network_factories
                .insert(entry.to_string(), factory);
        } else {
            warn!(mod_name, "network factory for unregistered mod ignored");
        }
    }

    /// Attach an agent-side factory under `entry` to a registered mod.
    pub fn register_adapter_factory(&mut self, mod_name: &str, entry: &str, factory: AdapterFactory) {
        if let Some(registered) = self.mods.get_mut(mod_name) {
            registered
                .adapter_factories
                .insert(entry.to_string(), factory);
        } else {
            warn!(mod_name, "adapter factory for unregistered mod ignored");
        }
    }

    /// The manifest for a registered mod.
    #[must_use]
    pub fn manifest(&self, mod_name: &str) -> Option<&ModManifest> {
        self.mods.get(mod_name).map(|registered| &registered.manifest)
    }

    /// Names of every registered mod.
    #[must_use]
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate server-side mods for `names`. Unresolvable names are
    /// reported, not fatal.
    pub fn load_network_mods(
        &self,
        names: &[String],
    ) -> (Vec<Arc<dyn NetworkMod>>, Vec<ModLoadFailure>) {
        let mut loaded = Vec::new();
        let mut failures = Vec::new();
        for name in names {
            match self.resolve_network(name) {
                Ok(instance) => {
                    info!(mod_name = %name, "loaded network mod");
                    loaded.push(instance);
                }
                Err(reason) => {
                    warn!(mod_name = %name, %reason, "network mod load failed");
                    failures.push(ModLoadFailure {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }
        (loaded, failures)
    }

    /// Instantiate agent-side adapters for `names`. Unresolvable names
    /// are reported, not fatal.
    pub fn load_adapters(&self, names: &[String]) -> (Vec<Arc<dyn ModAdapter>>, Vec<ModLoadFailure>) {
        let mut loaded = Vec::new();
        let mut failures = Vec::new();
        for name in names {
            match self.resolve_adapter(name) {
                Ok(instance) => {
                    info!(mod_name = %name, "loaded mod adapter");
                    loaded.push(instance);
                }
                Err(reason) => {
                    warn!(mod_name = %name, %reason, "mod adapter load failed");
                    failures.push(ModLoadFailure {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }
        (loaded, failures)
    }

    fn resolve_network(&self, mod_name: &str) -> std::result::Result<Arc<dyn NetworkMod>, String> {
        let registered = self
            .mods
            .get(mod_name)
            .ok_or_else(|| "no manifest registered".to_string())?;
        let entry = registered
            .manifest
            .network_mod
            .as_deref()
            .unwrap_or(CONVENTIONAL_NETWORK_ENTRY);
        let factory = registered.network_factories.get(entry).ok_or_else(|| {
            format!("manifest names network entry '{entry}' but no factory is registered")
        })?;
        Ok(factory())
    }

    fn resolve_adapter(&self, mod_name: &str) -> std::result::Result<Arc<dyn ModAdapter>, String> {
        let registered = self
            .mods
            .get(mod_name)
            .ok_or_else(|| "no manifest registered".to_string())?;
        let entry = registered
            .manifest
            .mod_adapter
            .as_deref()
            .unwrap_or(CONVENTIONAL_ADAPTER_ENTRY);
        let factory = registered.adapter_factories.get(entry).ok_or_else(|| {
            format!("manifest names adapter entry '{entry}' but no factory is registered")
        })?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::mods::registration::RegistrationMod;

    fn demo_registry() -> ModRegistry {
        let mut registry = ModRegistry::new();
        registry.register(ModManifest {
            name: "demo".to_string(),
            version: "1.2.0".to_string(),
            requires_adapter: false,
            network_mod: Some("make_server".to_string()),
            mod_adapter: None,
        });
        registry.register_network_factory(
            "demo",
            "make_server",
            Arc::new(|| Arc::new(RegistrationMod::new()) as Arc<dyn NetworkMod>),
        );
        registry
    }

    #[test]
    fn manifest_entry_name_resolves_factory() {
        let registry = demo_registry();
        let (loaded, failures) = registry.load_network_mods(&["demo".to_string()]);
        assert_eq!(loaded.len(), 1);
        assert!(failures.is_empty());
    }

    #[test]
    fn unregistered_mod_reports_failure_and_continues() {
        let registry = demo_registry();
        let (loaded, failures) =
            registry.load_network_mods(&["ghost".to_string(), "demo".to_string()]);
        assert_eq!(loaded.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "ghost");
        assert!(failures[0].reason.contains("no manifest"));
    }

    #[test]
    fn missing_factory_is_a_structured_error() {
        let mut registry = ModRegistry::new();
        registry.register(ModManifest {
            name: "halfbaked".to_string(),
            version: "0.1.0".to_string(),
            requires_adapter: true,
            network_mod: Some("absent_entry".to_string()),
            mod_adapter: None,
        });
        let (loaded, failures) = registry.load_network_mods(&["halfbaked".to_string()]);
        assert!(loaded.is_empty());
        assert!(failures[0].reason.contains("absent_entry"));
    }

    #[test]
    fn conventional_fallback_when_manifest_leaves_entry_unset() {
        let mut registry = ModRegistry::new();
        registry.register(ModManifest {
            name: "plain".to_string(),
            version: "0.1.0".to_string(),
            requires_adapter: true,
            network_mod: None,
            mod_adapter: None,
        });
        registry.register_network_factory(
            "plain",
            CONVENTIONAL_NETWORK_ENTRY,
            Arc::new(|| Arc::new(RegistrationMod::new()) as Arc<dyn NetworkMod>),
        );
        let (loaded, failures) = registry.load_network_mods(&["plain".to_string()]);
        assert_eq!(loaded.len(), 1);
        assert!(failures.is_empty());
    }

    #[test]
    fn builtins_include_registration() {
        let registry = ModRegistry::with_builtins();
        assert!(registry
            .registered_names()
            .contains(&crate::mods::REGISTRATION_MOD_NAME.to_string()));
        let (loaded, failures) = registry
            .load_adapters(&[crate::mods::REGISTRATION_MOD_NAME.to_string()]);
        assert_eq!(loaded.len(), 1);
        assert!(failures.is_empty());
    }
}
