#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! # commune
//!
//! Multi-agent networking substrate: a runtime in which autonomous
//! agents connect to a shared network, advertise capabilities, discover
//! peers, and exchange structured messages through pluggable transports
//! and topology strategies.
//!
//! The fabric has two sides:
//!
//! - **Network side** — a [`service::NetworkService`] owns the
//!   transport, the topology (centralized star or decentralized
//!   gossip), and the identity manager, and runs server-side
//!   [`mods::NetworkMod`]s in ordered ingress/egress pipelines.
//! - **Agent side** — an [`client::AgentClient`] owns a
//!   [`connector::Connector`] and a chain of [`mods::ModAdapter`]s, and
//!   an [`runner::AgentRunner`] drives user logic over causally-filtered
//!   message threads.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use commune::config::NetworkConfig;
//! use commune::message::ContentMap;
//! use commune::service::NetworkService;
//! use commune::client::AgentClient;
//!
//! # async fn example() -> commune::error::Result<()> {
//! // Coordinator
//! let service = NetworkService::new(NetworkConfig::default())?;
//! service.start().await?;
//!
//! // An agent
//! let client = AgentClient::new("a1");
//! client.connect("127.0.0.1", 8570, ContentMap::new(), vec![]).await?;
//! client.send_broadcast_message(ContentMap::new()).await?;
//! # Ok(())
//! # }
//! ```

/// Error types for commune network operations.
pub mod error;

/// Network service configuration.
pub mod config;

/// Message envelopes and per-key threads.
pub mod message;

/// Certificate-based agent identity.
pub mod identity;

/// Wire frames.
pub mod frame;

/// Stream transport layer.
pub mod transport;

/// Topology layer: directory and routing strategies.
pub mod topology;

/// The network service.
pub mod service;

/// Mod extension framework.
pub mod mods;

/// Agent-side network connector.
pub mod connector;

/// Agent client: adapters, pipelines, and message threads.
pub mod client;

/// Agent runner: the reaction loop.
pub mod runner;

pub use client::AgentClient;
pub use config::{NetworkConfig, TopologyMode, TransportKind};
pub use connector::Connector;
pub use error::{NetworkError, Result};
pub use identity::{AgentCertificate, IdentityManager};
pub use message::{
    thread_key, BroadcastMessage, ContentMap, DirectMessage, Envelope, MessageThread,
    ModDirection, ModMessage,
};
pub use mods::{ModAdapter, ModManifest, ModRegistry, NetworkMod};
pub use runner::{AgentReactor, AgentRunner, RunnerState};
pub use service::{NetworkHandle, NetworkService};
pub use topology::{AgentInfo, Topology};

/// The crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The crate name.
pub const NAME: &str = "commune";
