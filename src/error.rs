//! Error types for commune network operations.
//!
//! Every fallible operation in the crate returns [`Result`], an alias over
//! the [`NetworkError`] enum. Protocol-level failures that stay on the wire
//! (admission rejections, routing errors) are represented as error frames,
//! not Rust errors; `NetworkError` covers the paths where a caller needs
//! `?` propagation.

use thiserror::Error;

/// Comprehensive error type for commune operations.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Underlying socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket layer reported a failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A wire frame failed structural validation.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// A message envelope failed validation.
    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    /// The server refused the connection during the hello handshake.
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    /// The requested agent ID is already claimed by another certificate.
    #[error("agent id already in use: {0}")]
    AgentIdInUse(String),

    /// A presented certificate failed validation.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A direct message named a target absent from the directory.
    #[error("undeliverable: no agent {0} in directory")]
    Undeliverable(String),

    /// A mod message named a mod that is not registered.
    #[error("unknown mod: {0}")]
    ModUnknown(String),

    /// The peer connection closed while an operation was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// No connection is established; the caller must connect first.
    #[error("not connected")]
    NotConnected,

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// General transport failure (unknown connection, closed write queue).
    #[error("transport error: {0}")]
    Transport(String),

    /// A mod failed to load from the registry.
    #[error("mod load error: {0}")]
    ModLoad(String),

    /// Configuration values were inconsistent or out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Standard Result type for commune operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
