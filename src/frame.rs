//! Wire frames.
//!
//! Every object crossing a transport stream is one [`Frame`]: a
//! `frame_type` tag, an optional `correlation_id` (system
//! request/response pairing), and a type-specific `body`. Frames are
//! UTF-8 JSON; the transport length-frames them (WebSocket messages) and
//! validates structure on receipt, but never interprets `body.content`.

use crate::error::{NetworkError, Result};
use crate::identity::AgentCertificate;
use crate::message::{parse_envelope, ContentMap, Envelope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// System command: list connected agents.
pub const COMMAND_LIST_AGENTS: &str = "list_agents";
/// System command: list registered mods.
pub const COMMAND_LIST_MODS: &str = "list_mods";
/// System command: claim an agent ID and receive a certificate.
pub const COMMAND_CLAIM_AGENT_ID: &str = "claim_agent_id";

/// The eight legal frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Hello,
    HelloAck,
    Error,
    Message,
    SystemRequest,
    SystemResponse,
    Ping,
    Pong,
}

/// Error codes surfaced in `error` frames and admission rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Undeliverable,
    ModUnknown,
    BadEnvelope,
    #[serde(rename = "AgentIDInUse")]
    AgentIdInUse,
    InvalidCertificate,
    ExpiredCertificate,
    IdentityServerUnavailable,
}

/// Body of a `hello` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloBody {
    pub agent_id: String,
    #[serde(default)]
    pub metadata: ContentMap,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<AgentCertificate>,
}

/// Body of a `hello_ack` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAckBody {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<AgentCertificate>,
}

/// Body of a `system_request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRequestBody {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Body of a `system_response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResponseBody {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Frame {
    fn with_body<T: Serialize>(frame_type: FrameType, body: &T) -> Result<Self> {
        Ok(Self {
            frame_type,
            correlation_id: None,
            body: serde_json::to_value(body)?,
        })
    }

    /// Build a `hello` frame.
    pub fn hello(body: &HelloBody) -> Result<Self> {
        Self::with_body(FrameType::Hello, body)
    }

    /// Build a `hello_ack` frame.
    pub fn hello_ack(body: &HelloAckBody) -> Result<Self> {
        Self::with_body(FrameType::HelloAck, body)
    }

    /// Build a `message` frame around an envelope.
    pub fn message(envelope: &Envelope) -> Result<Self> {
        Self::with_body(FrameType::Message, envelope)
    }

    /// Build a `system_request` frame with a correlation id.
    pub fn system_request(
        correlation_id: impl Into<String>,
        command: impl Into<String>,
        args: Value,
    ) -> Result<Self> {
        let mut frame = Self::with_body(
            FrameType::SystemRequest,
            &SystemRequestBody {
                command: command.into(),
                args,
            },
        )?;
        frame.correlation_id = Some(correlation_id.into());
        Ok(frame)
    }

    /// Build a `system_response` frame answering `correlation_id`.
    pub fn system_response(
        correlation_id: impl Into<String>,
        body: &SystemResponseBody,
    ) -> Result<Self> {
        let mut frame = Self::with_body(FrameType::SystemResponse, body)?;
        frame.correlation_id = Some(correlation_id.into());
        Ok(frame)
    }

    /// Build an `error` frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Result<Self> {
        Self::with_body(
            FrameType::Error,
            &ErrorBody {
                code,
                message: message.into(),
            },
        )
    }

    /// Build a `ping` frame.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            correlation_id: None,
            body: json!({}),
        }
    }

    /// Build a `pong` frame.
    #[must_use]
    pub fn pong() -> Self {
        Self {
            frame_type: FrameType::Pong,
            correlation_id: None,
            body: json!({}),
        }
    }

    /// Deserialize the body into a typed struct.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadFrame`] if the body does not match `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| NetworkError::BadFrame(format!("{:?} body: {e}", self.frame_type)))
    }

    /// Parse the body as a validated message envelope.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadFrame`] if this is not a `message`
    /// frame, or [`NetworkError::BadEnvelope`] if the body fails
    /// envelope validation.
    pub fn envelope(&self) -> Result<Envelope> {
        if self.frame_type != FrameType::Message {
            return Err(NetworkError::BadFrame(format!(
                "expected message frame, got {:?}",
                self.frame_type
            )));
        }
        parse_envelope(self.body.clone())
    }

    /// Structural validation applied by the transport on receipt.
    ///
    /// Confirms the body parses for the given frame type. The body's
    /// `content` mapping is never inspected here.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadFrame`] or
    /// [`NetworkError::BadEnvelope`] on malformed bodies.
    pub fn validate(&self) -> Result<()> {
        match self.frame_type {
            FrameType::Hello => self.body_as::<HelloBody>().map(|_| ()),
            FrameType::HelloAck => self.body_as::<HelloAckBody>().map(|_| ()),
            FrameType::Message => self.envelope().map(|_| ()),
            FrameType::SystemRequest => self.body_as::<SystemRequestBody>().map(|_| ()),
            FrameType::SystemResponse => self.body_as::<SystemResponseBody>().map(|_| ()),
            FrameType::Error => self.body_as::<ErrorBody>().map(|_| ()),
            FrameType::Ping | FrameType::Pong => Ok(()),
        }
    }

    /// Encode to wire JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate wire JSON.
    ///
    /// Unknown `frame_type` values fail here — the enum is closed.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadFrame`] on malformed JSON or an
    /// unrecognized frame type, and validation errors per
    /// [`Frame::validate`].
    pub fn decode(data: &str) -> Result<Self> {
        let frame: Frame = serde_json::from_str(data)
            .map_err(|e| NetworkError::BadFrame(format!("undecodable frame: {e}")))?;
        frame.validate()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::message::DirectMessage;

    #[test]
    fn frame_type_wire_names() {
        assert_eq!(
            serde_json::to_value(FrameType::SystemRequest).unwrap(),
            "system_request"
        );
        assert_eq!(serde_json::to_value(FrameType::HelloAck).unwrap(), "hello_ack");
    }

    #[test]
    fn agent_id_in_use_wire_name() {
        assert_eq!(
            serde_json::to_value(ErrorCode::AgentIdInUse).unwrap(),
            "AgentIDInUse"
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let err = Frame::decode(r#"{"frame_type":"teleport","body":{}}"#).unwrap_err();
        assert!(matches!(err, NetworkError::BadFrame(_)));
    }

    #[test]
    fn message_frame_round_trips() {
        let envelope = Envelope::Direct(DirectMessage::new("a1", "a2", ContentMap::new()));
        let frame = Frame::message(&envelope).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.envelope().unwrap(), envelope);
    }

    #[test]
    fn message_frame_with_bad_envelope_fails_validation() {
        let frame = Frame {
            frame_type: FrameType::Message,
            correlation_id: None,
            body: json!({"message_type": "direct_message", "message_id": "m1"}),
        };
        assert!(matches!(
            frame.validate().unwrap_err(),
            NetworkError::BadEnvelope(_)
        ));
    }

    #[test]
    fn system_request_carries_correlation_id() {
        let frame =
            Frame::system_request("req-1", COMMAND_LIST_AGENTS, json!({})).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.correlation_id.as_deref(), Some("req-1"));
        let body: SystemRequestBody = decoded.body_as().unwrap();
        assert_eq!(body.command, COMMAND_LIST_AGENTS);
    }

    #[test]
    fn hello_ack_rejection_shape() {
        let frame = Frame::hello_ack(&HelloAckBody {
            accepted: false,
            reason: Some("agent id already in use".to_string()),
            certificate: None,
        })
        .unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        let body: HelloAckBody = decoded.body_as().unwrap();
        assert!(!body.accepted);
        assert!(body.certificate.is_none());
    }

    #[test]
    fn ping_pong_validate_with_empty_bodies() {
        assert!(Frame::ping().validate().is_ok());
        assert!(Frame::decode(&Frame::pong().encode().unwrap()).is_ok());
    }

    #[test]
    fn envelope_on_non_message_frame_fails() {
        let frame = Frame::ping();
        assert!(frame.envelope().is_err());
    }
}
