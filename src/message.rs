//! Message envelopes and per-key threads.
//!
//! Three envelope variants travel the network, discriminated on the wire
//! by `message_type`:
//!
//! - [`DirectMessage`] (`direct_message`): point-to-point, carries
//!   `target_agent_id`.
//! - [`BroadcastMessage`] (`broadcast_message`): fans out to every other
//!   connected agent.
//! - [`ModMessage`] (`mod_message`): scoped to a named mod, terminal at the
//!   server-side mod.
//!
//! Envelope `content` is an opaque JSON mapping; binary values cross the
//! boundary base64-encoded via [`encode_binary`] / [`decode_binary`].
//! Sender timestamps are fractional Unix seconds and are only trusted for
//! the runner's per-agent causal filtering — arrival order is the ground
//! truth everywhere else.

use crate::error::{NetworkError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque mapping type used for envelope `content` and `metadata`.
pub type ContentMap = serde_json::Map<String, Value>;

/// Thread key for all broadcast traffic.
pub const BROADCAST_THREAD: &str = "broadcast_message";

/// Current fractional Unix timestamp in seconds.
#[must_use]
pub fn now_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Generate a fresh message identifier (uuid v4, compact hex).
#[must_use]
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Base64-wrap a binary blob for embedding in envelope content.
#[must_use]
pub fn encode_binary(data: &[u8]) -> Value {
    Value::String(base64::engine::general_purpose::STANDARD.encode(data))
}

/// Recover a binary blob from a base64-wrapped content value.
#[must_use]
pub fn decode_binary(value: &Value) -> Option<Vec<u8>> {
    let s = value.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

/// Which way a mod message flows relative to the mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModDirection {
    /// Toward the agent from the mod.
    Inbound,
    /// Toward the mod from the agent.
    #[default]
    Outbound,
    /// Both directions.
    Both,
}

/// Point-to-point message between two agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message_id: String,
    pub sender_id: String,
    pub target_agent_id: String,
    pub timestamp: f64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub text_representation: Option<String>,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub content: ContentMap,
    #[serde(default)]
    pub metadata: ContentMap,
}

/// Message fanned out to every other connected agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub message_id: String,
    pub sender_id: String,
    pub timestamp: f64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub text_representation: Option<String>,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub content: ContentMap,
    #[serde(default)]
    pub metadata: ContentMap,
}

/// Message scoped to a named mod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModMessage {
    pub message_id: String,
    pub sender_id: String,
    /// The mod this message belongs to.
    #[serde(rename = "mod")]
    pub mod_name: String,
    #[serde(default)]
    pub direction: ModDirection,
    /// The agent this message concerns.
    pub relevant_agent_id: String,
    pub timestamp: f64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub text_representation: Option<String>,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub content: ContentMap,
    #[serde(default)]
    pub metadata: ContentMap,
}

impl DirectMessage {
    /// Build a direct message with a fresh id and timestamp.
    pub fn new(
        sender_id: impl Into<String>,
        target_agent_id: impl Into<String>,
        content: ContentMap,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            target_agent_id: target_agent_id.into(),
            timestamp: now_timestamp(),
            protocol: None,
            text_representation: None,
            requires_response: false,
            content,
            metadata: ContentMap::new(),
        }
    }
}

impl BroadcastMessage {
    /// Build a broadcast message with a fresh id and timestamp.
    pub fn new(sender_id: impl Into<String>, content: ContentMap) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            timestamp: now_timestamp(),
            protocol: None,
            text_representation: None,
            requires_response: false,
            content,
            metadata: ContentMap::new(),
        }
    }
}

impl ModMessage {
    /// Build a mod message with a fresh id and timestamp.
    pub fn new(
        sender_id: impl Into<String>,
        mod_name: impl Into<String>,
        direction: ModDirection,
        relevant_agent_id: impl Into<String>,
        content: ContentMap,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            mod_name: mod_name.into(),
            direction,
            relevant_agent_id: relevant_agent_id.into(),
            timestamp: now_timestamp(),
            protocol: None,
            text_representation: None,
            requires_response: false,
            content,
            metadata: ContentMap::new(),
        }
    }
}

/// A validated message, one of the three wire variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum Envelope {
    #[serde(rename = "direct_message")]
    Direct(DirectMessage),
    #[serde(rename = "broadcast_message")]
    Broadcast(BroadcastMessage),
    #[serde(rename = "mod_message")]
    Mod(ModMessage),
}

impl Envelope {
    /// Globally unique message identifier.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Envelope::Direct(m) => &m.message_id,
            Envelope::Broadcast(m) => &m.message_id,
            Envelope::Mod(m) => &m.message_id,
        }
    }

    /// Authenticated sender.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        match self {
            Envelope::Direct(m) => &m.sender_id,
            Envelope::Broadcast(m) => &m.sender_id,
            Envelope::Mod(m) => &m.sender_id,
        }
    }

    /// Sender-clock timestamp, fractional Unix seconds.
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        match self {
            Envelope::Direct(m) => m.timestamp,
            Envelope::Broadcast(m) => m.timestamp,
            Envelope::Mod(m) => m.timestamp,
        }
    }

    /// Opaque content mapping.
    #[must_use]
    pub fn content(&self) -> &ContentMap {
        match self {
            Envelope::Direct(m) => &m.content,
            Envelope::Broadcast(m) => &m.content,
            Envelope::Mod(m) => &m.content,
        }
    }

    /// Metadata mapping, mutable (gossip layers annotate TTL here).
    #[must_use]
    pub fn metadata_mut(&mut self) -> &mut ContentMap {
        match self {
            Envelope::Direct(m) => &mut m.metadata,
            Envelope::Broadcast(m) => &mut m.metadata,
            Envelope::Mod(m) => &mut m.metadata,
        }
    }

    /// Metadata mapping.
    #[must_use]
    pub fn metadata(&self) -> &ContentMap {
        match self {
            Envelope::Direct(m) => &m.metadata,
            Envelope::Broadcast(m) => &m.metadata,
            Envelope::Mod(m) => &m.metadata,
        }
    }

    /// Wire value of `message_type` for this variant.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Envelope::Direct(_) => "direct_message",
            Envelope::Broadcast(_) => "broadcast_message",
            Envelope::Mod(_) => "mod_message",
        }
    }

    /// Serialize to a wire JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the content maps cannot encode.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The thread a given envelope belongs to, from `self_id`'s point of view.
///
/// Direct threads are keyed by the non-self endpoint, so both sides of a
/// conversation land in the same thread.
#[must_use]
pub fn thread_key(envelope: &Envelope, self_id: &str) -> String {
    match envelope {
        Envelope::Direct(m) => {
            let peer = if m.sender_id == self_id {
                &m.target_agent_id
            } else {
                &m.sender_id
            };
            format!("direct_message:{peer}")
        }
        Envelope::Broadcast(_) => BROADCAST_THREAD.to_string(),
        Envelope::Mod(m) => format!("mod_message:{}", m.mod_name),
    }
}

/// Parse and validate a wire JSON object into an [`Envelope`].
///
/// Discriminates on `message_type`. For `mod_message` only, fields nested
/// under a `payload` key are flattened into the envelope before
/// validation (mods embed their logical body inside a generic wrapper),
/// and a missing `relevant_agent_id` is defaulted from a sibling
/// `target_id`.
///
/// # Errors
///
/// Returns [`NetworkError::BadEnvelope`] when `message_id` or `sender_id`
/// is absent, a direct message has no `target_agent_id`, a mod message
/// has a null `mod` or `relevant_agent_id`, or the object otherwise fails
/// to deserialize.
pub fn parse_envelope(value: Value) -> Result<Envelope> {
    let Value::Object(mut obj) = value else {
        return Err(NetworkError::BadEnvelope("not a JSON object".to_string()));
    };

    let message_type = match obj.get("message_type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => {
            return Err(NetworkError::BadEnvelope(
                "missing message_type".to_string(),
            ))
        }
    };

    if message_type == "mod_message" {
        flatten_mod_payload(&mut obj);
    }

    require_string_field(&obj, "message_id")?;
    require_string_field(&obj, "sender_id")?;
    match message_type.as_str() {
        "direct_message" => require_string_field(&obj, "target_agent_id")?,
        "broadcast_message" => {}
        "mod_message" => {
            require_string_field(&obj, "mod")?;
            require_string_field(&obj, "relevant_agent_id")?;
        }
        other => {
            return Err(NetworkError::BadEnvelope(format!(
                "unknown message_type: {other}"
            )))
        }
    }

    serde_json::from_value(Value::Object(obj))
        .map_err(|e| NetworkError::BadEnvelope(e.to_string()))
}

fn require_string_field(obj: &ContentMap, field: &str) -> Result<()> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        _ => Err(NetworkError::BadEnvelope(format!(
            "missing or null {field}"
        ))),
    }
}

/// Merge a nested `payload` object into the top-level mod-message object.
/// Existing top-level fields win; `target_id` backs `relevant_agent_id`.
fn flatten_mod_payload(obj: &mut ContentMap) {
    let target_id = obj.get("target_id").and_then(Value::as_str).map(String::from);
    if let Some(Value::Object(payload)) = obj.remove("payload") {
        for (key, value) in payload {
            obj.entry(key).or_insert(value);
        }
    }
    if !obj.contains_key("relevant_agent_id") {
        if let Some(target) = target_id {
            obj.insert("relevant_agent_id".to_string(), Value::String(target));
        }
    }
}

/// Append-only ordered history of envelopes sharing one thread key.
///
/// Append order is arrival order at the owning party; past entries are
/// never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageThread {
    messages: Vec<Envelope>,
}

impl MessageThread {
    /// Create an empty thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope.
    pub fn push(&mut self, envelope: Envelope) {
        self.messages.push(envelope);
    }

    /// The ordered message history.
    #[must_use]
    pub fn messages(&self) -> &[Envelope] {
        &self.messages
    }

    /// Number of messages in the thread.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the thread holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// A copy of the thread restricted to messages at or before `cutoff`.
    #[must_use]
    pub fn filtered_at(&self, cutoff: f64) -> Self {
        Self {
            messages: self
                .messages
                .iter()
                .filter(|m| m.timestamp() <= cutoff)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    fn content(pairs: &[(&str, Value)]) -> ContentMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn direct_round_trips_with_tag() {
        let msg = DirectMessage::new("a1", "a2", content(&[("text", json!("hi"))]));
        let value = serde_json::to_value(Envelope::Direct(msg.clone())).unwrap();
        assert_eq!(value["message_type"], "direct_message");
        let parsed = parse_envelope(value).unwrap();
        assert_eq!(parsed, Envelope::Direct(msg));
    }

    #[test]
    fn parse_rejects_missing_sender() {
        let err = parse_envelope(json!({
            "message_type": "direct_message",
            "message_id": "m1",
            "target_agent_id": "a2"
        }))
        .unwrap_err();
        assert!(matches!(err, NetworkError::BadEnvelope(_)));
    }

    #[test]
    fn parse_rejects_direct_without_target() {
        let err = parse_envelope(json!({
            "message_type": "direct_message",
            "message_id": "m1",
            "sender_id": "a1"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("target_agent_id"));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = parse_envelope(json!({
            "message_type": "carrier_pigeon",
            "message_id": "m1",
            "sender_id": "a1"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("carrier_pigeon"));
    }

    #[test]
    fn mod_message_payload_is_flattened() {
        let parsed = parse_envelope(json!({
            "message_type": "mod_message",
            "message_id": "m1",
            "sender_id": "a1",
            "timestamp": 100.5,
            "target_id": "a2",
            "payload": {
                "mod": "registration",
                "direction": "outbound",
                "content": {"x": 1}
            }
        }))
        .unwrap();
        let Envelope::Mod(m) = parsed else {
            panic!("expected mod message");
        };
        assert_eq!(m.mod_name, "registration");
        assert_eq!(m.relevant_agent_id, "a2");
        assert_eq!(m.content["x"], 1);
    }

    #[test]
    fn mod_message_null_mod_is_rejected() {
        let err = parse_envelope(json!({
            "message_type": "mod_message",
            "message_id": "m1",
            "sender_id": "a1",
            "mod": null,
            "relevant_agent_id": "a1"
        }))
        .unwrap_err();
        assert!(matches!(err, NetworkError::BadEnvelope(_)));
    }

    #[test]
    fn top_level_fields_win_over_payload() {
        let parsed = parse_envelope(json!({
            "message_type": "mod_message",
            "message_id": "m1",
            "sender_id": "a1",
            "mod": "outer",
            "relevant_agent_id": "a1",
            "payload": {"mod": "inner"}
        }))
        .unwrap();
        let Envelope::Mod(m) = parsed else {
            panic!("expected mod message");
        };
        assert_eq!(m.mod_name, "outer");
    }

    #[test]
    fn thread_keys() {
        let direct = Envelope::Direct(DirectMessage::new("a1", "a2", ContentMap::new()));
        assert_eq!(thread_key(&direct, "a1"), "direct_message:a2");
        assert_eq!(thread_key(&direct, "a2"), "direct_message:a1");

        let broadcast = Envelope::Broadcast(BroadcastMessage::new("a1", ContentMap::new()));
        assert_eq!(thread_key(&broadcast, "a2"), BROADCAST_THREAD);

        let mod_msg = Envelope::Mod(ModMessage::new(
            "a1",
            "registration",
            ModDirection::Outbound,
            "a1",
            ContentMap::new(),
        ));
        assert_eq!(thread_key(&mod_msg, "a1"), "mod_message:registration");
    }

    #[test]
    fn binary_content_round_trips() {
        let blob = vec![0u8, 159, 146, 150];
        let encoded = encode_binary(&blob);
        assert!(encoded.is_string());
        assert_eq!(decode_binary(&encoded).unwrap(), blob);
        assert!(decode_binary(&json!(42)).is_none());
    }

    #[test]
    fn thread_filter_is_inclusive() {
        let mut thread = MessageThread::new();
        for ts in [1.0, 2.0, 3.0] {
            let mut msg = DirectMessage::new("a1", "a2", ContentMap::new());
            msg.timestamp = ts;
            thread.push(Envelope::Direct(msg));
        }
        let filtered = thread.filtered_at(2.0);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.messages().iter().all(|m| m.timestamp() <= 2.0));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = DirectMessage::new("a1", "a2", ContentMap::new());
        let b = DirectMessage::new("a1", "a2", ContentMap::new());
        assert_ne!(a.message_id, b.message_id);
    }
}
