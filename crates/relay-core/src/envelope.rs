use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::DecodeError;
use crate::ids::RequestId;
use crate::topic::Topic;

/// Highest protocol version this codec understands.
pub const PROTOCOL_VERSION: u32 = 1;

/// The closed message-type catalog.
///
/// Alias tags (e.g. `thread_message_created`, `agent_state`) map to the same
/// variant as their primary tag and therefore to the same handler. Tags not
/// in the catalog decode to [`MessageKind::Unknown`] so newer producers do
/// not break older consumers; only structurally invalid envelopes are
/// rejected by the codec.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Error,
    Subscribe,
    SubscribeAck,
    SubscribeError,
    Unsubscribe,
    SendMessage,
    ThreadMessage,
    ThreadEvent,
    StreamStart,
    StreamChunk,
    StreamEnd,
    AssistantId,
    AgentEvent,
    RunUpdate,
    UserUpdate,
    NodeState,
    ExecutionFinished,
    NodeLog,
    OpsEvent,
    /// Forward-compatible passthrough carrying the original tag.
    Unknown(String),
}

impl MessageKind {
    /// The primary wire tag. `Unknown` echoes the tag it decoded from.
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Subscribe => "subscribe",
            Self::SubscribeAck => "subscribe_ack",
            Self::SubscribeError => "subscribe_error",
            Self::Unsubscribe => "unsubscribe",
            Self::SendMessage => "send_message",
            Self::ThreadMessage => "thread_message",
            Self::ThreadEvent => "thread_event",
            Self::StreamStart => "stream_start",
            Self::StreamChunk => "stream_chunk",
            Self::StreamEnd => "stream_end",
            Self::AssistantId => "assistant_id",
            Self::AgentEvent => "agent_event",
            Self::RunUpdate => "run_update",
            Self::UserUpdate => "user_update",
            Self::NodeState => "node_state",
            Self::ExecutionFinished => "execution_finished",
            Self::NodeLog => "node_log",
            Self::OpsEvent => "ops_event",
            Self::Unknown(tag) => tag,
        }
    }

    /// Resolve a wire tag, folding aliases onto their primary variant.
    /// Never fails: uncataloged tags become `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            "subscribe" => Self::Subscribe,
            "subscribe_ack" => Self::SubscribeAck,
            "subscribe_error" => Self::SubscribeError,
            "unsubscribe" => Self::Unsubscribe,
            "send_message" => Self::SendMessage,
            "thread_message" | "thread_message_created" => Self::ThreadMessage,
            "thread_event" | "thread_created" | "thread_updated" | "thread_deleted" => {
                Self::ThreadEvent
            }
            "stream_start" => Self::StreamStart,
            "stream_chunk" => Self::StreamChunk,
            "stream_end" => Self::StreamEnd,
            "assistant_id" => Self::AssistantId,
            "agent_event" | "agent_created" | "agent_updated" | "agent_deleted"
            | "agent_state" => Self::AgentEvent,
            "run_update" => Self::RunUpdate,
            "user_update" => Self::UserUpdate,
            "node_state" => Self::NodeState,
            "execution_finished" => Self::ExecutionFinished,
            "node_log" => Self::NodeLog,
            "ops_event" => Self::OpsEvent,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// The uniform wire wrapper.
///
/// JSON object with fields exactly `v`, `type`, `topic`, `req_id`
/// (optional), `ts` (ms epoch), `data`.
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub topic: Topic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<RequestId>,
    pub ts: i64,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, topic: Topic, ts: i64, data: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            topic,
            req_id: None,
            ts,
            data,
        }
    }

    pub fn with_req_id(mut self, req_id: RequestId) -> Self {
        self.req_id = Some(req_id);
        self
    }

    /// The cataloged kind, or `UnknownType` for callers that cannot accept
    /// a forward-compatible passthrough.
    pub fn known_kind(&self) -> Result<&MessageKind, DecodeError> {
        if let MessageKind::Unknown(tag) = &self.kind {
            return Err(DecodeError::UnknownType { tag: tag.clone() });
        }
        Ok(&self.kind)
    }
}

/// Serialize an envelope to its wire form. Pure transform.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Decode a wire frame into an [`Envelope`]. Pure transform.
///
/// Required fields are checked individually so the error names what is
/// missing; a field of the wrong shape counts as missing. An uncataloged
/// `type` decodes to [`MessageKind::Unknown`] with `data` passed through raw.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| DecodeError::MalformedJson)?;
    let obj = value.as_object().ok_or(DecodeError::MalformedJson)?;

    let v = obj
        .get("v")
        .and_then(Value::as_u64)
        .ok_or(DecodeError::MissingField { field: "v" })?;
    if v > u64::from(PROTOCOL_VERSION) {
        return Err(DecodeError::VersionMismatch {
            v: u32::try_from(v).unwrap_or(u32::MAX),
            max: PROTOCOL_VERSION,
        });
    }
    let v = v as u32;

    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField { field: "type" })?;

    let topic_str = obj
        .get("topic")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField { field: "topic" })?;
    let topic: Topic = topic_str
        .parse()
        .map_err(|_| DecodeError::MalformedTopic {
            topic: topic_str.to_string(),
        })?;

    let ts = obj
        .get("ts")
        .and_then(Value::as_i64)
        .ok_or(DecodeError::MissingField { field: "ts" })?;

    let data = obj
        .get("data")
        .cloned()
        .ok_or(DecodeError::MissingField { field: "data" })?;

    let req_id = obj
        .get("req_id")
        .and_then(Value::as_str)
        .map(RequestId::from_raw);

    Ok(Envelope {
        v,
        kind: MessageKind::from_tag(tag),
        topic,
        req_id,
        ts,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_ping() {
        let env = Envelope::new(MessageKind::Ping, Topic::System, 1700000000000, json!({}));
        let raw = encode(&env).unwrap();
        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.kind, MessageKind::Ping);
        assert_eq!(decoded.topic, Topic::System);
        assert_eq!(decoded.ts, 1700000000000);
        assert!(decoded.req_id.is_none());
    }

    #[test]
    fn req_id_survives_roundtrip() {
        let env = Envelope::new(
            MessageKind::Subscribe,
            Topic::System,
            1,
            json!({"topics": ["thread:42"]}),
        )
        .with_req_id(RequestId::from_raw("req_abc"));
        let raw = encode(&env).unwrap();
        assert!(raw.contains("\"req_id\":\"req_abc\""));
        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.req_id.unwrap().as_str(), "req_abc");
    }

    #[test]
    fn req_id_omitted_when_absent() {
        let env = Envelope::new(MessageKind::Pong, Topic::System, 1, json!({}));
        let raw = encode(&env).unwrap();
        assert!(!raw.contains("req_id"));
    }

    #[test]
    fn wire_field_names() {
        let env = Envelope::new(
            MessageKind::StreamChunk,
            Topic::thread("42"),
            99,
            json!({"content": "hi"}),
        );
        let value: Value = serde_json::from_str(&encode(&env).unwrap()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "stream_chunk");
        assert_eq!(value["topic"], "thread:42");
        assert_eq!(value["ts"], 99);
        assert_eq!(value["data"]["content"], "hi");
    }

    #[test]
    fn malformed_json_rejected() {
        assert_eq!(decode("{not json").unwrap_err(), DecodeError::MalformedJson);
        assert_eq!(decode("[1,2,3]").unwrap_err(), DecodeError::MalformedJson);
    }

    #[test]
    fn missing_fields_named() {
        let base = json!({
            "v": 1, "type": "ping", "topic": "system", "ts": 5, "data": {}
        });
        for field in ["v", "type", "topic", "ts", "data"] {
            let mut obj = base.as_object().unwrap().clone();
            obj.remove(field);
            let raw = serde_json::to_string(&obj).unwrap();
            assert_eq!(
                decode(&raw).unwrap_err(),
                DecodeError::MissingField { field },
                "removed {field}"
            );
        }
    }

    #[test]
    fn wrong_typed_field_counts_as_missing() {
        let raw = r#"{"v":"one","type":"ping","topic":"system","ts":5,"data":{}}"#;
        assert_eq!(
            decode(raw).unwrap_err(),
            DecodeError::MissingField { field: "v" }
        );
    }

    #[test]
    fn newer_version_rejected() {
        let raw = r#"{"v":2,"type":"ping","topic":"system","ts":5,"data":{}}"#;
        assert_eq!(
            decode(raw).unwrap_err(),
            DecodeError::VersionMismatch { v: 2, max: 1 }
        );
        // Versions past u32 range still fail the check rather than wrapping
        let raw = r#"{"v":4294967296,"type":"ping","topic":"system","ts":5,"data":{}}"#;
        assert!(matches!(
            decode(raw).unwrap_err(),
            DecodeError::VersionMismatch { .. }
        ));
    }

    #[test]
    fn malformed_topic_rejected() {
        let raw = r#"{"v":1,"type":"ping","topic":"nope:1","ts":5,"data":{}}"#;
        assert!(matches!(
            decode(raw).unwrap_err(),
            DecodeError::MalformedTopic { .. }
        ));
    }

    #[test]
    fn unknown_type_decodes_generically() {
        let raw = r#"{"v":1,"type":"hologram_update","topic":"system","ts":5,"data":{"x":1}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown("hologram_update".into()));
        assert_eq!(env.data["x"], 1);
        assert!(env.known_kind().is_err());
    }

    #[test]
    fn unknown_type_reencodes_original_tag() {
        let raw = r#"{"v":1,"type":"hologram_update","topic":"system","ts":5,"data":{}}"#;
        let env = decode(raw).unwrap();
        let reencoded = encode(&env).unwrap();
        assert!(reencoded.contains("\"type\":\"hologram_update\""));
    }

    #[test]
    fn aliases_map_to_primary_kind() {
        let cases = [
            ("thread_message_created", MessageKind::ThreadMessage),
            ("thread_created", MessageKind::ThreadEvent),
            ("thread_updated", MessageKind::ThreadEvent),
            ("thread_deleted", MessageKind::ThreadEvent),
            ("agent_created", MessageKind::AgentEvent),
            ("agent_updated", MessageKind::AgentEvent),
            ("agent_deleted", MessageKind::AgentEvent),
            ("agent_state", MessageKind::AgentEvent),
        ];
        for (alias, expected) in cases {
            assert_eq!(MessageKind::from_tag(alias), expected, "alias {alias}");
        }
    }

    #[test]
    fn primary_tags_roundtrip() {
        let kinds = [
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::Error,
            MessageKind::Subscribe,
            MessageKind::SubscribeAck,
            MessageKind::SubscribeError,
            MessageKind::Unsubscribe,
            MessageKind::SendMessage,
            MessageKind::ThreadMessage,
            MessageKind::ThreadEvent,
            MessageKind::StreamStart,
            MessageKind::StreamChunk,
            MessageKind::StreamEnd,
            MessageKind::AssistantId,
            MessageKind::AgentEvent,
            MessageKind::RunUpdate,
            MessageKind::UserUpdate,
            MessageKind::NodeState,
            MessageKind::ExecutionFinished,
            MessageKind::NodeLog,
            MessageKind::OpsEvent,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::from_tag(kind.as_tag()), kind);
            assert!(kind.is_known());
        }
    }

    #[test]
    fn extra_fields_tolerated() {
        let raw = r#"{"v":1,"type":"ping","topic":"system","ts":5,"data":{},"trace":"t1"}"#;
        assert!(decode(raw).is_ok());
    }

    #[test]
    fn null_data_is_present() {
        // `data: null` is present, just empty — distinct from a missing field.
        let raw = r#"{"v":1,"type":"ping","topic":"system","ts":5,"data":null}"#;
        let env = decode(raw).unwrap();
        assert!(env.data.is_null());
    }
}
