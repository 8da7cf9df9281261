use std::time::Duration;

/// Failure to decode a wire frame. The connection stays open; the hub
/// answers with an `error` envelope instead of closing the socket.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON payload")]
    MalformedJson,
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("unknown message type: {tag}")]
    UnknownType { tag: String },
    #[error("protocol version {v} exceeds supported maximum {max}")]
    VersionMismatch { v: u32, max: u32 },
    #[error("malformed topic address: {topic}")]
    MalformedTopic { topic: String },
}

impl DecodeError {
    /// Short classification string for logging/metrics and `error` payloads.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MalformedJson => "malformed_json",
            Self::MissingField { .. } => "missing_field",
            Self::UnknownType { .. } => "unknown_type",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::MalformedTopic { .. } => "malformed_topic",
        }
    }
}

/// Per-topic subscribe failure code, reported in `subscribe_error` payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeErrorCode {
    NotFound,
    Forbidden,
}

impl std::fmt::Display for SubscribeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("NOT_FOUND"),
            Self::Forbidden => f.write_str("FORBIDDEN"),
        }
    }
}

/// A conflicting `assistant_id` arrived for a stream that is already
/// attached to a different id. Surfaced to the application layer and
/// logged; never fatal to the connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("conflicting assistant id for thread {thread_id}: attached {attached}, received {received}")]
pub struct ProtocolRaceError {
    pub thread_id: String,
    pub attached: i64,
    pub received: i64,
}

/// Transport-level failure. The only error class that closes a socket;
/// expected to self-heal via reconnect + idempotent resubscribe.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("no pong within {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("reconnect attempts exhausted after {attempts}")]
    RetriesExhausted { attempts: u32 },
}

impl TransportFailure {
    /// Terminal failures stop the reconnection manager; everything else
    /// feeds another backoff cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed(_) => "closed",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::ConnectFailed(_) => "connect_failed",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}
