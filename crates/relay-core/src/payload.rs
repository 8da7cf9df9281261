//! Typed payload shapes carried in envelope `data` fields.
//!
//! Each cataloged kind with a fixed shape gets a struct here; event-style
//! kinds whose shape belongs to the producer (`thread_event`, `agent_event`,
//! `user_update`, `ops_event`) stay raw `serde_json::Value` at the call
//! sites.

use serde::{Deserialize, Serialize};

use crate::errors::SubscribeErrorCode;
use crate::topic::Topic;

/// `run_update` payloads are dashboard-class traffic and stay small.
pub const MAX_RUN_UPDATE_BYTES: usize = 1024;
/// `stream_chunk` payloads carry at most one provider block of tokens.
pub const MAX_STREAM_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topics: Vec<Topic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeAckPayload {
    pub topics: Vec<Topic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeErrorPayload {
    pub topics: Vec<Topic>,
    pub error_code: SubscribeErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    pub topics: Vec<Topic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub thread_id: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadMessagePayload {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    pub role: String,
    pub content: String,
}

/// What a `stream_chunk` carries. Closed for now; decoding tolerates new
/// values via `Other` so producers can add chunk classes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    AssistantToken,
    #[serde(untagged)]
    Other(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamStartPayload {
    pub thread_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamChunkPayload {
    pub thread_id: String,
    pub chunk_type: ChunkType,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamEndPayload {
    pub thread_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantIdPayload {
    pub thread_id: String,
    pub message_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunUpdatePayload {
    pub run_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatePayload {
    pub execution_id: String,
    pub node_id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeLogPayload {
    pub execution_id: String,
    pub node_id: String,
    pub line: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionFinishedPayload {
    pub execution_id: String,
    pub status: String,
}
