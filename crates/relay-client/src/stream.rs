//! Reassembly of incrementally streamed assistant output.
//!
//! Chunks for a thread start arriving before the storage layer has assigned
//! the message an id. The reconstructor buffers them, moves the buffer into
//! the accumulator exactly once when `assistant_id` lands, and appends
//! directly from then on. Correctness rests solely on withholding attachment
//! until the id arrives — accumulation preserves strict arrival order and
//! never reorders on timestamps.

use std::collections::HashMap;

use relay_core::envelope::{Envelope, MessageKind};
use relay_core::errors::ProtocolRaceError;
use relay_core::payload::{
    AssistantIdPayload, ChunkType, StreamChunkPayload, StreamEndPayload, StreamStartPayload,
};
use tracing::{debug, warn};

/// A fully reassembled assistant message, emitted on `stream_end`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedMessage {
    pub thread_id: String,
    /// `None` when the stream ended before an id was ever assigned; `text`
    /// is then the degraded raw-buffer fallback.
    pub message_id: Option<i64>,
    pub text: String,
}

/// Per-thread stream state. At most one open (unfinalized) stream per
/// thread; a new `stream_start` supersedes an unfinished one.
#[derive(Clone, Debug)]
enum StreamState {
    /// Chunks arriving, no id assigned yet.
    Buffering { pending: String },
    /// Id assigned; the buffer has been moved into the accumulator.
    Attached { message_id: i64, accumulated: String },
}

/// Rebuilds in-progress assistant responses from routed envelopes, keyed by
/// thread so independent threads can stream concurrently on one connection.
#[derive(Debug, Default)]
pub struct StreamReconstructor {
    streams: HashMap<String, StreamState>,
}

impl StreamReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one envelope through the state machine. Returns the completed
    /// message on `stream_end`; non-streaming kinds are a no-op.
    pub fn apply(
        &mut self,
        envelope: &Envelope,
    ) -> Result<Option<CompletedMessage>, ProtocolRaceError> {
        match envelope.kind {
            MessageKind::StreamStart => {
                if let Some(payload) = parse::<StreamStartPayload>(envelope) {
                    self.on_stream_start(&payload.thread_id);
                }
                Ok(None)
            }
            MessageKind::StreamChunk => {
                if let Some(payload) = parse::<StreamChunkPayload>(envelope) {
                    self.on_chunk(&payload.thread_id, &payload.chunk_type, &payload.content);
                }
                Ok(None)
            }
            MessageKind::AssistantId => {
                if let Some(payload) = parse::<AssistantIdPayload>(envelope) {
                    self.on_assistant_id(&payload.thread_id, payload.message_id)?;
                }
                Ok(None)
            }
            MessageKind::StreamEnd => {
                if let Some(payload) = parse::<StreamEndPayload>(envelope) {
                    return Ok(self.on_stream_end(&payload.thread_id));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Begin a fresh stream. An unfinished prior stream for the thread is
    /// discarded — a new generation supersedes an old one rather than
    /// erroring, since producers guarantee start/end pairing except on rare
    /// races.
    pub fn on_stream_start(&mut self, thread_id: &str) {
        if self.streams.contains_key(thread_id) {
            warn!(thread_id, "stream_start superseding unfinished stream");
        }
        self.streams.insert(
            thread_id.to_string(),
            StreamState::Buffering {
                pending: String::new(),
            },
        );
    }

    /// Append one chunk in arrival order. Chunks for a thread with no open
    /// stream are ignored (late arrivals after finalize).
    pub fn on_chunk(&mut self, thread_id: &str, chunk_type: &ChunkType, content: &str) {
        if *chunk_type != ChunkType::AssistantToken {
            debug!(thread_id, ?chunk_type, "ignoring non-token chunk");
            return;
        }
        match self.streams.get_mut(thread_id) {
            Some(StreamState::Buffering { pending }) => pending.push_str(content),
            Some(StreamState::Attached { accumulated, .. }) => accumulated.push_str(content),
            None => debug!(thread_id, "chunk with no open stream, ignoring"),
        }
    }

    /// Attach the assigned message id, moving the pending buffer into the
    /// accumulator verbatim, once. A repeat of the same id is a no-op; a
    /// different id is a protocol race surfaced to the caller, non-fatal —
    /// the stream keeps its original id.
    pub fn on_assistant_id(
        &mut self,
        thread_id: &str,
        message_id: i64,
    ) -> Result<(), ProtocolRaceError> {
        match self.streams.get_mut(thread_id) {
            Some(state) => match state {
                StreamState::Buffering { pending } => {
                    let accumulated = std::mem::take(pending);
                    *state = StreamState::Attached {
                        message_id,
                        accumulated,
                    };
                    Ok(())
                }
                StreamState::Attached {
                    message_id: attached,
                    ..
                } => {
                    if *attached == message_id {
                        return Ok(());
                    }
                    Err(ProtocolRaceError {
                        thread_id: thread_id.to_string(),
                        attached: *attached,
                        received: message_id,
                    })
                }
            },
            None => {
                debug!(thread_id, message_id, "assistant_id with no open stream, ignoring");
                Ok(())
            }
        }
    }

    /// Finalize: hand back the complete text and reset the thread to idle.
    /// A `stream_end` with no open stream is a safe duplicate and returns
    /// nothing.
    pub fn on_stream_end(&mut self, thread_id: &str) -> Option<CompletedMessage> {
        match self.streams.remove(thread_id)? {
            StreamState::Attached {
                message_id,
                accumulated,
            } => Some(CompletedMessage {
                thread_id: thread_id.to_string(),
                message_id: Some(message_id),
                text: accumulated,
            }),
            StreamState::Buffering { pending } => {
                warn!(thread_id, "stream ended without an assigned id, degraded finalize");
                Some(CompletedMessage {
                    thread_id: thread_id.to_string(),
                    message_id: None,
                    text: pending,
                })
            }
        }
    }

    /// Number of currently open (unfinalized) streams.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Discard all per-thread state. Called on reconnect: the producer will
    /// restart any live stream on the new connection.
    pub fn reset(&mut self) {
        self.streams.clear();
    }
}

fn parse<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match serde_json::from_value(envelope.data.clone()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(kind = envelope.kind.as_tag(), error = %e, "malformed streaming payload, skipping");
            None
        }
    }
}
