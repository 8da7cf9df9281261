use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::clock::MonotonicClock;
use relay_core::envelope::{decode, encode, Envelope, MessageKind};
use relay_core::errors::{ProtocolRaceError, SubscribeErrorCode, TransportFailure};
use relay_core::ids::RequestId;
use relay_core::payload::{
    SendMessagePayload, SubscribeAckPayload, SubscribeErrorPayload, SubscribePayload,
    UnsubscribePayload,
};
use relay_core::topic::Topic;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconnect::{BackoffConfig, ConnectionState, ReconnectionManager};
use crate::stream::{CompletedMessage, StreamReconstructor};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = DashMap<RequestId, oneshot::Sender<SubscribeResponse>>;

const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9400/ws`.
    pub url: String,
    /// Credential presented at connection open.
    pub token: String,
    pub backoff: BackoffConfig,
    /// How long `subscribe` waits for its ack before giving up.
    pub request_timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            backoff: BackoffConfig::default(),
            request_timeout_secs: 10,
        }
    }
}

/// Everything the application receives from the connection.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A fully reassembled streamed assistant message.
    Completed(CompletedMessage),
    /// Any other broadcast envelope (thread messages, agent/run/user/ops
    /// events, server errors) for the application to interpret.
    Envelope(Envelope),
    /// Conflicting `assistant_id` — logged and surfaced, never fatal.
    Race(ProtocolRaceError),
    /// Reconnect attempts exhausted; the connection will not come back
    /// without a new client.
    Failed(TransportFailure),
}

/// First server response correlated to a `subscribe` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscribeResponse {
    Acked {
        topics: Vec<Topic>,
    },
    Rejected {
        topics: Vec<Topic>,
        error_code: SubscribeErrorCode,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client stopped")]
    Stopped,
    #[error("timed out waiting for server response")]
    Timeout,
}

/// One physical connection per application session, explicitly owned —
/// share it by handle, not through a global.
pub struct RelayClient {
    manager: Arc<ReconnectionManager>,
    out_tx: mpsc::Sender<String>,
    pending: Arc<PendingMap>,
    clock: Arc<MonotonicClock>,
    request_timeout: Duration,
    _driver: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Spawn the connection driver and return the client plus its event
    /// stream. Returns immediately; watch `state()` for the handshake.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let manager = Arc::new(ReconnectionManager::new(config.backoff.clone()));
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let clock = Arc::new(MonotonicClock::new());
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let driver = tokio::spawn(drive(
            config,
            Arc::clone(&manager),
            out_rx,
            Arc::clone(&pending),
            event_tx,
            Arc::clone(&clock),
        ));

        (
            Self {
                manager,
                out_tx,
                pending,
                clock,
                request_timeout,
                _driver: driver,
            },
            event_rx,
        )
    }

    /// Observe the connection lifecycle (best-effort reconnecting
    /// indicator).
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state()
    }

    /// Add topics to the desired set and ask the server for them. Resolves
    /// with the first correlated response; the correlation token is
    /// discarded after it, so late duplicates are dropped silently.
    pub async fn subscribe(&self, topics: Vec<Topic>) -> Result<SubscribeResponse, ClientError> {
        if self.manager.is_stopped() {
            return Err(ClientError::Stopped);
        }
        self.manager.add_desired(&topics);

        let req_id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(req_id.clone(), tx);

        let envelope = Envelope::new(
            MessageKind::Subscribe,
            Topic::System,
            self.clock.now_ms(),
            serde_json::to_value(SubscribePayload { topics }).unwrap_or_default(),
        )
        .with_req_id(req_id.clone());

        let result = tokio::time::timeout(self.request_timeout, async {
            let json = encode(&envelope).map_err(|_| ClientError::Stopped)?;
            self.out_tx.send(json).await.map_err(|_| ClientError::Stopped)?;
            rx.await.map_err(|_| ClientError::Stopped)
        })
        .await;

        match result {
            Ok(response) => response,
            Err(_) => {
                self.pending.remove(&req_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Remove topics from the desired set and tell the server. Fire and
    /// forget; unsubscribing topics not held is a server-side no-op.
    pub async fn unsubscribe(&self, topics: Vec<Topic>) -> Result<(), ClientError> {
        self.manager.remove_desired(&topics);
        let envelope = Envelope::new(
            MessageKind::Unsubscribe,
            Topic::System,
            self.clock.now_ms(),
            serde_json::to_value(UnsubscribePayload { topics }).unwrap_or_default(),
        );
        self.send(&envelope).await
    }

    /// Post a user message to a thread.
    pub async fn send_message(
        &self,
        thread_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        let thread_id = thread_id.into();
        let envelope = Envelope::new(
            MessageKind::SendMessage,
            Topic::thread(thread_id.clone()),
            self.clock.now_ms(),
            serde_json::to_value(SendMessagePayload {
                thread_id,
                content: content.into(),
            })
            .unwrap_or_default(),
        );
        self.send(&envelope).await
    }

    /// Halt reconnection and close the socket. Idempotent; used when the
    /// owning context is torn down.
    pub fn stop(&self) {
        self.manager.stop();
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        if self.manager.is_stopped() {
            return Err(ClientError::Stopped);
        }
        let json = encode(envelope).map_err(|_| ClientError::Stopped)?;
        self.out_tx.send(json).await.map_err(|_| ClientError::Stopped)
    }
}

/// Connection driver: connect, run, reconnect with capped backoff until
/// stopped or exhausted.
async fn drive(
    config: ClientConfig,
    manager: Arc<ReconnectionManager>,
    mut out_rx: mpsc::Receiver<String>,
    pending: Arc<PendingMap>,
    event_tx: mpsc::Sender<ClientEvent>,
    clock: Arc<MonotonicClock>,
) {
    let url = format!("{}?token={}", config.url, config.token);
    let mut reconstructor = StreamReconstructor::new();
    let cancel = manager.cancelled();

    loop {
        if manager.is_stopped() {
            break;
        }
        manager.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            result = connect_async(&url) => result,
            _ = cancel.cancelled() => break,
        };

        match connected {
            Ok((ws, _)) => {
                info!(url = %config.url, "relay connection established");
                manager.record_connected();
                // Any stream that was mid-flight died with the old socket;
                // the producer restarts it on the new one.
                reconstructor.reset();

                let client_gone = run_connection(
                    ws,
                    &manager,
                    &mut out_rx,
                    &pending,
                    &event_tx,
                    &mut reconstructor,
                    &clock,
                    &cancel,
                )
                .await;

                if client_gone || manager.is_stopped() {
                    break;
                }
                manager.set_state(ConnectionState::Disconnected);
                info!("relay connection lost");
            }
            Err(e) => {
                warn!(error = %e, "relay connect failed");
            }
        }

        match manager.record_failure() {
            Some(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
                if !manager.wait_backoff(delay).await {
                    break;
                }
            }
            None => {
                let failure = TransportFailure::RetriesExhausted {
                    attempts: manager.attempts(),
                };
                warn!(error = %failure, "giving up on reconnection");
                let _ = event_tx.send(ClientEvent::Failed(failure)).await;
                break;
            }
        }
    }

    manager.set_state(ConnectionState::Disconnected);
}

/// Drive one live socket until it drops. On entry the full desired topic
/// set is re-declared — the server retained nothing from any previous
/// connection, and re-subscribing is idempotent there. Returns `true` when
/// the owning client handle is gone and the driver should not reconnect.
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    ws: WsStream,
    manager: &ReconnectionManager,
    out_rx: &mut mpsc::Receiver<String>,
    pending: &PendingMap,
    event_tx: &mpsc::Sender<ClientEvent>,
    reconstructor: &mut StreamReconstructor,
    clock: &MonotonicClock,
    cancel: &CancellationToken,
) -> bool {
    let (mut ws_tx, mut ws_rx): (SplitSink<WsStream, WsMessage>, SplitStream<WsStream>) =
        ws.split();

    let desired = manager.desired();
    if !desired.is_empty() {
        let redeclare = Envelope::new(
            MessageKind::Subscribe,
            Topic::System,
            clock.now_ms(),
            serde_json::to_value(SubscribePayload { topics: desired }).unwrap_or_default(),
        )
        .with_req_id(RequestId::new());
        match encode(&redeclare) {
            Ok(json) => {
                if ws_tx.send(WsMessage::text(json)).await.is_err() {
                    return false;
                }
            }
            Err(e) => warn!(error = %e, "failed to encode resubscription"),
        }
    }

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(json) => {
                        if ws_tx.send(WsMessage::text(json)).await.is_err() {
                            return false;
                        }
                    }
                    None => return true,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = handle_inbound(
                            text.as_str(),
                            pending,
                            event_tx,
                            reconstructor,
                            clock,
                        ) {
                            if ws_tx.send(WsMessage::text(reply)).await.is_err() {
                                return false;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "relay read error");
                        return false;
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return false;
            }
        }
    }
}

/// Process one inbound frame. Returns a frame to write back (the `pong`
/// answer to a server `ping`), if any.
fn handle_inbound(
    raw: &str,
    pending: &PendingMap,
    event_tx: &mpsc::Sender<ClientEvent>,
    reconstructor: &mut StreamReconstructor,
    clock: &MonotonicClock,
) -> Option<String> {
    let envelope = match decode(raw) {
        Ok(env) => env,
        Err(e) => {
            warn!(kind = e.error_kind(), "undecodable frame from server");
            return None;
        }
    };

    match &envelope.kind {
        MessageKind::Ping => {
            let mut pong = Envelope::new(
                MessageKind::Pong,
                Topic::System,
                clock.now_ms(),
                serde_json::json!({}),
            );
            pong.req_id = envelope.req_id;
            encode(&pong).ok()
        }
        MessageKind::Pong => None,

        MessageKind::SubscribeAck | MessageKind::SubscribeError => {
            let Some(req_id) = &envelope.req_id else {
                // The automatic resubscription carries a req_id nobody
                // awaits; one without any req_id has no home at all.
                return None;
            };
            let Some((_, tx)) = pending.remove(req_id) else {
                debug!(req_id = %req_id, "late or duplicate response, ignoring");
                return None;
            };
            let response = if envelope.kind == MessageKind::SubscribeAck {
                let payload: SubscribeAckPayload =
                    serde_json::from_value(envelope.data).unwrap_or(SubscribeAckPayload {
                        topics: Vec::new(),
                    });
                SubscribeResponse::Acked {
                    topics: payload.topics,
                }
            } else {
                match serde_json::from_value::<SubscribeErrorPayload>(envelope.data) {
                    Ok(payload) => SubscribeResponse::Rejected {
                        topics: payload.topics,
                        error_code: payload.error_code,
                    },
                    Err(_) => SubscribeResponse::Rejected {
                        topics: Vec::new(),
                        error_code: SubscribeErrorCode::NotFound,
                    },
                }
            };
            let _ = tx.send(response);
            None
        }

        MessageKind::StreamStart
        | MessageKind::StreamChunk
        | MessageKind::StreamEnd
        | MessageKind::AssistantId => {
            match reconstructor.apply(&envelope) {
                Ok(Some(completed)) => forward(event_tx, ClientEvent::Completed(completed)),
                Ok(None) => {}
                Err(race) => {
                    warn!(thread_id = %race.thread_id, attached = race.attached, received = race.received, "assistant id race");
                    forward(event_tx, ClientEvent::Race(race));
                }
            }
            None
        }

        MessageKind::Unknown(tag) => {
            debug!(tag = %tag, "ignoring unknown message type");
            None
        }

        // Everything else is application traffic
        _ => {
            forward(event_tx, ClientEvent::Envelope(envelope));
            None
        }
    }
}

/// Hand an event to the application without blocking the read loop.
fn forward(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if event_tx.try_send(event).is_err() {
        warn!("event queue full, dropping event");
    }
}
