use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use relay_core::auth::{Identity, TopicAuthorizer};
use relay_core::clock::MonotonicClock;
use relay_core::envelope::{encode, Envelope, MessageKind};
use relay_core::ids::ConnectionId;
use relay_core::topic::Topic;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::router::TopicRouter;
use crate::server::HubConfig;

/// Failure to enqueue an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// Bounded send queue is full — the subscriber is too slow.
    Full,
    /// The writer task is gone.
    Closed,
}

/// Per-socket server-side state.
///
/// Owns the connection's identity (immutable after open), its authoritative
/// topic set, the bounded outbound queue, and the heartbeat clock. The
/// router holds an `Arc` back-reference for dispatch only.
pub struct SessionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    tx: mpsc::Sender<Arc<str>>,
    topics: RwLock<HashSet<Topic>>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    clock: MonotonicClock,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn new(identity: Identity, max_send_queue: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(max_send_queue);
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            identity,
            tx,
            topics: RwLock::new(HashSet::new()),
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            clock: MonotonicClock::new(),
            shutdown: CancellationToken::new(),
        });
        (handle, rx)
    }

    /// Queue a frame for the writer task without blocking.
    pub fn enqueue(&self, frame: Arc<str>) -> Result<(), EnqueueError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Encode and queue an envelope. Serialization failures are logged, not
    /// propagated — one bad payload must not tear down the session.
    pub fn send_envelope(&self, envelope: &Envelope) {
        match encode(envelope) {
            Ok(json) => {
                if self.enqueue(Arc::from(json.as_str())).is_err() {
                    tracing::warn!(connection_id = %self.id, "send queue full, dropping control frame");
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "failed to encode envelope");
            }
        }
    }

    /// Timestamp for envelopes produced on behalf of this connection.
    pub fn stamp(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn insert_topics(&self, topics: &[Topic]) {
        let mut set = self.topics.write();
        for topic in topics {
            set.insert(topic.clone());
        }
    }

    pub fn remove_topics(&self, topics: &[Topic]) {
        let mut set = self.topics.write();
        for topic in topics {
            set.remove(topic);
        }
    }

    pub fn holds_topic(&self, topic: &Topic) -> bool {
        self.topics.read().contains(topic)
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.read().iter().cloned().collect()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn set_last_pong(&self, secs: u64) {
        self.last_pong.store(secs, Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Mark dead and wake the socket tasks so they close. Idempotent.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.shutdown.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Drive one WebSocket connection: split into reader/writer, heartbeat via
/// protocol-level `ping`/`pong` envelopes, teardown through the router on
/// exit. Ordering is preserved within each direction.
pub async fn run_session(
    socket: WebSocket,
    session: Arc<SessionHandle>,
    mut rx: mpsc::Receiver<Arc<str>>,
    router: Arc<TopicRouter>,
    authorizer: Arc<dyn TopicAuthorizer>,
    config: HubConfig,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs);

    // Writer: queued frames out, periodic ping, liveness check
    let writer_session = Arc::clone(&session);
    let writer_shutdown = session.closed();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.as_ref().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_session.is_alive(heartbeat_timeout) {
                        tracing::info!(connection_id = %writer_session.id, "heartbeat timeout");
                        break;
                    }
                    let ping = Envelope::new(
                        MessageKind::Ping,
                        Topic::System,
                        writer_session.stamp(),
                        serde_json::json!({}),
                    );
                    let Ok(json) = encode(&ping) else { break };
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = writer_shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader: inbound frames into the dispatcher
    let reader_session = Arc::clone(&session);
    let reader_router = Arc::clone(&router);
    let reader_shutdown = session.closed();
    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            crate::handlers::handle_frame(
                                &reader_router,
                                &reader_session,
                                authorizer.as_ref(),
                                text.as_str(),
                            )
                            .await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
                _ = reader_shutdown.cancelled() => break,
            }
        }
    });

    // Either side finishing tears down the whole session
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    session.close();
    router.drop_connection(&session.id);
    tracing::info!(connection_id = %session.id, "session closed");
}

/// Periodically drop sessions that stopped answering pings.
pub fn start_cleanup_task(
    router: Arc<TopicRouter>,
    interval: Duration,
    heartbeat_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = router.drop_dead_connections(heartbeat_timeout);
            if removed > 0 {
                tracing::info!(removed, "dead session cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ids::UserId;

    fn identity() -> Identity {
        Identity::new(UserId::from_raw("u1"), "u1")
    }

    #[test]
    fn fresh_session_is_alive_and_connected() {
        let (session, _rx) = SessionHandle::new(identity(), 8);
        assert!(session.is_connected());
        assert!(session.is_alive(Duration::from_secs(90)));
        assert!(session.id.as_str().starts_with("conn_"));
    }

    #[test]
    fn topic_set_mutations() {
        let (session, _rx) = SessionHandle::new(identity(), 8);
        session.insert_topics(&[Topic::thread("1"), Topic::agent("2")]);
        assert!(session.holds_topic(&Topic::thread("1")));
        assert!(session.holds_topic(&Topic::agent("2")));

        session.remove_topics(&[Topic::thread("1")]);
        assert!(!session.holds_topic(&Topic::thread("1")));

        // removing a topic never held is a no-op
        session.remove_topics(&[Topic::user("9")]);
        assert_eq!(session.topics().len(), 1);
    }

    #[test]
    fn enqueue_reports_full_queue() {
        let (session, _rx) = SessionHandle::new(identity(), 2);
        assert!(session.enqueue(Arc::from("a")).is_ok());
        assert!(session.enqueue(Arc::from("b")).is_ok());
        assert_eq!(session.enqueue(Arc::from("c")), Err(EnqueueError::Full));
    }

    #[test]
    fn enqueue_reports_closed_queue() {
        let (session, rx) = SessionHandle::new(identity(), 2);
        drop(rx);
        assert_eq!(session.enqueue(Arc::from("a")), Err(EnqueueError::Closed));
    }

    #[test]
    fn close_is_idempotent() {
        let (session, _rx) = SessionHandle::new(identity(), 2);
        session.close();
        session.close();
        assert!(!session.is_connected());
    }

    #[test]
    fn stale_pong_fails_liveness() {
        let (session, _rx) = SessionHandle::new(identity(), 2);
        session.last_pong.store(0, Ordering::Relaxed);
        assert!(!session.is_alive(Duration::from_secs(90)));
        session.record_pong();
        assert!(session.is_alive(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn send_envelope_lands_on_queue() {
        let (session, mut rx) = SessionHandle::new(identity(), 8);
        let env = Envelope::new(
            MessageKind::Pong,
            Topic::System,
            session.stamp(),
            serde_json::json!({}),
        );
        session.send_envelope(&env);
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"type\":\"pong\""));
    }
}
