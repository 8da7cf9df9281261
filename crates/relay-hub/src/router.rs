use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_core::auth::TopicAuthorizer;
use relay_core::envelope::{encode, Envelope};
use relay_core::errors::SubscribeErrorCode;
use relay_core::ids::ConnectionId;
use relay_core::topic::Topic;
use relay_telemetry::MetricsRecorder;
use tracing::{debug, warn};

use crate::session::{EnqueueError, SessionHandle};

/// Result of one subscribe request: which topics joined the subscriber set
/// and which were denied, per topic. Partial success is normal.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOutcome {
    pub granted: Vec<Topic>,
    pub denied: Vec<(Topic, SubscribeErrorCode)>,
}

/// What one broadcast call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub recipients: usize,
    /// Subscribers disconnected because their send queue was full.
    pub dropped: usize,
}

/// Server-side hub mapping topics to subscribed connections.
///
/// Exclusively owns the topic→subscriber mapping; each session keeps its own
/// authoritative topic set and the router holds only `Arc` back-references
/// for dispatch. All operations are safe under concurrent invocation.
pub struct TopicRouter {
    topics: DashMap<Topic, HashSet<ConnectionId>>,
    connections: DashMap<ConnectionId, Arc<SessionHandle>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl TopicRouter {
    pub fn new(metrics: Option<Arc<MetricsRecorder>>) -> Self {
        Self {
            topics: DashMap::new(),
            connections: DashMap::new(),
            metrics,
        }
    }

    /// Track a newly opened connection.
    pub fn register(&self, session: Arc<SessionHandle>) {
        self.connections.insert(session.id.clone(), session);
        self.record_connection_gauge();
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<SessionHandle>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Authorize and subscribe each requested topic independently.
    ///
    /// Granted topics join the subscriber set; re-subscribing a topic the
    /// connection already holds is a no-op that still shows up in the fresh
    /// ack. Denied topics carry their per-topic error code.
    pub async fn subscribe(
        &self,
        connection_id: &ConnectionId,
        topics: Vec<Topic>,
        authorizer: &dyn TopicAuthorizer,
    ) -> SubscribeOutcome {
        let Some(session) = self.connection(connection_id) else {
            return SubscribeOutcome {
                granted: Vec::new(),
                denied: topics
                    .into_iter()
                    .map(|t| (t, SubscribeErrorCode::NotFound))
                    .collect(),
            };
        };

        let mut outcome = SubscribeOutcome::default();
        for topic in topics {
            match authorizer.authorize(&session.identity, &topic).await {
                Ok(()) => {
                    // Session set first, router map second: once the topic
                    // entry contains the connection, broadcasts flow.
                    session.insert_topics(std::slice::from_ref(&topic));
                    self.topics
                        .entry(topic.clone())
                        .or_default()
                        .insert(connection_id.clone());
                    outcome.granted.push(topic);
                }
                Err(code) => {
                    debug!(connection_id = %connection_id, topic = %topic, code = %code, "subscribe denied");
                    outcome.denied.push((topic, code));
                }
            }
        }
        outcome
    }

    /// Remove the given topics from a connection's set. Topics not held are
    /// a no-op, not an error.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, topics: &[Topic]) {
        for topic in topics {
            // Router map first so no further broadcast reaches the session,
            // then the session's own set.
            if let Some(mut entry) = self.topics.get_mut(topic) {
                entry.remove(connection_id);
                if entry.is_empty() {
                    drop(entry);
                    self.topics.remove_if(topic, |_, subs| subs.is_empty());
                }
            }
        }
        if let Some(session) = self.connection(connection_id) {
            session.remove_topics(topics);
        }
    }

    /// Deliver an envelope to every connection currently subscribed to the
    /// topic. The frame is serialized once and shared; each delivery is
    /// independent, and a full send queue disconnects that subscriber
    /// without blocking the rest.
    pub fn broadcast(&self, topic: &Topic, envelope: &Envelope) -> BroadcastStats {
        let started = std::time::Instant::now();
        let frame: Arc<str> = match encode(envelope) {
            Ok(json) => Arc::from(json.as_str()),
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to serialize broadcast");
                return BroadcastStats::default();
            }
        };

        let subscriber_ids: Vec<ConnectionId> = match self.topics.get(topic) {
            Some(entry) => entry.iter().cloned().collect(),
            None => Vec::new(),
        };

        let mut stats = BroadcastStats::default();
        let mut to_drop = Vec::new();
        for id in subscriber_ids {
            let Some(session) = self.connection(&id) else { continue };
            match session.enqueue(Arc::clone(&frame)) {
                Ok(()) => stats.recipients += 1,
                Err(EnqueueError::Full) => {
                    warn!(connection_id = %id, topic = %topic, "send queue full, disconnecting slow subscriber");
                    to_drop.push(id);
                }
                Err(EnqueueError::Closed) => to_drop.push(id),
            }
        }

        stats.dropped = to_drop.len();
        for id in &to_drop {
            self.drop_connection(id);
        }

        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("relay_broadcast_total", &[("scheme", topic.scheme())], 1);
            if stats.dropped > 0 {
                metrics.counter_inc("relay_broadcast_drops_total", &[], stats.dropped as u64);
            }
            metrics.histogram_observe(
                "relay_broadcast_fanout_ms",
                &[],
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        debug!(topic = %topic, recipients = stats.recipients, dropped = stats.dropped, "broadcast");
        stats
    }

    /// Atomically remove a connection from every topic's subscriber set and
    /// the registry, and wake its socket tasks to close. Idempotent; used on
    /// socket close, heartbeat timeout, and slow-subscriber disconnect.
    pub fn drop_connection(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, session)) = self.connections.remove(connection_id) else {
            return false;
        };
        for topic in session.topics() {
            if let Some(mut entry) = self.topics.get_mut(&topic) {
                entry.remove(connection_id);
                if entry.is_empty() {
                    drop(entry);
                    self.topics.remove_if(&topic, |_, subs| subs.is_empty());
                }
            }
        }
        session.close();
        self.record_connection_gauge();
        true
    }

    /// Drop every connection that stopped answering pings.
    pub fn drop_dead_connections(&self, heartbeat_timeout: Duration) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(heartbeat_timeout))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for id in dead {
            if self.drop_connection(&id) {
                removed += 1;
            }
        }
        removed
    }

    /// Current subscriber count for a topic (tests and introspection).
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |entry| entry.len())
    }

    pub fn record_decode_error(&self, kind: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("relay_decode_errors_total", &[("kind", kind)], 1);
        }
    }

    fn record_connection_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set("relay_connections_active", &[], self.connections.len() as f64);
        }
    }
}
