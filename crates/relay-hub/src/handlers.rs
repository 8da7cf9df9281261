use std::sync::Arc;

use relay_core::auth::TopicAuthorizer;
use relay_core::envelope::{decode, Envelope, MessageKind};
use relay_core::errors::SubscribeErrorCode;
use relay_core::payload::{
    ErrorPayload, SendMessagePayload, SubscribeAckPayload, SubscribeErrorPayload,
    SubscribePayload, ThreadMessagePayload, UnsubscribePayload, MAX_RUN_UPDATE_BYTES,
    MAX_STREAM_CHUNK_BYTES,
};
use relay_core::topic::Topic;
use tracing::{debug, warn};

use crate::router::TopicRouter;
use crate::session::SessionHandle;

/// Decode one inbound frame and dispatch it. Every failure here is isolated:
/// the reply is an `error` envelope (or a per-topic `subscribe_error`) and
/// the connection stays open. Only the transport layer closes sockets.
pub async fn handle_frame(
    router: &Arc<TopicRouter>,
    session: &Arc<SessionHandle>,
    authorizer: &dyn TopicAuthorizer,
    raw: &str,
) {
    let envelope = match decode(raw) {
        Ok(env) => env,
        Err(e) => {
            warn!(connection_id = %session.id, kind = e.error_kind(), "undecodable frame");
            router.record_decode_error(e.error_kind());
            send_error(session, e.error_kind(), &e.to_string(), None);
            return;
        }
    };

    match &envelope.kind {
        MessageKind::Ping => {
            let mut pong = Envelope::new(
                MessageKind::Pong,
                Topic::System,
                session.stamp(),
                serde_json::json!({}),
            );
            pong.req_id = envelope.req_id;
            session.send_envelope(&pong);
        }
        MessageKind::Pong => session.record_pong(),

        MessageKind::Subscribe => handle_subscribe(router, session, authorizer, envelope).await,
        MessageKind::Unsubscribe => {
            match serde_json::from_value::<UnsubscribePayload>(envelope.data) {
                Ok(payload) => router.unsubscribe(&session.id, &payload.topics),
                Err(e) => send_error(session, "invalid_payload", &e.to_string(), envelope.req_id),
            }
        }

        MessageKind::SendMessage => handle_send_message(router, session, authorizer, envelope).await,

        // Producer-published event kinds are checked, then fanned out to the
        // envelope's own topic.
        MessageKind::ThreadMessage
        | MessageKind::ThreadEvent
        | MessageKind::StreamStart
        | MessageKind::StreamChunk
        | MessageKind::StreamEnd
        | MessageKind::AssistantId
        | MessageKind::AgentEvent
        | MessageKind::RunUpdate
        | MessageKind::UserUpdate
        | MessageKind::NodeState
        | MessageKind::ExecutionFinished
        | MessageKind::NodeLog
        | MessageKind::OpsEvent => handle_publish(router, session, authorizer, envelope).await,

        // Server-emitted kinds arriving inbound have no handler
        MessageKind::Error | MessageKind::SubscribeAck | MessageKind::SubscribeError => {
            debug!(connection_id = %session.id, kind = envelope.kind.as_tag(), "ignoring server-only kind from client");
        }

        MessageKind::Unknown(tag) => {
            debug!(connection_id = %session.id, tag = %tag, "ignoring unknown message type");
        }
    }
}

async fn handle_subscribe(
    router: &Arc<TopicRouter>,
    session: &Arc<SessionHandle>,
    authorizer: &dyn TopicAuthorizer,
    envelope: Envelope,
) {
    let req_id = envelope.req_id;
    let payload: SubscribePayload = match serde_json::from_value(envelope.data) {
        Ok(p) => p,
        Err(e) => {
            send_error(session, "invalid_payload", &e.to_string(), req_id);
            return;
        }
    };

    let outcome = router.subscribe(&session.id, payload.topics, authorizer).await;

    // Each denial code gets its own subscribe_error; a fully denied request
    // produces no ack at all.
    for code in [SubscribeErrorCode::NotFound, SubscribeErrorCode::Forbidden] {
        let topics: Vec<Topic> = outcome
            .denied
            .iter()
            .filter(|(_, c)| *c == code)
            .map(|(t, _)| t.clone())
            .collect();
        if topics.is_empty() {
            continue;
        }
        let mut err = Envelope::new(
            MessageKind::SubscribeError,
            Topic::System,
            session.stamp(),
            serde_json::to_value(SubscribeErrorPayload {
                topics,
                error_code: code,
                message: None,
            })
            .unwrap_or_default(),
        );
        err.req_id = req_id.clone();
        session.send_envelope(&err);
    }

    if outcome.denied.is_empty() || !outcome.granted.is_empty() {
        let mut ack = Envelope::new(
            MessageKind::SubscribeAck,
            Topic::System,
            session.stamp(),
            serde_json::to_value(SubscribeAckPayload {
                topics: outcome.granted,
            })
            .unwrap_or_default(),
        );
        ack.req_id = req_id;
        session.send_envelope(&ack);
    }
}

async fn handle_send_message(
    router: &Arc<TopicRouter>,
    session: &Arc<SessionHandle>,
    authorizer: &dyn TopicAuthorizer,
    envelope: Envelope,
) {
    let req_id = envelope.req_id;
    let payload: SendMessagePayload = match serde_json::from_value(envelope.data) {
        Ok(p) => p,
        Err(e) => {
            send_error(session, "invalid_payload", &e.to_string(), req_id);
            return;
        }
    };

    let topic = Topic::thread(payload.thread_id.clone());
    if let Err(code) = authorizer.authorize(&session.identity, &topic).await {
        send_error(session, &code.to_string(), "not allowed to post to this thread", req_id);
        return;
    }

    let message = Envelope::new(
        MessageKind::ThreadMessage,
        topic.clone(),
        session.stamp(),
        serde_json::to_value(ThreadMessagePayload {
            thread_id: payload.thread_id,
            message_id: None,
            role: "user".into(),
            content: payload.content,
        })
        .unwrap_or_default(),
    );
    router.broadcast(&topic, &message);
}

async fn handle_publish(
    router: &Arc<TopicRouter>,
    session: &Arc<SessionHandle>,
    authorizer: &dyn TopicAuthorizer,
    envelope: Envelope,
) {
    let limit = match envelope.kind {
        MessageKind::RunUpdate => Some(MAX_RUN_UPDATE_BYTES),
        MessageKind::StreamChunk => Some(MAX_STREAM_CHUNK_BYTES),
        _ => None,
    };
    if let Some(limit) = limit {
        let size = envelope.data.to_string().len();
        if size > limit {
            warn!(connection_id = %session.id, kind = envelope.kind.as_tag(), size, limit, "payload over size contract");
            send_error(
                session,
                "payload_too_large",
                &format!("{} payload exceeds {limit} bytes", envelope.kind.as_tag()),
                envelope.req_id,
            );
            return;
        }
    }

    // agent_event and run_update carry per-message authorization
    if matches!(envelope.kind, MessageKind::AgentEvent | MessageKind::RunUpdate) {
        if let Err(code) = authorizer
            .authorize_publish(&session.identity, &envelope.kind, &envelope.topic)
            .await
        {
            send_error(
                session,
                &code.to_string(),
                "not allowed to publish to this topic",
                envelope.req_id,
            );
            return;
        }
    }

    let topic = envelope.topic.clone();
    router.broadcast(&topic, &envelope);
}

fn send_error(
    session: &Arc<SessionHandle>,
    code: &str,
    message: &str,
    req_id: Option<relay_core::ids::RequestId>,
) {
    let mut err = Envelope::new(
        MessageKind::Error,
        Topic::System,
        session.stamp(),
        serde_json::to_value(ErrorPayload {
            code: code.into(),
            message: message.into(),
        })
        .unwrap_or_default(),
    );
    err.req_id = req_id;
    session.send_envelope(&err);
}
