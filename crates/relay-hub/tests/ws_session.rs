//! End-to-end WebSocket tests: a real hub on an ephemeral port, driven by
//! tokio-tungstenite clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::auth::{AllowAll, Identity, TopicAuthorizer};
use relay_core::errors::SubscribeErrorCode;
use relay_core::topic::Topic;
use relay_hub::{start, HubConfig};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_hub(authorizer: Arc<dyn TopicAuthorizer>) -> relay_hub::HubHandle {
    let config = HubConfig {
        port: 0,
        ..Default::default()
    };
    start(config, authorizer, Arc::new(AllowAll), None)
        .await
        .unwrap()
}

async fn connect(port: u16, token: &str) -> WsClient {
    let url = format!("ws://127.0.0.1:{port}/ws?token={token}");
    let (ws, _) = connect_async(&url).await.unwrap();
    ws
}

fn envelope(kind: &str, topic: &str, req_id: Option<&str>, data: Value) -> Message {
    let mut obj = json!({"v": 1, "type": kind, "topic": topic, "ts": 1, "data": data});
    if let Some(id) = req_id {
        obj["req_id"] = json!(id);
    }
    Message::text(obj.to_string())
}

/// Read frames until one arrives whose type is not `ping`, or time out.
async fn recv_non_ping(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "ping" {
                return value;
            }
        }
    }
}

/// Assert nothing but pings arrive within the window.
async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["type"] != "ping" {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                _ => futures::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(unexpected) = result {
        panic!("expected silence, got: {unexpected}");
    }
}

struct DenyThread999;

#[async_trait]
impl TopicAuthorizer for DenyThread999 {
    async fn authorize(
        &self,
        _identity: &Identity,
        topic: &Topic,
    ) -> Result<(), SubscribeErrorCode> {
        if topic == &Topic::thread("999") {
            return Err(SubscribeErrorCode::Forbidden);
        }
        Ok(())
    }
}

#[tokio::test]
async fn subscribe_ack_lists_exact_topic_set() {
    let hub = start_hub(Arc::new(AllowAll)).await;
    let mut ws = connect(hub.port, "u1").await;

    ws.send(envelope(
        "subscribe",
        "system",
        Some("req_1"),
        json!({"topics": ["thread:42", "agent:7"]}),
    ))
    .await
    .unwrap();

    let ack = recv_non_ping(&mut ws).await;
    assert_eq!(ack["type"], "subscribe_ack");
    assert_eq!(ack["req_id"], "req_1");
    let topics: Vec<&str> = ack["data"]["topics"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap())
        .collect();
    assert_eq!(topics, vec!["thread:42", "agent:7"]);
}

#[tokio::test]
async fn broadcast_fans_out_to_subscribers_only() {
    let hub = start_hub(Arc::new(AllowAll)).await;
    let mut sub_a = connect(hub.port, "u1").await;
    let mut sub_b = connect(hub.port, "u2").await;
    let mut bystander = connect(hub.port, "u3").await;
    let mut producer = connect(hub.port, "worker").await;

    for ws in [&mut sub_a, &mut sub_b] {
        ws.send(envelope(
            "subscribe",
            "system",
            Some("r"),
            json!({"topics": ["thread:42"]}),
        ))
        .await
        .unwrap();
        let ack = recv_non_ping(ws).await;
        assert_eq!(ack["type"], "subscribe_ack");
    }

    producer
        .send(envelope(
            "stream_chunk",
            "thread:42",
            None,
            json!({"thread_id": "42", "chunk_type": "assistant_token", "content": "Hel"}),
        ))
        .await
        .unwrap();

    let got_a = recv_non_ping(&mut sub_a).await;
    let got_b = recv_non_ping(&mut sub_b).await;
    assert_eq!(got_a, got_b, "both subscribers see the identical envelope");
    assert_eq!(got_a["type"], "stream_chunk");
    assert_eq!(got_a["data"]["content"], "Hel");

    assert_silent(&mut bystander, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn unsubscribed_client_stops_receiving() {
    let hub = start_hub(Arc::new(AllowAll)).await;
    let mut sub = connect(hub.port, "u1").await;
    let mut producer = connect(hub.port, "worker").await;

    sub.send(envelope(
        "subscribe",
        "system",
        Some("r"),
        json!({"topics": ["agent:7"]}),
    ))
    .await
    .unwrap();
    recv_non_ping(&mut sub).await;

    producer
        .send(envelope("agent_event", "agent:7", None, json!({"state": "busy"})))
        .await
        .unwrap();
    assert_eq!(recv_non_ping(&mut sub).await["type"], "agent_event");

    sub.send(envelope(
        "unsubscribe",
        "system",
        None,
        json!({"topics": ["agent:7"]}),
    ))
    .await
    .unwrap();
    // Unsubscribe has no ack; give the hub a beat to apply it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    producer
        .send(envelope("agent_event", "agent:7", None, json!({"state": "idle"})))
        .await
        .unwrap();
    assert_silent(&mut sub, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn forbidden_subscribe_leaves_connection_usable() {
    let hub = start_hub(Arc::new(DenyThread999)).await;
    let mut ws = connect(hub.port, "u1").await;

    ws.send(envelope(
        "subscribe",
        "system",
        Some("req_9"),
        json!({"topics": ["thread:999"]}),
    ))
    .await
    .unwrap();

    let err = recv_non_ping(&mut ws).await;
    assert_eq!(err["type"], "subscribe_error");
    assert_eq!(err["req_id"], "req_9");
    assert_eq!(err["data"]["error_code"], "FORBIDDEN");
    assert_eq!(err["data"]["topics"], json!(["thread:999"]));

    // Same connection, different topic: still works.
    ws.send(envelope(
        "subscribe",
        "system",
        Some("req_10"),
        json!({"topics": ["agent:7"]}),
    ))
    .await
    .unwrap();
    let ack = recv_non_ping(&mut ws).await;
    assert_eq!(ack["type"], "subscribe_ack");
    assert_eq!(ack["data"]["topics"], json!(["agent:7"]));
}

#[tokio::test]
async fn send_message_comes_back_as_thread_message() {
    let hub = start_hub(Arc::new(AllowAll)).await;
    let mut ws = connect(hub.port, "u1").await;

    ws.send(envelope(
        "subscribe",
        "system",
        Some("r"),
        json!({"topics": ["thread:42"]}),
    ))
    .await
    .unwrap();
    recv_non_ping(&mut ws).await;

    ws.send(envelope(
        "send_message",
        "thread:42",
        None,
        json!({"thread_id": "42", "content": "hello there"}),
    ))
    .await
    .unwrap();

    let msg = recv_non_ping(&mut ws).await;
    assert_eq!(msg["type"], "thread_message");
    assert_eq!(msg["topic"], "thread:42");
    assert_eq!(msg["data"]["content"], "hello there");
    assert_eq!(msg["data"]["role"], "user");
}

#[tokio::test]
async fn client_ping_answered_with_pong() {
    let hub = start_hub(Arc::new(AllowAll)).await;
    let mut ws = connect(hub.port, "u1").await;

    ws.send(envelope("ping", "system", Some("req_p"), json!({})))
        .await
        .unwrap();
    let pong = recv_non_ping(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["req_id"], "req_p");
}

#[tokio::test]
async fn malformed_frame_answered_with_error_envelope() {
    let hub = start_hub(Arc::new(AllowAll)).await;
    let mut ws = connect(hub.port, "u1").await;

    ws.send(Message::text("{this is not json")).await.unwrap();
    let err = recv_non_ping(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["data"]["code"], "malformed_json");

    // Connection survives the decode failure.
    ws.send(envelope("ping", "system", None, json!({})))
        .await
        .unwrap();
    assert_eq!(recv_non_ping(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn resubscribe_after_reconnect_restores_exact_set() {
    let hub = start_hub(Arc::new(AllowAll)).await;

    let mut ws = connect(hub.port, "u1").await;
    ws.send(envelope(
        "subscribe",
        "system",
        Some("r1"),
        json!({"topics": ["thread:42", "agent:7"]}),
    ))
    .await
    .unwrap();
    recv_non_ping(&mut ws).await;
    ws.close(None).await.unwrap();
    drop(ws);

    // The server retained nothing; a reconnect re-declares the full set.
    let mut ws = connect(hub.port, "u1").await;
    ws.send(envelope(
        "subscribe",
        "system",
        Some("r2"),
        json!({"topics": ["thread:42", "agent:7"]}),
    ))
    .await
    .unwrap();
    let ack = recv_non_ping(&mut ws).await;
    assert_eq!(ack["type"], "subscribe_ack");
    assert_eq!(ack["data"]["topics"], json!(["thread:42", "agent:7"]));
}
