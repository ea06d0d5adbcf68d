#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Dispatcher ↔ broker ↔ target round trips over real sockets.
//!
//! The target is a bare tokio-tungstenite client scripted per test.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use switchboard_broker::ChannelBroker;
use switchboard_client::{DispatchError, Dispatcher};
use switchboard_core::config::{ClientConfig, ReconnectConfig};
use switchboard_core::tracing_init::try_init_tracing;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot_broker() -> String {
    try_init_tracing("switchboard_client=debug,switchboard_broker=debug");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        switchboard_broker::serve(listener, Arc::new(ChannelBroker::new()))
            .await
            .ok();
    });
    format!("ws://{addr}/ws")
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        url: url.to_string(),
        command_timeout_secs: 5,
        connect_timeout_secs: 2,
        reconnect: ReconnectConfig {
            initial_delay_ms: 50,
            ..ReconnectConfig::default()
        },
        ..ClientConfig::default()
    }
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read frames until a broadcast carrying a command arrives.
async fn next_command(ws: &mut WsStream) -> Value {
    loop {
        let frame = read_json(ws).await;
        if frame["type"] == "broadcast" && frame["message"]["command"].is_string() {
            return frame["message"].clone();
        }
    }
}

/// A target joined to `channel`, ready to receive commands.
async fn target(url: &str, channel: &str) -> WsStream {
    let (mut ws, _) = connect_async(url).await.unwrap();
    read_json(&mut ws).await;
    ws.send(Message::text(json!({ "type": "join", "channel": channel }).to_string()))
        .await
        .unwrap();
    let reply = read_json(&mut ws).await;
    assert_eq!(reply["message"]["result"], format!("Connected to channel: {channel}"));
    ws
}

async fn reply(ws: &mut WsStream, channel: &str, body: Value) {
    let mut frame = json!({ "type": "message", "channel": channel });
    frame["id"] = body["id"].clone();
    frame["message"] = body;
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

#[tokio::test]
async fn command_round_trip_through_broker() {
    let url = boot_broker().await;
    let mut target = target(&url, "design").await;
    let (dispatcher, _tasks) = Dispatcher::start(&client_config(&url));

    dispatcher.join("design").await.unwrap();
    assert_eq!(dispatcher.current_channel().await.as_deref(), Some("design"));

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .send("get_node_info", json!({ "nodeId": "1:2" }), None)
                .await
        })
    };

    let command = next_command(&mut target).await;
    assert_eq!(command["params"]["nodeId"], "1:2");
    let id = command["id"].as_str().unwrap().to_string();
    reply(&mut target, "design", json!({ "id": id, "result": { "name": "Frame 1" } })).await;

    let result = timeout(TIMEOUT, call).await.unwrap().unwrap().unwrap();
    assert_eq!(result, json!({ "name": "Frame 1" }));
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test]
async fn target_error_reaches_caller() {
    let url = boot_broker().await;
    let mut target = target(&url, "design").await;
    let (dispatcher, _tasks) = Dispatcher::start(&client_config(&url));
    dispatcher.join("design").await.unwrap();

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send("delete_node", json!({}), None).await })
    };

    let command = next_command(&mut target).await;
    reply(
        &mut target,
        "design",
        json!({ "id": command["id"], "error": "Node not found" }),
    )
    .await;

    match timeout(TIMEOUT, call).await.unwrap().unwrap() {
        Err(DispatchError::Remote(message)) => assert_eq!(message, "Node not found"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn progress_frames_reach_subscribers() {
    let url = boot_broker().await;
    let mut target = target(&url, "design").await;
    let (dispatcher, _tasks) = Dispatcher::start(&client_config(&url));
    dispatcher.join("design").await.unwrap();
    let mut progress = dispatcher.subscribe_progress();

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send("scan_text_nodes", json!({}), None).await })
    };

    let command = next_command(&mut target).await;
    let id = command["id"].as_str().unwrap().to_string();
    let update = json!({
        "type": "progress", "id": id, "channel": "design",
        "message": { "data": { "status": "in_progress", "progress": 30, "message": "Scanning" } }
    });
    target.send(Message::text(update.to_string())).await.unwrap();

    let event = timeout(TIMEOUT, progress.recv()).await.unwrap().unwrap();
    assert_eq!(event.id, id);
    assert_eq!(event.update.message.as_deref(), Some("Scanning"));

    reply(&mut target, "design", json!({ "id": id, "result": { "count": 3 } })).await;
    let result = timeout(TIMEOUT, call).await.unwrap().unwrap().unwrap();
    assert_eq!(result["count"], 3);
}

#[tokio::test]
async fn commands_before_join_fail_fast() {
    let url = boot_broker().await;
    let (dispatcher, _tasks) = Dispatcher::start(&client_config(&url));
    let result = dispatcher.send("get_selection", json!({}), None).await;
    assert!(matches!(result, Err(DispatchError::NotJoined)));
}

#[tokio::test]
async fn shutdown_rejects_in_flight_commands() {
    let url = boot_broker().await;
    let mut target = target(&url, "design").await;
    let (dispatcher, _tasks) = Dispatcher::start(&client_config(&url));
    dispatcher.join("design").await.unwrap();

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send("export_node_as_image", json!({}), None).await })
    };
    next_command(&mut target).await;

    // The broker side notices the close; the client side rejects on its own.
    dispatcher.shutdown();
    let result = timeout(TIMEOUT, call).await.unwrap().unwrap();
    assert!(
        matches!(result, Err(DispatchError::ConnectionLost)),
        "unexpected {result:?}"
    );
}
