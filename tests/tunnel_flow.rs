//! End-to-end tunnel session scenarios against a fake edge and real local
//! origins: request forwarding, origin failure, concurrency, and WebSocket
//! bridging.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use uplink::auth::{MemoryStore, SecretStore, TOKEN_KEY};
use uplink::config::{Environment, Tunnel, TunnelStore};
use uplink::tunnel::manager::SessionManager;

type EdgeWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Fake edge: accepts tunnel transport connections and hands them to the
/// test over a channel.
async fn spawn_edge() -> (String, mpsc::Receiver<EdgeWs>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (conn_tx, conn_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if conn_tx.send(ws).await.is_err() {
                return;
            }
        }
    });
    (format!("http://127.0.0.1:{port}"), conn_rx)
}

/// Local HTTP origin: `GET /hello` → `world`, `POST /echo` → body back
/// after 50 ms.
async fn spawn_http_origin() -> u16 {
    let app = Router::new()
        .route("/hello", get(|| async { "world" }))
        .route(
            "/echo",
            post(|body: axum::body::Bytes| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                body
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Local WebSocket origin that echoes text and binary messages.
async fn spawn_ws_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

fn tunnel_descriptor(id: &str, local_port: u16) -> Tunnel {
    Tunnel {
        id: id.to_string(),
        user_id: "u1".to_string(),
        name: format!("{id}-name"),
        subdomain: id.to_string(),
        local_port,
        auth_token: "tunnel-secret".to_string(),
        is_active: false,
        auto_start: false,
    }
}

fn manager_for(api_url: &str, tunnel: &Tunnel, dir: &tempfile::TempDir) -> SessionManager {
    let env = Environment {
        server_api_url: api_url.to_string(),
        tunnel_public_domain: "tunnels.test".to_string(),
        web_url: "http://localhost:3000".to_string(),
        log_level: "info".to_string(),
    };
    let store = TunnelStore::at(dir.path().join("tunnels.json"));
    store.sync(vec![tunnel.clone()]).unwrap();
    let secrets: Arc<dyn SecretStore> = Arc::new(MemoryStore::new());
    secrets.set(TOKEN_KEY, "user-token").unwrap();
    SessionManager::new(&env, store, secrets)
}

/// Next JSON frame from the agent, skipping control frames.
async fn next_frame(ws: &mut EdgeWs) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => {}
            other => panic!("edge connection ended: {other:?}"),
        }
    }
}

async fn send_frame(ws: &mut EdgeWs, frame: &Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

#[tokio::test]
async fn single_get_round_trips() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-get", origin_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-get", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    send_frame(
        &mut ws,
        &json!({"type": "http_request", "id": "r1", "method": "GET", "url": "/hello"}),
    )
    .await;

    let response = next_frame(&mut ws).await;
    assert_eq!(response["type"], "http_response");
    assert_eq!(response["id"], "r1");
    assert_eq!(response["status"], 200);
    let body = BASE64.decode(response["body"].as_str().unwrap()).unwrap();
    assert_eq!(body, b"world");

    manager.disconnect("t-get").await.unwrap();
}

#[tokio::test]
async fn origin_down_yields_502_with_error() {
    // Grab a port that nothing listens on.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-down", dead_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-down", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    let started = Instant::now();
    send_frame(
        &mut ws,
        &json!({"type": "http_request", "id": "r1", "method": "GET", "url": "/"}),
    )
    .await;

    let response = next_frame(&mut ws).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(response["type"], "http_response");
    assert_eq!(response["id"], "r1");
    assert_eq!(response["status"], 502);
    assert!(!response["error"].as_str().unwrap().is_empty());

    manager.disconnect("t-down").await.unwrap();
}

#[tokio::test]
async fn hundred_requests_interleave() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-many", origin_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-many", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    let started = Instant::now();
    for i in 0..100 {
        send_frame(
            &mut ws,
            &json!({
                "type": "http_request",
                "id": format!("r{i}"),
                "method": "POST",
                "url": "/echo",
                "body": BASE64.encode(format!("payload-{i}")),
            }),
        )
        .await;
    }

    let mut seen = HashSet::new();
    for _ in 0..100 {
        let response = next_frame(&mut ws).await;
        assert_eq!(response["type"], "http_response");
        assert_eq!(response["status"], 200);
        let id = response["id"].as_str().unwrap().to_string();
        let body = BASE64.decode(response["body"].as_str().unwrap()).unwrap();
        let index: usize = id[1..].parse().unwrap();
        assert_eq!(body, format!("payload-{index}").as_bytes());
        assert!(seen.insert(id), "duplicate response id");
    }
    let elapsed = started.elapsed();
    assert_eq!(seen.len(), 100);
    // 100 requests against a 50 ms origin would take 5+ seconds if the
    // protocol serialized them.
    assert!(
        elapsed < Duration::from_secs(2),
        "responses took {elapsed:?}, forwarding is not concurrent"
    );

    manager.disconnect("t-many").await.unwrap();
}

#[tokio::test]
async fn websocket_upgrade_and_echo() {
    let origin_port = spawn_ws_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-ws", origin_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-ws", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    send_frame(
        &mut ws,
        &json!({"type": "websocket_upgrade", "id": "u1", "url": "/ws"}),
    )
    .await;

    let upgrade = next_frame(&mut ws).await;
    assert_eq!(upgrade["type"], "websocket_upgrade_response");
    assert_eq!(upgrade["id"], "u1");
    assert_eq!(upgrade["status"], 101);

    for text in ["a", "b", "c"] {
        send_frame(
            &mut ws,
            &json!({
                "type": "websocket_data",
                "id": "u1",
                "headers": {"message_type": "1"},
                "body": BASE64.encode(text),
            }),
        )
        .await;
    }

    for expected in ["a", "b", "c"] {
        let echoed = next_frame(&mut ws).await;
        assert_eq!(echoed["type"], "websocket_data");
        assert_eq!(echoed["id"], "u1");
        let body = BASE64.decode(echoed["body"].as_str().unwrap()).unwrap();
        assert_eq!(body, expected.as_bytes());
    }

    manager.disconnect("t-ws").await.unwrap();
}

#[tokio::test]
async fn websocket_upgrade_fails_with_502_when_origin_down() {
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-ws-down", dead_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-ws-down", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    send_frame(
        &mut ws,
        &json!({"type": "websocket_upgrade", "id": "u1", "url": "/ws"}),
    )
    .await;

    let response = next_frame(&mut ws).await;
    assert_eq!(response["type"], "websocket_upgrade_response");
    assert_eq!(response["id"], "u1");
    assert_eq!(response["status"], 502);
    assert!(!response["error"].as_str().unwrap().is_empty());

    manager.disconnect("t-ws-down").await.unwrap();
}

#[tokio::test]
async fn json_ping_answered_with_pong() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-ping", origin_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-ping", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    send_frame(&mut ws, &json!({"type": "ping", "id": "p1"})).await;
    let pong = next_frame(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["id"], "p1");

    manager.disconnect("t-ping").await.unwrap();
}

#[tokio::test]
async fn unknown_frame_type_is_ignored() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let tunnel = tunnel_descriptor("t-unknown", origin_port);
    let manager = manager_for(&api_url, &tunnel, &dir);

    manager.connect("t-unknown", false).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    // An unknown type must not disconnect the session; a follow-up
    // request still gets served.
    send_frame(&mut ws, &json!({"type": "metrics_snapshot", "id": "m1"})).await;
    send_frame(
        &mut ws,
        &json!({"type": "http_request", "id": "r1", "method": "GET", "url": "/hello"}),
    )
    .await;

    let response = next_frame(&mut ws).await;
    assert_eq!(response["id"], "r1");
    assert_eq!(response["status"], 200);

    manager.disconnect("t-unknown").await.unwrap();
}
