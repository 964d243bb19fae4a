//! Supervisor reconnect behavior and session manager lifecycle: transport
//! loss recovery, terminate handling, duplicate-connect rejection,
//! disconnect idempotence, logout, and network-change recycling.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use uplink::auth::{MemoryStore, SecretStore, TOKEN_KEY};
use uplink::config::{Environment, Tunnel, TunnelStore};
use uplink::tunnel::manager::SessionManager;
use uplink::SessionState;

type EdgeWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn spawn_edge() -> (String, mpsc::Receiver<EdgeWs>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (conn_tx, conn_rx) = mpsc::channel(8);
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

async fn spawn_http_origin() -> u16 {
    let app = Router::new().route("/hello", get(|| async { "world" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
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

fn manager_for(api_url: &str, tunnels: Vec<Tunnel>, dir: &tempfile::TempDir) -> SessionManager {
    let env = Environment {
        server_api_url: api_url.to_string(),
        tunnel_public_domain: "tunnels.test".to_string(),
        web_url: "http://localhost:3000".to_string(),
        log_level: "info".to_string(),
    };
    let store = TunnelStore::at(dir.path().join("tunnels.json"));
    store.sync(tunnels).unwrap();
    let secrets: Arc<dyn SecretStore> = Arc::new(MemoryStore::new());
    secrets.set(TOKEN_KEY, "user-token").unwrap();
    SessionManager::new(&env, store, secrets)
}

async fn next_frame(ws: &mut EdgeWs) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => {}
            other => panic!("edge connection ended: {other:?}"),
        }
    }
}

/// Wait until the session for `tunnel_id` reports `state`, up to `within`.
async fn wait_for_state(
    manager: &SessionManager,
    tunnel_id: &str,
    state: SessionState,
    within: Duration,
) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = manager
            .snapshot()
            .await
            .into_iter()
            .find(|s| s.tunnel_id == tunnel_id)
            .map(|s| s.state);
        if current == Some(state) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {tunnel_id} never reached {state} (currently {current:?})"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn persistent_session_reconnects_after_transport_drop() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&api_url, vec![tunnel_descriptor("t-re", origin_port)], &dir);

    manager.connect("t-re", true).await.unwrap();
    let ws1 = edge.recv().await.unwrap();

    // Kill the transport from the edge side.
    drop(ws1);

    // The supervisor backs off (2 s) and re-dials; a fresh connection must
    // arrive well within 10 s.
    let mut ws2 = tokio::time::timeout(Duration::from_secs(10), edge.recv())
        .await
        .expect("no reconnect within 10s")
        .unwrap();
    wait_for_state(&manager, "t-re", SessionState::Connected, Duration::from_secs(5)).await;

    // The new transport serves traffic normally.
    ws2.send(Message::Text(
        json!({"type": "http_request", "id": "r1", "method": "GET", "url": "/hello"}).to_string(),
    ))
    .await
    .unwrap();
    let response = next_frame(&mut ws2).await;
    assert_eq!(response["id"], "r1");
    assert_eq!(response["status"], 200);

    let snapshot = manager.snapshot().await;
    let session = snapshot.iter().find(|s| s.tunnel_id == "t-re").unwrap();
    assert!(session.reconnects >= 1);

    manager.disconnect("t-re").await.unwrap();
}

#[tokio::test]
async fn terminate_frame_ends_the_session() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&api_url, vec![tunnel_descriptor("t-term", origin_port)], &dir);

    manager.connect("t-term", true).await.unwrap();
    let mut ws = edge.recv().await.unwrap();

    ws.send(Message::Text(
        json!({"type": "terminate", "id": "t-term"}).to_string(),
    ))
    .await
    .unwrap();

    // The agent answers with a normal-closure frame before dropping.
    let mut saw_close = false;
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_secs(5), ws.next()).await
    {
        if matches!(message, Ok(Message::Close(_)) | Err(_)) {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "agent never closed the transport");

    // Terminate ends the session even in persistent mode — no reconnect.
    wait_for_state(&manager, "t-term", SessionState::Closed, Duration::from_secs(5)).await;
    assert!(!manager.is_connected("t-term").await);

    manager.disconnect("t-term").await.unwrap();
}

#[tokio::test]
async fn duplicate_connect_is_rejected() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&api_url, vec![tunnel_descriptor("t-dup", origin_port)], &dir);

    manager.connect("t-dup", false).await.unwrap();
    let _ws = edge.recv().await.unwrap();

    let err = manager.connect("t-dup", false).await.unwrap_err();
    assert!(
        matches!(err, uplink::AgentError::AlreadyConnected(_)),
        "expected AlreadyConnected, got {err}"
    );
    // The duplicate attempt must not have touched the live session.
    assert!(manager.is_connected("t-dup").await);

    manager.disconnect("t-dup").await.unwrap();
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&api_url, vec![tunnel_descriptor("t-idem", origin_port)], &dir);

    manager.connect("t-idem", false).await.unwrap();
    let _ws = edge.recv().await.unwrap();

    manager.disconnect("t-idem").await.unwrap();
    assert!(!manager.is_connected("t-idem").await);
    // Second disconnect: same terminal state, no error.
    manager.disconnect("t-idem").await.unwrap();
    assert!(!manager.is_connected("t-idem").await);
    assert!(manager.list_active().await.is_empty());
}

#[tokio::test]
async fn logout_disconnects_every_session() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(
        &api_url,
        vec![
            tunnel_descriptor("t-a", origin_port),
            tunnel_descriptor("t-b", origin_port),
        ],
        &dir,
    );

    manager.connect("t-a", false).await.unwrap();
    manager.connect("t-b", false).await.unwrap();
    let _ws_a = edge.recv().await.unwrap();
    let _ws_b = edge.recv().await.unwrap();
    assert_eq!(manager.list_active().await.len(), 2);

    manager.on_logout().await;
    assert!(manager.list_active().await.is_empty());
    assert!(manager.snapshot().await.is_empty());
}

#[tokio::test]
async fn origin_health_failures_degrade_then_recycle() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&api_url, vec![tunnel_descriptor("t-health", origin_port)], &dir);

    manager.connect("t-health", true).await.unwrap();
    let _ws1 = edge.recv().await.unwrap();

    // One failed probe degrades the session but keeps it serving.
    manager.note_origin_health("t-health", false).await;
    wait_for_state(&manager, "t-health", SessionState::Degraded, Duration::from_secs(2)).await;
    assert!(manager.is_connected("t-health").await);

    // A healthy probe clears the degradation and the failure streak.
    manager.note_origin_health("t-health", true).await;
    wait_for_state(&manager, "t-health", SessionState::Connected, Duration::from_secs(2)).await;

    // Five consecutive failures force a transport recycle.
    for _ in 0..5 {
        manager.note_origin_health("t-health", false).await;
    }
    let _ws2 = tokio::time::timeout(Duration::from_secs(15), edge.recv())
        .await
        .expect("no re-dial after origin failure streak")
        .unwrap();
    wait_for_state(&manager, "t-health", SessionState::Connected, Duration::from_secs(5)).await;

    manager.disconnect("t-health").await.unwrap();
}

#[tokio::test]
async fn network_change_recycles_the_transport() {
    let origin_port = spawn_http_origin().await;
    let (api_url, mut edge) = spawn_edge().await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&api_url, vec![tunnel_descriptor("t-net", origin_port)], &dir);

    manager.connect("t-net", true).await.unwrap();
    let mut ws1 = edge.recv().await.unwrap();

    manager.on_network_change().await;

    // The old transport is closed by the agent...
    let mut closed = false;
    while let Ok(next) = tokio::time::timeout(Duration::from_secs(5), ws1.next()).await {
        match next {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                closed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(closed, "old transport was not torn down");

    // ...and a new one is dialed after the settling delay.
    let _ws2 = tokio::time::timeout(Duration::from_secs(15), edge.recv())
        .await
        .expect("no re-dial after network change")
        .unwrap();
    wait_for_state(&manager, "t-net", SessionState::Connected, Duration::from_secs(5)).await;

    manager.disconnect("t-net").await.unwrap();
}
