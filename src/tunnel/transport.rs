//! Tunnel transport — one outbound WebSocket to the edge.
//!
//! The transport owns the dial/handshake path and the write side of the
//! connection. Writes are serialized behind a single mutex so concurrent
//! per-request tasks never interleave frame bytes; every write carries a
//! 10-second deadline. Liveness is a control-frame ping every 15 seconds
//! plus a 60-second sliding read deadline enforced by the session protocol
//! — three missed pongs and the transport is declared dead.
//!
//! The dialed TCP stream gets keepalive probes (30 s) and 64 KiB buffers;
//! long-lived connections through NAT die silently without them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Tunnel;
use crate::error::AgentError;
use crate::tunnel::frame::Frame;

/// Outbound TCP dial budget.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// WebSocket handshake budget.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
/// Per-frame write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Control-frame ping cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// TCP keepalive probe interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Send/receive socket buffer size.
const SOCKET_BUFFER_BYTES: usize = 64 * 1024;
/// Deadline for writing the close frame during graceful shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after the close frame so the peer can drain before the socket drops.
const CLOSE_DRAIN: Duration = Duration::from_millis(100);

/// Sliding read deadline. Extended by every successful read, including
/// control-frame pongs. With 15 s pings this tolerates three missed pongs.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// The framed duplex stream to the edge.
pub type EdgeWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live connection to the edge, split into a single-reader stream and a
/// cloneable serialized writer.
pub struct Transport {
    pub writer: TransportWriter,
    pub reader: SplitStream<EdgeWsStream>,
}

/// Write half of the transport. Cloneable; all clones share one mutex so
/// frame writes are totally ordered.
#[derive(Clone)]
pub struct TransportWriter {
    sink: Arc<Mutex<SplitSink<EdgeWsStream, Message>>>,
}

/// Derive the tunnel transport endpoint from the edge API URL.
pub fn websocket_url(api_url: &str) -> String {
    let ws = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    };
    format!("{}/tunnel/connect", ws.trim_end_matches('/'))
}

impl Transport {
    /// Dial the edge and upgrade to the tunnel transport.
    ///
    /// The upgrade carries the user token and the per-tunnel secret; a 401
    /// or 403 from the edge maps to [`AgentError::CredentialExpired`] and is
    /// never retried by the supervisor.
    pub async fn connect(
        api_url: &str,
        tunnel: &Tunnel,
        token: &str,
    ) -> Result<Transport, AgentError> {
        let url = websocket_url(api_url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::TransportFailed(format!("invalid edge URL {url}: {e}")))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| AgentError::TransportFailed(format!("invalid token: {e}")))?;
        let tunnel_id = HeaderValue::from_str(&tunnel.id)
            .map_err(|e| AgentError::TransportFailed(format!("invalid tunnel id: {e}")))?;
        let tunnel_auth = HeaderValue::from_str(&tunnel.auth_token)
            .map_err(|e| AgentError::TransportFailed(format!("invalid tunnel secret: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("X-Tunnel-ID", tunnel_id);
        headers.insert("X-Tunnel-Auth", tunnel_auth);

        let (host, port) = {
            let uri = request.uri();
            let host = uri
                .host()
                .ok_or_else(|| AgentError::TransportFailed(format!("no host in {url}")))?
                .to_string();
            let port = uri
                .port_u16()
                .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });
            (host, port)
        };

        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| AgentError::TransportFailed(format!("dial {host}:{port} timed out")))?
            .map_err(|e| AgentError::TransportFailed(format!("dial {host}:{port}: {e}")))?;

        configure_socket(&stream, &tunnel.name);

        let (ws, _response) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::client_async_tls(request, stream),
        )
        .await
        .map_err(|_| AgentError::TransportFailed("edge handshake timed out".to_string()))?
        .map_err(map_handshake_error)?;

        debug!(tunnel = %tunnel.name, "transport connected with TCP keepalive enabled");

        let (sink, reader) = ws.split();
        Ok(Transport {
            writer: TransportWriter {
                sink: Arc::new(Mutex::new(sink)),
            },
            reader,
        })
    }
}

/// Enable keepalive probes and size the socket buffers. Failures are
/// logged, not fatal — the connection still works without them.
fn configure_socket(stream: &TcpStream, tunnel_name: &str) {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(tunnel = %tunnel_name, "failed to enable TCP keepalive: {e}");
    }
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
        debug!(tunnel = %tunnel_name, "failed to set receive buffer: {e}");
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
        debug!(tunnel = %tunnel_name, "failed to set send buffer: {e}");
    }
}

/// A 401/403 during the upgrade means the credential is bad, not the
/// network — surface it as such so the supervisor stops retrying.
fn map_handshake_error(err: WsError) -> AgentError {
    if let WsError::Http(ref response) = err {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return AgentError::CredentialExpired;
        }
    }
    AgentError::TransportFailed(format!("edge handshake failed: {err}"))
}

impl TransportWriter {
    /// Write one frame, serialized against all other writers.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), AgentError> {
        let text = frame.encode()?;
        self.send_message(Message::Text(text)).await
    }

    /// Write a control-frame ping. A failed ping is a fatal transport error.
    pub async fn send_ping(&self) -> Result<(), AgentError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    /// Answer a control-frame ping from the edge.
    pub async fn send_pong(&self, payload: Vec<u8>) -> Result<(), AgentError> {
        self.send_message(Message::Pong(payload)).await
    }

    async fn send_message(&self, message: Message) -> Result<(), AgentError> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, sink.send(message))
            .await
            .map_err(|_| AgentError::TransportFailed("frame write timed out".to_string()))?
            .map_err(|e| AgentError::TransportFailed(format!("frame write failed: {e}")))
    }

    /// Graceful close: a normal-closure frame with a short deadline, then a
    /// brief pause so the peer can acknowledge before the socket drops.
    pub async fn close_graceful(&self, reason: &str) {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        }));
        {
            let mut sink = self.sink.lock().await;
            if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(close)).await {
                debug!("failed to send close frame: {e}");
            }
        }
        tokio::time::sleep(CLOSE_DRAIN).await;
    }
}

/// Emit a control-frame ping every 15 seconds until cancelled. A write
/// failure cancels `failed`, which the session protocol treats as a fatal
/// transport error.
pub fn spawn_heartbeat(
    writer: TransportWriter,
    cancel: CancellationToken,
    failed: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = writer.send_ping().await {
                        warn!("heartbeat failed: {e}");
                        failed.cancel();
                        return;
                    }
                }
            }
        }
    })
}
