//! Session protocol — frame dispatch and per-request forwarding.
//!
//! One protocol instance owns one transport. The main loop reads frames
//! serially and dispatches by type: HTTP requests fan out into concurrent
//! forwarding tasks (the loop never serializes them), WebSocket upgrades
//! become long-lived bridge tasks, and control frames are answered inline.
//! Writes from all of those tasks funnel through the transport's serialized
//! writer.
//!
//! Per-request failures never kill the session — they answer the request
//! with a 502 and move on. Only transport-level failures (read deadline,
//! heartbeat write failure, socket error) end the loop, and the reason
//! comes back as a [`SessionExit`] variant for the supervisor to act on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Tunnel;
use crate::tunnel::frame::{Frame, FrameType};
use crate::tunnel::origin::{LocalWsStream, OriginClient};
use crate::tunnel::transport::{
    spawn_heartbeat, EdgeWsStream, Transport, TransportWriter, READ_DEADLINE,
};

/// Buffered inbound messages per WebSocket stream. Covers frames that race
/// ahead of the local dial completing.
const BRIDGE_CHANNEL_CAPACITY: usize = 32;

/// Why the session loop ended. Reconnect, shutdown, and terminate are
/// expected events, not errors — the supervisor branches on the variant.
#[derive(Debug)]
pub enum SessionExit {
    /// The cancellation handle fired (caller disconnect or recycle).
    Cancelled,
    /// The edge sent a `terminate` frame.
    Terminated,
    /// The edge closed the connection.
    PeerClosed,
    /// Read deadline, heartbeat, or socket failure.
    TransportError(String),
}

impl fmt::Display for SessionExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionExit::Cancelled => write!(f, "cancelled"),
            SessionExit::Terminated => write!(f, "terminated by edge"),
            SessionExit::PeerClosed => write!(f, "closed by edge"),
            SessionExit::TransportError(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// Map of active WebSocket streams: frame `id` → sender feeding the bridge.
type BridgeMap = Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>;

/// The agent side of the tunnel protocol for one session.
pub struct SessionProtocol {
    tunnel_name: String,
    writer: TransportWriter,
    reader: SplitStream<EdgeWsStream>,
    origin: OriginClient,
    bridges: BridgeMap,
}

impl SessionProtocol {
    pub fn new(transport: Transport, tunnel: &Tunnel) -> Self {
        Self {
            tunnel_name: tunnel.name.clone(),
            writer: transport.writer,
            reader: transport.reader,
            origin: OriginClient::new(tunnel.local_port),
            bridges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the session until cancellation, terminate, or transport death.
    ///
    /// Cancellation stops the heartbeat, interrupts the read loop, aborts
    /// in-flight forwards (the edge times out their pending responses), and
    /// drops every local WebSocket.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionExit {
        let ping_failed = CancellationToken::new();
        let heartbeat = spawn_heartbeat(self.writer.clone(), cancel.clone(), ping_failed.clone());
        let mut tasks: JoinSet<()> = JoinSet::new();

        let exit = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.writer.close_graceful("client shutting down").await;
                    break SessionExit::Cancelled;
                }
                () = ping_failed.cancelled() => {
                    break SessionExit::TransportError("heartbeat write failed".to_string());
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                read = tokio::time::timeout(READ_DEADLINE, self.reader.next()) => {
                    match read {
                        Err(_) => break SessionExit::TransportError(
                            "read deadline exceeded".to_string(),
                        ),
                        Ok(None) => break SessionExit::PeerClosed,
                        Ok(Some(Err(e))) => {
                            break SessionExit::TransportError(e.to_string());
                        }
                        Ok(Some(Ok(message))) => {
                            if let Some(exit) = self.handle_message(message, &mut tasks).await {
                                break exit;
                            }
                        }
                    }
                }
            }
        };

        heartbeat.abort();
        tasks.abort_all();
        self.bridges.lock().await.clear();
        debug!(tunnel = %self.tunnel_name, %exit, "session loop ended");
        exit
    }

    /// Handle one transport message. Returns `Some` when the session must end.
    async fn handle_message(
        &mut self,
        message: Message,
        tasks: &mut JoinSet<()>,
    ) -> Option<SessionExit> {
        match message {
            Message::Text(text) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(tunnel = %self.tunnel_name, "dropping malformed frame: {e}");
                        return None;
                    }
                };
                self.dispatch(frame, tasks).await
            }
            Message::Ping(payload) => {
                if let Err(e) = self.writer.send_pong(payload).await {
                    return Some(SessionExit::TransportError(e.to_string()));
                }
                None
            }
            // Pongs refresh the read deadline by virtue of being a read.
            Message::Pong(_) => None,
            Message::Close(_) => Some(SessionExit::PeerClosed),
            other => {
                debug!(tunnel = %self.tunnel_name, "ignoring non-text message: {other:?}");
                None
            }
        }
    }

    /// Dispatch one decoded frame by type.
    async fn dispatch(&mut self, frame: Frame, tasks: &mut JoinSet<()>) -> Option<SessionExit> {
        match frame.frame_type.clone() {
            FrameType::HttpRequest => {
                let origin = self.origin.clone();
                let writer = self.writer.clone();
                tasks.spawn(forward_http_request(origin, writer, frame));
                None
            }
            FrameType::WebsocketUpgrade => {
                let (tx, rx) = mpsc::channel(BRIDGE_CHANNEL_CAPACITY);
                // Register before spawning so data frames racing ahead of
                // the local dial queue instead of dropping.
                self.bridges.lock().await.insert(frame.id.clone(), tx);
                let origin = self.origin.clone();
                let writer = self.writer.clone();
                let bridges = Arc::clone(&self.bridges);
                tasks.spawn(forward_websocket(origin, writer, bridges, frame, rx));
                None
            }
            FrameType::WebsocketData => {
                self.forward_ws_data(frame).await;
                None
            }
            FrameType::Ping => {
                match self.writer.send_frame(&Frame::pong(&frame.id)).await {
                    Ok(()) => None,
                    Err(e) => Some(SessionExit::TransportError(e.to_string())),
                }
            }
            // Liveness acknowledgement — nothing to do.
            FrameType::Pong => None,
            FrameType::Terminate => {
                warn!(tunnel = %self.tunnel_name, "tunnel terminated by edge");
                self.writer.close_graceful("edge initiated shutdown").await;
                Some(SessionExit::Terminated)
            }
            // Session establishment acknowledged by the edge.
            FrameType::Connected => None,
            frame_type @ (FrameType::HttpResponse
            | FrameType::WebsocketUpgradeResponse
            | FrameType::Unknown(_)) => {
                debug!(tunnel = %self.tunnel_name, %frame_type, "ignoring frame");
                None
            }
        }
    }

    /// Push an inbound `websocket_data` frame to its bridge, in arrival
    /// order. A missing or closed bridge means the stream is gone; the
    /// frame is dropped.
    async fn forward_ws_data(&mut self, frame: Frame) {
        let sender = { self.bridges.lock().await.get(&frame.id).cloned() };
        let Some(sender) = sender else {
            debug!(tunnel = %self.tunnel_name, id = %frame.id, "data for unknown stream");
            return;
        };

        let message = if frame.is_binary_data() {
            Message::Binary(frame.body)
        } else {
            Message::Text(String::from_utf8_lossy(&frame.body).into_owned())
        };

        if sender.send(message).await.is_err() {
            self.bridges.lock().await.remove(&frame.id);
        }
    }
}

/// One forwarded HTTP request: call the origin, answer with the correlated
/// response. Origin failure becomes a 502 with the error attached.
async fn forward_http_request(origin: OriginClient, writer: TransportWriter, frame: Frame) {
    let response = match origin
        .forward_http(&frame.method, &frame.url, &frame.headers, frame.body)
        .await
    {
        Ok(r) => Frame::http_response(&frame.id, r.status, r.headers, r.body),
        Err(e) => {
            debug!(id = %frame.id, "origin request failed: {e}");
            Frame::error_response(&frame.id, &e.to_string())
        }
    };
    if let Err(e) = writer.send_frame(&response).await {
        debug!(id = %frame.id, "failed to write response: {e}");
    }
}

/// One WebSocket upgrade: dial the origin, answer 101 (or 502), then bridge
/// both directions until either side closes.
async fn forward_websocket(
    origin: OriginClient,
    writer: TransportWriter,
    bridges: BridgeMap,
    frame: Frame,
    inbound: mpsc::Receiver<Message>,
) {
    let id = frame.id.clone();
    let local_ws = match origin.dial_websocket(&frame.url, &frame.headers).await {
        Ok((ws, response_headers)) => {
            let response = Frame::upgrade_response(&id, response_headers);
            if writer.send_frame(&response).await.is_err() {
                bridges.lock().await.remove(&id);
                return;
            }
            ws
        }
        Err(e) => {
            debug!(id = %id, "local WebSocket dial failed: {e}");
            bridges.lock().await.remove(&id);
            let _ = writer.send_frame(&Frame::upgrade_failure(&id, &e.to_string())).await;
            return;
        }
    };

    bridge_websocket(&id, local_ws, inbound, &writer).await;
    bridges.lock().await.remove(&id);
    debug!(id = %id, "WebSocket bridge closed");
}

/// Pump messages both ways for one established stream. Inbound frames go to
/// the local socket in arrival order; local messages go out as
/// `websocket_data` frames with the stream's id.
async fn bridge_websocket(
    id: &str,
    mut local_ws: LocalWsStream,
    mut inbound: mpsc::Receiver<Message>,
    writer: &TransportWriter,
) {
    loop {
        tokio::select! {
            message = inbound.recv() => {
                match message {
                    Some(message) => {
                        if local_ws.send(message).await.is_err() {
                            return;
                        }
                    }
                    // Session shutdown — close the local side and stop.
                    None => {
                        let _ = local_ws.close(None).await;
                        return;
                    }
                }
            }
            local = local_ws.next() => {
                let frame = match local {
                    Some(Ok(Message::Text(text))) => {
                        Frame::websocket_data(id, false, text.into_bytes())
                    }
                    Some(Ok(Message::Binary(bytes))) => Frame::websocket_data(id, true, bytes),
                    // Control frames are handled inside tungstenite.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(e)) => {
                        debug!(id = %id, "local WebSocket read error: {e}");
                        return;
                    }
                };
                if writer.send_frame(&frame).await.is_err() {
                    return;
                }
            }
        }
    }
}
