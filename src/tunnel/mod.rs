//! Tunnel session machinery.
//!
//! A session is one live tunnel: the descriptor, one transport to the edge,
//! and the supervisor that keeps the transport alive. Layers, bottom up:
//!
//! - `frame`      — JSON frame codec for the control plane
//! - `origin`     — HTTP/WebSocket client for the local service
//! - `transport`  — one outbound WebSocket: dial, keepalive, serialized
//!   writes, heartbeat
//! - `protocol`   — frame dispatch and concurrent per-request forwarding
//! - `supervisor` — dial/run/backoff/reconnect state machine per session
//! - `manager`    — registry of live sessions, the external control surface

pub mod frame;
pub mod manager;
pub mod origin;
pub mod protocol;
pub mod supervisor;
pub mod transport;

use std::fmt;

/// Lifecycle of one session, observable through the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing the edge (first attempt or reconnect).
    Dialing,
    /// Transport established, serving traffic.
    Connected,
    /// Transport alive but the origin or network probe is failing; traffic
    /// still attempts to flow.
    Degraded,
    /// Sleeping between reconnect attempts.
    Backoff,
    /// Graceful shutdown in progress.
    Closing,
    /// Ended by caller disconnect or edge terminate. Terminal.
    Closed,
    /// Retries exhausted or a non-retriable error. Terminal.
    Failed,
}

impl SessionState {
    /// Whether the session has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether the session is serving (or attempting to serve) traffic.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Dialing => "dialing",
            SessionState::Connected => "connected",
            SessionState::Degraded => "degraded",
            SessionState::Backoff => "backoff",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}
