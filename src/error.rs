//! Error kinds visible at the agent's API surface.
//!
//! Per-request origin failures are contained — they become 502 responses on
//! the tunnel and never kill a session. Transport failures are surfaced to
//! the supervisor, which retries or fails the session depending on its mode.
//! Credential failures are never retried.

use std::fmt;

/// Errors surfaced by the agent core.
#[derive(Debug)]
pub enum AgentError {
    /// No credential is available in the secret store.
    NotAuthenticated,
    /// The stored token was rejected by the edge.
    CredentialExpired,
    /// No descriptor for the requested tunnel in the local cache.
    TunnelNotFound(String),
    /// A session for this tunnel already exists.
    AlreadyConnected(String),
    /// The local origin refused, timed out, or died mid-request.
    OriginUnreachable(String),
    /// Transport dial, handshake, or read/write failure after retry exhaustion.
    TransportFailed(String),
    /// Both DNS and basic reachability probes failed.
    NetworkUnavailable(String),
    /// The edge sent a `terminate` frame.
    Terminated,
    /// The edge REST API returned a non-2xx response.
    Edge { status: u16, message: String },
    /// Configuration or state-file I/O failure.
    Config(String),
}

impl AgentError {
    /// Whether this error means the credential must be re-acquired.
    /// Credential errors are never retried by the supervisor.
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            AgentError::NotAuthenticated | AgentError::CredentialExpired
        )
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::NotAuthenticated => write!(f, "not authenticated — run `uplink login`"),
            AgentError::CredentialExpired => {
                write!(f, "credential rejected by the edge — run `uplink login` again")
            }
            AgentError::TunnelNotFound(name) => write!(f, "tunnel {name} not found"),
            AgentError::AlreadyConnected(name) => {
                write!(f, "tunnel {name} is already connected")
            }
            AgentError::OriginUnreachable(msg) => {
                write!(f, "local service unreachable: {msg}")
            }
            AgentError::TransportFailed(msg) => write!(f, "tunnel transport failed: {msg}"),
            AgentError::NetworkUnavailable(msg) => write!(f, "network unavailable: {msg}"),
            AgentError::Terminated => write!(f, "tunnel terminated by the edge"),
            AgentError::Edge { status, message } => {
                write!(f, "edge error (HTTP {status}): {message}")
            }
            AgentError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}
