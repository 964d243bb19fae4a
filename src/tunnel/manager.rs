//! Session manager — the registry of live tunnel sessions.
//!
//! Owns the map `tunnel_id → session handle` behind a readers-writer lock
//! and mediates all external control: connect, disconnect, status
//! snapshots, and reactions to network-change and logout events. It is the
//! only component that reads credentials from the secret store; the token
//! is passed by value into the supervisor at dial time.
//!
//! At most one session exists per tunnel id at any instant. `connect`
//! holds the write lock across the duplicate check and insert, and a
//! reconnecting supervisor reuses its existing transport slot, so the
//! invariant holds without a global lock around the dial itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{SecretStore, TOKEN_KEY};
use crate::config::{Environment, Tunnel, TunnelStore};
use crate::error::AgentError;
use crate::tunnel::supervisor::Supervisor;
use crate::tunnel::SessionState;

/// Consecutive origin-probe failures before the transport is recycled, on
/// the theory that the edge's keepalive may have desynced.
const ORIGIN_FAILURE_LIMIT: u32 = 5;

/// Bookkeeping for one live session.
pub struct SessionHandle {
    pub tunnel: Tunnel,
    /// Auto-reconnect across transport failures.
    pub persistent: bool,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    recycle: Arc<Notify>,
    reconnects: Arc<AtomicU32>,
    last_error: Arc<StdMutex<Option<AgentError>>>,
    /// Consecutive origin health-probe failures.
    origin_failures: AtomicU32,
}

impl SessionHandle {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Point-in-time view of one session, for status output.
pub struct SessionInfo {
    pub tunnel_id: String,
    pub name: String,
    pub state: SessionState,
    pub reconnects: u32,
    pub persistent: bool,
}

/// Registry of active sessions. Cloneable — clones share the same map.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    api_url: String,
    store: TunnelStore,
    secrets: Arc<dyn SecretStore>,
}

impl SessionManager {
    pub fn new(env: &Environment, store: TunnelStore, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            api_url: env.server_api_url.clone(),
            store,
            secrets,
        }
    }

    /// Connect a tunnel by name or id. Resolves the descriptor from the
    /// local cache, rejects duplicates, and hands off to a supervisor.
    /// Returns once the session is Connected, or with the failure that
    /// ended it.
    pub async fn connect(&self, name_or_id: &str, persistent: bool) -> Result<Tunnel, AgentError> {
        let token = self
            .secrets
            .get(TOKEN_KEY)?
            .ok_or(AgentError::NotAuthenticated)?;
        let tunnel = self.store.resolve(name_or_id)?;

        let (mut state_rx, last_error) = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(&tunnel.id) {
                if existing.state().is_terminal() {
                    sessions.remove(&tunnel.id);
                } else {
                    return Err(AgentError::AlreadyConnected(tunnel.name.clone()));
                }
            }

            let supervisor =
                Supervisor::new(tunnel.clone(), self.api_url.clone(), token, persistent);
            let (state, cancel, recycle, reconnects, last_error) = supervisor.handle_parts();
            let state_rx = state.subscribe();
            tokio::spawn(supervisor.run());
            sessions.insert(
                tunnel.id.clone(),
                SessionHandle {
                    tunnel: tunnel.clone(),
                    persistent,
                    state,
                    cancel,
                    recycle,
                    reconnects,
                    last_error: Arc::clone(&last_error),
                    origin_failures: AtomicU32::new(0),
                },
            );
            (state_rx, last_error)
        };

        let connected = state_rx
            .wait_for(|s| *s == SessionState::Connected || s.is_terminal())
            .await
            .map(|state| *state == SessionState::Connected)
            .unwrap_or(false);

        if connected {
            let _ = self.store.set_active(&tunnel.id, true);
            return Ok(tunnel);
        }

        self.sessions.write().await.remove(&tunnel.id);
        let error = last_error
            .lock()
            .expect("error mutex")
            .take()
            .unwrap_or_else(|| {
                AgentError::TransportFailed("session ended before connecting".to_string())
            });
        Err(error)
    }

    /// Disconnect a tunnel and wait for it to reach a terminal state.
    /// Idempotent: disconnecting an absent or already-closed tunnel is a
    /// no-op.
    pub async fn disconnect(&self, name_or_id: &str) -> Result<(), AgentError> {
        let found = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|h| h.tunnel.id == name_or_id || h.tunnel.name == name_or_id)
                .map(|h| (h.tunnel.id.clone(), h.cancel.clone(), h.state.subscribe()))
        };
        let Some((id, cancel, mut state_rx)) = found else {
            return Ok(());
        };

        cancel.cancel();
        let _ = state_rx.wait_for(|s| s.is_terminal()).await;
        self.sessions.write().await.remove(&id);
        let _ = self.store.set_active(&id, false);
        Ok(())
    }

    /// Tunnel ids currently serving traffic (Connected or Degraded).
    pub async fn list_active(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|h| h.state().is_active())
            .map(|h| h.tunnel.id.clone())
            .collect()
    }

    /// Whether a tunnel is currently serving traffic.
    pub async fn is_connected(&self, name_or_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .any(|h| (h.tunnel.id == name_or_id || h.tunnel.name == name_or_id)
                && h.state().is_active())
    }

    /// Local port targeted by a live session, if any.
    pub async fn local_port(&self, tunnel_id: &str) -> Option<u16> {
        let sessions = self.sessions.read().await;
        sessions.get(tunnel_id).map(|h| h.tunnel.local_port)
    }

    /// Snapshot of every tracked session.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|h| SessionInfo {
                tunnel_id: h.tunnel.id.clone(),
                name: h.tunnel.name.clone(),
                state: h.state(),
                reconnects: h.reconnects.load(Ordering::Relaxed),
                persistent: h.persistent,
            })
            .collect()
    }

    /// React to a network change: degrade every serving session and recycle
    /// its transport. The supervisor re-dials after a settling delay.
    pub async fn on_network_change(&self) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            if handle.state().is_active() {
                warn!(tunnel = %handle.tunnel.name, "network changed, recycling transport");
                handle.state.send_replace(SessionState::Degraded);
                handle.recycle.notify_one();
            }
        }
    }

    /// Disconnect every session (logout or shutdown).
    pub async fn on_logout(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!(tunnel = %id, "disconnect failed during logout: {e}");
            }
        }
    }

    /// Feed one origin health-probe result into the session. Failures are
    /// soft — the session keeps serving (clients see 502s) — until
    /// [`ORIGIN_FAILURE_LIMIT`] consecutive failures force a transport
    /// recycle.
    pub async fn note_origin_health(&self, tunnel_id: &str, healthy: bool) {
        let sessions = self.sessions.read().await;
        let Some(handle) = sessions.get(tunnel_id) else {
            return;
        };

        if healthy {
            handle.origin_failures.store(0, Ordering::Relaxed);
            if handle.state() == SessionState::Degraded {
                debug!(tunnel = %handle.tunnel.name, "origin healthy again");
                handle.state.send_replace(SessionState::Connected);
            }
            return;
        }

        let failures = handle.origin_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if handle.state() == SessionState::Connected {
            handle.state.send_replace(SessionState::Degraded);
        }
        if failures >= ORIGIN_FAILURE_LIMIT {
            warn!(
                tunnel = %handle.tunnel.name,
                failures, "origin unhealthy too long, recycling transport"
            );
            handle.origin_failures.store(0, Ordering::Relaxed);
            handle.recycle.notify_one();
        }
    }
}
