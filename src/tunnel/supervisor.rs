//! Per-session supervisor — dial, serve, detect death, back off, redial.
//!
//! The supervisor is the single owner of a session's transport. It runs as
//! one task, publishing state through a `watch` channel that the manager
//! and callers observe. Expected events (caller disconnect, edge terminate,
//! network-change recycle) are first-class variants of the serve outcome,
//! not errors.
//!
//! Retry policy: exponential backoff with base 2 s, doubling per attempt,
//! capped at 60 s. Ephemeral sessions give up after 5 dial attempts.
//! Persistent sessions dial forever initially, and after a disconnection
//! allow up to 10 consecutive reconnect failures before failing for good.
//! Credential rejections are never retried.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Tunnel;
use crate::error::AgentError;
use crate::tunnel::protocol::{SessionExit, SessionProtocol};
use crate::tunnel::transport::Transport;
use crate::tunnel::SessionState;

/// Dial attempts before an ephemeral session fails.
const EPHEMERAL_DIAL_ATTEMPTS: u32 = 5;
/// Consecutive reconnect failures before a persistent session fails.
const RECONNECT_ATTEMPTS: u32 = 10;
/// Pause between losing a transport to a network change and re-dialing,
/// so the OS finishes reconfiguring first.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the k-th attempt: `min(cap, base · 2^(k-1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        (self.base * (1u32 << exponent)).min(self.cap)
    }
}

/// How one serve cycle ended.
enum ServeExit {
    /// The session's cancellation handle fired.
    Shutdown,
    /// The edge sent `terminate`.
    Terminated,
    /// The transport was recycled (network change or health tear-down);
    /// redial after a settling delay.
    Recycle,
    /// The transport died.
    Lost(String),
}

/// The per-session state machine. Constructed by the manager, consumed by
/// `run` on its own task.
pub struct Supervisor {
    tunnel: Tunnel,
    api_url: String,
    token: String,
    persistent: bool,
    policy: RetryPolicy,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    recycle: Arc<Notify>,
    reconnects: Arc<AtomicU32>,
    last_error: Arc<Mutex<Option<AgentError>>>,
}

impl Supervisor {
    pub fn new(tunnel: Tunnel, api_url: String, token: String, persistent: bool) -> Self {
        let (state, _) = watch::channel(SessionState::Dialing);
        Self {
            tunnel,
            api_url,
            token,
            persistent,
            policy: RetryPolicy::default(),
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            recycle: Arc::new(Notify::new()),
            reconnects: Arc::new(AtomicU32::new(0)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared pieces the manager keeps in the session handle:
    /// (state, cancellation, recycle signal, reconnect count, last error).
    #[allow(clippy::type_complexity)]
    pub fn handle_parts(
        &self,
    ) -> (
        Arc<watch::Sender<SessionState>>,
        CancellationToken,
        Arc<Notify>,
        Arc<AtomicU32>,
        Arc<Mutex<Option<AgentError>>>,
    ) {
        (
            Arc::clone(&self.state),
            self.cancel.clone(),
            Arc::clone(&self.recycle),
            Arc::clone(&self.reconnects),
            Arc::clone(&self.last_error),
        )
    }

    /// Run the session to a terminal state.
    pub async fn run(self) {
        // Initial dial phase: try immediately, back off between failures.
        let mut transport = {
            let mut attempt = 0u32;
            loop {
                if self.cancel.is_cancelled() {
                    return self.finish();
                }
                self.set_state(SessionState::Dialing);
                match self.dial().await {
                    Some(Ok(transport)) => break transport,
                    Some(Err(e)) if e.is_credential() => return self.fail_with(e),
                    Some(Err(e)) => {
                        attempt += 1;
                        if !self.persistent && attempt >= EPHEMERAL_DIAL_ATTEMPTS {
                            return self.fail(format!(
                                "failed to connect after {attempt} attempts: {e}"
                            ));
                        }
                        let delay = self.policy.delay(attempt);
                        warn!(
                            tunnel = %self.tunnel.name, attempt,
                            "connect failed: {e}; retrying in {delay:?}"
                        );
                        self.set_state(SessionState::Backoff);
                        if self.wait(delay).await {
                            return self.finish();
                        }
                    }
                    None => return self.finish(),
                }
            }
        };

        // Serve/redial cycles until a terminal event.
        loop {
            self.set_state(SessionState::Connected);
            info!(tunnel = %self.tunnel.name, "tunnel connected");

            let redial_immediately = match self.serve(transport).await {
                ServeExit::Shutdown | ServeExit::Terminated => return self.finish(),
                ServeExit::Recycle => {
                    info!(tunnel = %self.tunnel.name, "transport recycled, re-dialing");
                    if self.wait(SETTLE_DELAY).await {
                        return self.finish();
                    }
                    true
                }
                ServeExit::Lost(reason) => {
                    if !self.persistent {
                        return self.fail(reason);
                    }
                    warn!(tunnel = %self.tunnel.name, "transport lost: {reason}; reconnecting");
                    false
                }
            };

            transport = match self.redial(redial_immediately).await {
                Some(transport) => transport,
                None => return,
            };
        }
    }

    /// Dial once, racing the cancellation handle. `None` means cancelled.
    async fn dial(&self) -> Option<Result<Transport, AgentError>> {
        tokio::select! {
            result = Transport::connect(&self.api_url, &self.tunnel, &self.token) => Some(result),
            () = self.cancel.cancelled() => None,
        }
    }

    /// One serve cycle: run the protocol over an established transport and
    /// classify how it ended. A recycle request cancels only this
    /// connection; the session-level handle stays armed.
    async fn serve(&self, transport: Transport) -> ServeExit {
        let conn_cancel = self.cancel.child_token();
        let recycle = Arc::clone(&self.recycle);
        let recycle_cancel = conn_cancel.clone();
        let recycle_watch = tokio::spawn(async move {
            recycle.notified().await;
            recycle_cancel.cancel();
        });

        let protocol = SessionProtocol::new(transport, &self.tunnel);
        let exit = protocol.run(conn_cancel).await;
        recycle_watch.abort();

        match exit {
            SessionExit::Cancelled if self.cancel.is_cancelled() => ServeExit::Shutdown,
            SessionExit::Cancelled => ServeExit::Recycle,
            SessionExit::Terminated => ServeExit::Terminated,
            SessionExit::PeerClosed => ServeExit::Lost("connection closed by edge".to_string()),
            SessionExit::TransportError(msg) => ServeExit::Lost(msg),
        }
    }

    /// Reconnect phase: up to [`RECONNECT_ATTEMPTS`] consecutive dial
    /// attempts, backing off before each one. `None` means the session
    /// reached a terminal state.
    async fn redial(&self, skip_first_backoff: bool) -> Option<Transport> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > RECONNECT_ATTEMPTS {
                self.fail(format!(
                    "giving up after {RECONNECT_ATTEMPTS} reconnect attempts"
                ));
                return None;
            }
            if !(skip_first_backoff && attempt == 1) {
                self.set_state(SessionState::Backoff);
                if self.wait(self.policy.delay(attempt)).await {
                    self.finish();
                    return None;
                }
            }

            self.set_state(SessionState::Dialing);
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(tunnel = %self.tunnel.name, attempt, "reconnection attempt");
            match self.dial().await {
                Some(Ok(transport)) => return Some(transport),
                Some(Err(e)) if e.is_credential() => {
                    self.fail_with(e);
                    return None;
                }
                Some(Err(e)) => {
                    warn!(tunnel = %self.tunnel.name, attempt, "reconnect failed: {e}");
                }
                None => {
                    self.finish();
                    return None;
                }
            }
        }
    }

    /// Sleep, racing cancellation. Returns `true` when cancelled.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.cancel.cancelled() => true,
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Normal end of life: Closing, then Closed.
    fn finish(&self) {
        self.set_state(SessionState::Closing);
        self.set_state(SessionState::Closed);
        info!(tunnel = %self.tunnel.name, "tunnel closed");
    }

    /// Abnormal end of life after retry exhaustion.
    fn fail(&self, reason: String) {
        self.fail_with(AgentError::TransportFailed(reason));
    }

    /// Abnormal end of life with a typed cause (credential rejections keep
    /// their kind so callers can force re-authentication).
    fn fail_with(&self, error: AgentError) {
        warn!(tunnel = %self.tunnel.name, "tunnel failed: {error}");
        *self.last_error.lock().expect("error mutex") = Some(error);
        self.set_state(SessionState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
        assert_eq!(policy.delay(60), Duration::from_secs(60));
    }
}
