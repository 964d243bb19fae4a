//! Origin health probing.
//!
//! Every 30 seconds, each serving session's origin gets a 5-second TCP
//! connect probe on its local port, plus one DNS lookup of a well-known
//! name per tick as a coarse internet check. Probe results feed the
//! manager as soft signals: the session degrades but keeps serving (the
//! edge's clients see 502s from request forwarding) until the failure
//! streak forces a transport recycle.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tunnel::manager::SessionManager;

/// Probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Per-origin TCP connect budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Name resolved as the internet reachability check.
const PROBE_HOST: &str = "google.com:443";

/// Spawn the health monitor over the manager's active sessions. Runs until
/// cancelled.
pub fn spawn(manager: SessionManager, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        interval.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => probe_all(&manager).await,
            }
        }
    })
}

async fn probe_all(manager: &SessionManager) {
    let dns_ok = tokio::net::lookup_host(PROBE_HOST).await.is_ok();

    for tunnel_id in manager.list_active().await {
        let Some(port) = manager.local_port(&tunnel_id).await else {
            continue;
        };
        let origin_ok = probe_origin(port).await;
        if !origin_ok {
            if dns_ok {
                warn!(tunnel = %tunnel_id, port, "origin not responding");
            } else {
                warn!(tunnel = %tunnel_id, port, "origin not responding and DNS failing — network unavailable");
            }
        } else {
            debug!(tunnel = %tunnel_id, "origin healthy");
        }
        manager.note_origin_health(&tunnel_id, origin_ok).await;
    }
}

/// One TCP connect probe against the local origin.
async fn probe_origin(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
