//! Network-change detection.
//!
//! Every 10 seconds the monitor resolves the primary interface: the first
//! non-loopback, administratively-up interface carrying an IPv4 address, in
//! the order the OS reports them (`ip -j addr show`, the same source the
//! rest of the fleet tooling uses). A change in either the address or the
//! interface name emits one event on a bounded channel. On overflow the
//! newest event is dropped — a later tick re-detects.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Bound of the event channel the agent run loop consumes.
pub const EVENT_CHANNEL_CAPACITY: usize = 10;

/// A detected change in the primary network identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    IpChange { old: String, new: String },
    InterfaceChange { old: String, new: String },
}

/// Spawn the network monitor. Events arrive on `events`; the task runs
/// until cancelled.
pub fn spawn(events: mpsc::Sender<NetworkEvent>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        let mut last: Option<(String, String)> = primary_ipv4().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let Some((interface, address)) = primary_ipv4().await else {
                        continue;
                    };
                    if let Some((last_interface, last_address)) = &last {
                        if *last_address != address {
                            info!(old = %last_address, new = %address, "IP address changed");
                            emit(&events, NetworkEvent::IpChange {
                                old: last_address.clone(),
                                new: address.clone(),
                            });
                        }
                        if *last_interface != interface {
                            info!(old = %last_interface, new = %interface, "network interface changed");
                            emit(&events, NetworkEvent::InterfaceChange {
                                old: last_interface.clone(),
                                new: interface.clone(),
                            });
                        }
                    }
                    last = Some((interface, address));
                }
            }
        }
    })
}

fn emit(events: &mpsc::Sender<NetworkEvent>, event: NetworkEvent) {
    if events.try_send(event).is_err() {
        warn!("network event channel full, dropping event");
    }
}

/// Resolve the primary (interface, IPv4 address) pair via `ip -j addr show`.
/// `None` when the command is unavailable or no candidate interface exists.
async fn primary_ipv4() -> Option<(String, String)> {
    let output = tokio::process::Command::new("ip")
        .args(["-j", "addr", "show"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("`ip -j addr show` exited with {}", output.status);
        return None;
    }
    let interfaces: Vec<Value> = serde_json::from_slice(&output.stdout).ok()?;
    parse_primary_ipv4(&interfaces)
}

/// Pick the first up, non-loopback interface with an IPv4 address.
/// Deterministic: the kernel's interface order decides ties.
fn parse_primary_ipv4(interfaces: &[Value]) -> Option<(String, String)> {
    for iface in interfaces {
        let name = iface["ifname"].as_str().unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let flags: Vec<&str> = iface["flags"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if flags.contains(&"LOOPBACK") || !flags.contains(&"UP") {
            continue;
        }

        let address = iface["addr_info"].as_array().and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a["family"].as_str() == Some("inet"))
                .and_then(|a| a["local"].as_str())
        });
        if let Some(address) = address {
            return Some((name.to_string(), address.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<Value> {
        vec![
            json!({
                "ifname": "lo",
                "flags": ["LOOPBACK", "UP", "LOWER_UP"],
                "addr_info": [{"family": "inet", "local": "127.0.0.1"}],
            }),
            json!({
                "ifname": "wg0",
                "flags": ["POINTOPOINT", "NOARP"],
                "addr_info": [{"family": "inet", "local": "10.9.0.2"}],
            }),
            json!({
                "ifname": "eth0",
                "flags": ["BROADCAST", "MULTICAST", "UP", "LOWER_UP"],
                "addr_info": [
                    {"family": "inet6", "local": "fe80::1"},
                    {"family": "inet", "local": "192.168.1.23"},
                ],
            }),
            json!({
                "ifname": "eth1",
                "flags": ["BROADCAST", "MULTICAST", "UP", "LOWER_UP"],
                "addr_info": [{"family": "inet", "local": "192.168.2.50"}],
            }),
        ]
    }

    #[test]
    fn skips_loopback_and_down_interfaces() {
        let (interface, address) = parse_primary_ipv4(&sample()).unwrap();
        assert_eq!(interface, "eth0");
        assert_eq!(address, "192.168.1.23");
    }

    #[test]
    fn none_when_no_candidate() {
        let interfaces = vec![serde_json::json!({
            "ifname": "lo",
            "flags": ["LOOPBACK", "UP"],
            "addr_info": [{"family": "inet", "local": "127.0.0.1"}],
        })];
        assert!(parse_primary_ipv4(&interfaces).is_none());
    }

    #[test]
    fn ipv6_only_interface_is_skipped() {
        let interfaces = vec![serde_json::json!({
            "ifname": "eth0",
            "flags": ["BROADCAST", "UP"],
            "addr_info": [{"family": "inet6", "local": "fe80::1"}],
        })];
        assert!(parse_primary_ipv4(&interfaces).is_none());
    }
}
