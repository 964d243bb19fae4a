//! Background probes feeding the session manager.
//!
//! - `network` — detects primary-IPv4 and interface changes every 10 s and
//!   emits events over a bounded channel; the agent run loop turns them
//!   into `on_network_change` calls.
//! - `health` — probes each serving tunnel's origin every 30 s and reports
//!   the result to the manager as a soft signal.

pub mod health;
pub mod network;

pub use network::{NetworkEvent, EVENT_CHANNEL_CAPACITY};
