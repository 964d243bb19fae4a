#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! uplink library — the client agent for the Uplink reverse tunneling service.
//!
//! The agent maintains an outbound, authenticated WebSocket to the Uplink
//! edge and relays public HTTP and WebSocket traffic arriving there to a
//! service listening on a local TCP port.
//!
//! Building blocks:
//! - `tunnel` — frame codec, origin client, session protocol, transport,
//!   supervisor, and the session manager
//! - `monitor` — origin health probe and network-change detection
//! - `api` — edge REST client (tunnel list, stop, token validation)
//! - `auth` — credential storage and the browser login flow
//! - `config` — environment resolution and the tunnel descriptor cache

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod monitor;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use api::EdgeApi;
pub use auth::{AuthManager, KeyringStore, MemoryStore, SecretStore};
pub use config::{Environment, Tunnel, TunnelStore};
pub use error::AgentError;
pub use tunnel::manager::SessionManager;
pub use tunnel::SessionState;
