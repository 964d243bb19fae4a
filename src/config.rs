//! Configuration loading and the tunnel descriptor cache.
//!
//! Two layers of state:
//!
//! - [`Environment`] — which edge this agent talks to. Resolved in order of
//!   precedence (highest wins): environment variables (`UPLINK_API_URL`,
//!   `UPLINK_WEB_URL`, `UPLINK_TUNNEL_DOMAIN`), an optional TOML file, then
//!   compiled defaults.
//! - [`TunnelStore`] — the descriptor cache. Tunnel descriptors are created
//!   by the edge; the agent fetches them over the REST API and persists them
//!   as JSON under the config directory so `connect` works by name without a
//!   round trip.
//!
//! The TOML file mirrors the struct:
//!
//! ```toml
//! server_api_url = "https://api.uplink.example/api/v1"
//! web_url = "https://uplink.example"
//! tunnel_public_domain = "tunnels.uplink.example"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Which edge the agent talks to. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Base URL of the edge REST API. The tunnel transport endpoint is
    /// derived from it by swapping the scheme to `ws`/`wss`.
    pub server_api_url: String,
    /// Public domain under which tunnel hostnames are allocated.
    pub tunnel_public_domain: String,
    /// Web UI base URL, used for the browser login flow.
    pub web_url: String,
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    pub log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct EnvironmentFile {
    server_api_url: Option<String>,
    tunnel_public_domain: Option<String>,
    web_url: Option<String>,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    level: Option<String>,
}

fn default_api_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}
fn default_web_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_tunnel_domain() -> String {
    "localhost:8080".to_string()
}

impl Environment {
    /// Load the environment with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `uplink.toml` in the config directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, AgentError> {
        let file = match path {
            Some(p) => Self::read_file(Path::new(p))?,
            None => {
                let default_path = config_dir().join("uplink.toml");
                if default_path.exists() {
                    Self::read_file(&default_path)?
                } else {
                    EnvironmentFile::default()
                }
            }
        };

        let mut env = Environment {
            server_api_url: file.server_api_url.unwrap_or_else(default_api_url),
            tunnel_public_domain: file
                .tunnel_public_domain
                .unwrap_or_else(default_tunnel_domain),
            web_url: file.web_url.unwrap_or_else(default_web_url),
            log_level: file.logging.level.unwrap_or_else(|| "info".to_string()),
        };

        if let Ok(url) = std::env::var("UPLINK_API_URL") {
            env.server_api_url = url;
        }
        if let Ok(url) = std::env::var("UPLINK_WEB_URL") {
            env.web_url = url;
        }
        if let Ok(domain) = std::env::var("UPLINK_TUNNEL_DOMAIN") {
            env.tunnel_public_domain = domain;
        }

        Ok(env)
    }

    fn read_file(path: &Path) -> Result<EnvironmentFile, AgentError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

/// Platform config directory for per-tunnel persistence (`~/.uplink`).
/// Falls back to the current directory when no home is resolvable.
pub fn config_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .map_or_else(|| PathBuf::from("."), |home| home.join(".uplink"));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// A tunnel descriptor, created by the edge and fetched by the agent.
/// Never mutated during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub subdomain: String,
    pub local_port: u16,
    pub auth_token: String,
    #[serde(default)]
    pub is_active: bool,
    /// Reconnect this tunnel automatically when the agent starts.
    #[serde(default)]
    pub auto_start: bool,
}

/// On-disk shape of the descriptor cache.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTunnels {
    #[serde(default)]
    tunnels: HashMap<String, Tunnel>,
    /// Unix seconds of the last successful sync from the edge.
    #[serde(default)]
    last_sync: i64,
}

/// Descriptor cache persisted as JSON under the config directory.
///
/// Cloneable — clones share the same file path. Writes are whole-file
/// rewrites; the agent is the only writer.
#[derive(Clone)]
pub struct TunnelStore {
    path: PathBuf,
}

impl TunnelStore {
    /// Open the store at the default location (`<config_dir>/tunnels.json`).
    pub fn open() -> Self {
        Self {
            path: config_dir().join("tunnels.json"),
        }
    }

    /// Open the store at an explicit path.
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<StoredTunnels, AgentError> {
        if !self.path.exists() {
            return Ok(StoredTunnels::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            AgentError::Config(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    fn save(&self, stored: &StoredTunnels) -> Result<(), AgentError> {
        let data = serde_json::to_string_pretty(stored)
            .map_err(|e| AgentError::Config(format!("failed to encode tunnel cache: {e}")))?;
        std::fs::write(&self.path, data).map_err(|e| {
            AgentError::Config(format!("failed to write {}: {e}", self.path.display()))
        })
    }

    /// Look up a descriptor by id or by human name.
    pub fn resolve(&self, name_or_id: &str) -> Result<Tunnel, AgentError> {
        let stored = self.load()?;
        if let Some(tunnel) = stored.tunnels.get(name_or_id) {
            return Ok(tunnel.clone());
        }
        stored
            .tunnels
            .values()
            .find(|t| t.name == name_or_id)
            .cloned()
            .ok_or_else(|| AgentError::TunnelNotFound(name_or_id.to_string()))
    }

    /// All cached descriptors, unordered.
    pub fn all(&self) -> Result<Vec<Tunnel>, AgentError> {
        Ok(self.load()?.tunnels.into_values().collect())
    }

    /// Descriptors flagged for auto-start.
    pub fn auto_start_tunnels(&self) -> Result<Vec<Tunnel>, AgentError> {
        Ok(self
            .load()?
            .tunnels
            .into_values()
            .filter(|t| t.auto_start)
            .collect())
    }

    /// Merge descriptors fetched from the edge into the cache, preserving
    /// local-only flags (`auto_start`) across syncs.
    pub fn sync(&self, fetched: Vec<Tunnel>) -> Result<(), AgentError> {
        let mut stored = self.load()?;
        for mut tunnel in fetched {
            if let Some(existing) = stored.tunnels.get(&tunnel.id) {
                tunnel.auto_start = existing.auto_start;
            }
            stored.tunnels.insert(tunnel.id.clone(), tunnel);
        }
        stored.last_sync = unix_now();
        self.save(&stored)
    }

    /// Flip the auto-start flag for one tunnel.
    pub fn set_auto_start(&self, tunnel_id: &str, auto_start: bool) -> Result<(), AgentError> {
        let mut stored = self.load()?;
        match stored.tunnels.get_mut(tunnel_id) {
            Some(tunnel) => tunnel.auto_start = auto_start,
            None => return Err(AgentError::TunnelNotFound(tunnel_id.to_string())),
        }
        self.save(&stored)
    }

    /// Record whether a tunnel is currently served by this agent.
    pub fn set_active(&self, tunnel_id: &str, active: bool) -> Result<(), AgentError> {
        let mut stored = self.load()?;
        if let Some(tunnel) = stored.tunnels.get_mut(tunnel_id) {
            tunnel.is_active = active;
            self.save(&stored)?;
        }
        Ok(())
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    i64::try_from(secs).unwrap_or(i64::MAX)
}
