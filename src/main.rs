//! # uplink
//!
//! Client agent for the Uplink reverse tunneling service.
//!
//! The agent keeps an outbound, authenticated WebSocket to the Uplink edge
//! and relays public HTTP and WebSocket traffic arriving at a tunnel's
//! hostname to a service on a local TCP port.
//!
//! ## Subcommands
//!
//! - `uplink login` — authenticate via the browser (or `--token`)
//! - `uplink tunnels` — list tunnels registered on the edge
//! - `uplink connect <name>` — serve one tunnel until Ctrl-C
//! - `uplink run` — serve every auto-start tunnel with monitoring
//! - `uplink stop <name>` — stop a tunnel on the edge side
//! - `uplink status` / `logout` / `autostart`
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, run loop, shutdown
//! api.rs           — edge REST client (list/stop/validate)
//! auth.rs          — secret store, login flows
//! config.rs        — environment + tunnel descriptor cache
//! tunnel/
//!   frame.rs       — JSON frame codec
//!   origin.rs      — local HTTP/WebSocket client
//!   transport.rs   — outbound WebSocket, keepalive, heartbeat
//!   protocol.rs    — frame dispatch, per-request forwarding
//!   supervisor.rs  — dial/backoff/reconnect state machine
//!   manager.rs     — session registry and control surface
//! monitor/
//!   network.rs     — primary-IPv4 change detection
//!   health.rs      — origin reachability probe
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use uplink::api::EdgeApi;
use uplink::auth::{AuthManager, KeyringStore, SecretStore};
use uplink::config::{Environment, TunnelStore};
use uplink::monitor;
use uplink::tunnel::manager::SessionManager;
use uplink::AgentError;

/// Cadence of the background maintenance pass in `uplink run`.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Client agent for the Uplink reverse tunneling service.
#[derive(Parser)]
#[command(name = "uplink", version)]
struct Cli {
    /// Path to a TOML config file (default: ~/.uplink/uplink.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate this agent with the edge.
    Login {
        /// Use an explicit token instead of the browser flow.
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove the stored credential.
    Logout,
    /// Show authentication state and cached tunnels.
    Status,
    /// List tunnels registered on the edge and refresh the local cache.
    Tunnels,
    /// Connect one tunnel and serve it until Ctrl-C.
    Connect {
        /// Tunnel name or id.
        name: String,
        /// Keep reconnecting across transport failures.
        #[arg(long)]
        persistent: bool,
    },
    /// Stop a tunnel on the edge side.
    Stop {
        /// Tunnel name or id.
        name: String,
    },
    /// Mark a tunnel to connect automatically under `uplink run`.
    Autostart {
        /// Tunnel name or id.
        name: String,
        /// Clear the flag instead of setting it.
        #[arg(long)]
        off: bool,
    },
    /// Run the agent: connect auto-start tunnels, monitor, reconnect.
    Run,
}

/// Everything a command needs, built once at startup.
struct Agent {
    env: Environment,
    store: TunnelStore,
    api: EdgeApi,
    auth: AuthManager,
    manager: SessionManager,
}

impl Agent {
    fn new(env: Environment) -> Self {
        let store = TunnelStore::open();
        let secrets: Arc<dyn SecretStore> = Arc::new(KeyringStore::new());
        let api = EdgeApi::new(&env.server_api_url);
        let auth = AuthManager::new(&env, api.clone(), Arc::clone(&secrets));
        let manager = SessionManager::new(&env, store.clone(), secrets);
        Self {
            env,
            store,
            api,
            auth,
            manager,
        }
    }

    /// Refresh the descriptor cache from the edge.
    async fn sync_tunnels(&self) -> Result<usize, AgentError> {
        let token = self.auth.token()?;
        let tunnels = self.api.tunnels(&token).await?;
        let count = tunnels.len();
        self.store.sync(tunnels)?;
        Ok(count)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env = match Environment::load(cli.config.as_deref()) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("uplink: {e}");
            std::process::exit(1);
        }
    };

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| env.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let agent = Agent::new(env);
    let result = match cli.command {
        Commands::Login { token } => login(&agent, token).await,
        Commands::Logout => logout(&agent),
        Commands::Status => status(&agent),
        Commands::Tunnels => tunnels(&agent).await,
        Commands::Connect { name, persistent } => connect(&agent, &name, persistent).await,
        Commands::Stop { name } => stop(&agent, &name).await,
        Commands::Autostart { name, off } => autostart(&agent, &name, off),
        Commands::Run => run(&agent).await,
    };

    if let Err(e) = result {
        eprintln!("uplink: {e}");
        std::process::exit(1);
    }
}

async fn login(agent: &Agent, token: Option<String>) -> Result<(), AgentError> {
    let token = match token {
        Some(token) => token,
        None => {
            let pending = agent.auth.begin_browser_login().await?;
            println!("Open this URL in your browser to log in:\n\n  {}\n", pending.login_url);
            println!("Waiting for login to complete...");
            pending.wait().await?
        }
    };

    let user = agent.auth.login_with_token(&token).await?;
    println!("Logged in as {}", user.email);

    match agent.sync_tunnels().await {
        Ok(count) => println!("Synced {count} tunnel(s) from the edge"),
        Err(e) => warn!("tunnel sync failed after login: {e}"),
    }
    Ok(())
}

fn logout(agent: &Agent) -> Result<(), AgentError> {
    agent.auth.logout()?;
    println!("Logged out");
    Ok(())
}

fn status(agent: &Agent) -> Result<(), AgentError> {
    if agent.auth.is_authenticated() {
        println!("Authenticated: yes");
    } else {
        println!("Authenticated: no (run `uplink login`)");
        return Ok(());
    }

    let mut tunnels = agent.store.all()?;
    if tunnels.is_empty() {
        println!("No tunnels cached — run `uplink tunnels`");
        return Ok(());
    }
    tunnels.sort_by(|a, b| a.name.cmp(&b.name));
    println!("{:<20} {:<24} {:>6}  {:<10} {}", "NAME", "SUBDOMAIN", "PORT", "ACTIVE", "AUTO-START");
    for t in tunnels {
        println!(
            "{:<20} {:<24} {:>6}  {:<10} {}",
            t.name,
            t.subdomain,
            t.local_port,
            if t.is_active { "yes" } else { "no" },
            if t.auto_start { "yes" } else { "no" },
        );
    }
    Ok(())
}

async fn tunnels(agent: &Agent) -> Result<(), AgentError> {
    let count = agent.sync_tunnels().await?;
    println!("{count} tunnel(s) registered:");
    let mut tunnels = agent.store.all()?;
    tunnels.sort_by(|a, b| a.name.cmp(&b.name));
    for t in tunnels {
        println!(
            "  {} — https://{}.{} -> 127.0.0.1:{}",
            t.name, t.subdomain, agent.env.tunnel_public_domain, t.local_port
        );
    }
    Ok(())
}

async fn connect(agent: &Agent, name: &str, persistent: bool) -> Result<(), AgentError> {
    if let Err(e) = agent.sync_tunnels().await {
        warn!("tunnel sync failed, using cached descriptors: {e}");
    }

    let tunnel = agent.manager.connect(name, persistent).await?;
    println!(
        "Tunnel {} connected: https://{}.{} -> 127.0.0.1:{}",
        tunnel.name, tunnel.subdomain, agent.env.tunnel_public_domain, tunnel.local_port
    );
    println!("Press Ctrl-C to disconnect");

    wait_for_shutdown().await;
    println!("Disconnecting...");
    agent.manager.disconnect(&tunnel.id).await?;
    Ok(())
}

async fn stop(agent: &Agent, name: &str) -> Result<(), AgentError> {
    let token = agent.auth.token()?;
    let tunnel = agent.store.resolve(name)?;
    agent.api.stop_tunnel(&token, &tunnel.id).await?;
    agent.store.set_active(&tunnel.id, false)?;
    println!("Tunnel {} stopped", tunnel.name);
    Ok(())
}

fn autostart(agent: &Agent, name: &str, off: bool) -> Result<(), AgentError> {
    let tunnel = agent.store.resolve(name)?;
    agent.store.set_auto_start(&tunnel.id, !off)?;
    println!(
        "Tunnel {} auto-start {}",
        tunnel.name,
        if off { "disabled" } else { "enabled" }
    );
    Ok(())
}

/// The long-running agent mode: serve every auto-start tunnel, react to
/// network changes, and re-sync descriptors periodically.
async fn run(agent: &Agent) -> Result<(), AgentError> {
    if !agent.auth.is_authenticated() {
        return Err(AgentError::NotAuthenticated);
    }

    info!("uplink v{} starting", env!("CARGO_PKG_VERSION"));
    if let Err(e) = agent.sync_tunnels().await {
        warn!("initial tunnel sync failed, using cached descriptors: {e}");
    }

    connect_auto_start(agent).await;

    let cancel = CancellationToken::new();
    let (network_tx, mut network_rx) = mpsc::channel(monitor::EVENT_CHANNEL_CAPACITY);
    let network_task = monitor::network::spawn(network_tx, cancel.clone());
    let health_task = monitor::health::spawn(agent.manager.clone(), cancel.clone());

    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
    maintenance.tick().await; // the first tick fires immediately

    info!("agent ready");
    loop {
        tokio::select! {
            () = wait_for_shutdown() => break,
            Some(event) = network_rx.recv() => {
                info!("network change detected: {event:?}");
                agent.manager.on_network_change().await;
            }
            _ = maintenance.tick() => {
                if let Err(e) = agent.sync_tunnels().await {
                    warn!("tunnel sync failed: {e}");
                }
                connect_auto_start(agent).await;
            }
        }
    }

    info!("shutting down...");
    cancel.cancel();
    network_task.abort();
    health_task.abort();
    agent.manager.on_logout().await;
    info!("goodbye");
    Ok(())
}

/// Connect every auto-start tunnel that is not already serving. Failures
/// are logged and skipped; the next maintenance pass retries.
async fn connect_auto_start(agent: &Agent) {
    let tunnels = match agent.store.auto_start_tunnels() {
        Ok(tunnels) => tunnels,
        Err(e) => {
            warn!("failed to read auto-start tunnels: {e}");
            return;
        }
    };

    for tunnel in tunnels {
        if agent.manager.is_connected(&tunnel.id).await {
            continue;
        }
        info!(tunnel = %tunnel.name, "auto-connecting");
        let manager = agent.manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.connect(&tunnel.id, true).await {
                warn!(tunnel = %tunnel.name, "auto-connect failed: {e}");
            }
        });
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
