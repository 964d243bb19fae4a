//! Credential storage and the login flows.
//!
//! Tokens live in the OS keyring behind the [`SecretStore`] trait; the
//! session manager reads them on demand and passes them by value into the
//! supervisor. [`MemoryStore`] backs tests and ephemeral runs where no
//! keyring is available.
//!
//! Browser login: the agent binds a localhost callback listener, hands the
//! user a login URL pointing at the web UI, and waits up to five minutes
//! for the redirect to deliver the token. The token is then validated
//! against the edge before being stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{AgentUser, EdgeApi};
use crate::config::Environment;
use crate::error::AgentError;

/// Secret-store key under which the user token is kept.
pub const TOKEN_KEY: &str = "user_token";

/// Keyring service name.
const KEYRING_SERVICE: &str = "uplink-agent";

/// How long the browser flow waits for the callback.
const LOGIN_WAIT: Duration = Duration::from_secs(300);

/// Handle to wherever secrets are kept.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, AgentError>;
    fn set(&self, key: &str, value: &str) -> Result<(), AgentError>;
    fn delete(&self, key: &str) -> Result<(), AgentError>;
}

/// OS keyring-backed store.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, AgentError> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| AgentError::Config(format!("keyring unavailable: {e}")))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, AgentError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AgentError::Config(format!("keyring read failed: {e}"))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AgentError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| AgentError::Config(format!("keyring write failed: {e}")))
    }

    fn delete(&self, key: &str) -> Result<(), AgentError> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AgentError::Config(format!("keyring delete failed: {e}"))),
        }
    }
}

/// In-memory store for tests and environments without a keyring.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, AgentError> {
        Ok(self.values.lock().expect("store mutex").get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AgentError> {
        self.values
            .lock()
            .expect("store mutex")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), AgentError> {
        self.values.lock().expect("store mutex").remove(key);
        Ok(())
    }
}

/// Login, logout, and token access.
pub struct AuthManager {
    api: EdgeApi,
    secrets: Arc<dyn SecretStore>,
    web_url: String,
}

impl AuthManager {
    pub fn new(env: &Environment, api: EdgeApi, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            api,
            secrets,
            web_url: env.web_url.trim_end_matches('/').to_string(),
        }
    }

    /// The stored token, or [`AgentError::NotAuthenticated`].
    pub fn token(&self) -> Result<String, AgentError> {
        self.secrets
            .get(TOKEN_KEY)?
            .ok_or(AgentError::NotAuthenticated)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.secrets.get(TOKEN_KEY), Ok(Some(_)))
    }

    /// Validate a token against the edge, then persist it.
    pub async fn login_with_token(&self, token: &str) -> Result<AgentUser, AgentError> {
        let user = self.api.validate_token(token).await?;
        self.secrets.set(TOKEN_KEY, token)?;
        info!(email = %user.email, "logged in");
        Ok(user)
    }

    /// Start the browser flow: bind the callback listener and build the
    /// login URL for the user to open. Call [`PendingLogin::wait`] to
    /// block for the redirect.
    pub async fn begin_browser_login(&self) -> Result<PendingLogin, AgentError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| AgentError::Config(format!("failed to bind callback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| AgentError::Config(format!("failed to read callback address: {e}")))?
            .port();

        let callback_url = format!("http://127.0.0.1:{port}/callback");
        let encoded: String = url::form_urlencoded::byte_serialize(callback_url.as_bytes()).collect();
        let login_url = format!("{}/agent-login?callback={encoded}", self.web_url);

        let (token_tx, token_rx) = mpsc::channel::<String>(1);
        let app = Router::new()
            .route("/callback", get(callback))
            .with_state(token_tx);
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(PendingLogin {
            login_url,
            token_rx,
            server,
        })
    }

    /// Delete the stored credential. The caller disconnects sessions first.
    pub fn logout(&self) -> Result<(), AgentError> {
        self.secrets.delete(TOKEN_KEY)
    }
}

/// A browser login in progress.
pub struct PendingLogin {
    /// URL the user must open to authorize this agent.
    pub login_url: String,
    token_rx: mpsc::Receiver<String>,
    server: JoinHandle<()>,
}

impl PendingLogin {
    /// Wait for the web UI to redirect the token to the callback listener.
    pub async fn wait(mut self) -> Result<String, AgentError> {
        let result = tokio::time::timeout(LOGIN_WAIT, self.token_rx.recv()).await;
        self.server.abort();
        match result {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(AgentError::Config(
                "callback listener closed unexpectedly".to_string(),
            )),
            Err(_) => Err(AgentError::Config(
                "timed out waiting for browser login".to_string(),
            )),
        }
    }
}

/// `GET /callback?token=...` — receives the redirect from the web UI.
async fn callback(
    State(tokens): State<mpsc::Sender<String>>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    match params.get("token") {
        Some(token) if !token.is_empty() => {
            let _ = tokens.try_send(token.clone());
            Html("<html><body><h2>Login complete.</h2><p>You can close this tab and return to the terminal.</p></body></html>")
        }
        _ => Html("<html><body><h2>Login failed.</h2><p>No token in callback.</p></body></html>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert!(store.get(TOKEN_KEY).unwrap().is_none());
        store.set(TOKEN_KEY, "tok-123").unwrap();
        assert_eq!(store.get(TOKEN_KEY).unwrap().as_deref(), Some("tok-123"));
        store.delete(TOKEN_KEY).unwrap();
        assert!(store.get(TOKEN_KEY).unwrap().is_none());
    }
}
