//! Edge REST client.
//!
//! Typed wrappers over the three control endpoints the agent consumes:
//! tunnel listing, remote stop, and agent token validation. All endpoints
//! use Bearer authentication. Non-2xx responses are parsed for an `error`
//! field in the JSON body; if that fails, the raw body becomes the error
//! message.

use std::time::Duration;

use serde::Deserialize;

use crate::config::Tunnel;
use crate::error::AgentError;

/// Client for the edge REST API.
#[derive(Clone)]
pub struct EdgeApi {
    http: reqwest::Client,
    base_url: String,
}

/// The authenticated user, as reported by the edge.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct TunnelsResponse {
    tunnels: Vec<Tunnel>,
}

#[derive(Deserialize)]
struct AgentAuthResponse {
    valid: bool,
    user: Option<AgentUser>,
}

impl EdgeApi {
    /// Create a client for the edge at `base_url` (no trailing slash needed).
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default reqwest client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `GET /tunnels` — the caller's registered tunnels.
    pub async fn tunnels(&self, token: &str) -> Result<Vec<Tunnel>, AgentError> {
        let response = self
            .http
            .get(format!("{}/tunnels", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;
        let body: TunnelsResponse = Self::parse(response).await?;
        Ok(body.tunnels)
    }

    /// `POST /tunnels/{id}/stop` — stop a tunnel on the edge side.
    /// The edge answers 200 on success (body unused) and 400 when the
    /// tunnel is not active.
    pub async fn stop_tunnel(&self, token: &str, tunnel_id: &str) -> Result<(), AgentError> {
        let response = self
            .http
            .post(format!("{}/tunnels/{tunnel_id}/stop", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;
        Self::ensure_success(response).await
    }

    /// `POST /auth/agent-auth` — validate a token. An explicit
    /// `valid: false` maps to [`AgentError::CredentialExpired`].
    pub async fn validate_token(&self, token: &str) -> Result<AgentUser, AgentError> {
        let response = self
            .http
            .post(format!("{}/auth/agent-auth", self.base_url))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(request_error)?;
        let body: AgentAuthResponse = Self::parse(response).await?;
        if !body.valid {
            return Err(AgentError::CredentialExpired);
        }
        body.user.ok_or_else(|| AgentError::Edge {
            status: 200,
            message: "valid token but no user in response".to_string(),
        })
    }

    async fn parse<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, AgentError> {
        let status = response.status();
        let body = Self::check_status(response).await?;
        serde_json::from_str(&body).map_err(|e| AgentError::Edge {
            status: status.as_u16(),
            message: format!("invalid JSON from edge: {e}"),
        })
    }

    async fn ensure_success(response: reqwest::Response) -> Result<(), AgentError> {
        Self::check_status(response).await.map(|_| ())
    }

    /// Reject non-2xx responses, extracting the `error` field from the
    /// JSON body when present. 401/403 map to `CredentialExpired`.
    async fn check_status(response: reqwest::Response) -> Result<String, AgentError> {
        let status = response.status();
        let body = response.text().await.map_err(request_error)?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AgentError::CredentialExpired);
        }
        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            return Err(AgentError::Edge {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

/// Transport-level REST failures are network problems, not edge rejections.
fn request_error(err: reqwest::Error) -> AgentError {
    AgentError::NetworkUnavailable(err.to_string())
}
