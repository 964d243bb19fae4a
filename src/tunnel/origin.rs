//! Origin client — talks to the local service a tunnel targets.
//!
//! Two operations: forward a buffered HTTP request to
//! `http://127.0.0.1:<port>`, and open a WebSocket against
//! `ws://127.0.0.1:<port>` for upgrade passthrough. Every failure mode
//! (refused, DNS, timeout, mid-body read error) collapses into
//! [`AgentError::OriginUnreachable`] carrying the underlying message — the
//! session protocol turns that into a 502 on the tunnel.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::AgentError;

/// Total budget for one forwarded HTTP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Handshake budget for a local WebSocket dial.
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
/// Cap on request and response bodies. Past this the request is answered
/// with a 502 rather than buffered.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Stream type returned by a local WebSocket dial.
pub type LocalWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A buffered response from the local origin.
pub struct OriginResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Client for the local service behind one tunnel.
///
/// Cloneable — per-request forwarding tasks each hold a clone and share the
/// underlying connection pool.
#[derive(Clone)]
pub struct OriginClient {
    http: reqwest::Client,
    local_port: u16,
}

impl OriginClient {
    pub fn new(local_port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("default reqwest client");
        Self { http, local_port }
    }

    /// Forward one HTTP request to the origin and buffer the full response.
    ///
    /// Headers are copied verbatim, hop-by-hop included — the edge is
    /// responsible for request hygiene. Content-Length is the exception:
    /// it is recomputed from the buffered body.
    pub async fn forward_http(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<OriginResponse, AgentError> {
        if body.len() > MAX_BODY_BYTES {
            return Err(AgentError::OriginUnreachable(format!(
                "request body of {} bytes exceeds the {MAX_BODY_BYTES}-byte cap",
                body.len()
            )));
        }

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| AgentError::OriginUnreachable(format!("invalid method: {e}")))?;
        let target = format!("http://127.0.0.1:{}{}", self.local_port, url);

        let response = self
            .http
            .request(method, &target)
            .headers(request_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| AgentError::OriginUnreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let response_headers = join_headers(response.headers());
        let body = read_capped(response).await?;

        Ok(OriginResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    /// Open a WebSocket to the origin for upgrade passthrough. Returns the
    /// duplex stream plus the origin's handshake response headers.
    pub async fn dial_websocket(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<(LocalWsStream, HashMap<String, String>), AgentError> {
        let target = format!("ws://127.0.0.1:{}{}", self.local_port, url);
        let mut request = target
            .into_client_request()
            .map_err(|e| AgentError::OriginUnreachable(format!("invalid upgrade URL: {e}")))?;

        // The dialer generates its own handshake headers; forwarding the
        // edge client's copies would corrupt the upgrade.
        for (name, value) in headers {
            if is_handshake_header(name) {
                continue;
            }
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!(header = %name, "skipping invalid header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                debug!(header = %name, "skipping invalid header value");
                continue;
            };
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = tokio::time::timeout(
            WS_HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| AgentError::OriginUnreachable("WebSocket handshake timed out".to_string()))?
        .map_err(|e| AgentError::OriginUnreachable(e.to_string()))?;

        Ok((stream, join_headers(response.headers())))
    }
}

/// Headers the WebSocket dialer owns during the handshake.
fn is_handshake_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "connection"
            | "upgrade"
            | "sec-websocket-key"
            | "sec-websocket-version"
            | "sec-websocket-extensions"
    )
}

/// Build the outbound header map, dropping Content-Length (recomputed) and
/// any name/value that is not expressible on the wire.
fn request_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "skipping invalid header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            debug!(header = %name, "skipping invalid header value");
            continue;
        };
        map.insert(name, value);
    }
    map
}

/// Flatten a header map into the wire shape: one entry per name,
/// multi-valued headers joined with `", "`.
pub fn join_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), joined);
    }
    map
}

/// Read a response body, failing once it exceeds [`MAX_BODY_BYTES`].
async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>, AgentError> {
    if let Some(length) = response.content_length() {
        if length > MAX_BODY_BYTES as u64 {
            return Err(AgentError::OriginUnreachable(format!(
                "response body of {length} bytes exceeds the {MAX_BODY_BYTES}-byte cap"
            )));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| AgentError::OriginUnreachable(e.to_string()))?
    {
        if body.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(AgentError::OriginUnreachable(format!(
                "response body exceeds the {MAX_BODY_BYTES}-byte cap"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
