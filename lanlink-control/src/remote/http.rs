//! Retrying, pooled, token-authenticated HTTP layer.
//!
//! Transport failures and 5xx responses are retried here with
//! exponential backoff and jitter; business errors (4xx) are mapped to
//! [`ControlError`] kinds and never retried. Callers above this layer
//! only ever see either a decoded body or a final error.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::error::{ControlError, ErrorBody, Result};
use crate::types::{
    AuthRegisterRequest, AuthRegisterResponse, CreatePartyRequest, JoinPartyRequest, PartyInfo,
    PeerInfo, RelayInfo,
};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on pooled idle connections per host.
const MAX_IDLE_PER_HOST: usize = 32;
/// Retries after the first attempt, for transport errors and 5xx.
const RETRIES: u32 = 3;
/// First backoff delay; doubles per retry (250 ms, 500 ms, 1 s).
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Token state bound to a peer at `/auth/register` time.
#[derive(Debug, Clone)]
pub(crate) struct AuthState {
    pub token: String,
    pub peer_id: String,
    pub expires_at: DateTime<Utc>,
}

pub(crate) struct HttpClient {
    http: reqwest::Client,
    base: Url,
    auth: Mutex<Option<AuthState>>,
}

impl HttpClient {
    /// Build the client. No network I/O happens here.
    pub fn new(base_url: &str) -> Result<Self> {
        // A trailing slash makes Url::join treat the last path segment
        // as a directory, which is what prefix-mounted servers need.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| ControlError::Invalid(format!("bad control_server_url: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ControlError::Invalid(format!(
                "control_server_url must be http(s), got {}",
                base.scheme()
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build()?;
        Ok(Self {
            http,
            base,
            auth: Mutex::new(None),
        })
    }

    /// The streaming endpoint derived from the configured server URL.
    pub fn ws_url(&self) -> Result<Url> {
        let mut url = self
            .base
            .join("ws")
            .map_err(|e| ControlError::Invalid(format!("bad ws url: {e}")))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ControlError::Invalid("cannot derive ws scheme".into()))?;
        Ok(url)
    }

    pub fn auth_state(&self) -> Option<AuthState> {
        self.auth.lock().clone()
    }

    /// Return a valid token bound to `peer_id`, registering with the
    /// server if we don't hold one yet. An empty `peer_id` lets the
    /// server assign one.
    pub async fn ensure_auth(&self, peer_id: &str) -> Result<AuthState> {
        {
            let auth = self.auth.lock();
            if let Some(auth) = auth.as_ref()
                && (peer_id.is_empty() || auth.peer_id == peer_id)
                && auth.expires_at > Utc::now()
            {
                return Ok(auth.clone());
            }
        }
        let req = AuthRegisterRequest {
            peer_id: peer_id.to_string(),
        };
        let resp: AuthRegisterResponse = self
            .request_json(
                Method::POST,
                "auth/register",
                Some(serde_json::to_value(&req)?),
            )
            .await?;
        let state = AuthState {
            token: resp.token,
            peer_id: resp.peer_id,
            expires_at: resp.expires_at,
        };
        tracing::debug!(peer_id = %state.peer_id, "registered auth token");
        *self.auth.lock() = Some(state.clone());
        Ok(state)
    }

    /// Drop the held token and register a fresh one for the same peer.
    /// Used when the server answers 401 for a token it used to accept.
    async fn reauth(&self) -> Result<AuthState> {
        let peer_id = self
            .auth
            .lock()
            .take()
            .map(|auth| auth.peer_id)
            .ok_or_else(|| ControlError::Auth("no registered peer to re-authenticate".into()))?;
        self.ensure_auth(&peer_id).await
    }

    // ── Endpoints ──────────────────────────────────────────────────────

    pub async fn create_party(&self, req: &CreatePartyRequest) -> Result<PartyInfo> {
        self.call_json(Method::POST, "parties".to_string(), Some(serde_json::to_value(req)?))
            .await
    }

    pub async fn get_party(&self, party_id: &str) -> Result<PartyInfo> {
        self.call_json(Method::GET, format!("parties/{party_id}"), None)
            .await
    }

    pub async fn join_party(&self, party_id: &str, req: &JoinPartyRequest) -> Result<PartyInfo> {
        self.call_json(
            Method::POST,
            format!("parties/{party_id}/join"),
            Some(serde_json::to_value(req)?),
        )
        .await
    }

    pub async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()> {
        self.call_unit(
            Method::DELETE,
            format!("parties/{party_id}/peers/{peer_id}"),
            None,
        )
        .await
    }

    pub async fn list_peers(&self, party_id: &str) -> Result<Vec<PeerInfo>> {
        self.call_json(Method::GET, format!("parties/{party_id}/peers"), None)
            .await
    }

    pub async fn get_peer(&self, party_id: &str, peer_id: &str) -> Result<PeerInfo> {
        self.call_json(
            Method::GET,
            format!("parties/{party_id}/peers/{peer_id}"),
            None,
        )
        .await
    }

    pub async fn update_peer(&self, party_id: &str, peer: &PeerInfo) -> Result<()> {
        self.call_unit(
            Method::PUT,
            format!("parties/{party_id}/peers/{}", peer.peer_id),
            Some(serde_json::to_value(peer)?),
        )
        .await
    }

    pub async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()> {
        self.call_unit(
            Method::POST,
            format!("parties/{party_id}/peers/{peer_id}/heartbeat"),
            None,
        )
        .await
    }

    pub async fn register_relay(&self, relay: &RelayInfo) -> Result<()> {
        self.call_unit(
            Method::POST,
            "relays".to_string(),
            Some(serde_json::to_value(relay)?),
        )
        .await
    }

    pub async fn list_relays(&self, region: Option<&str>) -> Result<Vec<RelayInfo>> {
        let path = match region {
            Some(region) => format!("relays/{region}"),
            None => "relays".to_string(),
        };
        self.call_json(Method::GET, path, None).await
    }

    // ── Request pipeline ───────────────────────────────────────────────

    /// JSON call with a single transparent re-auth on 401.
    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        match self.request_json(method.clone(), &path, body.clone()).await {
            Err(ControlError::Auth(_)) if self.auth.lock().is_some() => {
                self.reauth().await?;
                self.request_json(method, &path, body).await
            }
            other => other,
        }
    }

    async fn call_unit(
        &self,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        match self.execute(method.clone(), &path, body.clone()).await {
            Err(ControlError::Auth(_)) if self.auth.lock().is_some() => {
                self.reauth().await?;
                self.execute(method, &path, body).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let resp = self.execute(method, path, body).await?;
        Ok(resp.json::<T>().await?)
    }

    /// Send with retries. Returns the successful response; transport
    /// errors and 5xx are retried up to [`RETRIES`] times with
    /// exponential backoff ±20 % jitter, then become `Unavailable`.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = self
            .base
            .join(path)
            .map_err(|e| ControlError::Invalid(format!("bad request path {path}: {e}")))?;
        let mut delay = BACKOFF_BASE;
        let mut last_err = String::new();
        for attempt in 0..=RETRIES {
            if attempt > 0 {
                tokio::time::sleep(jitter(delay)).await;
                delay *= 2;
            }
            let mut req = self.http.request(method.clone(), url.clone());
            if let Some(auth) = self.auth.lock().as_ref() {
                req = req.bearer_auth(&auth.token);
            }
            if let Some(ref body) = body {
                req = req.json(body);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status.is_server_error() {
                        last_err = format!("{method} {path}: HTTP {status}");
                        tracing::debug!("{last_err} (attempt {})", attempt + 1);
                        continue;
                    }
                    return Err(map_client_error(status, resp).await);
                }
                Err(e) => {
                    last_err = format!("{method} {path}: {e}");
                    tracing::debug!("{last_err} (attempt {})", attempt + 1);
                }
            }
        }
        Err(ControlError::Unavailable(last_err))
    }
}

/// Map a non-retryable status to an error kind, preferring the server's
/// own message when the body is a well-formed error envelope.
async fn map_client_error(status: StatusCode, resp: reqwest::Response) -> ControlError {
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error.message,
        Err(_) => format!("HTTP {status}"),
    };
    match status {
        StatusCode::NOT_FOUND => ControlError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ControlError::Auth(message),
        StatusCode::CONFLICT => ControlError::Conflict(message),
        StatusCode::UNPROCESSABLE_ENTITY => ControlError::Invalid(message),
        _ => ControlError::Server(message),
    }
}

fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_derivation() {
        let client = HttpClient::new("http://127.0.0.1:8537").unwrap();
        assert_eq!(client.ws_url().unwrap().as_str(), "ws://127.0.0.1:8537/ws");

        let client = HttpClient::new("https://control.example.net/api/").unwrap();
        assert_eq!(
            client.ws_url().unwrap().as_str(),
            "wss://control.example.net/api/ws"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            HttpClient::new("ftp://example.net"),
            Err(ControlError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_retries_become_unavailable() {
        // Nothing listens on this port; every attempt fails at transport.
        let client = HttpClient::new("http://127.0.0.1:9").unwrap();
        let started = std::time::Instant::now();
        let err = client.get_party("a1b2c3d4e5f6").await.unwrap_err();
        assert!(matches!(err, ControlError::Unavailable(_)), "got {err:?}");
        // Three backoffs: ≥ (250+500+1000) ms × 0.8 jitter floor.
        assert!(started.elapsed() >= Duration::from_millis(1400));
    }

    #[test]
    fn jitter_stays_within_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_millis(800) && j < Duration::from_millis(1200));
        }
    }
}
