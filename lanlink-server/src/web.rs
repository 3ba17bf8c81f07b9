//! HTTP API and WebSocket push endpoint.
//!
//! All endpoints speak JSON. Everything except `GET /` and
//! `POST /auth/register` requires a bearer token issued by the latter;
//! endpoints that mutate a specific peer additionally require the token
//! to be bound to that peer_id, which is what stops one member from
//! evicting another. Errors come back as
//! `{"error": {"code": ..., "message": ...}}`.
//!
//! The `/ws` endpoint upgrades to the streaming channel: the client
//! authenticates with a `hello` frame, then receives membership events
//! and relayed NAT-traversal signals for as long as the socket lives.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{FromRequestParts, Path, State, WebSocketUpgrade};
use axum::http::{StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use lanlink_control::error::{ControlError, ErrorBody};
use lanlink_control::push::{ClientFrame, ServerFrame};
use lanlink_control::types::{
    AuthRegisterRequest, AuthRegisterResponse, CreatePartyRequest, JoinPartyRequest, PartyInfo,
    PeerInfo, RelayInfo, generate_party_id, generate_peer_id, validate_party_id, validate_peer,
    validate_peer_id,
};

use crate::db::{JoinOutcome, RemoveOutcome, TokenRow};
use crate::server::{RELAY_TTL, SharedState};

/// How long the streaming handshake may take before the socket is dropped.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound push frames are abandoned if the socket stays blocked this long.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/auth/register", post(auth_register))
        .route("/parties", post(create_party))
        .route("/parties/{id}", get(get_party))
        .route("/parties/{id}/join", post(join_party))
        .route("/parties/{id}/peers", get(list_peers))
        .route(
            "/parties/{id}/peers/{peer_id}",
            get(get_peer).put(update_peer).delete(leave_party),
        )
        .route("/parties/{id}/peers/{peer_id}/heartbeat", post(heartbeat))
        .route("/relays", post(register_relay).get(list_relays))
        .route("/relays/{region}", get(list_relays_region))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ─────────────────────────────────────────────────────────────

/// Wrapper turning [`ControlError`] into an HTTP response.
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::NotFound => StatusCode::NOT_FOUND,
            ControlError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Auth(_) => StatusCode::UNAUTHORIZED,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Server(_) | ControlError::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

// ── Auth extractor ─────────────────────────────────────────────────────

/// The peer a valid bearer token is bound to.
///
/// Extraction fails with 401 for a missing, unknown, or expired token.
/// A successful extraction also refreshes the peer's `last_seen`
/// everywhere — any authenticated API call counts as liveness.
pub struct AuthedPeer {
    pub peer_id: String,
}

impl AuthedPeer {
    /// Enforce the token↔path binding on peer-mutating endpoints.
    fn must_be(&self, peer_id: &str) -> Result<(), ApiError> {
        if self.peer_id != peer_id {
            return Err(ApiError(ControlError::Auth(format!(
                "token is bound to a different peer than '{peer_id}'"
            ))));
        }
        Ok(())
    }
}

impl FromRequestParts<Arc<SharedState>> for AuthedPeer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<SharedState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError(ControlError::Auth("missing bearer token".into())))?
            .to_string();

        let now = Utc::now();
        let row = state.db(|db| db.lookup_token(&token))?;
        match row {
            Some(row) if row.expires_at > now => {
                state.db(|db| db.touch_peer_everywhere(&row.peer_id, now))?;
                Ok(AuthedPeer {
                    peer_id: row.peer_id,
                })
            }
            Some(_) => Err(ApiError(ControlError::Auth("token expired".into()))),
            None => Err(ApiError(ControlError::Auth("unknown token".into()))),
        }
    }
}

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    server: &'static str,
    version: &'static str,
    parties: i64,
    peers: i64,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<SharedState>>) -> Result<Json<HealthResponse>, ApiError> {
    let (parties, peers) = state.db(|db| db.counts())?;
    Ok(Json(HealthResponse {
        server: "lanlink-server",
        version: env!("CARGO_PKG_VERSION"),
        parties,
        peers,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

// ── Auth ───────────────────────────────────────────────────────────────

async fn auth_register(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<AuthRegisterRequest>,
) -> Result<Json<AuthRegisterResponse>, ApiError> {
    let peer_id = if req.peer_id.is_empty() {
        generate_peer_id()
    } else {
        validate_peer_id(&req.peer_id)?;
        req.peer_id
    };

    let now = Utc::now();
    let row = TokenRow {
        token: hex::encode(rand::random::<[u8; 32]>()),
        peer_id: peer_id.clone(),
        issued_at: now,
        expires_at: now + chrono::Duration::seconds(state.config.token_ttl as i64),
    };
    state.db(|db| db.insert_token(&row))?;
    tracing::debug!(peer_id = %peer_id, "issued auth token");
    Ok(Json(AuthRegisterResponse {
        token: row.token,
        peer_id,
        expires_at: row.expires_at,
    }))
}

// ── Parties ────────────────────────────────────────────────────────────

async fn create_party(
    State(state): State<Arc<SharedState>>,
    auth: AuthedPeer,
    Json(req): Json<CreatePartyRequest>,
) -> Result<(StatusCode, Json<PartyInfo>), ApiError> {
    let party_id = if req.party_id.is_empty() {
        generate_party_id()
    } else {
        validate_party_id(&req.party_id)?;
        req.party_id
    };

    let mut host = req.host;
    if host.peer_id.is_empty() {
        host.peer_id = auth.peer_id.clone();
    }
    auth.must_be(&host.peer_id)?;
    validate_peer(&host)?;
    host.touch();

    let party = PartyInfo::new(party_id, req.name, host);
    let created = state.db(|db| db.create_party(&party))?;
    if !created {
        return Err(ApiError(ControlError::Conflict(format!(
            "party {} already exists",
            party.party_id
        ))));
    }
    tracing::info!(party_id = %party.party_id, host_id = %party.host_id, "party created");
    Ok((StatusCode::CREATED, Json(party)))
}

async fn get_party(
    State(state): State<Arc<SharedState>>,
    _auth: AuthedPeer,
    Path(party_id): Path<String>,
) -> Result<Json<PartyInfo>, ApiError> {
    let party = state
        .db(|db| db.get_party(&party_id))?
        .ok_or(ControlError::NotFound)?;
    Ok(Json(party))
}

async fn join_party(
    State(state): State<Arc<SharedState>>,
    auth: AuthedPeer,
    Path(party_id): Path<String>,
    Json(req): Json<JoinPartyRequest>,
) -> Result<Json<PartyInfo>, ApiError> {
    let mut peer = req.peer;
    if peer.peer_id.is_empty() {
        peer.peer_id = auth.peer_id.clone();
    }
    auth.must_be(&peer.peer_id)?;
    validate_peer(&peer)?;
    peer.touch();

    let outcome = state.db(|db| db.join_party(&party_id, &peer))?;
    match outcome {
        JoinOutcome::NoParty => Err(ApiError(ControlError::NotFound)),
        JoinOutcome::Joined { newly_joined } => {
            let party = state
                .db(|db| db.get_party(&party_id))?
                .ok_or(ControlError::NotFound)?;
            if newly_joined {
                tracing::info!(party_id = %party_id, peer_id = %peer.peer_id, "peer joined");
                state.push_to_party(
                    &party_id,
                    Some(&peer.peer_id),
                    &ServerFrame::PeerJoined {
                        party_id: party_id.clone(),
                        peer: peer.clone(),
                    },
                );
            } else {
                // Rejoin replaced the record: ship the whole snapshot.
                state.push_to_party(
                    &party_id,
                    Some(&peer.peer_id),
                    &ServerFrame::PartyUpdate {
                        party: party.clone(),
                    },
                );
            }
            Ok(Json(party))
        }
    }
}

async fn leave_party(
    State(state): State<Arc<SharedState>>,
    auth: AuthedPeer,
    Path((party_id, peer_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.must_be(&peer_id)?;
    let outcome = state.db(|db| db.remove_peer(&party_id, &peer_id))?;
    match outcome {
        RemoveOutcome::NotFound => Err(ApiError(ControlError::NotFound)),
        RemoveOutcome::Removed { party_deleted, .. } => {
            tracing::info!(party_id = %party_id, peer_id = %peer_id, "peer left");
            if !party_deleted {
                state.push_to_party(
                    &party_id,
                    None,
                    &ServerFrame::PeerLeft {
                        party_id: party_id.clone(),
                        peer_id,
                    },
                );
            }
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

// ── Peers ──────────────────────────────────────────────────────────────

async fn list_peers(
    State(state): State<Arc<SharedState>>,
    _auth: AuthedPeer,
    Path(party_id): Path<String>,
) -> Result<Json<Vec<PeerInfo>>, ApiError> {
    let peers = state
        .db(|db| db.list_peers(&party_id))?
        .ok_or(ControlError::NotFound)?;
    Ok(Json(peers))
}

async fn get_peer(
    State(state): State<Arc<SharedState>>,
    _auth: AuthedPeer,
    Path((party_id, peer_id)): Path<(String, String)>,
) -> Result<Json<PeerInfo>, ApiError> {
    let peer = state
        .db(|db| db.get_peer(&party_id, &peer_id))?
        .ok_or(ControlError::NotFound)?;
    Ok(Json(peer))
}

async fn update_peer(
    State(state): State<Arc<SharedState>>,
    auth: AuthedPeer,
    Path((party_id, peer_id)): Path<(String, String)>,
    Json(mut peer): Json<PeerInfo>,
) -> Result<StatusCode, ApiError> {
    auth.must_be(&peer_id)?;
    peer.peer_id = peer_id;
    validate_peer(&peer)?;

    let updated = state.db(|db| db.update_peer(&party_id, &peer))?;
    if !updated {
        return Err(ApiError(ControlError::NotFound));
    }
    if let Some(party) = state.db(|db| db.get_party(&party_id))? {
        state.push_to_party(
            &party_id,
            Some(&peer.peer_id),
            &ServerFrame::PartyUpdate { party },
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<Arc<SharedState>>,
    auth: AuthedPeer,
    Path((party_id, peer_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.must_be(&peer_id)?;
    let touched = state.db(|db| db.touch_peer(&party_id, &peer_id, Utc::now()))?;
    if !touched {
        return Err(ApiError(ControlError::NotFound));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Relays ─────────────────────────────────────────────────────────────

async fn register_relay(
    State(state): State<Arc<SharedState>>,
    _auth: AuthedPeer,
    Json(mut relay): Json<RelayInfo>,
) -> Result<StatusCode, ApiError> {
    if relay.relay_id.is_empty() {
        return Err(ApiError(ControlError::Invalid(
            "relay_id must not be empty".into(),
        )));
    }
    relay.last_seen = Utc::now();
    state.db(|db| db.upsert_relay(&relay))?;
    Ok(StatusCode::CREATED)
}

async fn list_relays(
    State(state): State<Arc<SharedState>>,
    _auth: AuthedPeer,
) -> Result<Json<Vec<RelayInfo>>, ApiError> {
    let cutoff = Utc::now() - chrono::Duration::seconds(RELAY_TTL.as_secs() as i64);
    let relays = state.db(|db| db.list_relays(None, cutoff))?;
    Ok(Json(relays))
}

async fn list_relays_region(
    State(state): State<Arc<SharedState>>,
    _auth: AuthedPeer,
    Path(region): Path<String>,
) -> Result<Json<Vec<RelayInfo>>, ApiError> {
    let cutoff = Utc::now() - chrono::Duration::seconds(RELAY_TTL.as_secs() as i64);
    let relays = state.db(|db| db.list_relays(Some(&region), cutoff))?;
    Ok(Json(relays))
}

// ── Streaming channel ──────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<SharedState>) {
    // First frame must be a hello carrying a valid, unexpired token.
    let peer_id = match await_hello(&mut socket, &state).await {
        Some(peer_id) => peer_id,
        None => return,
    };
    tracing::debug!(peer_id = %peer_id, "streaming session established");

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(64);
    state.sessions.lock().insert(peer_id.clone(), tx.clone());

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_client_frame(&state, &peer_id, text.as_str());
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(peer_id = %peer_id, "streaming read error: {e}");
                        break;
                    }
                }
            }
            push = rx.recv() => {
                match push {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!("cannot serialize push frame: {e}");
                                continue;
                            }
                        };
                        let send = socket.send(WsMessage::Text(text.into()));
                        match tokio::time::timeout(WS_SEND_TIMEOUT, send).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => {
                                tracing::debug!(peer_id = %peer_id, "push send failed or timed out");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Drop the session only if it is still ours — a newer connection
    // for the same peer replaces the map entry.
    let mut sessions = state.sessions.lock();
    if sessions
        .get(&peer_id)
        .is_some_and(|current| current.same_channel(&tx))
    {
        sessions.remove(&peer_id);
    }
    drop(sessions);
    tracing::debug!(peer_id = %peer_id, "streaming session closed");
}

/// Wait for the hello frame and authenticate it. On failure an `error`
/// frame is sent (best-effort) and the socket dropped.
async fn await_hello(socket: &mut WebSocket, state: &Arc<SharedState>) -> Option<String> {
    let first = match tokio::time::timeout(HELLO_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        _ => return None,
    };
    let (token, peer_id) = match serde_json::from_str::<ClientFrame>(first.as_str()) {
        Ok(ClientFrame::Hello { token, peer_id }) => (token, peer_id),
        _ => {
            send_ws_error(socket, "invalid", "expected hello frame").await;
            return None;
        }
    };
    let valid = state
        .db(|db| db.lookup_token(&token))
        .ok()
        .flatten()
        .filter(|row| row.expires_at > Utc::now())
        .is_some_and(|row| row.peer_id == peer_id);
    if !valid {
        send_ws_error(socket, "auth", "invalid token for streaming session").await;
        return None;
    }
    Some(peer_id)
}

async fn send_ws_error(socket: &mut WebSocket, code: &str, message: &str) {
    let frame = ServerFrame::Error {
        code: code.to_string(),
        message: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(WsMessage::Text(text.into())).await;
    }
}

/// Route an inbound client frame. Only `signal` is meaningful after the
/// handshake; the sender must be a member of the party it names.
fn handle_client_frame(state: &Arc<SharedState>, sender: &str, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("ignoring unparsable client frame: {e}");
            return;
        }
    };
    match frame {
        ClientFrame::Signal { party_id, to, data } => {
            let is_member = state
                .db(|db| db.get_peer(&party_id, sender))
                .ok()
                .flatten()
                .is_some();
            if !is_member {
                tracing::debug!(peer_id = %sender, party_id = %party_id, "dropping signal from non-member");
                return;
            }
            state.push_to_peer(
                &to,
                ServerFrame::Signal {
                    party_id,
                    from: sender.to_string(),
                    data,
                },
            );
        }
        ClientFrame::Hello { .. } => {} // already authenticated
    }
}
