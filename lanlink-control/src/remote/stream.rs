//! Long-lived streaming channel with reconnect and HTTP fallback.
//!
//! One worker task owns the WebSocket for its whole life: it connects,
//! sends the `hello` frame, resyncs the shadow over HTTP (push events
//! may have been lost while disconnected), then consumes server frames
//! strictly in arrival order. On connection loss it retries up to five
//! times with doubling delays; after that the session is demoted to
//! pure HTTP for good — re-upgrading is deliberately not attempted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::push::{ClientFrame, ServerFrame, SignalEvent};
use crate::remote::http::{AuthState, HttpClient};
use crate::types::PartyInfo;

/// Reconnect attempts before demoting the session to HTTP-only.
const MAX_RECONNECTS: u32 = 5;

pub(crate) struct StreamHandle {
    pub outgoing: mpsc::UnboundedSender<ClientFrame>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the streaming worker. `failed` flips to true when the channel
/// is permanently demoted.
pub(crate) fn spawn(
    ws_url: Url,
    auth: AuthState,
    shadow: Arc<Mutex<HashMap<String, PartyInfo>>>,
    signals: broadcast::Sender<SignalEvent>,
    http: Arc<HttpClient>,
    failed: Arc<AtomicBool>,
) -> StreamHandle {
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(ws_url, auth, shadow, signals, http, failed, outgoing_rx));
    StreamHandle { outgoing, task }
}

enum StreamEnd {
    /// Connection dropped; retry per policy.
    Retry,
    /// Server rejected the channel (auth); give up for this session.
    Terminate,
}

async fn run(
    ws_url: Url,
    auth: AuthState,
    shadow: Arc<Mutex<HashMap<String, PartyInfo>>>,
    signals: broadcast::Sender<SignalEvent>,
    http: Arc<HttpClient>,
    failed: Arc<AtomicBool>,
    mut outgoing: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let mut attempt = 0u32;
    loop {
        match tokio_tungstenite::connect_async(ws_url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!("streaming channel connected to {ws_url}");
                attempt = 0;
                resync(&http, &shadow).await;
                match consume(ws, &auth, &shadow, &signals, &mut outgoing).await {
                    StreamEnd::Retry => {}
                    StreamEnd::Terminate => break,
                }
            }
            Err(e) => {
                tracing::debug!("streaming connect to {ws_url} failed: {e}");
            }
        }
        attempt += 1;
        if attempt > MAX_RECONNECTS {
            tracing::warn!(
                "streaming channel lost after {MAX_RECONNECTS} reconnect attempts, \
                 falling back to HTTP for the rest of this session"
            );
            failed.store(true, Ordering::Relaxed);
            break;
        }
        let delay = Duration::from_secs(1 << (attempt - 1));
        tracing::info!("reconnecting streaming channel in {delay:?} ({attempt}/{MAX_RECONNECTS})");
        tokio::time::sleep(delay).await;
    }
}

/// Re-fetch every shadowed party over HTTP. Events lost while the
/// channel was down must not leave the shadow stale forever.
async fn resync(http: &HttpClient, shadow: &Mutex<HashMap<String, PartyInfo>>) {
    let party_ids: Vec<String> = shadow.lock().keys().cloned().collect();
    for party_id in party_ids {
        match http.get_party(&party_id).await {
            Ok(party) => {
                shadow.lock().insert(party_id, party);
            }
            Err(crate::error::ControlError::NotFound) => {
                tracing::info!(party_id = %party_id, "party vanished while disconnected");
                shadow.lock().remove(&party_id);
            }
            Err(e) => tracing::debug!(party_id = %party_id, "resync failed: {e}"),
        }
    }
}

async fn consume(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    auth: &AuthState,
    shadow: &Mutex<HashMap<String, PartyInfo>>,
    signals: &broadcast::Sender<SignalEvent>,
    outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>,
) -> StreamEnd {
    let (mut sink, mut stream) = ws.split();

    let hello = ClientFrame::Hello {
        token: auth.token.clone(),
        peer_id: auth.peer_id.clone(),
    };
    if send_frame(&mut sink, &hello).await.is_err() {
        return StreamEnd::Retry;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => {
                                if let StreamEnd::Terminate = apply(frame, shadow, signals) {
                                    return StreamEnd::Terminate;
                                }
                            }
                            Err(e) => tracing::debug!("ignoring unparsable push frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return StreamEnd::Retry,
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(e)) => {
                        tracing::debug!("streaming read error: {e}");
                        return StreamEnd::Retry;
                    }
                }
            }
            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return StreamEnd::Retry;
                        }
                    }
                    None => return StreamEnd::Terminate, // client dropped
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), ()>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("cannot serialize outbound frame: {e}");
            return Ok(());
        }
    };
    sink.send(WsMessage::text(text)).await.map_err(|_| {
        tracing::debug!("streaming send failed");
    })
}

/// Apply one push frame to the shadow. Runs on the single consumer
/// task, so frames mutate the shadow strictly in arrival order.
fn apply(
    frame: ServerFrame,
    shadow: &Mutex<HashMap<String, PartyInfo>>,
    signals: &broadcast::Sender<SignalEvent>,
) -> StreamEnd {
    match frame {
        ServerFrame::PartyUpdate { party } => {
            shadow.lock().insert(party.party_id.clone(), party);
        }
        ServerFrame::PeerJoined { party_id, peer } => {
            if let Some(party) = shadow.lock().get_mut(&party_id) {
                party.peers.insert(peer.peer_id.clone(), peer);
            }
        }
        ServerFrame::PeerLeft { party_id, peer_id } => {
            let mut shadow = shadow.lock();
            if let Some(party) = shadow.get_mut(&party_id) {
                party.peers.remove(&peer_id);
                if party.peers.is_empty() {
                    shadow.remove(&party_id);
                }
            }
        }
        ServerFrame::Signal {
            party_id,
            from,
            data,
        } => {
            // No subscribers is fine; the NAT layer may not be up yet.
            let _ = signals.send(SignalEvent {
                party_id,
                from,
                data,
            });
        }
        ServerFrame::Error { code, message } => {
            if code == "auth" {
                tracing::warn!("server closed streaming channel: {message}");
                return StreamEnd::Terminate;
            }
            tracing::warn!("streaming error from server ({code}): {message}");
        }
    }
    StreamEnd::Retry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerInfo;

    fn shadow_with_party() -> Mutex<HashMap<String, PartyInfo>> {
        let mut map = HashMap::new();
        map.insert(
            "a1b2c3d4e5f6".to_string(),
            PartyInfo::new("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host")),
        );
        Mutex::new(map)
    }

    #[test]
    fn peer_joined_updates_shadow() {
        let shadow = shadow_with_party();
        let (signals, _) = broadcast::channel(4);
        apply(
            ServerFrame::PeerJoined {
                party_id: "a1b2c3d4e5f6".into(),
                peer: PeerInfo::new("j", "Joiner"),
            },
            &shadow,
            &signals,
        );
        assert_eq!(shadow.lock()["a1b2c3d4e5f6"].peers.len(), 2);
    }

    #[test]
    fn last_peer_left_drops_shadow_party() {
        let shadow = shadow_with_party();
        let (signals, _) = broadcast::channel(4);
        apply(
            ServerFrame::PeerLeft {
                party_id: "a1b2c3d4e5f6".into(),
                peer_id: "h".into(),
            },
            &shadow,
            &signals,
        );
        assert!(shadow.lock().is_empty());
    }

    #[test]
    fn signal_reaches_subscribers() {
        let shadow = shadow_with_party();
        let (signals, mut rx) = broadcast::channel(4);
        apply(
            ServerFrame::Signal {
                party_id: "a1b2c3d4e5f6".into(),
                from: "h".into(),
                data: serde_json::json!({"port": 4242}),
            },
            &shadow,
            &signals,
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.from, "h");
        assert_eq!(event.data["port"], 4242);
    }

    #[test]
    fn auth_error_terminates_channel() {
        let shadow = shadow_with_party();
        let (signals, _) = broadcast::channel(4);
        let end = apply(
            ServerFrame::Error {
                code: "auth".into(),
                message: "token expired".into(),
            },
            &shadow,
            &signals,
        );
        assert!(matches!(end, StreamEnd::Terminate));
    }
}
