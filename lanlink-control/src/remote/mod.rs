//! Server-backed control plane.
//!
//! Translates the control-plane contract into HTTP calls against the
//! central server, keeps a local shadow of every joined party (updated
//! by push events and by successful responses), persists that shadow
//! with the write-behind persister, and runs one heartbeat task per
//! joined party.
//!
//! When retries exhaust, the client enters **degraded mode**: reads are
//! served from the shadow and liveness writes land there too, so the
//! rest of the application keeps functioning against slightly stale
//! data. The next successful request clears the flag.

mod http;
mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::persist::{ControlSnapshot, STATE_FILE, StatePersister};
use crate::plane::ControlPlane;
use crate::push::{ClientFrame, SignalEvent};
use crate::types::{
    CreatePartyRequest, JoinPartyRequest, PartyInfo, PeerInfo, RelayInfo, validate_party_id,
    validate_peer,
};
use http::{AuthState, HttpClient};
use stream::StreamHandle;

pub struct RemoteControlPlane {
    http: Arc<HttpClient>,
    state_dir: std::path::PathBuf,
    heartbeat_interval: Duration,
    /// Local shadow of joined parties: push-updated cache and the data
    /// source for degraded-mode reads.
    shadow: Arc<Mutex<HashMap<String, PartyInfo>>>,
    persister: Mutex<Option<StatePersister>>,
    heartbeats: Mutex<HashMap<String, JoinHandle<()>>>,
    stream: Mutex<Option<StreamHandle>>,
    stream_failed: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    signals: broadcast::Sender<SignalEvent>,
}

impl RemoteControlPlane {
    /// Build the remote variant. No network I/O here; the first real
    /// call registers auth lazily.
    pub fn new(config: &ControlConfig) -> Result<Self> {
        let url = config
            .control_server_url
            .as_deref()
            .ok_or_else(|| ControlError::Invalid("control_server_url is required".into()))?;
        let (signals, _) = broadcast::channel(64);
        Ok(Self {
            http: Arc::new(HttpClient::new(url)?),
            state_dir: config.state_dir.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval),
            shadow: Arc::new(Mutex::new(HashMap::new())),
            persister: Mutex::new(None),
            heartbeats: Mutex::new(HashMap::new()),
            stream: Mutex::new(None),
            stream_failed: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(AtomicBool::new(false)),
            signals,
        })
    }

    /// Whether the client is currently serving from the local shadow.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn note_result<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("control server reachable again, leaving degraded mode");
                }
            }
            Err(ControlError::Unavailable(_)) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!("control server unreachable, entering degraded mode");
                }
            }
            Err(_) => {}
        }
    }

    fn adopt_party(&self, party: PartyInfo) {
        self.shadow.lock().insert(party.party_id.clone(), party);
        self.queue_persist();
    }

    fn queue_persist(&self) {
        let guard = self.persister.lock();
        if let Some(persister) = guard.as_ref() {
            persister.queue(ControlSnapshot {
                parties: self.shadow.lock().clone(),
            });
        }
    }

    /// Start the streaming channel once auth is known. One-shot: a
    /// session whose channel failed permanently stays HTTP-only.
    fn ensure_stream(&self, auth: &AuthState) {
        if self.stream_failed.load(Ordering::Relaxed) {
            return;
        }
        let mut stream = self.stream.lock();
        if stream.is_some() {
            return;
        }
        let ws_url = match self.http.ws_url() {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("cannot derive streaming endpoint: {e}");
                self.stream_failed.store(true, Ordering::Relaxed);
                return;
            }
        };
        *stream = Some(stream::spawn(
            ws_url,
            auth.clone(),
            Arc::clone(&self.shadow),
            self.signals.clone(),
            Arc::clone(&self.http),
            Arc::clone(&self.stream_failed),
        ));
    }

    fn spawn_heartbeat(&self, party_id: String, peer_id: String) {
        let mut heartbeats = self.heartbeats.lock();
        if heartbeats.contains_key(&party_id) {
            return;
        }
        let http = Arc::clone(&self.http);
        let shadow = Arc::clone(&self.shadow);
        let interval = self.heartbeat_interval;
        let id = party_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the join itself just proved liveness
            loop {
                ticker.tick().await;
                match http.heartbeat(&id, &peer_id).await {
                    Ok(()) => {
                        if let Some(peer) = shadow
                            .lock()
                            .get_mut(&id)
                            .and_then(|party| party.peers.get_mut(&peer_id))
                        {
                            peer.touch();
                        }
                    }
                    Err(ControlError::NotFound) => {
                        tracing::info!(party_id = %id, "reaped by server, stopping heartbeat");
                        break;
                    }
                    Err(ControlError::Unavailable(e)) => {
                        tracing::debug!(party_id = %id, "heartbeat not delivered: {e}");
                    }
                    Err(e) => {
                        tracing::warn!(party_id = %id, "heartbeat failed: {e}");
                    }
                }
            }
        });
        heartbeats.insert(party_id, task);
    }

    fn stop_heartbeat(&self, party_id: &str) {
        if let Some(task) = self.heartbeats.lock().remove(party_id) {
            task.abort();
        }
    }
}

#[async_trait]
impl ControlPlane for RemoteControlPlane {
    async fn initialize(&self) -> Result<()> {
        // The shadow survives restarts as a cache; authoritative state
        // is always re-fetched from the server on use.
        let snapshot = StatePersister::load(&self.state_dir.join(STATE_FILE));
        if !snapshot.parties.is_empty() {
            tracing::info!("loaded {} shadowed parties from state file", snapshot.parties.len());
        }
        *self.shadow.lock() = snapshot.parties;
        *self.persister.lock() = Some(StatePersister::spawn(&self.state_dir));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(stream) = self.stream.lock().take() {
            stream.abort();
        }
        for (_, task) in self.heartbeats.lock().drain() {
            task.abort();
        }
        let persister = self.persister.lock().take();
        if let Some(persister) = persister {
            persister.shutdown().await;
        }
        Ok(())
    }

    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        mut host: PeerInfo,
    ) -> Result<PartyInfo> {
        validate_party_id(party_id)?;
        let auth = self.http.ensure_auth(&host.peer_id).await?;
        host.peer_id = auth.peer_id.clone();
        let req = CreatePartyRequest {
            party_id: party_id.to_string(),
            name: name.to_string(),
            host,
        };
        let result = self.http.create_party(&req).await;
        self.note_result(&result);
        let party = result?;
        self.adopt_party(party.clone());
        self.spawn_heartbeat(party.party_id.clone(), auth.peer_id.clone());
        self.ensure_stream(&auth);
        Ok(party)
    }

    async fn join_party(&self, party_id: &str, mut peer: PeerInfo) -> Result<PartyInfo> {
        let auth = self.http.ensure_auth(&peer.peer_id).await?;
        peer.peer_id = auth.peer_id.clone();
        validate_peer(&peer)?;
        let req = JoinPartyRequest { peer };
        let result = self.http.join_party(party_id, &req).await;
        self.note_result(&result);
        let party = result?;
        self.adopt_party(party.clone());
        self.spawn_heartbeat(party.party_id.clone(), auth.peer_id.clone());
        self.ensure_stream(&auth);
        Ok(party)
    }

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()> {
        let result = self.http.leave_party(party_id, peer_id).await;
        self.note_result(&result);
        result?;
        let ours = self
            .http
            .auth_state()
            .is_some_and(|auth| auth.peer_id == peer_id);
        if ours {
            self.stop_heartbeat(party_id);
            self.shadow.lock().remove(party_id);
            self.queue_persist();
        } else if let Some(party) = self.shadow.lock().get_mut(party_id) {
            party.peers.remove(peer_id);
        }
        Ok(())
    }

    async fn update_peer(&self, party_id: &str, peer: PeerInfo) -> Result<()> {
        validate_peer(&peer)?;
        let result = self.http.update_peer(party_id, &peer).await;
        self.note_result(&result);
        match result {
            Ok(()) => {
                if let Some(party) = self.shadow.lock().get_mut(party_id) {
                    party.peers.insert(peer.peer_id.clone(), peer);
                }
                self.queue_persist();
                Ok(())
            }
            // Degraded: accept the write locally so collaborators keep
            // seeing fresh endpoints; the server catches up via the
            // next successful update or rejoin.
            Err(ControlError::Unavailable(reason)) => {
                let mut shadow = self.shadow.lock();
                let party = shadow.get_mut(party_id).ok_or(ControlError::NotFound)?;
                if !party.peers.contains_key(&peer.peer_id) {
                    return Err(ControlError::NotFound);
                }
                tracing::warn!(party_id = %party_id, "queued peer update locally ({reason})");
                party.peers.insert(peer.peer_id.clone(), peer);
                drop(shadow);
                self.queue_persist();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_party(&self, party_id: &str) -> Result<PartyInfo> {
        let result = self.http.get_party(party_id).await;
        self.note_result(&result);
        match result {
            Ok(party) => {
                self.adopt_party(party.clone());
                Ok(party)
            }
            Err(ControlError::Unavailable(reason)) => {
                match self.shadow.lock().get(party_id).cloned() {
                    Some(party) => {
                        tracing::warn!(party_id = %party_id, "serving party from shadow ({reason})");
                        Ok(party)
                    }
                    None => Err(ControlError::Unavailable(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_peers(&self, party_id: &str) -> Result<HashMap<String, PeerInfo>> {
        let result = self.http.list_peers(party_id).await;
        self.note_result(&result);
        match result {
            Ok(peers) => {
                let map: HashMap<String, PeerInfo> = peers
                    .into_iter()
                    .map(|peer| (peer.peer_id.clone(), peer))
                    .collect();
                if let Some(party) = self.shadow.lock().get_mut(party_id) {
                    party.peers = map.clone();
                }
                self.queue_persist();
                Ok(map)
            }
            Err(ControlError::Unavailable(reason)) => {
                match self.shadow.lock().get(party_id) {
                    Some(party) => {
                        tracing::warn!(party_id = %party_id, "serving peers from shadow ({reason})");
                        Ok(party.peers.clone())
                    }
                    None => Err(ControlError::Unavailable(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<PeerInfo> {
        let result = self.http.get_peer(party_id, peer_id).await;
        self.note_result(&result);
        match result {
            Ok(peer) => {
                if let Some(party) = self.shadow.lock().get_mut(party_id) {
                    party.peers.insert(peer.peer_id.clone(), peer.clone());
                }
                Ok(peer)
            }
            Err(ControlError::Unavailable(reason)) => self
                .shadow
                .lock()
                .get(party_id)
                .and_then(|party| party.peers.get(peer_id))
                .cloned()
                .ok_or(ControlError::Unavailable(reason)),
            Err(e) => Err(e),
        }
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()> {
        let result = self.http.heartbeat(party_id, peer_id).await;
        self.note_result(&result);
        match result {
            Ok(()) | Err(ControlError::Unavailable(_)) => {
                // Liveness bookkeeping continues locally while degraded.
                if let Some(peer) = self
                    .shadow
                    .lock()
                    .get_mut(party_id)
                    .and_then(|party| party.peers.get_mut(peer_id))
                {
                    peer.touch();
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn discover_parties(&self) -> Result<Vec<PartyInfo>> {
        // Party ids are unguessable invites; the server exposes no
        // global listing. What we can discover is what we shadow.
        Ok(self.shadow.lock().values().cloned().collect())
    }

    async fn register_relay(&self, mut relay: RelayInfo) -> Result<()> {
        relay.last_seen = Utc::now();
        let result = self.http.register_relay(&relay).await;
        self.note_result(&result);
        result
    }

    async fn list_relays(&self, region: Option<&str>) -> Result<Vec<RelayInfo>> {
        let result = self.http.list_relays(region).await;
        self.note_result(&result);
        result
    }

    async fn send_signal(&self, party_id: &str, to: &str, data: serde_json::Value) -> Result<()> {
        let stream = self.stream.lock();
        let Some(handle) = stream.as_ref() else {
            return Err(ControlError::Unavailable(
                "streaming channel not connected".into(),
            ));
        };
        handle
            .outgoing
            .send(ClientFrame::Signal {
                party_id: party_id.to_string(),
                to: to.to_string(),
                data,
            })
            .map_err(|_| ControlError::Unavailable("streaming channel closed".into()))
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<SignalEvent> {
        self.signals.subscribe()
    }
}
