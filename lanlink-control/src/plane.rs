//! The control-plane contract and its local implementation.
//!
//! Both variants — local file-backed and remote server-backed — present
//! the same operation set to the party manager and NAT collaborators.
//! The factory picks one from configuration; construction never touches
//! the network, and a remote variant that cannot even be constructed
//! degrades to local with a warning rather than crashing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::ControlConfig;
use crate::discovery::DiscoveryFile;
use crate::error::Result;
use crate::membership::MembershipCore;
use crate::push::SignalEvent;
use crate::remote::RemoteControlPlane;
use crate::types::{PartyInfo, PeerInfo, RelayInfo};

/// How long a relay registration stays listed without a refresh.
pub const RELAY_TTL: Duration = Duration::from_secs(120);

/// The rendezvous/membership contract.
///
/// All operations are asynchronous; the local variant's map mutations
/// never actually suspend, but the remote variant's do, and callers
/// should not care which one they hold.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Load persisted state and start background tasks. I/O problems on
    /// state load are non-fatal.
    async fn initialize(&self) -> Result<()>;

    /// Cancel background tasks and flush state to disk.
    async fn shutdown(&self) -> Result<()>;

    async fn register_party(&self, party_id: &str, name: &str, host: PeerInfo)
    -> Result<PartyInfo>;

    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo>;

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()>;

    /// Publish a fresh peer record (endpoints, NAT classification).
    async fn update_peer(&self, party_id: &str, peer: PeerInfo) -> Result<()>;

    async fn get_party(&self, party_id: &str) -> Result<PartyInfo>;

    async fn get_peers(&self, party_id: &str) -> Result<HashMap<String, PeerInfo>>;

    async fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<PeerInfo>;

    /// Refresh this peer's liveness.
    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()>;

    /// Parties visible to this node: the shared discovery file for the
    /// local variant, the joined-party shadow for the remote one.
    async fn discover_parties(&self) -> Result<Vec<PartyInfo>>;

    async fn register_relay(&self, relay: RelayInfo) -> Result<()>;

    async fn list_relays(&self, region: Option<&str>) -> Result<Vec<RelayInfo>>;

    /// Send an opaque NAT-traversal blob to another party member.
    /// Best-effort; only the remote variant has a transport for it.
    async fn send_signal(&self, party_id: &str, to: &str, data: serde_json::Value) -> Result<()>;

    /// Subscribe to inbound signal events for the NAT collaborator.
    fn subscribe_signals(&self) -> broadcast::Receiver<SignalEvent>;
}

/// Construct the variant the configuration asks for.
///
/// Remote requires a non-empty, non-placeholder `control_server_url`.
/// No network I/O happens here; the caller drives `initialize()`.
pub fn control_plane_from_config(config: &ControlConfig) -> Box<dyn ControlPlane> {
    if config.wants_remote() {
        match RemoteControlPlane::new(config) {
            Ok(remote) => {
                tracing::info!(
                    "using remote control plane at {}",
                    config.control_server_url.as_deref().unwrap_or_default()
                );
                return Box::new(remote);
            }
            Err(e) => {
                tracing::warn!("remote control plane unavailable ({e}), degrading to local");
            }
        }
    } else {
        tracing::info!("using local control plane in {}", config.state_dir.display());
    }
    Box::new(LocalControlPlane::new(config))
}

/// File-backed control plane for same-host or same-LAN rendezvous.
///
/// The membership core holds the authoritative map; the discovery file
/// lets other local processes find advertised parties by polling.
pub struct LocalControlPlane {
    core: MembershipCore,
    discovery: DiscoveryFile,
    relays: Mutex<HashMap<String, RelayInfo>>,
    signals: broadcast::Sender<SignalEvent>,
}

impl LocalControlPlane {
    pub fn new(config: &ControlConfig) -> Self {
        let stale_ttl = Duration::from_secs(config.stale_ttl);
        let (signals, _) = broadcast::channel(64);
        Self {
            core: MembershipCore::new(
                config.state_dir.clone(),
                stale_ttl,
                Duration::from_secs(config.reaper_interval),
            ),
            discovery: DiscoveryFile::new(&config.state_dir, stale_ttl),
            relays: Mutex::new(HashMap::new()),
            signals,
        }
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn initialize(&self) -> Result<()> {
        self.core.initialize();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await;
        Ok(())
    }

    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        host: PeerInfo,
    ) -> Result<PartyInfo> {
        let party = self.core.register_party(party_id, name, host)?;
        self.discovery.announce(&party);
        Ok(party)
    }

    async fn join_party(&self, party_id: &str, peer: PeerInfo) -> Result<PartyInfo> {
        let party = self.core.join_party(party_id, peer)?;
        self.discovery.announce(&party);
        Ok(party)
    }

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()> {
        self.core.leave_party(party_id, peer_id)?;
        match self.core.get_party(party_id) {
            Ok(party) => self.discovery.announce(&party),
            Err(_) => self.discovery.retract(party_id),
        }
        Ok(())
    }

    async fn update_peer(&self, party_id: &str, peer: PeerInfo) -> Result<()> {
        self.core.update_peer(party_id, peer)
    }

    async fn get_party(&self, party_id: &str) -> Result<PartyInfo> {
        self.core.get_party(party_id)
    }

    async fn get_peers(&self, party_id: &str) -> Result<HashMap<String, PeerInfo>> {
        self.core.get_peers(party_id)
    }

    async fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<PeerInfo> {
        self.core.discover_peer(party_id, peer_id)
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()> {
        self.core.heartbeat(party_id, peer_id)
    }

    async fn discover_parties(&self) -> Result<Vec<PartyInfo>> {
        Ok(self.discovery.read_parties())
    }

    async fn register_relay(&self, relay: RelayInfo) -> Result<()> {
        let mut relay = relay;
        relay.last_seen = Utc::now();
        self.relays.lock().insert(relay.relay_id.clone(), relay);
        Ok(())
    }

    async fn list_relays(&self, region: Option<&str>) -> Result<Vec<RelayInfo>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(RELAY_TTL.as_secs() as i64);
        Ok(self
            .relays
            .lock()
            .values()
            .filter(|relay| relay.last_seen >= cutoff)
            .filter(|relay| region.is_none_or(|r| relay.region == r))
            .cloned()
            .collect())
    }

    async fn send_signal(&self, party_id: &str, to: &str, _data: serde_json::Value) -> Result<()> {
        // Same-host peers exchange NAT metadata through the membership
        // map itself; there is no push transport to carry a blob.
        tracing::debug!(party_id = %party_id, to = %to, "dropping signal: local variant has no streaming channel");
        Ok(())
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<SignalEvent> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(dir: &std::path::Path) -> ControlConfig {
        ControlConfig {
            state_dir: dir.to_path_buf(),
            ..ControlConfig::default()
        }
    }

    #[tokio::test]
    async fn factory_defaults_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let plane = control_plane_from_config(&local_config(dir.path()));
        plane.initialize().await.unwrap();
        plane
            .register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .await
            .unwrap();
        let peers = plane.get_peers("a1b2c3d4e5f6").await.unwrap();
        assert!(peers.contains_key("h"));
        plane.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn two_local_processes_rendezvous_via_discovery_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());

        let process_a = LocalControlPlane::new(&config);
        process_a.initialize().await.unwrap();
        process_a
            .register_party("deadbeef0001", "Test", PeerInfo::new("h", "Host"))
            .await
            .unwrap();

        // A second instance sharing the state dir sees the advert.
        let process_b = LocalControlPlane::new(&config);
        let found = process_b.discover_parties().await.unwrap();
        assert!(
            found
                .iter()
                .any(|p| p.party_id == "deadbeef0001" && p.host_id == "h")
        );
        process_a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn relay_listing_filters_by_region() {
        let dir = tempfile::tempdir().unwrap();
        let plane = LocalControlPlane::new(&local_config(dir.path()));
        for (id, region) in [("r1", "eu-west"), ("r2", "us-east"), ("r3", "eu-west")] {
            plane
                .register_relay(RelayInfo {
                    relay_id: id.into(),
                    region: region.into(),
                    endpoint_ip: "198.51.100.7".into(),
                    endpoint_port: 3478,
                    capacity: 100,
                    current_load: 0,
                    last_seen: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(plane.list_relays(None).await.unwrap().len(), 3);
        assert_eq!(plane.list_relays(Some("eu-west")).await.unwrap().len(), 2);
        assert_eq!(plane.list_relays(Some("ap-south")).await.unwrap().len(), 0);
    }
}
