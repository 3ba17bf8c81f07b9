//! In-memory membership core.
//!
//! Owns the authoritative party/peer map for the local variant. All map
//! mutations are O(1) critical sections behind a single mutex; disk and
//! network never happen under the lock. Every mutation queues a snapshot
//! with the write-behind persister. A background reaper drops peers that
//! stopped heartbeating and deletes parties that emptied out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{ControlError, Result};
use crate::persist::{ControlSnapshot, STATE_FILE, StatePersister};
use crate::types::{PartyInfo, PeerInfo, validate_party_id, validate_peer};

#[derive(Clone)]
pub struct MembershipCore {
    inner: Arc<Inner>,
}

struct Inner {
    state_dir: PathBuf,
    stale_ttl: chrono::Duration,
    reaper_interval: Duration,
    parties: Mutex<HashMap<String, PartyInfo>>,
    /// Started by `initialize()`. Mutations before that skip persistence.
    persister: Mutex<Option<StatePersister>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipCore {
    pub fn new(state_dir: PathBuf, stale_ttl: Duration, reaper_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state_dir,
                stale_ttl: chrono::Duration::seconds(stale_ttl.as_secs() as i64),
                reaper_interval,
                parties: Mutex::new(HashMap::new()),
                persister: Mutex::new(None),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Load persisted state and start the persister and reaper tasks.
    /// A bad state file is non-fatal: warn and start empty.
    pub fn initialize(&self) {
        let snapshot = StatePersister::load(&self.inner.state_dir.join(STATE_FILE));
        if !snapshot.parties.is_empty() {
            tracing::info!("loaded {} parties from state file", snapshot.parties.len());
        }
        *self.inner.parties.lock() = snapshot.parties;
        *self.inner.persister.lock() = Some(StatePersister::spawn(&self.inner.state_dir));

        let core = self.clone();
        let interval = self.inner.reaper_interval;
        *self.inner.reaper.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                core.reap(Utc::now());
            }
        }));
    }

    /// Stop the reaper and flush pending state to disk.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        let persister = self.inner.persister.lock().take();
        if let Some(persister) = persister {
            persister.shutdown().await;
        }
    }

    pub fn register_party(&self, party_id: &str, name: &str, mut host: PeerInfo) -> Result<PartyInfo> {
        validate_party_id(party_id)?;
        validate_peer(&host)?;
        host.touch();
        let party = {
            let mut parties = self.inner.parties.lock();
            if parties.contains_key(party_id) {
                return Err(ControlError::Conflict(format!(
                    "party {party_id} already exists"
                )));
            }
            let party = PartyInfo::new(party_id, name, host);
            parties.insert(party_id.to_string(), party.clone());
            party
        };
        self.queue_persist();
        Ok(party)
    }

    /// Add a peer to a party. Joining again with the same peer_id
    /// replaces the older record (idempotent rejoin).
    pub fn join_party(&self, party_id: &str, mut peer: PeerInfo) -> Result<PartyInfo> {
        validate_peer(&peer)?;
        peer.touch();
        let party = {
            let mut parties = self.inner.parties.lock();
            let party = parties.get_mut(party_id).ok_or(ControlError::NotFound)?;
            party.peers.insert(peer.peer_id.clone(), peer);
            party.clone()
        };
        self.queue_persist();
        Ok(party)
    }

    pub fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<()> {
        {
            let mut parties = self.inner.parties.lock();
            let party = parties.get_mut(party_id).ok_or(ControlError::NotFound)?;
            if party.peers.remove(peer_id).is_none() {
                return Err(ControlError::NotFound);
            }
            if party.peers.is_empty() {
                parties.remove(party_id);
            } else if party.host_id == peer_id {
                promote_host(party);
            }
        }
        self.queue_persist();
        Ok(())
    }

    /// Replace a peer's record (NAT layer publishing fresh endpoints).
    /// The peer must already be a member.
    pub fn update_peer(&self, party_id: &str, mut peer: PeerInfo) -> Result<()> {
        validate_peer(&peer)?;
        {
            let mut parties = self.inner.parties.lock();
            let party = parties.get_mut(party_id).ok_or(ControlError::NotFound)?;
            let existing = party
                .peers
                .get(&peer.peer_id)
                .ok_or(ControlError::NotFound)?;
            peer.last_seen = Utc::now().max(existing.last_seen);
            party.peers.insert(peer.peer_id.clone(), peer);
        }
        self.queue_persist();
        Ok(())
    }

    pub fn get_party(&self, party_id: &str) -> Result<PartyInfo> {
        self.inner
            .parties
            .lock()
            .get(party_id)
            .cloned()
            .ok_or(ControlError::NotFound)
    }

    pub fn get_peers(&self, party_id: &str) -> Result<HashMap<String, PeerInfo>> {
        self.inner
            .parties
            .lock()
            .get(party_id)
            .map(|party| party.peers.clone())
            .ok_or(ControlError::NotFound)
    }

    pub fn discover_peer(&self, party_id: &str, peer_id: &str) -> Result<PeerInfo> {
        self.inner
            .parties
            .lock()
            .get(party_id)
            .and_then(|party| party.peers.get(peer_id))
            .cloned()
            .ok_or(ControlError::NotFound)
    }

    pub fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<()> {
        {
            let mut parties = self.inner.parties.lock();
            let party = parties.get_mut(party_id).ok_or(ControlError::NotFound)?;
            let peer = party.peers.get_mut(peer_id).ok_or(ControlError::NotFound)?;
            peer.touch();
        }
        self.queue_persist();
        Ok(())
    }

    pub fn list_parties(&self) -> Vec<PartyInfo> {
        self.inner.parties.lock().values().cloned().collect()
    }

    /// One reaper pass: drop peers unseen for longer than the stale TTL,
    /// delete parties that emptied out, keep `host_id` pointing at a
    /// member. Returns whether anything changed.
    pub fn reap(&self, now: DateTime<Utc>) -> bool {
        let mut mutated = false;
        {
            let mut parties = self.inner.parties.lock();
            let stale_ttl = self.inner.stale_ttl;
            parties.retain(|party_id, party| {
                let before = party.peers.len();
                party.peers.retain(|peer_id, peer| {
                    let live = now.signed_duration_since(peer.last_seen) <= stale_ttl;
                    if !live {
                        tracing::info!(party_id = %party_id, peer_id = %peer_id, "reaped stale peer");
                    }
                    live
                });
                if party.peers.len() != before {
                    mutated = true;
                }
                if party.peers.is_empty() {
                    tracing::info!(party_id = %party_id, "deleted empty party");
                    mutated = true;
                    return false;
                }
                if !party.peers.contains_key(&party.host_id) {
                    promote_host(party);
                }
                true
            });
        }
        if mutated {
            self.queue_persist();
        }
        mutated
    }

    fn queue_persist(&self) {
        let guard = self.inner.persister.lock();
        if let Some(persister) = guard.as_ref() {
            let snapshot = ControlSnapshot {
                parties: self.inner.parties.lock().clone(),
            };
            persister.queue(snapshot);
        }
    }

    #[cfg(test)]
    fn set_last_seen(&self, party_id: &str, peer_id: &str, at: DateTime<Utc>) {
        let mut parties = self.inner.parties.lock();
        let peer = parties
            .get_mut(party_id)
            .and_then(|party| party.peers.get_mut(peer_id))
            .unwrap();
        peer.last_seen = at;
    }
}

/// Deterministically pick a new host from the remaining members.
fn promote_host(party: &mut PartyInfo) {
    if let Some(next) = party.peers.keys().min().cloned() {
        tracing::debug!(party_id = %party.party_id, host_id = %next, "promoted new host");
        party.host_id = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> (tempfile::TempDir, MembershipCore) {
        let dir = tempfile::tempdir().unwrap();
        let core = MembershipCore::new(
            dir.path().to_path_buf(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        (dir, core)
    }

    #[test]
    fn register_then_conflict() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        let err = core
            .register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h2", "Other"))
            .unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
    }

    #[test]
    fn host_is_member_after_register() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        let party = core.get_party("a1b2c3d4e5f6").unwrap();
        assert_eq!(party.host_id, "h");
        assert!(core.get_peers("a1b2c3d4e5f6").unwrap().contains_key("h"));
    }

    #[test]
    fn rejoin_is_idempotent() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        let mut joiner = PeerInfo::new("j", "Joiner");
        core.join_party("a1b2c3d4e5f6", joiner.clone()).unwrap();
        joiner.name = "Joiner v2".to_string();
        core.join_party("a1b2c3d4e5f6", joiner).unwrap();

        let peers = core.get_peers("a1b2c3d4e5f6").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers["j"].name, "Joiner v2");
    }

    #[test]
    fn join_unknown_party() {
        let (_dir, core) = core();
        let err = core
            .join_party("a1b2c3d4e5f6", PeerInfo::new("j", "Joiner"))
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound));
    }

    #[test]
    fn leaving_host_promotes_another_member() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        core.join_party("a1b2c3d4e5f6", PeerInfo::new("j", "Joiner"))
            .unwrap();
        core.leave_party("a1b2c3d4e5f6", "h").unwrap();

        let party = core.get_party("a1b2c3d4e5f6").unwrap();
        assert_eq!(party.host_id, "j");
    }

    #[test]
    fn last_leave_deletes_party() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        core.join_party("a1b2c3d4e5f6", PeerInfo::new("j", "Joiner"))
            .unwrap();
        core.leave_party("a1b2c3d4e5f6", "j").unwrap();
        core.leave_party("a1b2c3d4e5f6", "h").unwrap();
        assert!(matches!(
            core.get_party("a1b2c3d4e5f6"),
            Err(ControlError::NotFound)
        ));
    }

    #[test]
    fn update_requires_membership() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        let err = core
            .update_peer("a1b2c3d4e5f6", PeerInfo::new("ghost", "Ghost"))
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound));
    }

    #[test]
    fn heartbeat_is_monotonic() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        let t0 = core.discover_peer("a1b2c3d4e5f6", "h").unwrap().last_seen;
        core.heartbeat("a1b2c3d4e5f6", "h").unwrap();
        let t1 = core.discover_peer("a1b2c3d4e5f6", "h").unwrap().last_seen;
        core.heartbeat("a1b2c3d4e5f6", "h").unwrap();
        let t2 = core.discover_peer("a1b2c3d4e5f6", "h").unwrap().last_seen;
        assert!(t0 <= t1 && t1 <= t2);
    }

    #[test]
    fn reap_drops_stale_peers_and_promotes() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        core.join_party("a1b2c3d4e5f6", PeerInfo::new("j", "Joiner"))
            .unwrap();
        core.set_last_seen(
            "a1b2c3d4e5f6",
            "h",
            Utc::now() - chrono::Duration::seconds(600),
        );

        assert!(core.reap(Utc::now()));

        let party = core.get_party("a1b2c3d4e5f6").unwrap();
        assert_eq!(party.peers.len(), 1);
        assert!(party.peers.contains_key("j"));
        assert_eq!(party.host_id, "j");
    }

    #[test]
    fn reap_deletes_fully_stale_party() {
        let (_dir, core) = core();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(600);
        assert!(core.reap(later));
        assert!(matches!(
            core.get_party("a1b2c3d4e5f6"),
            Err(ControlError::NotFound)
        ));
    }

    #[tokio::test]
    async fn persist_roundtrip_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ttl = Duration::from_secs(300);
        let every = Duration::from_secs(60);

        let core = MembershipCore::new(dir.path().to_path_buf(), ttl, every);
        core.initialize();
        core.register_party("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"))
            .unwrap();
        core.join_party("a1b2c3d4e5f6", PeerInfo::new("j", "Joiner"))
            .unwrap();
        core.shutdown().await;

        let reborn = MembershipCore::new(dir.path().to_path_buf(), ttl, every);
        reborn.initialize();
        let party = reborn.get_party("a1b2c3d4e5f6").unwrap();
        assert_eq!(party.peers.len(), 2);
        assert_eq!(party.host_id, "h");
        reborn.shutdown().await;
    }
}
