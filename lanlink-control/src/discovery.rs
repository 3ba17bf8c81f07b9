//! Same-host party discovery via a shared file.
//!
//! Local-variant processes rendezvous by reading and writing
//! `discovery.json` in a shared state directory. No broadcast or
//! multicast at this layer: peers poll the file. Writes use the same
//! temp-file-and-rename pattern as the state persister, so a reader
//! never sees a torn file. Entries carry a freshness stamp; adverts
//! from crashed processes age out on read and are dropped on the next
//! write.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist::write_atomic;
use crate::types::PartyInfo;

/// File name of the shared discovery map inside the state dir.
pub const DISCOVERY_FILE: &str = "discovery.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiscoveryEntry {
    party: PartyInfo,
    advertised_at: DateTime<Utc>,
    /// Advertising process id (informational).
    pid: u32,
}

pub struct DiscoveryFile {
    path: PathBuf,
    stale_ttl: chrono::Duration,
}

impl DiscoveryFile {
    pub fn new(state_dir: &std::path::Path, stale_ttl: std::time::Duration) -> Self {
        Self {
            path: state_dir.join(DISCOVERY_FILE),
            stale_ttl: chrono::Duration::seconds(stale_ttl.as_secs() as i64),
        }
    }

    /// Advertise (or refresh) a party in the shared file.
    /// Errors are logged and swallowed: discovery is best-effort.
    pub fn announce(&self, party: &PartyInfo) {
        self.rewrite(|entries| {
            entries.insert(
                party.party_id.clone(),
                DiscoveryEntry {
                    party: party.clone(),
                    advertised_at: Utc::now(),
                    pid: std::process::id(),
                },
            );
        });
    }

    /// Remove a party's advertisement.
    pub fn retract(&self, party_id: &str) {
        self.rewrite(|entries| {
            entries.remove(party_id);
        });
    }

    /// Re-read the file and return all currently advertised parties.
    pub fn read_parties(&self) -> Vec<PartyInfo> {
        let now = Utc::now();
        self.read_entries()
            .into_values()
            .filter(|entry| now.signed_duration_since(entry.advertised_at) <= self.stale_ttl)
            .map(|entry| entry.party)
            .collect()
    }

    fn read_entries(&self) -> HashMap<String, DiscoveryEntry> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("corrupt discovery file {}: {e}", self.path.display());
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!("cannot read discovery file {}: {e}", self.path.display());
                HashMap::new()
            }
        }
    }

    fn rewrite(&self, mutate: impl FnOnce(&mut HashMap<String, DiscoveryEntry>)) {
        let now = Utc::now();
        let mut entries = self.read_entries();
        entries.retain(|_, entry| now.signed_duration_since(entry.advertised_at) <= self.stale_ttl);
        mutate(&mut entries);
        match serde_json::to_vec_pretty(&entries) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.path, &bytes) {
                    tracing::warn!("cannot write discovery file {}: {e}", self.path.display());
                }
            }
            Err(e) => tracing::warn!("cannot serialize discovery entries: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerInfo;
    use std::time::Duration;

    #[test]
    fn announce_and_discover_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiscoveryFile::new(dir.path(), Duration::from_secs(300));
        let reader = DiscoveryFile::new(dir.path(), Duration::from_secs(300));

        let party = PartyInfo::new("deadbeef0001", "Test", PeerInfo::new("h", "Host"));
        writer.announce(&party);

        let found = reader.read_parties();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].party_id, "deadbeef0001");
        assert_eq!(found[0].host_id, "h");
    }

    #[test]
    fn retract_removes_advertisement() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = DiscoveryFile::new(dir.path(), Duration::from_secs(300));
        let party = PartyInfo::new("deadbeef0001", "Test", PeerInfo::new("h", "Host"));
        discovery.announce(&party);
        discovery.retract("deadbeef0001");
        assert!(discovery.read_parties().is_empty());
    }

    #[test]
    fn stale_adverts_age_out() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = DiscoveryFile::new(dir.path(), Duration::from_secs(0));
        let party = PartyInfo::new("deadbeef0001", "Test", PeerInfo::new("h", "Host"));
        discovery.announce(&party);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(discovery.read_parties().is_empty());
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DISCOVERY_FILE), b"not json").unwrap();
        let discovery = DiscoveryFile::new(dir.path(), Duration::from_secs(300));
        assert!(discovery.read_parties().is_empty());
        // And a subsequent announce recovers the file.
        discovery.announce(&PartyInfo::new(
            "deadbeef0001",
            "Test",
            PeerInfo::new("h", "Host"),
        ));
        assert_eq!(discovery.read_parties().len(), 1);
    }
}
