//! Wire data types shared by the control-plane variants and the server.
//!
//! Everything here serializes to the JSON shapes the control server speaks.
//! Timestamps are ISO-8601 UTC with a trailing `Z` (chrono's default for
//! `DateTime<Utc>`). Optional endpoint fields serialize as empty string / 0
//! so older clients never see `null`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// NAT classification reported by the NAT probing layer.
///
/// The control plane only stores and distributes this; it never probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    #[default]
    Unknown,
}

impl NatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Open => "open",
            NatType::FullCone => "full_cone",
            NatType::RestrictedCone => "restricted_cone",
            NatType::PortRestrictedCone => "port_restricted_cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NatType {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(NatType::Open),
            "full_cone" => Ok(NatType::FullCone),
            "restricted_cone" => Ok(NatType::RestrictedCone),
            "port_restricted_cone" => Ok(NatType::PortRestrictedCone),
            "symmetric" => Ok(NatType::Symmetric),
            "unknown" => Ok(NatType::Unknown),
            other => Err(ControlError::Invalid(format!("unknown nat_type '{other}'"))),
        }
    }
}

/// A participant within one party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique within a party. Assigned by the caller, or by the server
    /// during auth registration when left empty.
    pub peer_id: String,
    /// Human label shown in peer lists.
    pub name: String,
    /// Key material encoded as text. Opaque to the control plane.
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub nat_type: NatType,
    /// Externally observed endpoint, filled in by the NAT layer.
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub public_port: u16,
    /// LAN endpoint, for same-network shortcuts.
    #[serde(default)]
    pub local_ip: String,
    #[serde(default)]
    pub local_port: u16,
    /// Refreshed on every authenticated operation by this peer.
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            public_key: String::new(),
            nat_type: NatType::Unknown,
            public_ip: String::new(),
            public_port: 0,
            local_ip: String::new(),
            local_port: 0,
            last_seen: Utc::now(),
        }
    }

    /// Refresh `last_seen`, never moving it backwards.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now().max(self.last_seen);
    }
}

/// A virtual LAN: a named set of peers sharing rendezvous state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyInfo {
    pub party_id: String,
    pub name: String,
    /// peer_id of the founding member. No special privileges; surfaced
    /// for UI. Reassigned if the host leaves while others remain.
    pub host_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub peers: HashMap<String, PeerInfo>,
}

impl PartyInfo {
    /// Create a party with its founding member.
    pub fn new(party_id: impl Into<String>, name: impl Into<String>, host: PeerInfo) -> Self {
        let mut peers = HashMap::new();
        let host_id = host.peer_id.clone();
        peers.insert(host_id.clone(), host);
        Self {
            party_id: party_id.into(),
            name: name.into(),
            host_id,
            created_at: Utc::now(),
            peers,
        }
    }
}

/// A relay-server registration. The control plane stores relay metadata;
/// relay selection happens in the data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_id: String,
    pub region: String,
    pub endpoint_ip: String,
    pub endpoint_port: u16,
    pub capacity: u32,
    pub current_load: u32,
    pub last_seen: DateTime<Utc>,
}

// ── Identifiers ────────────────────────────────────────────────────────

/// Length of a party id: 6 random bytes as lowercase hex.
pub const PARTY_ID_LEN: usize = 12;

/// Generate a random party id. 48 bits is weak against an active
/// collision attack but fine for the unguessable-invite model; creators
/// regenerate on insertion conflict.
pub fn generate_party_id() -> String {
    let bytes: [u8; PARTY_ID_LEN / 2] = rand::random();
    hex::encode(bytes)
}

/// Generate a peer id for callers that didn't bring their own.
pub fn generate_peer_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// Check a party id is exactly 12 hex characters.
pub fn validate_party_id(party_id: &str) -> Result<(), ControlError> {
    if party_id.len() != PARTY_ID_LEN || !party_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ControlError::Invalid(format!(
            "party_id must be {PARTY_ID_LEN} hex characters, got '{party_id}'"
        )));
    }
    Ok(())
}

/// Check a peer id is present and sane.
pub fn validate_peer_id(peer_id: &str) -> Result<(), ControlError> {
    if peer_id.is_empty() {
        return Err(ControlError::Invalid("peer_id must not be empty".into()));
    }
    if peer_id.len() > 64 || peer_id.contains(char::is_whitespace) {
        return Err(ControlError::Invalid(format!("malformed peer_id '{peer_id}'")));
    }
    Ok(())
}

/// Validate a peer record before it enters the membership map.
pub fn validate_peer(peer: &PeerInfo) -> Result<(), ControlError> {
    validate_peer_id(&peer.peer_id)
}

// ── Request / response bodies ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRegisterRequest {
    /// Empty to let the server assign one.
    #[serde(default)]
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRegisterResponse {
    pub token: String,
    /// The peer_id the token is bound to (server-assigned when the
    /// request left it empty).
    pub peer_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePartyRequest {
    /// Empty to let the server generate one.
    #[serde(default)]
    pub party_id: String,
    pub name: String,
    pub host: PeerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPartyRequest {
    pub peer: PeerInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_id_roundtrip() {
        let id = generate_party_id();
        assert_eq!(id.len(), PARTY_ID_LEN);
        validate_party_id(&id).unwrap();
    }

    #[test]
    fn party_id_rejects_bad_input() {
        assert!(validate_party_id("short").is_err());
        assert!(validate_party_id("zzzzzzzzzzzz").is_err());
        assert!(validate_party_id("a1b2c3d4e5f60").is_err()); // 13 chars
        validate_party_id("a1b2c3d4e5f6").unwrap();
    }

    #[test]
    fn nat_type_wire_strings() {
        for s in [
            "open",
            "full_cone",
            "restricted_cone",
            "port_restricted_cone",
            "symmetric",
            "unknown",
        ] {
            let nat: NatType = s.parse().unwrap();
            assert_eq!(nat.as_str(), s);
        }
        assert!("carrier_grade".parse::<NatType>().is_err());
    }

    #[test]
    fn peer_serializes_nat_as_snake_case() {
        let mut peer = PeerInfo::new("p1", "Player One");
        peer.nat_type = NatType::PortRestrictedCone;
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["nat_type"], "port_restricted_cone");
        // Timestamps carry the Z suffix
        assert!(json["last_seen"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn peer_deserializes_with_missing_optionals() {
        let json = r#"{
            "peer_id": "p1",
            "name": "Player One",
            "last_seen": "2026-01-01T00:00:00Z"
        }"#;
        let peer: PeerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(peer.nat_type, NatType::Unknown);
        assert_eq!(peer.public_ip, "");
        assert_eq!(peer.public_port, 0);
    }

    #[test]
    fn touch_is_monotonic() {
        let mut peer = PeerInfo::new("p1", "x");
        peer.last_seen = Utc::now() + chrono::Duration::seconds(60);
        let future = peer.last_seen;
        peer.touch();
        assert_eq!(peer.last_seen, future);
    }

    #[test]
    fn new_party_contains_host() {
        let party = PartyInfo::new("a1b2c3d4e5f6", "Friday", PeerInfo::new("h", "Host"));
        assert_eq!(party.host_id, "h");
        assert!(party.peers.contains_key("h"));
    }

    #[test]
    fn validate_peer_rejects_garbage() {
        assert!(validate_peer(&PeerInfo::new("", "x")).is_err());
        assert!(validate_peer(&PeerInfo::new("has space", "x")).is_err());
        validate_peer(&PeerInfo::new("ok-id", "x")).unwrap();
    }
}
