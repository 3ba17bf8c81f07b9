//! Frames exchanged over the streaming channel.
//!
//! The channel is a latency optimization, not a correctness requirement:
//! every frame the server pushes can be reconstructed by querying the
//! HTTP API. Frames are JSON text messages tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::types::{PartyInfo, PeerInfo};

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame after connect: authenticates the channel and binds it
    /// to a peer session.
    Hello { token: String, peer_id: String },
    /// Opaque NAT-traversal blob routed to another peer in the party.
    Signal {
        party_id: String,
        to: String,
        data: serde_json::Value,
    },
}

/// Server → client push frames. Delivery is best-effort: an event may
/// be lost across a reconnect, so clients reconcile by querying after
/// every reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full snapshot — replaces the local shadow entry.
    PartyUpdate { party: PartyInfo },
    PeerJoined {
        party_id: String,
        peer: PeerInfo,
    },
    PeerLeft {
        party_id: String,
        peer_id: String,
    },
    /// Relayed from another peer; `data` is opaque to the control plane.
    Signal {
        party_id: String,
        from: String,
        data: serde_json::Value,
    },
    Error {
        code: String,
        message: String,
    },
}

/// An inbound signal handed to the NAT collaborator.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub party_id: String,
    pub from: String,
    pub data: serde_json::Value,
}
