//! Control plane for a peer-to-peer LAN-emulation service.
//!
//! Clients form short-lived *parties* (virtual LANs). Once members know
//! each other's identity, NAT metadata, and endpoints, they tunnel
//! directly — this crate only does rendezvous, membership, and
//! liveness, in one of two interchangeable flavors:
//!
//! - **local**: file-backed, for same-host rendezvous and testing
//!   ([`LocalControlPlane`]);
//! - **remote**: a resilient client of the central control server
//!   ([`RemoteControlPlane`]), with retrying HTTP, a push channel that
//!   falls back to polling, and a persisted local shadow.
//!
//! [`control_plane_from_config`] picks the variant; everything behind
//! the [`ControlPlane`] trait behaves identically from the caller's
//! side.

pub mod config;
pub mod discovery;
pub mod error;
pub mod membership;
pub mod persist;
pub mod plane;
pub mod push;
pub mod remote;
pub mod types;

pub use config::{ControlConfig, DEFAULT_SERVER_PLACEHOLDER};
pub use error::{ControlError, ErrorBody, Result};
pub use plane::{ControlPlane, LocalControlPlane, control_plane_from_config};
pub use remote::RemoteControlPlane;
pub use types::{NatType, PartyInfo, PeerInfo, RelayInfo};
