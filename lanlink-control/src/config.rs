//! Control-plane configuration.
//!
//! The recognized keys are exactly the ones the configuration source
//! provides: `control_server_url`, `keys_dir`, `state_dir`,
//! `heartbeat_interval`, `stale_ttl`, `token_ttl`, `reaper_interval`.
//! Durations are integer seconds.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Documented default placeholder. A configured URL equal to this (or
/// empty/absent) selects the local file-backed variant.
pub const DEFAULT_SERVER_PLACEHOLDER: &str = "https://lanlink.example.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Remote control server base URL. Absent, empty, or the placeholder
    /// means "run local".
    pub control_server_url: Option<String>,
    pub keys_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Seconds between heartbeats per joined party.
    pub heartbeat_interval: u64,
    /// Seconds without a heartbeat before a peer is considered stale.
    pub stale_ttl: u64,
    /// Seconds an auth token stays valid.
    pub token_ttl: u64,
    /// Seconds between reaper passes.
    pub reaper_interval: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanlink");
        Self {
            control_server_url: None,
            keys_dir: base.join("keys"),
            state_dir: base,
            heartbeat_interval: 30,
            stale_ttl: 300,
            token_ttl: 86_400,
            reaper_interval: 60,
        }
    }
}

impl ControlConfig {
    /// Whether the configuration selects the remote variant.
    pub fn wants_remote(&self) -> bool {
        match self.control_server_url.as_deref() {
            Some(url) => !url.is_empty() && url != DEFAULT_SERVER_PLACEHOLDER,
            None => false,
        }
    }

}
