//! Centralized control server: the rendezvous, membership, and liveness
//! authority that remote control-plane clients talk to.
//!
//! Persistent party/peer/relay registry in SQLite, bearer-token auth,
//! heartbeat-driven liveness with a background reaper, and a WebSocket
//! push channel for membership events and NAT-traversal signals.

pub mod config;
pub mod db;
pub mod server;
pub mod web;
