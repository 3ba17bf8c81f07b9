//! Server state, listener, and background reaper.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lanlink_control::error::ControlError;
use lanlink_control::push::ServerFrame;

use crate::config::ServerConfig;
use crate::db::Db;

/// How long a peer stays live without a heartbeat.
pub const STALE_TTL: Duration = Duration::from_secs(300);
/// How long a relay registration stays listed without a refresh.
pub const RELAY_TTL: Duration = Duration::from_secs(120);

/// Shared state accessible by all request handlers and the reaper.
pub struct SharedState {
    pub config: ServerConfig,
    pub db: Mutex<Db>,
    /// peer_id → sender for that peer's streaming session. Push is
    /// best-effort: full or gone channels just drop the frame.
    pub sessions: Mutex<HashMap<String, mpsc::Sender<ServerFrame>>>,
    pub started_at: Instant,
}

impl SharedState {
    /// Run a closure against the database. Errors are logged here and
    /// mapped to an opaque `Server` kind — callers retry, they don't
    /// need SQLite details.
    pub fn db<R>(&self, f: impl FnOnce(&mut Db) -> rusqlite::Result<R>) -> std::result::Result<R, ControlError> {
        let mut db = self.db.lock();
        f(&mut db).map_err(|e| {
            tracing::error!("database error: {e}");
            ControlError::Server("database error".into())
        })
    }

    /// Push a frame to every connected member of a party, optionally
    /// excluding one peer (usually the one whose action caused it).
    pub fn push_to_party(&self, party_id: &str, exclude: Option<&str>, frame: &ServerFrame) {
        let members = match self.db(|db| db.list_peers(party_id)) {
            Ok(Some(peers)) => peers,
            _ => return,
        };
        let sessions = self.sessions.lock();
        for peer in members {
            if exclude.is_some_and(|excluded| excluded == peer.peer_id) {
                continue;
            }
            if let Some(tx) = sessions.get(&peer.peer_id) {
                let _ = tx.try_send(frame.clone());
            }
        }
    }

    pub fn push_to_peer(&self, peer_id: &str, frame: ServerFrame) {
        if let Some(tx) = self.sessions.lock().get(peer_id) {
            let _ = tx.try_send(frame);
        }
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    fn build_state(&self) -> Result<Arc<SharedState>> {
        let db = Db::open(&self.config.database_path)
            .with_context(|| format!("cannot open database {}", self.config.database_path))?;
        Ok(Arc::new(SharedState {
            config: self.config.clone(),
            db: Mutex::new(db),
            sessions: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }))
    }

    /// Run the server, blocking until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("cannot bind {}", state.config.listen_addr))?;
        tracing::info!("control server listening on {}", listener.local_addr()?);

        let reaper = spawn_reaper(Arc::clone(&state));
        let router = crate::web::router(Arc::clone(&state));
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        reaper.abort();
        tracing::info!("shutdown complete");
        Ok(())
    }

    /// Bind an ephemeral port and serve in the background (for tests).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let reaper = spawn_reaper(Arc::clone(&state));
        let router = crate::web::router(Arc::clone(&state));
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router).await;
            reaper.abort();
            result.map_err(Into::into)
        });
        Ok((addr, state, handle))
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down..."),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down..."),
    }
}

/// Background reaper: stale peers, empty parties, expired tokens, stale
/// relays. Each step is its own short transaction so nothing holds the
/// database across steps; a failing step logs and the pass continues.
fn spawn_reaper(state: Arc<SharedState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(state.config.reaper_interval));
        interval.tick().await; // skip first immediate tick
        loop {
            interval.tick().await;
            reap_pass(&state);
        }
    })
}

fn reap_pass(state: &Arc<SharedState>) {
    let now = Utc::now();

    let peer_cutoff = now - chrono::Duration::seconds(STALE_TTL.as_secs() as i64);
    match state.db(|db| db.reap_stale_peers(peer_cutoff)) {
        Ok(0) => {}
        Ok(n) => tracing::info!("reaped {n} stale peers"),
        Err(e) => tracing::warn!("stale-peer reap failed: {e}"),
    }

    match state.db(|db| db.reap_empty_parties()) {
        Ok(0) => {}
        Ok(n) => tracing::info!("deleted {n} empty parties"),
        Err(e) => tracing::warn!("empty-party reap failed: {e}"),
    }

    match state.db(|db| db.reap_expired_tokens(now)) {
        Ok(0) => {}
        Ok(n) => tracing::info!("purged {n} expired tokens"),
        Err(e) => tracing::warn!("token reap failed: {e}"),
    }

    let relay_cutoff = now - chrono::Duration::seconds(RELAY_TTL.as_secs() as i64);
    match state.db(|db| db.reap_stale_relays(relay_cutoff)) {
        Ok(0) => {}
        Ok(n) => tracing::info!("dropped {n} stale relays"),
        Err(e) => tracing::warn!("relay reap failed: {e}"),
    }
}
