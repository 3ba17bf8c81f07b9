//! Write-behind state persistence.
//!
//! A single writer task owns the state file. Mutations queue a full
//! snapshot; queued snapshots coalesce into one disk write scheduled
//! 250 ms out, so a burst of joins costs one write. Crash loses at most
//! that window. Readers never see a torn file: every write goes to a
//! temp file in the same directory, is fsynced, then renamed over the
//! target.
//!
//! I/O errors are logged and swallowed — the in-memory map stays
//! authoritative and callers are never blocked or failed by disk trouble.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::PartyInfo;

/// File name of the membership snapshot inside the state dir.
pub const STATE_FILE: &str = "control_state.json";

/// How long a queued snapshot waits for more mutations to coalesce.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Complete snapshot of the in-memory membership map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub parties: HashMap<String, PartyInfo>,
}

enum PersistMsg {
    Queue(ControlSnapshot),
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task.
pub struct StatePersister {
    tx: mpsc::UnboundedSender<PersistMsg>,
    task: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl StatePersister {
    /// Spawn the writer task for `<state_dir>/control_state.json`.
    pub fn spawn(state_dir: &Path) -> Self {
        let path = state_dir.join(STATE_FILE);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(path.clone(), rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a snapshot for writing. Never blocks the caller; replaces
    /// any snapshot already pending.
    pub fn queue(&self, snapshot: ControlSnapshot) {
        let _ = self.tx.send(PersistMsg::Queue(snapshot));
    }

    /// Force any pending snapshot to disk and wait for the write.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PersistMsg::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush and stop the writer task.
    pub async fn shutdown(&self) {
        self.flush().await;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Load a snapshot from disk. A missing or corrupt file is not
    /// fatal: start empty and warn.
    pub fn load(path: &Path) -> ControlSnapshot {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        "corrupt state file {}: {e} — starting empty",
                        path.display()
                    );
                    ControlSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ControlSnapshot::default(),
            Err(e) => {
                tracing::warn!(
                    "cannot read state file {}: {e} — starting empty",
                    path.display()
                );
                ControlSnapshot::default()
            }
        }
    }
}

async fn run(path: PathBuf, mut rx: mpsc::UnboundedReceiver<PersistMsg>) {
    let mut pending: Option<ControlSnapshot> = None;
    let mut deadline: Option<Instant> = None;
    loop {
        let msg = if let Some(at) = deadline {
            tokio::select! {
                msg = rx.recv() => msg,
                _ = tokio::time::sleep_until(at) => {
                    write_pending(&path, &mut pending);
                    deadline = None;
                    continue;
                }
            }
        } else {
            rx.recv().await
        };
        match msg {
            Some(PersistMsg::Queue(snapshot)) => {
                pending = Some(snapshot);
                if deadline.is_none() {
                    deadline = Some(Instant::now() + DEBOUNCE);
                }
            }
            Some(PersistMsg::Flush(ack)) => {
                write_pending(&path, &mut pending);
                deadline = None;
                let _ = ack.send(());
            }
            None => {
                write_pending(&path, &mut pending);
                break;
            }
        }
    }
}

fn write_pending(path: &Path, pending: &mut Option<ControlSnapshot>) {
    let Some(snapshot) = pending.take() else {
        return;
    };
    let bytes = match serde_json::to_vec_pretty(&snapshot) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("cannot serialize state snapshot: {e}");
            return;
        }
    };
    if let Err(e) = write_atomic(path, &bytes) {
        tracing::warn!("cannot write state file {}: {e}", path.display());
    }
}

/// Write a file so readers observe either the previous content or the
/// new content, never a truncation: temp file in the same directory,
/// fsync, atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        std::process::id()
    ));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartyInfo, PeerInfo};

    fn snapshot_with(party_id: &str) -> ControlSnapshot {
        let mut snapshot = ControlSnapshot::default();
        snapshot.parties.insert(
            party_id.to_string(),
            PartyInfo::new(party_id, "test", PeerInfo::new("h", "Host")),
        );
        snapshot
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = StatePersister::load(&dir.path().join(STATE_FILE));
        assert!(snapshot.parties.is_empty());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        std::fs::write(&path, b"{\"parties\": {\"trunc").unwrap();
        let snapshot = StatePersister::load(&path);
        assert!(snapshot.parties.is_empty());
    }

    #[tokio::test]
    async fn flush_writes_latest_queued_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::spawn(dir.path());

        persister.queue(snapshot_with("a1b2c3d4e5f6"));
        persister.queue(snapshot_with("deadbeef0001"));
        persister.flush().await;

        let loaded = StatePersister::load(persister.path());
        assert_eq!(loaded.parties.len(), 1);
        assert!(loaded.parties.contains_key("deadbeef0001"));
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn debounced_write_lands_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::spawn(dir.path());

        persister.queue(snapshot_with("a1b2c3d4e5f6"));
        tokio::time::sleep(Duration::from_millis(600)).await;

        let loaded = StatePersister::load(persister.path());
        assert!(loaded.parties.contains_key("a1b2c3d4e5f6"));
        persister.shutdown().await;
    }

    #[test]
    fn atomic_writes_never_tear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        let big = snapshot_with("a1b2c3d4e5f6");
        let bytes_a = serde_json::to_vec_pretty(&big).unwrap();
        let bytes_b = serde_json::to_vec_pretty(&snapshot_with("deadbeef0001")).unwrap();
        write_atomic(&path, &bytes_a).unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..200 {
                let bytes = if i % 2 == 0 { &bytes_b } else { &bytes_a };
                write_atomic(&writer_path, bytes).unwrap();
            }
        });
        for _ in 0..200 {
            let bytes = std::fs::read(&path).unwrap();
            let parsed: ControlSnapshot = serde_json::from_slice(&bytes)
                .expect("reader must never observe a torn state file");
            assert_eq!(parsed.parties.len(), 1);
        }
        writer.join().unwrap();
    }
}
