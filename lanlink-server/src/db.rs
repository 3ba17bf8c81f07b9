//! SQLite persistence layer.
//!
//! Authoritative store for parties, peers, relays, and auth tokens.
//! Uses WAL mode for concurrent reads during writes, foreign keys for
//! peer→party cascade deletes. Multi-row mutations (join, leave,
//! cross-party eviction) run in one transaction; single-statement
//! updates rely on SQLite's per-statement atomicity.
//!
//! Timestamps are stored as unix seconds — sub-second precision is not
//! meaningful for liveness windows measured in minutes.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use std::path::Path;

use lanlink_control::types::{NatType, PartyInfo, PeerInfo, RelayInfo};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A persisted auth token row.
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub token: String,
    pub peer_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Party id is unknown.
    NoParty,
    /// Peer inserted or refreshed. `newly_joined` is false on an
    /// idempotent rejoin.
    Joined { newly_joined: bool },
}

/// Result of removing a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Party or peer was not there.
    NotFound,
    /// Peer removed. The party may have been deleted with it, or have
    /// had its host reassigned.
    Removed {
        party_deleted: bool,
        new_host: Option<String>,
    },
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS parties (
                party_id   TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                host_id    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peers (
                party_id    TEXT NOT NULL REFERENCES parties(party_id) ON DELETE CASCADE,
                peer_id     TEXT NOT NULL,
                name        TEXT NOT NULL,
                public_key  TEXT NOT NULL DEFAULT '',
                nat_type    TEXT NOT NULL DEFAULT 'unknown',
                public_ip   TEXT NOT NULL DEFAULT '',
                public_port INTEGER NOT NULL DEFAULT 0,
                local_ip    TEXT NOT NULL DEFAULT '',
                local_port  INTEGER NOT NULL DEFAULT 0,
                last_seen   INTEGER NOT NULL,
                PRIMARY KEY (party_id, peer_id)
            );

            CREATE INDEX IF NOT EXISTS idx_peers_party ON peers(party_id);
            CREATE INDEX IF NOT EXISTS idx_peers_last_seen ON peers(last_seen);

            CREATE TABLE IF NOT EXISTS relays (
                relay_id      TEXT PRIMARY KEY,
                region        TEXT NOT NULL,
                endpoint_ip   TEXT NOT NULL,
                endpoint_port INTEGER NOT NULL,
                capacity      INTEGER NOT NULL DEFAULT 0,
                current_load  INTEGER NOT NULL DEFAULT 0,
                last_seen     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_relays_last_seen ON relays(last_seen);

            CREATE TABLE IF NOT EXISTS auth_tokens (
                token      TEXT PRIMARY KEY,
                peer_id    TEXT NOT NULL,
                issued_at  INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_auth_tokens_expiry ON auth_tokens(expires_at);
            ",
        )?;
        Ok(())
    }

    // ── Parties ────────────────────────────────────────────────────────

    /// Create a party with its host as the first member. Returns false
    /// without touching anything when the party id is taken. The host's
    /// membership in any other party is evicted in the same transaction
    /// (a peer belongs to at most one party).
    pub fn create_party(&mut self, party: &PartyInfo) -> SqlResult<bool> {
        let tx = self.conn.transaction()?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM parties WHERE party_id = ?1",
                params![party.party_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO parties (party_id, name, host_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![party.party_id, party.name, party.host_id, ts(party.created_at)],
        )?;
        for peer in party.peers.values() {
            tx.execute(
                "DELETE FROM peers WHERE peer_id = ?1 AND party_id != ?2",
                params![peer.peer_id, party.party_id],
            )?;
            insert_peer(&tx, &party.party_id, peer)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_party(&self, party_id: &str) -> SqlResult<Option<PartyInfo>> {
        let Some(mut party) = self
            .conn
            .query_row(
                "SELECT party_id, name, host_id, created_at FROM parties WHERE party_id = ?1",
                params![party_id],
                |row| {
                    Ok(PartyInfo {
                        party_id: row.get(0)?,
                        name: row.get(1)?,
                        host_id: row.get(2)?,
                        created_at: dt(row.get(3)?),
                        peers: Default::default(),
                    })
                },
            )
            .optional()?
        else {
            return Ok(None);
        };
        for peer in self.party_peers(party_id)? {
            party.peers.insert(peer.peer_id.clone(), peer);
        }
        Ok(Some(party))
    }

    // ── Peers ──────────────────────────────────────────────────────────

    /// Insert or refresh a peer's membership. Joining again with the
    /// same peer_id replaces the older record; membership anywhere else
    /// is evicted in the same transaction.
    pub fn join_party(&mut self, party_id: &str, peer: &PeerInfo) -> SqlResult<JoinOutcome> {
        let tx = self.conn.transaction()?;
        let party_exists: bool = tx
            .query_row(
                "SELECT 1 FROM parties WHERE party_id = ?1",
                params![party_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !party_exists {
            return Ok(JoinOutcome::NoParty);
        }
        tx.execute(
            "DELETE FROM peers WHERE peer_id = ?1 AND party_id != ?2",
            params![peer.peer_id, party_id],
        )?;
        let was_member: bool = tx
            .query_row(
                "SELECT 1 FROM peers WHERE party_id = ?1 AND peer_id = ?2",
                params![party_id, peer.peer_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        insert_peer(&tx, party_id, peer)?;
        tx.commit()?;
        Ok(JoinOutcome::Joined {
            newly_joined: !was_member,
        })
    }

    /// Remove a peer. Deletes the party when it empties out; promotes a
    /// new host when the host left but others remain.
    pub fn remove_peer(&mut self, party_id: &str, peer_id: &str) -> SqlResult<RemoveOutcome> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM peers WHERE party_id = ?1 AND peer_id = ?2",
            params![party_id, peer_id],
        )?;
        if removed == 0 {
            return Ok(RemoveOutcome::NotFound);
        }
        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM peers WHERE party_id = ?1",
            params![party_id],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            tx.execute("DELETE FROM parties WHERE party_id = ?1", params![party_id])?;
            tx.commit()?;
            return Ok(RemoveOutcome::Removed {
                party_deleted: true,
                new_host: None,
            });
        }
        let host_id: String = tx.query_row(
            "SELECT host_id FROM parties WHERE party_id = ?1",
            params![party_id],
            |row| row.get(0),
        )?;
        let mut new_host = None;
        if host_id == peer_id {
            let next: String = tx.query_row(
                "SELECT MIN(peer_id) FROM peers WHERE party_id = ?1",
                params![party_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE parties SET host_id = ?1 WHERE party_id = ?2",
                params![next, party_id],
            )?;
            new_host = Some(next);
        }
        tx.commit()?;
        Ok(RemoveOutcome::Removed {
            party_deleted: false,
            new_host,
        })
    }

    /// Peers of a party, or None when the party doesn't exist.
    pub fn list_peers(&self, party_id: &str) -> SqlResult<Option<Vec<PeerInfo>>> {
        let party_exists: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM parties WHERE party_id = ?1",
                params![party_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !party_exists {
            return Ok(None);
        }
        Ok(Some(self.party_peers(party_id)?))
    }

    pub fn get_peer(&self, party_id: &str, peer_id: &str) -> SqlResult<Option<PeerInfo>> {
        self.conn
            .query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE party_id = ?1 AND peer_id = ?2"),
                params![party_id, peer_id],
                map_peer_row,
            )
            .optional()
    }

    /// Replace a peer's published record. `last_seen` only ever moves
    /// forward. Returns false when the peer is not a member.
    pub fn update_peer(&self, party_id: &str, peer: &PeerInfo) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE peers SET name = ?3, public_key = ?4, nat_type = ?5,
                    public_ip = ?6, public_port = ?7, local_ip = ?8, local_port = ?9,
                    last_seen = MAX(last_seen, ?10)
             WHERE party_id = ?1 AND peer_id = ?2",
            params![
                party_id,
                peer.peer_id,
                peer.name,
                peer.public_key,
                peer.nat_type.as_str(),
                peer.public_ip,
                peer.public_port,
                peer.local_ip,
                peer.local_port,
                ts(Utc::now()),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Heartbeat: refresh a member's `last_seen`.
    pub fn touch_peer(&self, party_id: &str, peer_id: &str, now: DateTime<Utc>) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE peers SET last_seen = MAX(last_seen, ?3)
             WHERE party_id = ?1 AND peer_id = ?2",
            params![party_id, peer_id, ts(now)],
        )?;
        Ok(changed > 0)
    }

    /// Refresh `last_seen` wherever this peer is a member. Called on
    /// every authenticated request, so any API activity counts as
    /// liveness.
    pub fn touch_peer_everywhere(&self, peer_id: &str, now: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE peers SET last_seen = MAX(last_seen, ?2) WHERE peer_id = ?1",
            params![peer_id, ts(now)],
        )?;
        Ok(())
    }

    fn party_peers(&self, party_id: &str) -> SqlResult<Vec<PeerInfo>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PEER_COLUMNS} FROM peers WHERE party_id = ?1"))?;
        let rows = stmt.query_map(params![party_id], map_peer_row)?;
        rows.collect()
    }

    // ── Relays ─────────────────────────────────────────────────────────

    pub fn upsert_relay(&self, relay: &RelayInfo) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO relays (relay_id, region, endpoint_ip, endpoint_port, capacity, current_load, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(relay_id) DO UPDATE SET
                region=excluded.region,
                endpoint_ip=excluded.endpoint_ip,
                endpoint_port=excluded.endpoint_port,
                capacity=excluded.capacity,
                current_load=excluded.current_load,
                last_seen=excluded.last_seen",
            params![
                relay.relay_id,
                relay.region,
                relay.endpoint_ip,
                relay.endpoint_port,
                relay.capacity,
                relay.current_load,
                ts(relay.last_seen),
            ],
        )?;
        Ok(())
    }

    /// Relays seen since `cutoff`, optionally restricted to a region.
    pub fn list_relays(
        &self,
        region: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> SqlResult<Vec<RelayInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT relay_id, region, endpoint_ip, endpoint_port, capacity, current_load, last_seen
             FROM relays
             WHERE last_seen >= ?1 AND (?2 IS NULL OR region = ?2)",
        )?;
        let rows = stmt.query_map(params![ts(cutoff), region], |row| {
            Ok(RelayInfo {
                relay_id: row.get(0)?,
                region: row.get(1)?,
                endpoint_ip: row.get(2)?,
                endpoint_port: row.get(3)?,
                capacity: row.get(4)?,
                current_load: row.get(5)?,
                last_seen: dt(row.get(6)?),
            })
        })?;
        rows.collect()
    }

    // ── Auth tokens ────────────────────────────────────────────────────

    pub fn insert_token(&self, row: &TokenRow) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO auth_tokens (token, peer_id, issued_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.token, row.peer_id, ts(row.issued_at), ts(row.expires_at)],
        )?;
        Ok(())
    }

    pub fn lookup_token(&self, token: &str) -> SqlResult<Option<TokenRow>> {
        self.conn
            .query_row(
                "SELECT token, peer_id, issued_at, expires_at FROM auth_tokens WHERE token = ?1",
                params![token],
                |row| {
                    Ok(TokenRow {
                        token: row.get(0)?,
                        peer_id: row.get(1)?,
                        issued_at: dt(row.get(2)?),
                        expires_at: dt(row.get(3)?),
                    })
                },
            )
            .optional()
    }

    // ── Reaper ─────────────────────────────────────────────────────────

    /// Delete peers unseen since `cutoff`. Hosts that were reaped while
    /// other members remain are replaced in the same pass.
    pub fn reap_stale_peers(&self, cutoff: DateTime<Utc>) -> SqlResult<usize> {
        let reaped = self.conn.execute(
            "DELETE FROM peers WHERE last_seen < ?1",
            params![ts(cutoff)],
        )?;
        if reaped > 0 {
            self.conn.execute(
                "UPDATE parties SET host_id =
                     (SELECT MIN(peer_id) FROM peers WHERE peers.party_id = parties.party_id)
                 WHERE EXISTS (SELECT 1 FROM peers WHERE peers.party_id = parties.party_id)
                   AND NOT EXISTS (SELECT 1 FROM peers
                                   WHERE peers.party_id = parties.party_id
                                     AND peers.peer_id = parties.host_id)",
                [],
            )?;
        }
        Ok(reaped)
    }

    pub fn reap_empty_parties(&self) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM parties WHERE NOT EXISTS
                 (SELECT 1 FROM peers WHERE peers.party_id = parties.party_id)",
            [],
        )
    }

    pub fn reap_expired_tokens(&self, now: DateTime<Utc>) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM auth_tokens WHERE expires_at < ?1",
            params![ts(now)],
        )
    }

    pub fn reap_stale_relays(&self, cutoff: DateTime<Utc>) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM relays WHERE last_seen < ?1",
            params![ts(cutoff)],
        )
    }

    // ── Stats ──────────────────────────────────────────────────────────

    /// (party count, peer count) for the health endpoint.
    pub fn counts(&self) -> SqlResult<(i64, i64)> {
        let parties = self
            .conn
            .query_row("SELECT COUNT(*) FROM parties", [], |row| row.get(0))?;
        let peers = self
            .conn
            .query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))?;
        Ok((parties, peers))
    }
}

const PEER_COLUMNS: &str = "peer_id, name, public_key, nat_type, public_ip, public_port, \
                            local_ip, local_port, last_seen";

fn insert_peer(conn: &Connection, party_id: &str, peer: &PeerInfo) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO peers (party_id, peer_id, name, public_key, nat_type,
                            public_ip, public_port, local_ip, local_port, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(party_id, peer_id) DO UPDATE SET
            name=excluded.name,
            public_key=excluded.public_key,
            nat_type=excluded.nat_type,
            public_ip=excluded.public_ip,
            public_port=excluded.public_port,
            local_ip=excluded.local_ip,
            local_port=excluded.local_port,
            last_seen=MAX(peers.last_seen, excluded.last_seen)",
        params![
            party_id,
            peer.peer_id,
            peer.name,
            peer.public_key,
            peer.nat_type.as_str(),
            peer.public_ip,
            peer.public_port,
            peer.local_ip,
            peer.local_port,
            ts(peer.last_seen),
        ],
    )?;
    Ok(())
}

fn map_peer_row(row: &rusqlite::Row) -> SqlResult<PeerInfo> {
    let nat: String = row.get(3)?;
    Ok(PeerInfo {
        peer_id: row.get(0)?,
        name: row.get(1)?,
        public_key: row.get(2)?,
        // Rows predating a nat_type rename read as unknown.
        nat_type: nat.parse::<NatType>().unwrap_or(NatType::Unknown),
        public_ip: row.get(4)?,
        public_port: row.get(5)?,
        local_ip: row.get(6)?,
        local_port: row.get(7)?,
        last_seen: dt(row.get(8)?),
    })
}

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn dt(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(party_id: &str, host: &str) -> PartyInfo {
        PartyInfo::new(party_id, "Test", PeerInfo::new(host, "Host"))
    }

    #[test]
    fn create_then_conflict() {
        let mut db = Db::open_memory().unwrap();
        assert!(db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap());
        assert!(!db.create_party(&party("a1b2c3d4e5f6", "h2")).unwrap());

        let loaded = db.get_party("a1b2c3d4e5f6").unwrap().unwrap();
        assert_eq!(loaded.host_id, "h");
        assert_eq!(loaded.peers.len(), 1);
    }

    #[test]
    fn join_and_idempotent_rejoin() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();

        let mut joiner = PeerInfo::new("j", "Joiner");
        assert_eq!(
            db.join_party("a1b2c3d4e5f6", &joiner).unwrap(),
            JoinOutcome::Joined { newly_joined: true }
        );
        joiner.name = "Joiner v2".into();
        assert_eq!(
            db.join_party("a1b2c3d4e5f6", &joiner).unwrap(),
            JoinOutcome::Joined {
                newly_joined: false
            }
        );

        let peers = db.list_peers("a1b2c3d4e5f6").unwrap().unwrap();
        assert_eq!(peers.len(), 2);
        let j = peers.iter().find(|p| p.peer_id == "j").unwrap();
        assert_eq!(j.name, "Joiner v2");
    }

    #[test]
    fn join_unknown_party() {
        let mut db = Db::open_memory().unwrap();
        assert_eq!(
            db.join_party("a1b2c3d4e5f6", &PeerInfo::new("j", "Joiner"))
                .unwrap(),
            JoinOutcome::NoParty
        );
    }

    #[test]
    fn peer_belongs_to_one_party() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h1")).unwrap();
        db.create_party(&party("deadbeef0001", "h2")).unwrap();

        let nomad = PeerInfo::new("nomad", "Nomad");
        db.join_party("a1b2c3d4e5f6", &nomad).unwrap();
        db.join_party("deadbeef0001", &nomad).unwrap();

        assert!(db.get_peer("a1b2c3d4e5f6", "nomad").unwrap().is_none());
        assert!(db.get_peer("deadbeef0001", "nomad").unwrap().is_some());
    }

    #[test]
    fn removing_last_peer_deletes_party() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();
        let outcome = db.remove_peer("a1b2c3d4e5f6", "h").unwrap();
        assert_eq!(
            outcome,
            RemoveOutcome::Removed {
                party_deleted: true,
                new_host: None
            }
        );
        assert!(db.get_party("a1b2c3d4e5f6").unwrap().is_none());
    }

    #[test]
    fn removing_host_promotes_next_member() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();
        db.join_party("a1b2c3d4e5f6", &PeerInfo::new("j", "Joiner"))
            .unwrap();

        let outcome = db.remove_peer("a1b2c3d4e5f6", "h").unwrap();
        assert_eq!(
            outcome,
            RemoveOutcome::Removed {
                party_deleted: false,
                new_host: Some("j".into())
            }
        );
        assert_eq!(db.get_party("a1b2c3d4e5f6").unwrap().unwrap().host_id, "j");
    }

    #[test]
    fn remove_missing_peer_reports_not_found() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();
        assert_eq!(
            db.remove_peer("a1b2c3d4e5f6", "ghost").unwrap(),
            RemoveOutcome::NotFound
        );
        assert_eq!(
            db.remove_peer("ffffffffffff", "h").unwrap(),
            RemoveOutcome::NotFound
        );
    }

    #[test]
    fn touch_moves_last_seen_forward_only() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();

        let future = Utc::now() + chrono::Duration::seconds(120);
        assert!(db.touch_peer("a1b2c3d4e5f6", "h", future).unwrap());
        // A touch with an older timestamp must not move last_seen back.
        assert!(db.touch_peer("a1b2c3d4e5f6", "h", Utc::now()).unwrap());
        let peer = db.get_peer("a1b2c3d4e5f6", "h").unwrap().unwrap();
        assert_eq!(peer.last_seen.timestamp(), future.timestamp());
    }

    #[test]
    fn reaper_clears_stale_peers_and_empty_parties() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();
        db.join_party("a1b2c3d4e5f6", &PeerInfo::new("j", "Joiner"))
            .unwrap();

        // Only j stays fresh.
        let fresh = Utc::now() + chrono::Duration::seconds(600);
        db.touch_peer("a1b2c3d4e5f6", "j", fresh).unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(300);
        assert_eq!(db.reap_stale_peers(cutoff).unwrap(), 1);
        assert_eq!(db.reap_empty_parties().unwrap(), 0);

        // Host was reaped; j got promoted.
        let loaded = db.get_party("a1b2c3d4e5f6").unwrap().unwrap();
        assert_eq!(loaded.host_id, "j");

        // Now everything goes stale.
        let cutoff = Utc::now() + chrono::Duration::seconds(900);
        assert_eq!(db.reap_stale_peers(cutoff).unwrap(), 1);
        assert_eq!(db.reap_empty_parties().unwrap(), 1);
        assert!(db.get_party("a1b2c3d4e5f6").unwrap().is_none());
    }

    #[test]
    fn token_roundtrip_and_expiry_reaping() {
        let db = Db::open_memory().unwrap();
        let now = Utc::now();
        db.insert_token(&TokenRow {
            token: "live".into(),
            peer_id: "h".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(24),
        })
        .unwrap();
        db.insert_token(&TokenRow {
            token: "dead".into(),
            peer_id: "j".into(),
            issued_at: now - chrono::Duration::hours(48),
            expires_at: now - chrono::Duration::hours(24),
        })
        .unwrap();

        assert_eq!(
            db.lookup_token("live").unwrap().unwrap().peer_id,
            "h".to_string()
        );
        assert_eq!(db.reap_expired_tokens(now).unwrap(), 1);
        assert!(db.lookup_token("dead").unwrap().is_none());
    }

    #[test]
    fn relay_upsert_list_and_reap() {
        let db = Db::open_memory().unwrap();
        let now = Utc::now();
        let mut relay = RelayInfo {
            relay_id: "r1".into(),
            region: "eu-west".into(),
            endpoint_ip: "198.51.100.7".into(),
            endpoint_port: 3478,
            capacity: 64,
            current_load: 3,
            last_seen: now,
        };
        db.upsert_relay(&relay).unwrap();
        relay.current_load = 9;
        db.upsert_relay(&relay).unwrap();

        let cutoff = now - chrono::Duration::seconds(120);
        let listed = db.list_relays(None, cutoff).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].current_load, 9);

        assert!(db.list_relays(Some("us-east"), cutoff).unwrap().is_empty());
        assert_eq!(
            db.list_relays(Some("eu-west"), cutoff).unwrap().len(),
            1
        );

        assert_eq!(
            db.reap_stale_relays(now + chrono::Duration::seconds(300))
                .unwrap(),
            1
        );
    }

    #[test]
    fn peers_cascade_on_party_delete() {
        let mut db = Db::open_memory().unwrap();
        db.create_party(&party("a1b2c3d4e5f6", "h")).unwrap();
        db.join_party("a1b2c3d4e5f6", &PeerInfo::new("j", "Joiner"))
            .unwrap();
        db.conn
            .execute("DELETE FROM parties WHERE party_id = 'a1b2c3d4e5f6'", [])
            .unwrap();
        assert!(db.get_peer("a1b2c3d4e5f6", "j").unwrap().is_none());
    }
}
