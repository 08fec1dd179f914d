//! SQLite database for peers and bandwidth history.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::{debug, info};
use wgpilot_wireguard::{PresharedKey, PrivateKey, PublicKey};

use crate::error::{Result, StoreError};
use crate::models::{BandwidthSample, NewPeer, PeerCounts, PeerRecord, SampleUpdate};

const PEER_COLUMNS: &str = "id, name, address, public_key, private_key, preshared_key, \
                            enabled, created_at, last_seen, total_rx, total_tx";

const SAMPLE_COLUMNS: &str = "id, peer_id, timestamp, rx_bytes, tx_bytes";

/// Handle to the wgpilot database. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS peers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                address TEXT NOT NULL UNIQUE,
                public_key TEXT NOT NULL UNIQUE,
                private_key TEXT NOT NULL,
                preshared_key TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_seen INTEGER,
                total_rx INTEGER NOT NULL DEFAULT 0,
                total_tx INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS bandwidth_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id INTEGER NOT NULL REFERENCES peers(id) ON DELETE CASCADE,
                timestamp INTEGER NOT NULL,
                rx_bytes INTEGER NOT NULL,
                tx_bytes INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bandwidth_peer_time
                ON bandwidth_history(peer_id, timestamp);
            ",
        )?;
        Ok(())
    }

    // ==================== Peers ====================

    /// Inserts a peer and returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the address or public key is
    /// already taken.
    pub fn insert_peer(&self, peer: &NewPeer) -> Result<PeerRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers
                 (name, address, public_key, private_key, preshared_key, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                peer.name,
                peer.address.to_string(),
                peer.public_key.to_base64(),
                peer.private_key.to_base64(),
                peer.preshared_key.as_ref().map(PresharedKey::to_base64),
                peer.enabled,
                peer.created_at.timestamp_millis(),
            ],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StoreError::Conflict(format!(
                "address {} or public key {} already in use",
                peer.address, peer.public_key
            )),
            _ => StoreError::Sqlite(e),
        })?;

        let id = conn.last_insert_rowid();
        debug!(peer_id = id, address = %peer.address, "inserted peer");
        Ok(PeerRecord {
            id,
            name: peer.name.clone(),
            address: peer.address,
            public_key: peer.public_key,
            private_key: peer.private_key.clone(),
            preshared_key: peer.preshared_key.clone(),
            enabled: peer.enabled,
            // Stored with millisecond precision.
            created_at: DateTime::from_timestamp_millis(peer.created_at.timestamp_millis())
                .unwrap_or(peer.created_at),
            last_seen: None,
            total_rx: 0,
            total_tx: 0,
        })
    }

    /// Fetches a peer by id.
    pub fn get_peer(&self, id: i64) -> Result<Option<PeerRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {PEER_COLUMNS} FROM peers WHERE id = ?1"),
            params![id],
            row_to_peer,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fetches a peer by id, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such peer.
    pub fn require_peer(&self, id: i64) -> Result<PeerRecord> {
        self.get_peer(id)?
            .ok_or_else(|| StoreError::peer_not_found(id))
    }

    /// Lists all peers ordered by id.
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {PEER_COLUMNS} FROM peers ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_peer)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Returns every assigned VPN address.
    pub fn peer_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        Ok(self.list_peers()?.into_iter().map(|p| p.address).collect())
    }

    /// Sets the enabled flag of a peer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such peer.
    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE peers SET enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        if changed == 0 {
            return Err(StoreError::peer_not_found(id));
        }
        Ok(())
    }

    /// Deletes a peer together with its bandwidth history.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such peer.
    pub fn delete_peer(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM peers WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::peer_not_found(id));
        }
        debug!(peer_id = id, "deleted peer");
        Ok(())
    }

    /// Counts peers by enabled state.
    pub fn peer_counts(&self) -> Result<PeerCounts> {
        let conn = self.conn.lock();
        let (total, enabled): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM peers",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PeerCounts {
            total: total as usize,
            enabled: enabled as usize,
            disabled: (total - enabled) as usize,
        })
    }

    // ==================== Telemetry ====================

    /// Appends one sample per update and refreshes the peers' totals, all in
    /// one transaction. `last_seen` moves to `at` only for online peers.
    /// Updates for peers deleted since they were listed are skipped.
    ///
    /// Returns the number of samples written.
    pub fn record_samples(&self, updates: &[SampleUpdate], at: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = at.timestamp_millis();
        let mut written = 0;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO bandwidth_history (peer_id, timestamp, rx_bytes, tx_bytes)
                 SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM peers WHERE id = ?1)",
            )?;
            let mut update = tx.prepare_cached(UPDATE_TOTALS)?;
            for u in updates {
                let (rx, tx_bytes) = (u.rx_bytes as i64, u.tx_bytes as i64);
                if insert.execute(params![u.peer_id, ts, rx, tx_bytes])? == 0 {
                    debug!(peer_id = u.peer_id, "peer vanished before its sample was stored");
                    continue;
                }
                update.execute(params![rx, tx_bytes, u.online, ts, u.peer_id])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Refreshes totals and `last_seen` without writing history.
    pub fn refresh_live_totals(&self, updates: &[SampleUpdate], at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ts = at.timestamp_millis();
        {
            let mut update = tx.prepare_cached(UPDATE_TOTALS)?;
            for u in updates {
                update.execute(params![
                    u.rx_bytes as i64,
                    u.tx_bytes as i64,
                    u.online,
                    ts,
                    u.peer_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns the oldest sample of `peer_id` taken at or after `since`.
    pub fn oldest_sample_since(
        &self,
        peer_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<BandwidthSample>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {SAMPLE_COLUMNS} FROM bandwidth_history
                 WHERE peer_id = ?1 AND timestamp >= ?2
                 ORDER BY timestamp ASC, id ASC LIMIT 1"
            ),
            params![peer_id, since.timestamp_millis()],
            row_to_sample,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Returns the first sample ever recorded for `peer_id`.
    pub fn earliest_sample(&self, peer_id: i64) -> Result<Option<BandwidthSample>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {SAMPLE_COLUMNS} FROM bandwidth_history
                 WHERE peer_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT 1"
            ),
            params![peer_id],
            row_to_sample,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Returns the samples of `peer_id` taken at or after `since`, oldest
    /// first.
    pub fn samples_since(
        &self,
        peer_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BandwidthSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM bandwidth_history
             WHERE peer_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![peer_id, since.timestamp_millis()], row_to_sample)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Inserts a sample with an explicit timestamp.
    ///
    /// The sampler goes through [`Database::record_samples`]; this exists for
    /// imports and for seeding history.
    pub fn insert_sample(
        &self,
        peer_id: i64,
        at: DateTime<Utc>,
        rx_bytes: u64,
        tx_bytes: u64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bandwidth_history (peer_id, timestamp, rx_bytes, tx_bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![peer_id, at.timestamp_millis(), rx_bytes as i64, tx_bytes as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Number of samples stored for `peer_id`.
    pub fn sample_count(&self, peer_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bandwidth_history WHERE peer_id = ?1",
            params![peer_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

const UPDATE_TOTALS: &str = "UPDATE peers SET total_rx = ?1, total_tx = ?2,
                                 last_seen = CASE WHEN ?3 THEN ?4 ELSE last_seen END
                             WHERE id = ?5";

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn millis_to_datetime(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    let address: String = row.get(2)?;
    let public_key: String = row.get(3)?;
    let private_key: String = row.get(4)?;
    let preshared_key: Option<String> = row.get(5)?;
    let last_seen: Option<i64> = row.get(8)?;
    let total_rx: i64 = row.get(9)?;
    let total_tx: i64 = row.get(10)?;

    Ok(PeerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        address: address.parse().map_err(|e| conversion_error(2, e))?,
        public_key: PublicKey::from_base64(&public_key).map_err(|e| conversion_error(3, e))?,
        private_key: PrivateKey::from_base64(&private_key).map_err(|e| conversion_error(4, e))?,
        preshared_key: preshared_key
            .map(|k| PresharedKey::from_base64(&k))
            .transpose()
            .map_err(|e| conversion_error(5, e))?,
        enabled: row.get(6)?,
        created_at: millis_to_datetime(7, row.get(7)?)?,
        last_seen: last_seen.map(|ms| millis_to_datetime(8, ms)).transpose()?,
        total_rx: total_rx.max(0) as u64,
        total_tx: total_tx.max(0) as u64,
    })
}

fn row_to_sample(row: &Row<'_>) -> rusqlite::Result<BandwidthSample> {
    let rx: i64 = row.get(3)?;
    let tx: i64 = row.get(4)?;
    Ok(BandwidthSample {
        id: row.get(0)?,
        peer_id: row.get(1)?,
        timestamp: millis_to_datetime(2, row.get(2)?)?,
        rx_bytes: rx.max(0) as u64,
        tx_bytes: tx.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use wgpilot_wireguard::{KeyGenerator, OsKeyGenerator};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    fn new_peer(name: &str, last_octet: u8) -> NewPeer {
        let keys = OsKeyGenerator.generate().expect("keys");
        NewPeer {
            name: name.to_string(),
            address: Ipv4Addr::new(10, 0, 0, last_octet),
            public_key: keys.public,
            private_key: keys.private,
            preshared_key: Some(keys.preshared),
            enabled: true,
            created_at: t0(),
        }
    }

    fn update(peer_id: i64, rx: u64, tx: u64, online: bool) -> SampleUpdate {
        SampleUpdate {
            peer_id,
            rx_bytes: rx,
            tx_bytes: tx,
            online,
        }
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let db = Database::open_memory().expect("db");
        let inserted = db.insert_peer(&new_peer("laptop", 2)).expect("insert");
        let fetched = db.get_peer(inserted.id).expect("get").expect("present");
        assert_eq!(fetched, inserted);
        assert!(fetched.last_seen.is_none());
    }

    #[test]
    fn missing_preshared_key_is_null() {
        let db = Database::open_memory().expect("db");
        let mut peer = new_peer("phone", 3);
        peer.preshared_key = None;
        let inserted = db.insert_peer(&peer).expect("insert");
        let fetched = db.require_peer(inserted.id).expect("present");
        assert!(fetched.preshared_key.is_none());
    }

    #[test]
    fn duplicate_address_is_conflict() {
        let db = Database::open_memory().expect("db");
        db.insert_peer(&new_peer("a", 2)).expect("insert");
        let err = db.insert_peer(&new_peer("b", 2)).expect_err("duplicate");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn duplicate_public_key_is_conflict() {
        let db = Database::open_memory().expect("db");
        let first = new_peer("a", 2);
        let mut second = new_peer("b", 3);
        second.public_key = first.public_key;
        db.insert_peer(&first).expect("insert");
        assert!(matches!(db.insert_peer(&second), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let db = Database::open_memory().expect("db");
        let a = db.insert_peer(&new_peer("a", 2)).expect("insert");
        db.delete_peer(a.id).expect("delete");
        let b = db.insert_peer(&new_peer("b", 2)).expect("insert");
        assert!(b.id > a.id);
    }

    #[test]
    fn toggle_and_counts() {
        let db = Database::open_memory().expect("db");
        let a = db.insert_peer(&new_peer("a", 2)).expect("insert");
        db.insert_peer(&new_peer("b", 3)).expect("insert");
        db.set_enabled(a.id, false).expect("disable");

        assert!(!db.require_peer(a.id).expect("present").enabled);
        assert_eq!(
            db.peer_counts().expect("counts"),
            PeerCounts {
                total: 2,
                enabled: 1,
                disabled: 1
            }
        );
    }

    #[test]
    fn counts_on_empty_table() {
        let db = Database::open_memory().expect("db");
        assert_eq!(db.peer_counts().expect("counts"), PeerCounts::default());
    }

    #[test]
    fn missing_peer_operations_fail() {
        let db = Database::open_memory().expect("db");
        assert!(matches!(db.set_enabled(42, true), Err(StoreError::NotFound(_))));
        assert!(matches!(db.delete_peer(42), Err(StoreError::NotFound(_))));
        assert!(db.get_peer(42).expect("query").is_none());
    }

    #[test]
    fn record_samples_updates_totals_and_last_seen() {
        let db = Database::open_memory().expect("db");
        let online = db.insert_peer(&new_peer("online", 2)).expect("insert");
        let offline = db.insert_peer(&new_peer("offline", 3)).expect("insert");

        let written = db
            .record_samples(
                &[update(online.id, 100, 200, true), update(offline.id, 5, 6, false)],
                t0(),
            )
            .expect("record");
        assert_eq!(written, 2);

        let online = db.require_peer(online.id).expect("present");
        assert_eq!((online.total_rx, online.total_tx), (100, 200));
        assert_eq!(online.last_seen, Some(t0()));

        let offline = db.require_peer(offline.id).expect("present");
        assert_eq!((offline.total_rx, offline.total_tx), (5, 6));
        assert_eq!(offline.last_seen, None);
        assert_eq!(db.sample_count(offline.id).expect("count"), 1);
    }

    #[test]
    fn record_samples_skips_deleted_peers() {
        let db = Database::open_memory().expect("db");
        let kept = db.insert_peer(&new_peer("kept", 2)).expect("insert");
        let gone = db.insert_peer(&new_peer("gone", 3)).expect("insert");
        // Deleted between listing and recording.
        db.delete_peer(gone.id).expect("delete");

        let written = db
            .record_samples(&[update(gone.id, 9, 9, true), update(kept.id, 4, 5, true)], t0())
            .expect("record");
        assert_eq!(written, 1);
        assert_eq!(db.sample_count(kept.id).expect("count"), 1);
        assert_eq!(db.sample_count(gone.id).expect("count"), 0);
        assert_eq!(db.require_peer(kept.id).expect("present").total_tx, 5);
    }

    #[test]
    fn refresh_does_not_write_history() {
        let db = Database::open_memory().expect("db");
        let peer = db.insert_peer(&new_peer("a", 2)).expect("insert");
        db.refresh_live_totals(&[update(peer.id, 7, 8, true)], t0())
            .expect("refresh");
        assert_eq!(db.sample_count(peer.id).expect("count"), 0);
        let peer = db.require_peer(peer.id).expect("present");
        assert_eq!(peer.total_tx, 8);
        assert_eq!(peer.last_seen, Some(t0()));
    }

    #[test]
    fn sample_window_queries() {
        let db = Database::open_memory().expect("db");
        let peer = db.insert_peer(&new_peer("a", 2)).expect("insert");
        for minutes in [0, 30, 60, 90] {
            db.insert_sample(peer.id, t0() + Duration::minutes(minutes), minutes as u64, 0)
                .expect("sample");
        }

        let since = t0() + Duration::minutes(45);
        let oldest = db
            .oldest_sample_since(peer.id, since)
            .expect("query")
            .expect("present");
        assert_eq!(oldest.rx_bytes, 60);

        let earliest = db.earliest_sample(peer.id).expect("query").expect("present");
        assert_eq!(earliest.timestamp, t0());

        let window: Vec<u64> = db
            .samples_since(peer.id, since)
            .expect("query")
            .into_iter()
            .map(|s| s.rx_bytes)
            .collect();
        assert_eq!(window, vec![60, 90]);

        assert!(db
            .oldest_sample_since(peer.id, t0() + Duration::hours(2))
            .expect("query")
            .is_none());
    }

    #[test]
    fn deleting_peer_cascades_to_history() {
        let db = Database::open_memory().expect("db");
        let peer = db.insert_peer(&new_peer("a", 2)).expect("insert");
        db.record_samples(&[update(peer.id, 1, 1, false)], t0())
            .expect("record");
        db.delete_peer(peer.id).expect("delete");
        assert_eq!(db.sample_count(peer.id).expect("count"), 0);
    }

    #[test]
    fn reopen_file_keeps_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("wgpilot.db");
        let id = {
            let db = Database::open(&path).expect("open");
            db.insert_peer(&new_peer("a", 2)).expect("insert").id
        };
        let db = Database::open(&path).expect("reopen");
        assert_eq!(db.require_peer(id).expect("present").name, "a");
        assert_eq!(db.peer_addresses().expect("addresses").len(), 1);
    }
}
