//! Durable storage for squeaks, profiles, peers, offers, and payments.
//!
//! Single SQLite database behind a mutex; every mutating call has committed
//! by the time it returns. Constraint violations on idempotent inserts
//! (squeaks, received offers, received payments) are reported as `None`
//! rather than errors; the remaining inserts surface `AlreadyExists`.
//!
//! Listing queries use keyset pagination: the caller passes the last entry
//! it saw and gets rows strictly below it in (block_height, squeak_time,
//! hash) order, so pages never repeat and never skip under concurrent
//! inserts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};
use tracing::debug;

use squeak_core::{Address, Network, PeerAddress, Squeak, SqueakHash};

use crate::error::{NodeError, Result};
use crate::now_ms;
use crate::types::{
    ReceivedOffer, ReceivedPayment, ReceivedPaymentSummary, SentOffer, SentPayment,
    SentPaymentSummary, SqueakEntry, SqueakPeer, SqueakProfile,
};

/// Bound on reply-thread ancestor walks. Cycles cannot exist (a reply
/// commits to its parent's hash); this caps damage from a corrupt database.
const MAX_THREAD_DEPTH: usize = 1024;

const MAX_HASH: [u8; 32] = [0xff; 32];

const SCHEMA_V1: &str = r#"
CREATE TABLE squeak (
    hash            BLOB PRIMARY KEY,
    created_time_ms INTEGER NOT NULL,
    squeak          BLOB NOT NULL,
    hash_reply_sqk  BLOB,
    hash_block      BLOB NOT NULL,
    n_block_height  INTEGER NOT NULL,
    n_time          INTEGER NOT NULL,
    author_address  TEXT NOT NULL,
    secret_key      BLOB,
    block_time      INTEGER NOT NULL,
    liked_time_ms   INTEGER,
    content         TEXT
);
CREATE INDEX idx_squeak_author_address ON squeak(author_address);
CREATE INDEX idx_squeak_reply ON squeak(hash_reply_sqk);
CREATE INDEX idx_squeak_keyset ON squeak(n_block_height DESC, n_time DESC, hash DESC);

CREATE TABLE profile (
    profile_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    created_time_ms   INTEGER NOT NULL,
    profile_name      TEXT NOT NULL UNIQUE,
    private_key       BLOB,
    address           TEXT NOT NULL UNIQUE,
    following         INTEGER NOT NULL,
    use_custom_price  INTEGER NOT NULL DEFAULT 0,
    custom_price_msat INTEGER NOT NULL DEFAULT 0,
    profile_image     BLOB
);

CREATE TABLE peer (
    peer_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    created_time_ms INTEGER NOT NULL,
    peer_name       TEXT NOT NULL,
    host            TEXT NOT NULL,
    port            INTEGER NOT NULL,
    use_tor         INTEGER NOT NULL,
    autoconnect     INTEGER NOT NULL,
    UNIQUE (host, port)
);

CREATE TABLE received_offer (
    received_offer_id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_time_ms   INTEGER NOT NULL,
    squeak_hash       BLOB NOT NULL,
    payment_hash      BLOB NOT NULL UNIQUE,
    nonce             BLOB NOT NULL,
    payment_point     BLOB NOT NULL,
    invoice_timestamp INTEGER NOT NULL,
    invoice_expiry    INTEGER NOT NULL,
    price_msat        INTEGER NOT NULL,
    payment_request   TEXT NOT NULL,
    destination       TEXT NOT NULL,
    lightning_host    TEXT NOT NULL,
    lightning_port    INTEGER NOT NULL,
    peer_host         TEXT NOT NULL,
    peer_port         INTEGER NOT NULL,
    peer_use_tor      INTEGER NOT NULL,
    paid              INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_received_offer_squeak ON received_offer(squeak_hash);

CREATE TABLE sent_offer (
    sent_offer_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    created_time_ms   INTEGER NOT NULL,
    squeak_hash       BLOB NOT NULL,
    payment_hash      BLOB NOT NULL UNIQUE,
    secret_key        BLOB NOT NULL,
    nonce             BLOB NOT NULL,
    price_msat        INTEGER NOT NULL DEFAULT 0,
    payment_request   TEXT NOT NULL,
    invoice_timestamp INTEGER NOT NULL,
    invoice_expiry    INTEGER NOT NULL,
    peer_host         TEXT NOT NULL,
    peer_port         INTEGER NOT NULL,
    peer_use_tor      INTEGER NOT NULL,
    paid              INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_sent_offer_squeak ON sent_offer(squeak_hash);

CREATE TABLE sent_payment (
    sent_payment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_time_ms INTEGER NOT NULL,
    peer_host       TEXT NOT NULL,
    peer_port       INTEGER NOT NULL,
    peer_use_tor    INTEGER NOT NULL,
    squeak_hash     BLOB NOT NULL,
    payment_hash    BLOB NOT NULL UNIQUE,
    secret_key      BLOB NOT NULL,
    price_msat      INTEGER NOT NULL DEFAULT 0,
    node_pubkey     TEXT NOT NULL,
    valid           INTEGER NOT NULL
);

CREATE TABLE received_payment (
    received_payment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_time_ms     INTEGER NOT NULL,
    squeak_hash         BLOB NOT NULL,
    payment_hash        BLOB NOT NULL UNIQUE,
    price_msat          INTEGER NOT NULL,
    settle_index        INTEGER NOT NULL,
    peer_host           TEXT NOT NULL,
    peer_port           INTEGER NOT NULL,
    peer_use_tor        INTEGER NOT NULL
);
"#;

const ENTRY_SELECT: &str = "\
    SELECT s.hash, s.hash_reply_sqk, s.hash_block, s.n_block_height, s.n_time, \
           s.block_time, s.created_time_ms, s.liked_time_ms, s.content, s.author_address, \
           p.profile_id, p.created_time_ms, p.profile_name, p.private_key, p.address, \
           p.following, p.use_custom_price, p.custom_price_msat, p.profile_image \
    FROM squeak s LEFT JOIN profile p ON p.address = s.author_address";

pub struct SqueakStore {
    conn: Mutex<Connection>,
    network: Network,
}

impl SqueakStore {
    pub fn open(path: &Path, network: Network) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, network)
    }

    pub fn open_in_memory(network: Network) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, network)
    }

    fn from_connection(mut conn: Connection, network: Network) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let migrations = Migrations::new(vec![M::up(SCHEMA_V1)]);
        migrations
            .to_latest(&mut conn)
            .map_err(|e| NodeError::Unavailable(format!("database migration failed: {e}")))?;
        Ok(SqueakStore {
            conn: Mutex::new(conn),
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NodeError::Unavailable("store mutex poisoned".to_string()))
    }

    // ------------------------------------------------------------------
    // Squeaks
    // ------------------------------------------------------------------

    /// Insert a squeak. Returns its hash, or `None` if it was already
    /// present (idempotent no-op).
    pub fn insert_squeak(&self, squeak: &Squeak, block_time: u32) -> Result<Option<SqueakHash>> {
        let hash = squeak.hash();
        let address = squeak.author_address(self.network);
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO squeak (hash, created_time_ms, squeak, hash_reply_sqk, hash_block, \
             n_block_height, n_time, author_address, secret_key, block_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)",
            params![
                hash.as_bytes(),
                now_ms(),
                squeak.serialize(),
                squeak.reply_to().map(|h| h.as_bytes().to_vec()),
                squeak.block_hash(),
                squeak.block_height(),
                squeak.time(),
                address.as_str(),
                block_time,
            ],
        );
        match res {
            Ok(_) => Ok(Some(hash)),
            Err(e) if is_unique_violation(&e) => {
                debug!(squeak_hash = %hash, "squeak already stored");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_squeak(&self, squeak_hash: SqueakHash) -> Result<Option<Squeak>> {
        let conn = self.conn()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT squeak FROM squeak WHERE hash = ?1",
                params![squeak_hash.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(bytes) => Ok(Some(Squeak::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_squeak_secret_key(&self, squeak_hash: SqueakHash) -> Result<Option<[u8; 32]>> {
        let conn = self.conn()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT secret_key FROM squeak WHERE hash = ?1",
                params![squeak_hash.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        match blob.flatten() {
            Some(bytes) => Ok(Some(blob32(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_squeak_entry(&self, squeak_hash: SqueakHash) -> Result<Option<SqueakEntry>> {
        let conn = self.conn()?;
        let sql = format!("{ENTRY_SELECT} WHERE s.hash = ?1");
        conn.query_row(&sql, params![squeak_hash.as_bytes()], parse_entry)
            .optional()
            .map_err(Into::into)
    }

    /// Timeline: squeaks from followed profiles, newest first.
    pub fn get_timeline_squeak_entries(
        &self,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        let (height, time, hash) = keyset_cursor(last_entry);
        let conn = self.conn()?;
        let sql = format!(
            "{ENTRY_SELECT} \
             WHERE p.following = 1 \
               AND (s.n_block_height, s.n_time, s.hash) < (?1, ?2, ?3) \
             ORDER BY s.n_block_height DESC, s.n_time DESC, s.hash DESC \
             LIMIT ?4"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![height, time, hash, limit as i64], parse_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_liked_squeak_entries(
        &self,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        let last_liked = last_entry
            .and_then(|e| e.liked_time_ms)
            .unwrap_or(i64::MAX);
        let last_hash = last_entry
            .map(|e| e.squeak_hash.as_bytes().to_vec())
            .unwrap_or_else(|| MAX_HASH.to_vec());
        let conn = self.conn()?;
        let sql = format!(
            "{ENTRY_SELECT} \
             WHERE s.liked_time_ms IS NOT NULL \
               AND (s.liked_time_ms, s.hash) < (?1, ?2) \
             ORDER BY s.liked_time_ms DESC, s.hash DESC \
             LIMIT ?3"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![last_liked, last_hash, limit as i64], parse_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_squeak_entries_for_address(
        &self,
        address: &Address,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        let (height, time, hash) = keyset_cursor(last_entry);
        let conn = self.conn()?;
        let sql = format!(
            "{ENTRY_SELECT} \
             WHERE s.author_address = ?1 \
               AND (s.n_block_height, s.n_time, s.hash) < (?2, ?3, ?4) \
             ORDER BY s.n_block_height DESC, s.n_time DESC, s.hash DESC \
             LIMIT ?5"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![address.as_str(), height, time, hash, limit as i64],
            parse_entry,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Case-insensitive substring search over unlocked content.
    pub fn get_squeak_entries_for_text_search(
        &self,
        text: &str,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        let (height, time, hash) = keyset_cursor(last_entry);
        let conn = self.conn()?;
        let sql = format!(
            "{ENTRY_SELECT} \
             WHERE s.content IS NOT NULL \
               AND instr(lower(s.content), lower(?1)) > 0 \
               AND (s.n_block_height, s.n_time, s.hash) < (?2, ?3, ?4) \
             ORDER BY s.n_block_height DESC, s.n_time DESC, s.hash DESC \
             LIMIT ?5"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![text, height, time, hash, limit as i64], parse_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Reply-thread ancestors of a squeak, root first, the squeak itself
    /// last. Iterative walk along reply_to, bounded by [`MAX_THREAD_DEPTH`].
    pub fn get_ancestor_squeak_entries(&self, squeak_hash: SqueakHash) -> Result<Vec<SqueakEntry>> {
        let mut chain = Vec::new();
        let mut cursor = Some(squeak_hash);
        while let Some(hash) = cursor {
            if chain.len() >= MAX_THREAD_DEPTH {
                break;
            }
            match self.get_squeak_entry(hash)? {
                Some(entry) => {
                    cursor = entry.reply_to;
                    chain.push(entry);
                }
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn get_reply_squeak_entries(
        &self,
        squeak_hash: SqueakHash,
        limit: usize,
        last_entry: Option<&SqueakEntry>,
    ) -> Result<Vec<SqueakEntry>> {
        let (height, time, hash) = keyset_cursor(last_entry);
        let conn = self.conn()?;
        let sql = format!(
            "{ENTRY_SELECT} \
             WHERE s.hash_reply_sqk = ?1 \
               AND (s.n_block_height, s.n_time, s.hash) < (?2, ?3, ?4) \
             ORDER BY s.n_block_height DESC, s.n_time DESC, s.hash DESC \
             LIMIT ?5"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![squeak_hash.as_bytes(), height, time, hash, limit as i64],
            parse_entry,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Hashes matching a subscription-style lookup. `include_locked`
    /// selects whether squeaks without a stored secret key count.
    pub fn lookup_squeaks(
        &self,
        addresses: &[Address],
        min_block: Option<u32>,
        max_block: Option<u32>,
        reply_to: Option<SqueakHash>,
        include_locked: bool,
    ) -> Result<Vec<SqueakHash>> {
        let mut sql = "SELECT hash FROM squeak WHERE 1 = 1".to_string();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if !addresses.is_empty() {
            let placeholders = vec!["?"; addresses.len()].join(", ");
            sql.push_str(&format!(" AND author_address IN ({placeholders})"));
            for address in addresses {
                args.push(Box::new(address.as_str().to_string()));
            }
        }
        if let Some(min) = min_block {
            sql.push_str(" AND n_block_height >= ?");
            args.push(Box::new(min));
        }
        if let Some(max) = max_block {
            sql.push_str(" AND n_block_height <= ?");
            args.push(Box::new(max));
        }
        if let Some(reply) = reply_to {
            sql.push_str(" AND hash_reply_sqk = ?");
            args.push(Box::new(reply.as_bytes().to_vec()));
        }
        if !include_locked {
            sql.push_str(" AND secret_key IS NOT NULL");
        }
        sql.push_str(" ORDER BY n_block_height DESC, n_time DESC, hash DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            let blob: Vec<u8> = row.get(0)?;
            blob32(&blob).map(SqueakHash::from_bytes)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_number_of_squeaks(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT count(*) FROM squeak", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn number_of_squeaks_with_address_in_block_range(
        &self,
        address: &Address,
        min_block: u32,
        max_block: u32,
    ) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM squeak \
             WHERE author_address = ?1 AND n_block_height >= ?2 AND n_block_height <= ?3",
            params![address.as_str(), min_block, max_block],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Squeaks eligible for the retention sweep: older than retention, not
    /// liked, and not authored by a locally-owned (signing) profile.
    pub fn get_old_squeaks_to_delete(&self, retention_s: u64) -> Result<Vec<SqueakHash>> {
        let cutoff = now_ms() - (retention_s as i64) * 1000;
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT s.hash FROM squeak s \
             LEFT JOIN profile p ON p.address = s.author_address \
             WHERE s.created_time_ms <= ?1 \
               AND s.liked_time_ms IS NULL \
               AND p.private_key IS NULL",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            let blob: Vec<u8> = row.get(0)?;
            blob32(&blob).map(SqueakHash::from_bytes)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Store the revealed secret key and plaintext in one transaction.
    pub fn set_squeak_decryption_key(
        &self,
        squeak_hash: SqueakHash,
        secret_key: &[u8; 32],
        content: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE squeak SET secret_key = ?1, content = ?2 WHERE hash = ?3",
            params![secret_key.as_slice(), content, squeak_hash.as_bytes()],
        )?;
        if updated == 0 {
            return Err(NodeError::NotFound(format!("squeak {squeak_hash}")));
        }
        Ok(())
    }

    pub fn set_squeak_liked(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.update_squeak_liked(squeak_hash, Some(now_ms()))
    }

    pub fn set_squeak_unliked(&self, squeak_hash: SqueakHash) -> Result<()> {
        self.update_squeak_liked(squeak_hash, None)
    }

    fn update_squeak_liked(&self, squeak_hash: SqueakHash, liked: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE squeak SET liked_time_ms = ?1 WHERE hash = ?2",
            params![liked, squeak_hash.as_bytes()],
        )?;
        if updated == 0 {
            return Err(NodeError::NotFound(format!("squeak {squeak_hash}")));
        }
        Ok(())
    }

    pub fn delete_squeak(&self, squeak_hash: SqueakHash) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM squeak WHERE hash = ?1",
            params![squeak_hash.as_bytes()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub fn insert_profile(
        &self,
        profile_name: &str,
        private_key: Option<&[u8]>,
        address: &Address,
        following: bool,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO profile (created_time_ms, profile_name, private_key, address, \
             following, use_custom_price, custom_price_msat) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)",
            params![now_ms(), profile_name, private_key, address.as_str(), following],
        );
        match res {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(NodeError::AlreadyExists(format!(
                "profile {profile_name} / {address}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.profiles_where("1 = 1")
    }

    pub fn get_signing_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.profiles_where("private_key IS NOT NULL")
    }

    pub fn get_contact_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.profiles_where("private_key IS NULL")
    }

    pub fn get_following_profiles(&self) -> Result<Vec<SqueakProfile>> {
        self.profiles_where("following = 1")
    }

    fn profiles_where(&self, predicate: &str) -> Result<Vec<SqueakProfile>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT profile_id, created_time_ms, profile_name, private_key, address, \
             following, use_custom_price, custom_price_msat, profile_image \
             FROM profile WHERE {predicate} ORDER BY profile_name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], parse_profile)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_profile(&self, profile_id: i64) -> Result<Option<SqueakProfile>> {
        self.profile_by("profile_id = ?1", params![profile_id])
    }

    pub fn get_profile_by_address(&self, address: &Address) -> Result<Option<SqueakProfile>> {
        self.profile_by("address = ?1", params![address.as_str()])
    }

    pub fn get_profile_by_name(&self, name: &str) -> Result<Option<SqueakProfile>> {
        self.profile_by("profile_name = ?1", params![name])
    }

    fn profile_by(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<SqueakProfile>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT profile_id, created_time_ms, profile_name, private_key, address, \
             following, use_custom_price, custom_price_msat, profile_image \
             FROM profile WHERE {predicate}"
        );
        conn.query_row(&sql, args, parse_profile)
            .optional()
            .map_err(Into::into)
    }

    pub fn set_profile_following(&self, profile_id: i64, following: bool) -> Result<()> {
        self.update_profile(profile_id, "following = ?1", params![following, profile_id])
    }

    pub fn set_profile_use_custom_price(&self, profile_id: i64, use_custom: bool) -> Result<()> {
        self.update_profile(
            profile_id,
            "use_custom_price = ?1",
            params![use_custom, profile_id],
        )
    }

    pub fn set_profile_custom_price_msat(&self, profile_id: i64, price_msat: u64) -> Result<()> {
        self.update_profile(
            profile_id,
            "custom_price_msat = ?1",
            params![price_msat as i64, profile_id],
        )
    }

    pub fn set_profile_name(&self, profile_id: i64, profile_name: &str) -> Result<()> {
        self.update_profile(
            profile_id,
            "profile_name = ?1",
            params![profile_name, profile_id],
        )
    }

    pub fn set_profile_image(&self, profile_id: i64, image: Option<&[u8]>) -> Result<()> {
        self.update_profile(
            profile_id,
            "profile_image = ?1",
            params![image, profile_id],
        )
    }

    fn update_profile(
        &self,
        profile_id: i64,
        assignment: &str,
        args: impl rusqlite::Params,
    ) -> Result<()> {
        let conn = self.conn()?;
        let sql = format!("UPDATE profile SET {assignment} WHERE profile_id = ?2");
        let updated = conn.execute(&sql, args)?;
        if updated == 0 {
            return Err(NodeError::NotFound(format!("profile {profile_id}")));
        }
        Ok(())
    }

    pub fn delete_profile(&self, profile_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM profile WHERE profile_id = ?1", params![profile_id])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    pub fn insert_peer(
        &self,
        peer_name: &str,
        address: &PeerAddress,
        autoconnect: bool,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO peer (created_time_ms, peer_name, host, port, use_tor, autoconnect) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now_ms(),
                peer_name,
                address.host,
                address.port,
                address.use_tor,
                autoconnect
            ],
        );
        match res {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                Err(NodeError::AlreadyExists(format!("peer {address}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_peer(&self, peer_id: i64) -> Result<Option<SqueakPeer>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT peer_id, created_time_ms, peer_name, host, port, use_tor, autoconnect \
             FROM peer WHERE peer_id = ?1",
            params![peer_id],
            parse_peer,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_peer_by_address(&self, address: &PeerAddress) -> Result<Option<SqueakPeer>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT peer_id, created_time_ms, peer_name, host, port, use_tor, autoconnect \
             FROM peer WHERE host = ?1 AND port = ?2",
            params![address.host, address.port],
            parse_peer,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_peers(&self) -> Result<Vec<SqueakPeer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT peer_id, created_time_ms, peer_name, host, port, use_tor, autoconnect \
             FROM peer ORDER BY peer_name",
        )?;
        let rows = stmt.query_map([], parse_peer)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_autoconnect_peers(&self) -> Result<Vec<SqueakPeer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT peer_id, created_time_ms, peer_name, host, port, use_tor, autoconnect \
             FROM peer WHERE autoconnect = 1",
        )?;
        let rows = stmt.query_map([], parse_peer)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn set_peer_autoconnect(&self, peer_id: i64, autoconnect: bool) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE peer SET autoconnect = ?1 WHERE peer_id = ?2",
            params![autoconnect, peer_id],
        )?;
        if updated == 0 {
            return Err(NodeError::NotFound(format!("peer {peer_id}")));
        }
        Ok(())
    }

    pub fn set_peer_name(&self, peer_id: i64, peer_name: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE peer SET peer_name = ?1 WHERE peer_id = ?2",
            params![peer_name, peer_id],
        )?;
        if updated == 0 {
            return Err(NodeError::NotFound(format!("peer {peer_id}")));
        }
        Ok(())
    }

    pub fn delete_peer(&self, peer_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM peer WHERE peer_id = ?1", params![peer_id])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Received offers
    // ------------------------------------------------------------------

    /// Insert a received offer. Returns `None` when an offer with the same
    /// payment hash is already stored (idempotent no-op).
    pub fn insert_received_offer(&self, offer: &ReceivedOffer) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO received_offer (created_time_ms, squeak_hash, payment_hash, nonce, \
             payment_point, invoice_timestamp, invoice_expiry, price_msat, payment_request, \
             destination, lightning_host, lightning_port, peer_host, peer_port, peer_use_tor, paid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0)",
            params![
                now_ms(),
                offer.squeak_hash.as_bytes(),
                offer.payment_hash.as_slice(),
                offer.nonce.as_slice(),
                offer.payment_point.as_slice(),
                offer.invoice_timestamp as i64,
                offer.invoice_expiry as i64,
                offer.price_msat as i64,
                offer.payment_request,
                offer.destination,
                offer.lightning_address.host,
                offer.lightning_address.port,
                offer.peer_address.host,
                offer.peer_address.port,
                offer.peer_address.use_tor,
            ],
        );
        match res {
            Ok(_) => Ok(Some(conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => {
                debug!(payment_hash = %hex::encode(offer.payment_hash), "received offer already stored");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unexpired offers for a squeak.
    pub fn get_received_offers(&self, squeak_hash: SqueakHash) -> Result<Vec<ReceivedOffer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE squeak_hash = ?1 AND invoice_timestamp + invoice_expiry > ?2",
            RECEIVED_OFFER_SELECT
        ))?;
        let rows = stmt.query_map(
            params![squeak_hash.as_bytes(), crate::now_s() as i64],
            parse_received_offer,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_received_offer(&self, received_offer_id: i64) -> Result<Option<ReceivedOffer>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{RECEIVED_OFFER_SELECT} WHERE received_offer_id = ?1"),
            params![received_offer_id],
            parse_received_offer,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_received_offer_for_squeak_and_peer(
        &self,
        squeak_hash: SqueakHash,
        peer_address: &PeerAddress,
    ) -> Result<Option<ReceivedOffer>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "{RECEIVED_OFFER_SELECT} \
                 WHERE squeak_hash = ?1 AND peer_host = ?2 AND peer_port = ?3 \
                   AND invoice_timestamp + invoice_expiry > ?4"
            ),
            params![
                squeak_hash.as_bytes(),
                peer_address.host,
                peer_address.port,
                crate::now_s() as i64
            ],
            parse_received_offer,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Delete expired, unpaid received offers. Returns how many went.
    pub fn delete_expired_received_offers(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM received_offer \
             WHERE paid = 0 AND invoice_timestamp + invoice_expiry <= ?1",
            params![crate::now_s() as i64],
        )?;
        Ok(deleted)
    }

    pub fn delete_offers_for_squeak(&self, squeak_hash: SqueakHash) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM received_offer WHERE squeak_hash = ?1",
            params![squeak_hash.as_bytes()],
        )?;
        Ok(deleted)
    }

    pub fn set_received_offer_paid(&self, payment_hash: &[u8; 32], paid: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE received_offer SET paid = ?1 WHERE payment_hash = ?2",
            params![paid, payment_hash.as_slice()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sent offers
    // ------------------------------------------------------------------

    pub fn insert_sent_offer(&self, offer: &SentOffer) -> Result<i64> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO sent_offer (created_time_ms, squeak_hash, payment_hash, secret_key, \
             nonce, price_msat, payment_request, invoice_timestamp, invoice_expiry, \
             peer_host, peer_port, peer_use_tor, paid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
            params![
                now_ms(),
                offer.squeak_hash.as_bytes(),
                offer.payment_hash.as_slice(),
                offer.secret_key.as_slice(),
                offer.nonce.as_slice(),
                offer.price_msat as i64,
                offer.payment_request,
                offer.invoice_timestamp as i64,
                offer.invoice_expiry as i64,
                offer.peer_address.host,
                offer.peer_address.port,
                offer.peer_address.use_tor,
            ],
        );
        match res {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(NodeError::AlreadyExists(format!(
                "sent offer with payment hash {}",
                hex::encode(offer.payment_hash)
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_sent_offers(&self) -> Result<Vec<SentOffer>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(SENT_OFFER_SELECT)?;
        let rows = stmt.query_map([], parse_sent_offer)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_sent_offer_by_payment_hash(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<SentOffer>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{SENT_OFFER_SELECT} WHERE payment_hash = ?1"),
            params![payment_hash.as_slice()],
            parse_sent_offer,
        )
        .optional()
        .map_err(Into::into)
    }

    /// An unexpired, unpaid offer already minted for this squeak and peer,
    /// so repeated `getoffer` requests reuse the same invoice.
    pub fn get_sent_offer_for_squeak_and_peer(
        &self,
        squeak_hash: SqueakHash,
        peer_address: &PeerAddress,
    ) -> Result<Option<SentOffer>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "{SENT_OFFER_SELECT} \
                 WHERE squeak_hash = ?1 AND peer_host = ?2 AND peer_port = ?3 \
                   AND paid = 0 AND invoice_timestamp + invoice_expiry > ?4"
            ),
            params![
                squeak_hash.as_bytes(),
                peer_address.host,
                peer_address.port,
                crate::now_s() as i64
            ],
            parse_sent_offer,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Delete unpaid sent offers expired past the grace period. Returns the
    /// payment hashes of the deleted rows so their hold invoices can be
    /// cancelled.
    pub fn delete_expired_sent_offers(&self, grace_s: u64) -> Result<Vec<[u8; 32]>> {
        let cutoff = crate::now_s() as i64 - grace_s as i64;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let hashes = {
            let mut stmt = tx.prepare(
                "SELECT payment_hash FROM sent_offer \
                 WHERE paid = 0 AND invoice_timestamp + invoice_expiry <= ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                let blob: Vec<u8> = row.get(0)?;
                blob32(&blob)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM sent_offer \
             WHERE paid = 0 AND invoice_timestamp + invoice_expiry <= ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(hashes)
    }

    pub fn set_sent_offer_paid(&self, payment_hash: &[u8; 32], paid: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sent_offer SET paid = ?1 WHERE payment_hash = ?2",
            params![paid, payment_hash.as_slice()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sent payments
    // ------------------------------------------------------------------

    pub fn insert_sent_payment(&self, payment: &SentPayment) -> Result<i64> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO sent_payment (created_time_ms, peer_host, peer_port, peer_use_tor, \
             squeak_hash, payment_hash, secret_key, price_msat, node_pubkey, valid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                now_ms(),
                payment.peer_address.host,
                payment.peer_address.port,
                payment.peer_address.use_tor,
                payment.squeak_hash.as_bytes(),
                payment.payment_hash.as_slice(),
                payment.secret_key.as_slice(),
                payment.price_msat as i64,
                payment.node_pubkey,
                payment.valid,
            ],
        );
        match res {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(NodeError::AlreadyExists(format!(
                "sent payment with payment hash {}",
                hex::encode(payment.payment_hash)
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_sent_payments(
        &self,
        limit: usize,
        last_payment: Option<&SentPayment>,
    ) -> Result<Vec<SentPayment>> {
        let last_created = last_payment.map(|p| p.created_time_ms).unwrap_or(i64::MAX);
        let last_hash = last_payment
            .map(|p| p.payment_hash.to_vec())
            .unwrap_or_else(|| MAX_HASH.to_vec());
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{SENT_PAYMENT_SELECT} \
             WHERE (created_time_ms, payment_hash) < (?1, ?2) \
             ORDER BY created_time_ms DESC, payment_hash DESC \
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![last_created, last_hash, limit as i64], parse_sent_payment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_sent_payment(&self, sent_payment_id: i64) -> Result<Option<SentPayment>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{SENT_PAYMENT_SELECT} WHERE sent_payment_id = ?1"),
            params![sent_payment_id],
            parse_sent_payment,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_sent_payment_summary(&self) -> Result<SentPaymentSummary> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT count(*), coalesce(sum(price_msat), 0) FROM sent_payment",
            [],
            |row| {
                Ok(SentPaymentSummary {
                    num_sent_payments: row.get::<_, i64>(0)? as u64,
                    total_amount_sent_msat: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Received payments
    // ------------------------------------------------------------------

    /// Insert a received payment. Returns `None` on a duplicate payment
    /// hash (idempotent no-op, e.g. a replayed settle event).
    pub fn insert_received_payment(&self, payment: &ReceivedPayment) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO received_payment (created_time_ms, squeak_hash, payment_hash, \
             price_msat, settle_index, peer_host, peer_port, peer_use_tor) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                now_ms(),
                payment.squeak_hash.as_bytes(),
                payment.payment_hash.as_slice(),
                payment.price_msat as i64,
                payment.settle_index as i64,
                payment.peer_address.host,
                payment.peer_address.port,
                payment.peer_address.use_tor,
            ],
        );
        match res {
            Ok(_) => Ok(Some(conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    payment_hash = %hex::encode(payment.payment_hash),
                    "received payment already recorded"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_received_payments(
        &self,
        limit: usize,
        last_payment: Option<&ReceivedPayment>,
    ) -> Result<Vec<ReceivedPayment>> {
        let last_created = last_payment.map(|p| p.created_time_ms).unwrap_or(i64::MAX);
        let last_hash = last_payment
            .map(|p| p.payment_hash.to_vec())
            .unwrap_or_else(|| MAX_HASH.to_vec());
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{RECEIVED_PAYMENT_SELECT} \
             WHERE (created_time_ms, payment_hash) < (?1, ?2) \
             ORDER BY created_time_ms DESC, payment_hash DESC \
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![last_created, last_hash, limit as i64],
            parse_received_payment,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Highest lnd settle index seen, to resume the invoice subscription.
    pub fn get_latest_settle_index(&self) -> Result<u64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT max(settle_index) FROM received_payment",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Reset all settle indices to the "not from live subscription"
    /// sentinel so the payment processor replays from the beginning.
    pub fn clear_received_payment_settle_indices(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE received_payment SET settle_index = 0", [])?;
        Ok(())
    }

    pub fn get_received_payment_summary(&self) -> Result<ReceivedPaymentSummary> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT count(*), coalesce(sum(price_msat), 0) FROM received_payment",
            [],
            |row| {
                Ok(ReceivedPaymentSummary {
                    num_received_payments: row.get::<_, i64>(0)? as u64,
                    total_amount_received_msat: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .map_err(Into::into)
    }
}

const RECEIVED_OFFER_SELECT: &str = "\
    SELECT received_offer_id, created_time_ms, squeak_hash, payment_hash, nonce, \
           payment_point, invoice_timestamp, invoice_expiry, price_msat, payment_request, \
           destination, lightning_host, lightning_port, peer_host, peer_port, peer_use_tor, paid \
    FROM received_offer";

const SENT_OFFER_SELECT: &str = "\
    SELECT sent_offer_id, created_time_ms, squeak_hash, payment_hash, secret_key, nonce, \
           price_msat, payment_request, invoice_timestamp, invoice_expiry, \
           peer_host, peer_port, peer_use_tor, paid \
    FROM sent_offer";

const SENT_PAYMENT_SELECT: &str = "\
    SELECT sent_payment_id, created_time_ms, peer_host, peer_port, peer_use_tor, \
           squeak_hash, payment_hash, secret_key, price_msat, node_pubkey, valid \
    FROM sent_payment";

const RECEIVED_PAYMENT_SELECT: &str = "\
    SELECT received_payment_id, created_time_ms, squeak_hash, payment_hash, price_msat, \
           settle_index, peer_host, peer_port, peer_use_tor \
    FROM received_payment";

fn keyset_cursor(last_entry: Option<&SqueakEntry>) -> (i64, i64, Vec<u8>) {
    match last_entry {
        Some(entry) => (
            entry.block_height as i64,
            entry.squeak_time as i64,
            entry.squeak_hash.as_bytes().to_vec(),
        ),
        None => (i64::MAX, i64::MAX, MAX_HASH.to_vec()),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn blob32(bytes: &[u8]) -> rusqlite::Result<[u8; 32]> {
    bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            bytes.len(),
            rusqlite::types::Type::Blob,
            "expected 32-byte blob".into(),
        )
    })
}

fn blob33(bytes: &[u8]) -> rusqlite::Result<[u8; 33]> {
    bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            bytes.len(),
            rusqlite::types::Type::Blob,
            "expected 33-byte blob".into(),
        )
    })
}

fn parse_address(s: String) -> rusqlite::Result<Address> {
    Address::parse(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            s.len(),
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn parse_entry(row: &Row<'_>) -> rusqlite::Result<SqueakEntry> {
    let hash: Vec<u8> = row.get(0)?;
    let reply: Option<Vec<u8>> = row.get(1)?;
    let block_hash: Vec<u8> = row.get(2)?;
    let author_address: String = row.get(9)?;
    let author = match row.get::<_, Option<i64>>(10)? {
        Some(profile_id) => Some(SqueakProfile {
            profile_id,
            created_time_ms: row.get(11)?,
            profile_name: row.get(12)?,
            private_key: row.get(13)?,
            address: parse_address(row.get::<_, String>(14)?)?,
            following: row.get(15)?,
            use_custom_price: row.get(16)?,
            custom_price_msat: row.get::<_, i64>(17)? as u64,
            profile_image: row.get(18)?,
        }),
        None => None,
    };
    let reply_to = match reply {
        Some(bytes) => Some(SqueakHash::from_bytes(blob32(&bytes)?)),
        None => None,
    };
    Ok(SqueakEntry {
        squeak_hash: SqueakHash::from_bytes(blob32(&hash)?),
        author_address: parse_address(author_address)?,
        reply_to,
        block_hash: blob32(&block_hash)?,
        block_height: row.get::<_, i64>(3)? as u32,
        squeak_time: row.get::<_, i64>(4)? as u32,
        block_time: row.get::<_, i64>(5)? as u32,
        created_time_ms: row.get(6)?,
        liked_time_ms: row.get(7)?,
        content: row.get(8)?,
        author,
    })
}

fn parse_profile(row: &Row<'_>) -> rusqlite::Result<SqueakProfile> {
    Ok(SqueakProfile {
        profile_id: row.get(0)?,
        created_time_ms: row.get(1)?,
        profile_name: row.get(2)?,
        private_key: row.get(3)?,
        address: parse_address(row.get::<_, String>(4)?)?,
        following: row.get(5)?,
        use_custom_price: row.get(6)?,
        custom_price_msat: row.get::<_, i64>(7)? as u64,
        profile_image: row.get(8)?,
    })
}

fn parse_peer(row: &Row<'_>) -> rusqlite::Result<SqueakPeer> {
    Ok(SqueakPeer {
        peer_id: row.get(0)?,
        created_time_ms: row.get(1)?,
        peer_name: row.get(2)?,
        address: PeerAddress {
            host: row.get(3)?,
            port: row.get::<_, i64>(4)? as u16,
            use_tor: row.get(5)?,
        },
        autoconnect: row.get(6)?,
    })
}

fn parse_received_offer(row: &Row<'_>) -> rusqlite::Result<ReceivedOffer> {
    let squeak_hash: Vec<u8> = row.get(2)?;
    let payment_hash: Vec<u8> = row.get(3)?;
    let nonce: Vec<u8> = row.get(4)?;
    let payment_point: Vec<u8> = row.get(5)?;
    Ok(ReceivedOffer {
        received_offer_id: row.get(0)?,
        created_time_ms: row.get(1)?,
        squeak_hash: SqueakHash::from_bytes(blob32(&squeak_hash)?),
        payment_hash: blob32(&payment_hash)?,
        nonce: blob32(&nonce)?,
        payment_point: blob33(&payment_point)?,
        invoice_timestamp: row.get::<_, i64>(6)? as u64,
        invoice_expiry: row.get::<_, i64>(7)? as u64,
        price_msat: row.get::<_, i64>(8)? as u64,
        payment_request: row.get(9)?,
        destination: row.get(10)?,
        lightning_address: PeerAddress::new(
            row.get::<_, String>(11)?,
            row.get::<_, i64>(12)? as u16,
        ),
        peer_address: PeerAddress {
            host: row.get(13)?,
            port: row.get::<_, i64>(14)? as u16,
            use_tor: row.get(15)?,
        },
        paid: row.get(16)?,
    })
}

fn parse_sent_offer(row: &Row<'_>) -> rusqlite::Result<SentOffer> {
    let squeak_hash: Vec<u8> = row.get(2)?;
    let payment_hash: Vec<u8> = row.get(3)?;
    let secret_key: Vec<u8> = row.get(4)?;
    let nonce: Vec<u8> = row.get(5)?;
    Ok(SentOffer {
        sent_offer_id: row.get(0)?,
        created_time_ms: row.get(1)?,
        squeak_hash: SqueakHash::from_bytes(blob32(&squeak_hash)?),
        payment_hash: blob32(&payment_hash)?,
        secret_key: blob32(&secret_key)?,
        nonce: blob32(&nonce)?,
        price_msat: row.get::<_, i64>(6)? as u64,
        payment_request: row.get(7)?,
        invoice_timestamp: row.get::<_, i64>(8)? as u64,
        invoice_expiry: row.get::<_, i64>(9)? as u64,
        peer_address: PeerAddress {
            host: row.get(10)?,
            port: row.get::<_, i64>(11)? as u16,
            use_tor: row.get(12)?,
        },
        paid: row.get(13)?,
    })
}

fn parse_sent_payment(row: &Row<'_>) -> rusqlite::Result<SentPayment> {
    let squeak_hash: Vec<u8> = row.get(5)?;
    let payment_hash: Vec<u8> = row.get(6)?;
    let secret_key: Vec<u8> = row.get(7)?;
    Ok(SentPayment {
        sent_payment_id: row.get(0)?,
        created_time_ms: row.get(1)?,
        peer_address: PeerAddress {
            host: row.get(2)?,
            port: row.get::<_, i64>(3)? as u16,
            use_tor: row.get(4)?,
        },
        squeak_hash: SqueakHash::from_bytes(blob32(&squeak_hash)?),
        payment_hash: blob32(&payment_hash)?,
        secret_key: blob32(&secret_key)?,
        price_msat: row.get::<_, i64>(8)? as u64,
        node_pubkey: row.get(9)?,
        valid: row.get(10)?,
    })
}

fn parse_received_payment(row: &Row<'_>) -> rusqlite::Result<ReceivedPayment> {
    let squeak_hash: Vec<u8> = row.get(2)?;
    let payment_hash: Vec<u8> = row.get(3)?;
    Ok(ReceivedPayment {
        received_payment_id: row.get(0)?,
        created_time_ms: row.get(1)?,
        squeak_hash: SqueakHash::from_bytes(blob32(&squeak_hash)?),
        payment_hash: blob32(&payment_hash)?,
        price_msat: row.get::<_, i64>(4)? as u64,
        settle_index: row.get::<_, i64>(5)? as u64,
        peer_address: PeerAddress {
            host: row.get(6)?,
            port: row.get::<_, i64>(7)? as u16,
            use_tor: row.get(8)?,
        },
    })
}
