//! SQLite-backed store.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that string
//! comparison in SQL orders them chronologically.

use crate::clock::{Clock, SystemClock};
use crate::migration::run_migrations;
use crate::whitelist::Whitelist;
use crate::{active_cutoff, Store};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use vipnode_types::{Node, Stats, VipnodeError, VipnodeResult};

/// Durable store with the same semantics as [`MemoryStore`](crate::MemoryStore).
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    whitelist: Whitelist,
    clock: Arc<dyn Clock>,
}

fn store_err(e: rusqlite::Error) -> VipnodeError {
    VipnodeError::Store(e.to_string())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> VipnodeResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VipnodeError::Store(format!("bad timestamp {s:?}: {e}")))
}

const NODE_COLUMNS: &str = "id, uri, is_host, kind, payout, last_seen";

type NodeRow = (String, String, bool, String, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_node((id, uri, is_host, kind, payout, last_seen): NodeRow) -> VipnodeResult<Node> {
    Ok(Node {
        id,
        uri,
        is_host,
        kind,
        payout,
        last_seen: parse_timestamp(&last_seen)?,
    })
}

impl SqliteStore {
    /// Open (creating if needed) a database file and migrate it.
    pub fn open(path: &Path) -> VipnodeResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(store_err)?;
        debug!(path = %path.display(), "Opened SQLite store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> VipnodeResult<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn from_connection(conn: Connection) -> VipnodeResult<Self> {
        run_migrations(&conn).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            whitelist: Whitelist::default(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> VipnodeResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VipnodeError::Store(e.to_string()))
    }

    fn query_nodes(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> VipnodeResult<Vec<Node>> {
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt.query_map(params, read_row).map_err(store_err)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(into_node(row.map_err(store_err)?)?);
        }
        Ok(nodes)
    }
}

impl Store for SqliteStore {
    fn set_node(&self, node: Node, whitelist_token: &str) -> VipnodeResult<()> {
        if node.is_host && !self.whitelist.admits(&node.id, whitelist_token) {
            return Err(VipnodeError::Unauthorized(format!(
                "node is not whitelisted: {}",
                node.id
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO nodes (id, uri, is_host, kind, payout, last_seen) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET uri = ?2, is_host = ?3, kind = ?4, payout = ?5, last_seen = ?6",
            rusqlite::params![
                node.id,
                node.uri,
                node.is_host,
                node.kind,
                node.payout,
                timestamp(node.last_seen)
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn get_node(&self, id: &str) -> VipnodeResult<Option<Node>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                rusqlite::params![id],
                read_row,
            )
            .optional()
            .map_err(store_err)?;
        row.map(into_node).transpose()
    }

    fn check_and_save_nonce(&self, id: &str, nonce: i64) -> VipnodeResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        let last: Option<i64> = tx
            .query_row(
                "SELECT nonce FROM nonces WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        if let Some(last) = last {
            if nonce <= last {
                return Err(VipnodeError::InvalidNonce(format!(
                    "nonce {nonce} is not greater than {last}"
                )));
            }
        }
        tx.execute(
            "INSERT INTO nonces (id, nonce) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET nonce = ?2",
            rusqlite::params![id, nonce],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)
    }

    fn update_node_peers(&self, id: &str, peers: &[String]) -> VipnodeResult<Vec<String>> {
        let now = self.clock.now();
        let cutoff = timestamp(active_cutoff(now));
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;
        let updated = tx
            .execute(
                "UPDATE nodes SET last_seen = ?2 WHERE id = ?1",
                rusqlite::params![id, timestamp(now)],
            )
            .map_err(store_err)?;
        if updated == 0 {
            return Err(VipnodeError::UnregisteredNode(id.to_string()));
        }

        let mut valid = Vec::new();
        {
            let mut stmt = tx
                .prepare("SELECT 1 FROM nodes WHERE id = ?1 AND last_seen >= ?2")
                .map_err(store_err)?;
            for peer in peers {
                if stmt
                    .exists(rusqlite::params![peer, cutoff])
                    .map_err(store_err)?
                {
                    valid.push(peer.clone());
                }
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(valid)
    }

    fn active_hosts(&self, kind: &str, limit: usize) -> VipnodeResult<Vec<Node>> {
        let cutoff = timestamp(active_cutoff(self.clock.now()));
        let conn = self.lock()?;
        Self::query_nodes(
            &conn,
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes
                 WHERE is_host = 1 AND last_seen >= ?1 AND (?2 = '' OR kind = ?2)
                 ORDER BY last_seen DESC, id ASC
                 LIMIT ?3"
            ),
            rusqlite::params![cutoff, kind, limit as i64],
        )
    }

    fn stats(&self) -> VipnodeResult<Stats> {
        let cutoff = timestamp(active_cutoff(self.clock.now()));
        let conn = self.lock()?;
        let (active_hosts, total_hosts, active_clients, total): (i64, i64, i64, i64) = conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN is_host = 1 AND last_seen >= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN is_host = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN is_host = 0 AND last_seen >= ?1 THEN 1 ELSE 0 END), 0),
                    COUNT(*)
                 FROM nodes",
                rusqlite::params![cutoff],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(store_err)?;
        Ok(Stats {
            num_active_hosts: active_hosts as usize,
            num_total_hosts: total_hosts as usize,
            num_active_clients: active_clients as usize,
            num_total_nodes: total as usize,
        })
    }
}
