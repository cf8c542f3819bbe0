//! SQLite storage implementation

use crate::peer::{PeerAddrInfo, PeerId};
use crate::storage::schema::initialize_schema;
use crate::storage::{
    DialVisitRecord, RawVisitRecord, RunRecord, RunState, Storage, StorageError, StorageResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
        let started_at: String = row.get(1)?;
        let finished_at: Option<String> = row.get(2)?;
        let state: String = row.get(3)?;
        Ok(RunRecord {
            id: row.get(0)?,
            started_at: parse_ts(&started_at),
            finished_at: finished_at.as_deref().map(parse_ts),
            state: RunState::from_db_string(&state).unwrap_or(RunState::Started),
            crawled_peers: row.get::<_, i64>(4)? as u64,
            dialable_peers: row.get::<_, i64>(5)? as u64,
            undialable_peers: row.get::<_, i64>(6)? as u64,
            remaining_queue: row.get::<_, i64>(7)? as u64,
        })
    }
}

const RUN_COLUMNS: &str = "id, started_at, finished_at, state, crawled_peers, \
                           dialable_peers, undialable_peers, remaining_queue";

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl Storage for SqliteStorage {
    fn init_crawl_run(&mut self) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO crawls (started_at, state) VALUES (?1, ?2)",
            params![Utc::now().to_rfc3339(), RunState::Started.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_crawl_run(&mut self, run: &RunRecord) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawls
             SET finished_at = ?1, state = ?2, crawled_peers = ?3,
                 dialable_peers = ?4, undialable_peers = ?5, remaining_queue = ?6
             WHERE id = ?7",
            params![
                run.finished_at.map(|t| t.to_rfc3339()),
                run.state.to_db_string(),
                run.crawled_peers as i64,
                run.dialable_peers as i64,
                run.undialable_peers as i64,
                run.remaining_queue as i64,
                run.id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run.id));
        }
        Ok(())
    }

    fn get_run(&mut self, run_id: i64) -> StorageResult<RunRecord> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM crawls WHERE id = ?1");
        self.conn
            .query_row(&sql, params![run_id], Self::row_to_run)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&mut self) -> StorageResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM crawls ORDER BY id DESC LIMIT 1");
        Ok(self.conn.query_row(&sql, [], Self::row_to_run).optional()?)
    }

    fn insert_raw_visit(&mut self, visit: &RawVisitRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO raw_visits (
                crawl_id, crawler_id, peer_id, addrs, agent_version, protocols,
                neighbor_count, error_kind, error_message, discovery_error,
                error_bits, exposed_api, connect_duration_ms, visit_duration_ms,
                visit_started_at, visit_ended_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                visit.crawl_id,
                visit.crawler_id,
                visit.peer_id,
                to_json(&visit.addrs)?,
                visit.agent_version,
                to_json(&visit.protocols)?,
                visit.neighbor_count as i64,
                visit.error_kind,
                visit.error_message,
                visit.discovery_error,
                visit.error_bits as i64,
                visit.exposed_api,
                visit.connect_duration_ms,
                visit.visit_duration_ms,
                visit.visit_started_at.to_rfc3339(),
                visit.visit_ended_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn insert_dial_visit(&mut self, visit: &DialVisitRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO dial_visits (
                dialer_id, peer_id, success, error_kind, error_message,
                attempts, dial_duration_ms, dialed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                visit.dialer_id,
                visit.peer_id,
                visit.success,
                visit.error_kind,
                visit.error_message,
                visit.attempts as i64,
                visit.dial_duration_ms,
                visit.dialed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn persist_neighbor_edges(
        &mut self,
        crawl_id: i64,
        peer_id: &str,
        neighbor_ids: &[String],
        error_bits: u16,
    ) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO neighbor_edges (crawl_id, peer_id, neighbor_id, error_bits)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for neighbor in neighbor_ids {
                stmt.execute(params![crawl_id, peer_id, neighbor, error_bits as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn persist_crawl_properties(
        &mut self,
        crawl_id: i64,
        properties: &HashMap<String, HashMap<String, u64>>,
    ) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO crawl_properties (crawl_id, property, value, count)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (property, table) in properties {
                for (value, count) in table {
                    stmt.execute(params![crawl_id, property, value, *count as i64])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_crawl_properties(
        &mut self,
        crawl_id: i64,
        property: &str,
    ) -> StorageResult<HashMap<String, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT value, count FROM crawl_properties WHERE crawl_id = ?1 AND property = ?2",
        )?;
        let rows = stmt.query_map(params![crawl_id, property], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut table = HashMap::new();
        for row in rows {
            let (value, count) = row?;
            table.insert(value, count);
        }
        Ok(table)
    }

    fn query_cached_peers(&mut self, limit: usize) -> StorageResult<Vec<PeerAddrInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT peer_id, addrs FROM raw_visits
             WHERE error_kind IS NULL
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut peers = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for row in rows {
            if peers.len() >= limit {
                break;
            }
            let (peer_hex, addrs_json) = row?;
            let Some(peer_id) = PeerId::from_hex(&peer_hex) else {
                continue;
            };
            if !seen.insert(peer_id) {
                continue;
            }
            let addr_strs: Vec<String> = serde_json::from_str(&addrs_json)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let addrs: Vec<SocketAddr> =
                addr_strs.iter().filter_map(|a| a.parse().ok()).collect();
            peers.push(PeerAddrInfo::new(peer_id, addrs));
        }
        Ok(peers)
    }

    fn count_visits(&mut self, crawl_id: i64) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_visits WHERE crawl_id = ?1",
            params![crawl_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(crawl_id: i64, peer: &str, error_kind: Option<&str>) -> RawVisitRecord {
        RawVisitRecord {
            crawl_id,
            crawler_id: "crawler-01".into(),
            peer_id: PeerId::from_seed(peer).to_string(),
            addrs: vec!["1.0.0.1:4001".into()],
            agent_version: Some("go-ipfs/0.12.1".into()),
            protocols: vec!["/ipfs/kad/1.0.0".into()],
            neighbor_count: 3,
            error_kind: error_kind.map(String::from),
            error_message: error_kind.map(|k| format!("{k} while dialing")),
            discovery_error: None,
            error_bits: 0,
            exposed_api: false,
            connect_duration_ms: 42,
            visit_duration_ms: 180,
            visit_started_at: Utc::now(),
            visit_ended_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_lifecycle() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.init_crawl_run().unwrap();

        let mut run = storage.get_run(run_id).unwrap();
        assert_eq!(run.state, RunState::Started);
        assert!(run.finished_at.is_none());

        run.state = RunState::Succeeded;
        run.finished_at = Some(Utc::now());
        run.crawled_peers = 10;
        run.dialable_peers = 8;
        run.undialable_peers = 2;
        storage.update_crawl_run(&run).unwrap();

        let stored = storage.get_run(run_id).unwrap();
        assert_eq!(stored.state, RunState::Succeeded);
        assert_eq!(stored.crawled_peers, 10);
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn test_update_unknown_run_fails() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run = RunRecord {
            id: 999,
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Failed,
            crawled_peers: 0,
            dialable_peers: 0,
            undialable_peers: 0,
            remaining_queue: 0,
        };
        assert!(matches!(
            storage.update_crawl_run(&run),
            Err(StorageError::RunNotFound(999))
        ));
    }

    #[test]
    fn test_raw_visits_are_counted_per_run() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_a = storage.init_crawl_run().unwrap();
        let run_b = storage.init_crawl_run().unwrap();

        storage.insert_raw_visit(&visit(run_a, "p1", None)).unwrap();
        storage.insert_raw_visit(&visit(run_a, "p2", None)).unwrap();
        storage.insert_raw_visit(&visit(run_b, "p1", None)).unwrap();

        assert_eq!(storage.count_visits(run_a).unwrap(), 2);
        assert_eq!(storage.count_visits(run_b).unwrap(), 1);
    }

    #[test]
    fn test_crawl_properties_roundtrip() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.init_crawl_run().unwrap();

        let mut properties = HashMap::new();
        properties.insert(
            "agent_version".to_string(),
            HashMap::from([("go-ipfs/0.12.1".to_string(), 5u64)]),
        );
        properties.insert(
            "conn_errors".to_string(),
            HashMap::from([
                ("dial_timeout".to_string(), 3u64),
                ("connection_refused".to_string(), 1u64),
            ]),
        );
        storage
            .persist_crawl_properties(run_id, &properties)
            .unwrap();

        let errors = storage.get_crawl_properties(run_id, "conn_errors").unwrap();
        assert_eq!(errors.get("dial_timeout"), Some(&3));
        assert_eq!(errors.get("connection_refused"), Some(&1));

        let agents = storage
            .get_crawl_properties(run_id, "agent_version")
            .unwrap();
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn test_cached_peers_skip_failures_and_duplicates() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.init_crawl_run().unwrap();

        storage.insert_raw_visit(&visit(run_id, "ok-1", None)).unwrap();
        storage
            .insert_raw_visit(&visit(run_id, "bad", Some("dial_timeout")))
            .unwrap();
        storage.insert_raw_visit(&visit(run_id, "ok-2", None)).unwrap();
        // A repeat visit of ok-1 must not produce a duplicate entry.
        storage.insert_raw_visit(&visit(run_id, "ok-1", None)).unwrap();

        let peers = storage.query_cached_peers(10).unwrap();
        assert_eq!(peers.len(), 2);
        // Most recent visit first.
        assert_eq!(peers[0].peer_id, PeerId::from_seed("ok-1"));
        assert_eq!(peers[1].peer_id, PeerId::from_seed("ok-2"));
        assert_eq!(peers[0].addrs, vec!["1.0.0.1:4001".parse().unwrap()]);
    }

    #[test]
    fn test_cached_peers_respect_limit() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.init_crawl_run().unwrap();
        for i in 0..5 {
            storage
                .insert_raw_visit(&visit(run_id, &format!("peer-{i}"), None))
                .unwrap();
        }
        assert_eq!(storage.query_cached_peers(3).unwrap().len(), 3);
    }

    #[test]
    fn test_neighbor_edges() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.init_crawl_run().unwrap();

        let peer = PeerId::from_seed("center").to_string();
        let neighbors: Vec<String> = (0..4)
            .map(|i| PeerId::from_seed(&format!("n{i}")).to_string())
            .collect();
        storage
            .persist_neighbor_edges(run_id, &peer, &neighbors, 0b0000_0000_0000_0010)
            .unwrap();

        let count: i64 = storage
            .conn
            .query_row(
                "SELECT COUNT(*) FROM neighbor_edges WHERE crawl_id = ?1 AND peer_id = ?2",
                params![run_id, peer],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_dial_visit_insert() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let record = DialVisitRecord {
            dialer_id: "dialer-01".into(),
            peer_id: PeerId::from_seed("probed").to_string(),
            success: false,
            error_kind: Some("connection_refused".into()),
            error_message: Some("connection refused".into()),
            attempts: 2,
            dial_duration_ms: 140,
            dialed_at: Utc::now(),
        };
        storage.insert_dial_visit(&record).unwrap();
    }

    #[test]
    fn test_latest_run() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        assert!(storage.get_latest_run().unwrap().is_none());

        storage.init_crawl_run().unwrap();
        let second = storage.init_crawl_run().unwrap();
        assert_eq!(storage.get_latest_run().unwrap().unwrap().id, second);
    }
}
