//! Storage layer
//!
//! This module defines the trait interface the crawl pipeline persists
//! through, the record types it exchanges, and a no-op backend for dry
//! runs. The SQLite implementation lives in [`sqlite`].

mod schema;
mod sqlite;

pub use sqlite::SqliteStorage;

use crate::peer::PeerAddrInfo;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("run not found: {0}")]
    RunNotFound(i64),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Terminal state of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn to_db_string(self) -> &'static str {
        match self {
            RunState::Started => "started",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "started" => Some(RunState::Started),
            "succeeded" => Some(RunState::Succeeded),
            "failed" => Some(RunState::Failed),
            "cancelled" => Some(RunState::Cancelled),
            _ => None,
        }
    }
}

/// A crawl run row
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub crawled_peers: u64,
    pub dialable_peers: u64,
    pub undialable_peers: u64,
    pub remaining_queue: u64,
}

/// A denormalized raw-visit row, one per visited peer
#[derive(Debug, Clone)]
pub struct RawVisitRecord {
    pub crawl_id: i64,
    pub crawler_id: String,
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub agent_version: Option<String>,
    pub protocols: Vec<String>,
    pub neighbor_count: u64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub discovery_error: Option<String>,
    pub error_bits: u16,
    pub exposed_api: bool,
    pub connect_duration_ms: i64,
    pub visit_duration_ms: i64,
    pub visit_started_at: DateTime<Utc>,
    pub visit_ended_at: DateTime<Utc>,
}

/// A liveness-probe outcome row from the monitor
#[derive(Debug, Clone)]
pub struct DialVisitRecord {
    pub dialer_id: String,
    pub peer_id: String,
    pub success: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub dial_duration_ms: i64,
    pub dialed_at: DateTime<Utc>,
}

/// Trait for storage backend implementations
///
/// The crawl pipeline only talks to storage through this interface; the
/// persister pool serializes access behind a mutex, so methods take
/// `&mut self`.
pub trait Storage: Send {
    /// Opens a new crawl run row in state Started and returns its ID
    fn init_crawl_run(&mut self) -> StorageResult<i64>;

    /// Finalizes a crawl run with its terminal state and counters
    fn update_crawl_run(&mut self, run: &RunRecord) -> StorageResult<()>;

    /// Fetches a run by ID
    fn get_run(&mut self, run_id: i64) -> StorageResult<RunRecord>;

    /// Fetches the most recent run, if any
    fn get_latest_run(&mut self) -> StorageResult<Option<RunRecord>>;

    /// Inserts one denormalized raw-visit row
    fn insert_raw_visit(&mut self, visit: &RawVisitRecord) -> StorageResult<()>;

    /// Inserts one dial-visit row
    fn insert_dial_visit(&mut self, visit: &DialVisitRecord) -> StorageResult<()>;

    /// Persists the neighbor edges of one visited peer
    fn persist_neighbor_edges(
        &mut self,
        crawl_id: i64,
        peer_id: &str,
        neighbor_ids: &[String],
        error_bits: u16,
    ) -> StorageResult<()>;

    /// Persists the run's frequency tables in one transaction
    ///
    /// `properties` maps a property name (`agent_version`, `protocol`,
    /// `conn_errors`) to its value → count table. The batch either lands
    /// completely or rolls back.
    fn persist_crawl_properties(
        &mut self,
        crawl_id: i64,
        properties: &HashMap<String, HashMap<String, u64>>,
    ) -> StorageResult<()>;

    /// Reads back a frequency table of the given run
    fn get_crawl_properties(
        &mut self,
        crawl_id: i64,
        property: &str,
    ) -> StorageResult<HashMap<String, u64>>;

    /// Returns recently dialable peers for seeding a new run
    ///
    /// Most recently visited peers come first; each peer appears once.
    fn query_cached_peers(&mut self, limit: usize) -> StorageResult<Vec<PeerAddrInfo>>;

    /// Number of raw visits recorded for a run
    fn count_visits(&mut self, crawl_id: i64) -> StorageResult<u64>;
}

/// A storage backend that records nothing
///
/// Used for dry runs; every write succeeds and every query is empty.
#[derive(Debug, Default)]
pub struct NoopStorage;

impl Storage for NoopStorage {
    fn init_crawl_run(&mut self) -> StorageResult<i64> {
        Ok(0)
    }

    fn update_crawl_run(&mut self, _run: &RunRecord) -> StorageResult<()> {
        Ok(())
    }

    fn get_run(&mut self, run_id: i64) -> StorageResult<RunRecord> {
        Err(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&mut self) -> StorageResult<Option<RunRecord>> {
        Ok(None)
    }

    fn insert_raw_visit(&mut self, _visit: &RawVisitRecord) -> StorageResult<()> {
        Ok(())
    }

    fn insert_dial_visit(&mut self, _visit: &DialVisitRecord) -> StorageResult<()> {
        Ok(())
    }

    fn persist_neighbor_edges(
        &mut self,
        _crawl_id: i64,
        _peer_id: &str,
        _neighbor_ids: &[String],
        _error_bits: u16,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn persist_crawl_properties(
        &mut self,
        _crawl_id: i64,
        _properties: &HashMap<String, HashMap<String, u64>>,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn get_crawl_properties(
        &mut self,
        _crawl_id: i64,
        _property: &str,
    ) -> StorageResult<HashMap<String, u64>> {
        Ok(HashMap::new())
    }

    fn query_cached_peers(&mut self, _limit: usize) -> StorageResult<Vec<PeerAddrInfo>> {
        Ok(Vec::new())
    }

    fn count_visits(&mut self, _crawl_id: i64) -> StorageResult<u64> {
        Ok(0)
    }
}
