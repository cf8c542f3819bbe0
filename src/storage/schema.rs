//! SQLite schema bootstrap

use rusqlite::Connection;

/// Creates all tables and indexes if they do not exist yet
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS crawls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            state TEXT NOT NULL,
            crawled_peers INTEGER NOT NULL DEFAULT 0,
            dialable_peers INTEGER NOT NULL DEFAULT 0,
            undialable_peers INTEGER NOT NULL DEFAULT 0,
            remaining_queue INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS raw_visits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            crawl_id INTEGER NOT NULL REFERENCES crawls(id),
            crawler_id TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            addrs TEXT NOT NULL,
            agent_version TEXT,
            protocols TEXT NOT NULL,
            neighbor_count INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            error_message TEXT,
            discovery_error TEXT,
            error_bits INTEGER NOT NULL DEFAULT 0,
            exposed_api INTEGER NOT NULL DEFAULT 0,
            connect_duration_ms INTEGER NOT NULL DEFAULT 0,
            visit_duration_ms INTEGER NOT NULL DEFAULT 0,
            visit_started_at TEXT NOT NULL,
            visit_ended_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_raw_visits_crawl
            ON raw_visits(crawl_id);
        CREATE INDEX IF NOT EXISTS idx_raw_visits_peer
            ON raw_visits(peer_id);

        CREATE TABLE IF NOT EXISTS neighbor_edges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            crawl_id INTEGER NOT NULL REFERENCES crawls(id),
            peer_id TEXT NOT NULL,
            neighbor_id TEXT NOT NULL,
            error_bits INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_neighbor_edges_crawl
            ON neighbor_edges(crawl_id, peer_id);

        CREATE TABLE IF NOT EXISTS crawl_properties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            crawl_id INTEGER NOT NULL REFERENCES crawls(id),
            property TEXT NOT NULL,
            value TEXT NOT NULL,
            count INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_crawl_properties_crawl
            ON crawl_properties(crawl_id, property);

        CREATE TABLE IF NOT EXISTS dial_visits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dialer_id TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            success INTEGER NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            dial_duration_ms INTEGER NOT NULL DEFAULT 0,
            dialed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dial_visits_peer
            ON dial_visits(peer_id);
        ",
    )
}
