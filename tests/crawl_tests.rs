//! Integration tests for the crawl pipeline
//!
//! These tests drive the full crawl cycle end-to-end: a topology file,
//! a real configuration, the sim network backend and an on-disk SQLite
//! database.

use kadmap::config::Config;
use kadmap::crawl::crawl;
use kadmap::monitor::MonitorScheduler;
use kadmap::net::sim::SimNetwork;
use kadmap::storage::{RunState, SqliteStorage, Storage};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Body of the `[crawl]` section used by most tests
const DEFAULT_CRAWL: &str = "crawler_count = 2\npersister_count = 1\ndial_timeout_secs = 5";

/// Writes a topology file and a matching config into `dir`
fn write_fixtures(
    dir: &TempDir,
    topology: &str,
    bootstrap_names: &[&str],
    crawl_section: &str,
) -> Config {
    let topology_path = dir.path().join("topology.toml");
    std::fs::write(&topology_path, topology).unwrap();

    let db_path = dir.path().join("kadmap.db");
    let bootstrap: String = bootstrap_names
        .iter()
        .map(|name| format!("[[bootstrap]]\nname = \"{name}\"\n\n"))
        .collect();
    let raw = format!(
        r#"
[network]
backend = "sim"
topology_path = "{}"

[output]
database_path = "{}"

[crawl]
{crawl_section}

{bootstrap}
"#,
        topology_path.display(),
        db_path.display(),
    );

    let config: Config = toml::from_str(&raw).unwrap();
    config.validate().unwrap();
    config
}

fn db_path(config: &Config) -> PathBuf {
    PathBuf::from(&config.output.database_path)
}

#[tokio::test]
async fn test_full_crawl_visits_all_reachable_peers() {
    let dir = TempDir::new().unwrap();
    let topology = r#"
        [[peers]]
        name = "boot"
        addrs = ["1.0.0.1:4001"]
        agent = "go-ipfs/0.12.1"
        protocols = ["/ipfs/kad/1.0.0"]
        neighbors = ["n1", "n2", "n3"]

        [[peers]]
        name = "n1"
        addrs = ["1.0.0.2:4001"]
        agent = "go-ipfs/0.11.0"
        protocols = ["/ipfs/kad/1.0.0"]

        [[peers]]
        name = "n2"
        addrs = ["1.0.0.3:4001"]

        [[peers]]
        name = "n3"
        addrs = ["1.0.0.4:4001"]
    "#;
    let config = write_fixtures(&dir, topology, &["boot"], DEFAULT_CRAWL);

    let summary = crawl(&config, false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.crawled_peers, 4);
    assert_eq!(summary.dialable_peers, 4);
    assert_eq!(summary.remaining_queue, 0);
    assert_eq!(summary.state, RunState::Succeeded);
    assert_eq!(summary.agent_versions.get("go-ipfs/0.12.1"), Some(&1));
    assert_eq!(summary.protocols.get("/ipfs/kad/1.0.0"), Some(&2));

    // Every visit reached the database, and the run record was finalized.
    let mut storage = SqliteStorage::new(&db_path(&config)).unwrap();
    let run = storage.get_run(summary.crawl_id).unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.crawled_peers, 4);
    assert_eq!(storage.count_visits(summary.crawl_id).unwrap(), 4);

    let agents = storage
        .get_crawl_properties(summary.crawl_id, "agent_version")
        .unwrap();
    assert_eq!(agents.get("go-ipfs/0.12.1"), Some(&1));
}

#[tokio::test]
async fn test_mutual_neighbors_visited_exactly_once() {
    let dir = TempDir::new().unwrap();
    let topology = r#"
        [[peers]]
        name = "a"
        addrs = ["1.0.0.1:4001"]
        neighbors = ["b"]

        [[peers]]
        name = "b"
        addrs = ["1.0.0.2:4001"]
        neighbors = ["a"]
    "#;
    let config = write_fixtures(&dir, topology, &["a", "b"], DEFAULT_CRAWL);

    let summary = crawl(&config, false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.crawled_peers, 2);
    assert_eq!(summary.state, RunState::Succeeded);

    let mut storage = SqliteStorage::new(&db_path(&config)).unwrap();
    assert_eq!(storage.count_visits(summary.crawl_id).unwrap(), 2);
}

#[tokio::test]
async fn test_unreachable_addresses_recorded_as_no_public_address() {
    let dir = TempDir::new().unwrap();
    // The peer only advertises a private address.
    let topology = r#"
        [[peers]]
        name = "hidden"
        addrs = ["192.168.7.7:4001"]
    "#;
    let config = write_fixtures(&dir, topology, &["hidden"], DEFAULT_CRAWL);

    let summary = crawl(&config, false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.crawled_peers, 1);
    assert_eq!(summary.dialable_peers, 0);
    assert_eq!(summary.conn_errors.get("no_public_address"), Some(&1));
}

#[tokio::test]
async fn test_crawl_limit_bounds_an_unbounded_frontier() {
    let dir = TempDir::new().unwrap();
    // A chain: every peer reveals the next one, so an unlimited crawl
    // would walk all eight. Later peers answer slowly so the in-flight
    // visit at limit time is aborted by the draining pass instead of
    // sneaking in as a third visit.
    let mut topology = String::new();
    for i in 0..8 {
        let latency = if i == 0 { 0 } else { 200 };
        topology.push_str(&format!(
            "[[peers]]\nname = \"p{i}\"\naddrs = [\"1.0.0.{}:4001\"]\n\
             neighbors = [\"p{}\"]\nlatency_ms = {latency}\n\n",
            i + 1,
            i + 1,
        ));
    }
    let config = write_fixtures(
        &dir,
        &topology,
        &["p0"],
        "crawler_count = 1\npersister_count = 1\ndial_timeout_secs = 5\ncrawl_limit = 2",
    );

    let summary = crawl(&config, false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.crawled_peers, 2);
    assert!(summary.remaining_queue > 0);
    assert_ne!(summary.state, RunState::Succeeded);
}

#[tokio::test]
async fn test_cancellation_marks_run_cancelled_and_keeps_finished_visits() {
    let dir = TempDir::new().unwrap();
    let mut topology = String::from(
        "[[peers]]\nname = \"boot\"\naddrs = [\"1.0.0.1:4001\"]\n\
         neighbors = [\"s0\", \"s1\", \"s2\", \"s3\", \"s4\"]\n\n",
    );
    for i in 0..5 {
        topology.push_str(&format!(
            "[[peers]]\nname = \"s{i}\"\naddrs = [\"1.0.1.{}:4001\"]\nlatency_ms = 2000\n\n",
            i + 1,
        ));
    }
    let config = write_fixtures(
        &dir,
        &topology,
        &["boot"],
        "crawler_count = 1\ndial_timeout_secs = 30",
    );

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };

    let start = std::time::Instant::now();
    let summary = crawl(&config, false, cancel).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.remaining_queue > 0);
    assert!(
        start.elapsed() < std::time::Duration::from_secs(2),
        "in-flight dials must unblock promptly on cancellation"
    );

    // No persist job for an already-completed visit was dropped.
    let mut storage = SqliteStorage::new(&db_path(&config)).unwrap();
    assert_eq!(
        storage.count_visits(summary.crawl_id).unwrap(),
        summary.crawled_peers
    );
}

#[tokio::test]
async fn test_dry_run_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let topology = r#"
        [[peers]]
        name = "solo"
        addrs = ["1.0.0.1:4001"]
    "#;
    let config = write_fixtures(&dir, topology, &["solo"], DEFAULT_CRAWL);

    let summary = crawl(&config, true, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.crawled_peers, 1);
    assert_eq!(summary.state, RunState::Succeeded);
    assert!(
        !db_path(&config).exists(),
        "a dry run must not create the database"
    );
}

#[tokio::test]
async fn test_neighbor_persistence_writes_edges() {
    let dir = TempDir::new().unwrap();
    let topology = r#"
        [[peers]]
        name = "hub"
        addrs = ["1.0.0.1:4001"]
        neighbors = ["spoke1", "spoke2"]

        [[peers]]
        name = "spoke1"
        addrs = ["1.0.0.2:4001"]

        [[peers]]
        name = "spoke2"
        addrs = ["1.0.0.3:4001"]
    "#;
    let config = write_fixtures(
        &dir,
        topology,
        &["hub"],
        "crawler_count = 2\npersister_count = 1\ndial_timeout_secs = 5\npersist_neighbors = true",
    );

    let summary = crawl(&config, false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.crawled_peers, 3);

    // The hub's two edges must be on disk exactly once each.
    let conn = rusqlite::Connection::open(db_path(&config)).unwrap();
    let edge_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM neighbor_edges WHERE crawl_id = ?1 AND peer_id = ?2",
            rusqlite::params![
                summary.crawl_id,
                SimNetwork::id_of("hub").to_string()
            ],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(edge_count, 2);
}

#[tokio::test]
async fn test_monitor_round_probes_peers_cached_by_a_crawl() {
    let dir = TempDir::new().unwrap();
    let topology = r#"
        [[peers]]
        name = "boot"
        addrs = ["1.0.0.1:4001"]
        neighbors = ["n1"]

        [[peers]]
        name = "n1"
        addrs = ["1.0.0.2:4001"]
    "#;
    let config = write_fixtures(&dir, topology, &["boot"], DEFAULT_CRAWL);

    let summary = crawl(&config, false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.crawled_peers, 2);

    // The monitor seeds its probe set from the peers the crawl found
    // dialable.
    let storage: Arc<Mutex<dyn Storage>> = Arc::new(Mutex::new(
        SqliteStorage::new(&db_path(&config)).unwrap(),
    ));
    let peers = storage.lock().unwrap().query_cached_peers(100).unwrap();
    assert_eq!(peers.len(), 2);

    let net = Arc::new(SimNetwork::from_toml_file(&dir.path().join("topology.toml")).unwrap());
    let scheduler = MonitorScheduler::new(net, Arc::clone(&storage), config.monitor.clone());
    let probe_summary = scheduler
        .run(peers, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(probe_summary.dialed, 2);
    assert_eq!(probe_summary.alive, 2);

    let conn = rusqlite::Connection::open(db_path(&config)).unwrap();
    let dials: i64 = conn
        .query_row("SELECT COUNT(*) FROM dial_visits", [], |row| row.get(0))
        .unwrap();
    assert_eq!(dials, 2);
}
