//! Statistics reporting
//!
//! Loads the aggregate results of the most recent crawl run from storage
//! and prints a human-readable report. Used by the `stats` subcommand.

use crate::storage::{RunRecord, Storage};
use crate::KadmapError;
use std::collections::HashMap;

/// Aggregate statistics of one crawl run
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    pub run: RunRecord,
    pub visit_count: u64,
    pub agent_versions: HashMap<String, u64>,
    pub protocols: HashMap<String, u64>,
    pub conn_errors: HashMap<String, u64>,
}

/// Loads statistics of the latest run, if any exists
pub fn load_statistics(storage: &mut dyn Storage) -> Result<Option<CrawlStatistics>, KadmapError> {
    let Some(run) = storage.get_latest_run()? else {
        return Ok(None);
    };

    let visit_count = storage.count_visits(run.id)?;
    let agent_versions = storage.get_crawl_properties(run.id, "agent_version")?;
    let protocols = storage.get_crawl_properties(run.id, "protocol")?;
    let conn_errors = storage.get_crawl_properties(run.id, "conn_errors")?;

    Ok(Some(CrawlStatistics {
        run,
        visit_count,
        agent_versions,
        protocols,
        conn_errors,
    }))
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &CrawlStatistics) {
    let run = &stats.run;

    println!("=== Crawl {} ===\n", run.id);
    println!("State:            {}", run.state.to_db_string());
    println!("Started:          {}", run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        println!("Finished:         {}", finished.to_rfc3339());
        println!("Duration:         {}", finished - run.started_at);
    }
    println!("Crawled peers:    {}", run.crawled_peers);
    println!("Dialable peers:   {}", run.dialable_peers);
    println!("Undialable peers: {}", run.undialable_peers);
    println!("Remaining queue:  {}", run.remaining_queue);
    println!("Persisted visits: {}", stats.visit_count);

    print_table("Agent Versions", &stats.agent_versions, run.crawled_peers);
    print_table("Protocols", &stats.protocols, run.crawled_peers);
    print_table("Dial Errors", &stats.conn_errors, run.crawled_peers);
}

/// Prints one frequency table sorted by descending count
fn print_table(title: &str, table: &HashMap<String, u64>, total: u64) {
    if table.is_empty() {
        return;
    }
    println!("\n{title}:");

    let mut entries: Vec<_> = table.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    for (value, count) in entries {
        let percentage = if total > 0 {
            (*count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!("  {value}: {count} ({percentage:.1}%)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RunState, SqliteStorage};
    use chrono::Utc;

    #[test]
    fn test_load_statistics_empty_database() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        assert!(load_statistics(&mut storage).unwrap().is_none());
    }

    #[test]
    fn test_load_statistics_latest_run() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.init_crawl_run().unwrap();

        let mut run = storage.get_run(run_id).unwrap();
        run.state = RunState::Succeeded;
        run.finished_at = Some(Utc::now());
        run.crawled_peers = 3;
        run.dialable_peers = 2;
        run.undialable_peers = 1;
        storage.update_crawl_run(&run).unwrap();

        let mut properties = HashMap::new();
        properties.insert(
            "protocol".to_string(),
            HashMap::from([("/ipfs/kad/1.0.0".to_string(), 2u64)]),
        );
        storage.persist_crawl_properties(run_id, &properties).unwrap();

        let stats = load_statistics(&mut storage).unwrap().unwrap();
        assert_eq!(stats.run.id, run_id);
        assert_eq!(stats.run.crawled_peers, 3);
        assert_eq!(stats.protocols.get("/ipfs/kad/1.0.0"), Some(&2));
        assert!(stats.agent_versions.is_empty());
    }
}
