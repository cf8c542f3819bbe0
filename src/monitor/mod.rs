//! Monitor: continuous liveness probing
//!
//! The monitor revisits previously seen peers in rounds, checking whether
//! they still accept connections. It reuses the crawl's worker-pool
//! machinery but with [`Dialer`]s, which retry under an explicit
//! per-error policy instead of fetching neighbors.

mod dialer;
mod scheduler;

pub use dialer::{retry_decision, DialJob, DialResult, Dialer, RetryDecision, MAX_ATTEMPTS};
pub use scheduler::{MonitorScheduler, MonitorSummary};

use crate::config::Config;
use crate::crawl::build_sim_network;
use crate::storage::{SqliteStorage, Storage};
use crate::KadmapError;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause between probing rounds
const ROUND_INTERVAL: Duration = Duration::from_secs(10);

/// Runs probing rounds until cancelled
///
/// Each round probes the most recently dialable peers known to storage,
/// falling back to the configured bootstrap set while the database is
/// still empty.
pub async fn monitor(config: &Config, cancel: CancellationToken) -> Result<(), KadmapError> {
    let net = build_sim_network(config)?;
    let storage: Arc<Mutex<dyn Storage>> = Arc::new(Mutex::new(SqliteStorage::new(Path::new(
        &config.output.database_path,
    ))?));

    let mut rounds: u64 = 0;
    loop {
        let mut peers = storage
            .lock()
            .unwrap()
            .query_cached_peers(config.monitor.probe_limit)?;
        if peers.is_empty() {
            peers = config.bootstrap_peers()?;
            tracing::info!(
                count = peers.len(),
                "No cached peers yet, probing the bootstrap set"
            );
        }

        let scheduler = MonitorScheduler::new(
            Arc::clone(&net) as Arc<dyn crate::net::Network>,
            Arc::clone(&storage),
            config.monitor.clone(),
        );
        let summary = scheduler.run(peers, cancel.clone()).await?;
        rounds += 1;
        tracing::info!(
            round = rounds,
            alive = summary.alive,
            dead = summary.dead,
            "Monitor round complete"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ROUND_INTERVAL) => {}
        }
    }

    tracing::info!(rounds, "Monitor stopped");
    Ok(())
}
