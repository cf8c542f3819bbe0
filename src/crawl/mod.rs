//! Crawl engine
//!
//! This module contains the crawl pipeline: the scheduler that owns the
//! frontier, the crawler workers that visit peers, and the persister
//! workers that write results to storage. [`crawl`] wires them together
//! for one run.

mod crawler;
mod persister;
mod result;
mod scheduler;

pub use crawler::Crawler;
pub use persister::Persister;
pub use result::VisitResult;
pub use scheduler::{CrawlSummary, Scheduler};

use crate::config::Config;
use crate::net::sim::SimNetwork;
use crate::peer::PeerAddrInfo;
use crate::storage::{NoopStorage, SqliteStorage, Storage};
use crate::KadmapError;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A unit of crawl work: one peer to visit
pub type CrawlJob = PeerAddrInfo;

/// Runs one complete crawl according to the configuration
///
/// Initialization failures (network backend, storage) abort before any
/// worker starts. Cancelling `cancel` stops the run gracefully and marks
/// it Cancelled.
pub async fn crawl(
    config: &Config,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<CrawlSummary, KadmapError> {
    let net = build_sim_network(config)?;

    let storage: Arc<Mutex<dyn Storage>> = if dry_run {
        tracing::info!("Dry run: results will not be persisted");
        Arc::new(Mutex::new(NoopStorage))
    } else {
        Arc::new(Mutex::new(SqliteStorage::new(Path::new(
            &config.output.database_path,
        ))?))
    };

    let bootstrap = resolve_bootstrap(config, &net)?;
    let scheduler = Scheduler::new(net, storage, config.crawl.clone());
    scheduler.run(bootstrap, cancel).await
}

/// Builds the configured network backend
///
/// Only the bundled sim backend is constructed here; real stacks are
/// wired up by embedding [`Scheduler`] directly with their own
/// [`Network`](crate::net::Network) implementation.
pub(crate) fn build_sim_network(config: &Config) -> Result<Arc<SimNetwork>, KadmapError> {
    let path = config.network.topology_path.as_deref().ok_or_else(|| {
        KadmapError::Config(crate::ConfigError::Validation(
            "network.topology_path is required for the sim backend".to_string(),
        ))
    })?;
    let net = SimNetwork::from_toml_file(Path::new(path))?;
    tracing::info!(peers = net.peer_count(), topology = path, "Loaded sim topology");
    Ok(Arc::new(net))
}

/// Resolves bootstrap entries, filling in addresses from the topology
/// for entries that only carry a name
fn resolve_bootstrap(
    config: &Config,
    net: &SimNetwork,
) -> Result<Vec<PeerAddrInfo>, KadmapError> {
    let mut bootstrap = Vec::with_capacity(config.bootstrap.len());
    for entry in &config.bootstrap {
        let info = entry.to_addr_info()?;
        if info.addrs.is_empty() {
            if let Some(resolved) = entry.name.as_deref().and_then(|n| net.addr_info_of(n)) {
                bootstrap.push(resolved);
                continue;
            }
        }
        bootstrap.push(info);
    }
    Ok(bootstrap)
}
