//! Scheduler: crawl orchestration
//!
//! The scheduler owns the frontier and all aggregate statistics of a run.
//! It starts the crawler and persister pools, seeds the crawl queue,
//! consumes visit results in a single-threaded loop (so dedup and
//! dispatch decisions are linearizable without locks), detects
//! completion, and drives the ordered shutdown of every pipeline stage.

use crate::config::CrawlConfig;
use crate::crawl::crawler::Crawler;
use crate::crawl::persister::Persister;
use crate::crawl::result::VisitResult;
use crate::crawl::CrawlJob;
use crate::metrics;
use crate::net::api::ExposedApiClient;
use crate::net::Network;
use crate::peer::{PeerAddrInfo, PeerId};
use crate::queue::WorkQueue;
use crate::storage::{RunRecord, RunState, Storage};
use crate::KadmapError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the running loop reports progress, in handled results
const PROGRESS_INTERVAL: u64 = 10;

/// Aggregate outcome of one crawl run
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub crawl_id: i64,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub crawled_peers: u64,
    pub dialable_peers: u64,
    pub undialable_peers: u64,
    pub remaining_queue: u64,
    pub agent_versions: HashMap<String, u64>,
    pub protocols: HashMap<String, u64>,
    pub conn_errors: HashMap<String, u64>,
}

/// The crawl orchestrator
///
/// Frontier state (`queued`, `visited`) is owned exclusively by the
/// scheduler's event loop and never shared; workers stay stateless with
/// respect to it.
pub struct Scheduler {
    net: Arc<dyn Network>,
    storage: Arc<Mutex<dyn Storage>>,
    config: CrawlConfig,

    // Disjoint frontier sets: a peer is in at most one of them, and once
    // visited it is never queued again within the run.
    queued: HashSet<PeerId>,
    visited: HashSet<PeerId>,

    crawl_queue: WorkQueue<CrawlJob>,
    results_queue: WorkQueue<VisitResult>,
    persist_queue: WorkQueue<VisitResult>,

    crawlers: Vec<Arc<Crawler>>,
    persisters: Vec<Arc<Persister>>,
    worker_handles: Vec<JoinHandle<()>>,

    crawled: u64,
    undialable: u64,
    agent_versions: HashMap<String, u64>,
    protocols: HashMap<String, u64>,
    conn_errors: HashMap<String, u64>,
}

impl Scheduler {
    pub fn new(
        net: Arc<dyn Network>,
        storage: Arc<Mutex<dyn Storage>>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            net,
            storage,
            config,
            queued: HashSet::new(),
            visited: HashSet::new(),
            crawl_queue: WorkQueue::new(),
            results_queue: WorkQueue::new(),
            persist_queue: WorkQueue::new(),
            crawlers: Vec::new(),
            persisters: Vec::new(),
            worker_handles: Vec::new(),
            crawled: 0,
            undialable: 0,
            agent_versions: HashMap::new(),
            protocols: HashMap::new(),
            conn_errors: HashMap::new(),
        }
    }

    /// Crawls the network starting from the bootstrap set
    ///
    /// Runs until the frontier is drained, the configured visit limit is
    /// reached, or `cancel` fires. Returns the finalized run summary.
    pub async fn run(
        mut self,
        bootstrap: Vec<PeerAddrInfo>,
        cancel: CancellationToken,
    ) -> Result<CrawlSummary, KadmapError> {
        let started_at = Utc::now();

        // Initializing: a failure to open the run record is fatal and
        // aborts before any worker starts.
        let crawl_id = self.storage.lock().unwrap().init_crawl_run()?;
        self.start_pools(crawl_id);

        tracing::info!(
            crawl_id,
            crawlers = self.config.crawler_count,
            persisters = self.config.persister_count,
            bootstrap = bootstrap.len(),
            "Starting crawl"
        );

        // Seed with bootstrap peers plus optionally cached peers from a
        // previous run; both go through the same dedup gate.
        for peer in bootstrap {
            self.try_dispatch(peer);
        }
        if self.config.cached_peer_limit > 0 {
            let cached = self
                .storage
                .lock()
                .unwrap()
                .query_cached_peers(self.config.cached_peer_limit)?;
            tracing::info!(count = cached.len(), "Seeding cached peers");
            for peer in cached {
                self.try_dispatch(peer);
            }
        }

        // Running: the single-threaded result loop.
        let results_queue = self.results_queue.clone();
        let mut cancelled = false;
        while !self.queued.is_empty() && !self.limit_reached() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Received cancellation signal, stopping crawl");
                    cancelled = true;
                    break;
                }
                result = results_queue.pop() => match result {
                    Some(result) => self.handle_result(result, true),
                    None => break,
                },
            }
        }

        // Draining, in strict order: no result or persist job may be
        // dropped mid-flight.
        self.drain().await;

        // Finished.
        let state = if self.queued.is_empty() && !cancelled {
            RunState::Succeeded
        } else if cancelled {
            RunState::Cancelled
        } else {
            RunState::Failed
        };
        let summary = CrawlSummary {
            crawl_id,
            state,
            started_at,
            finished_at: Utc::now(),
            crawled_peers: self.crawled,
            dialable_peers: self.crawled - self.undialable,
            undialable_peers: self.undialable,
            remaining_queue: self.queued.len() as u64,
            agent_versions: self.agent_versions.clone(),
            protocols: self.protocols.clone(),
            conn_errors: self.conn_errors.clone(),
        };
        self.finalize(&summary)?;
        log_summary(&summary);

        Ok(summary)
    }

    /// Starts the crawler and persister pools with injected sequence IDs
    fn start_pools(&mut self, crawl_id: i64) {
        for seq in 1..=self.config.crawler_count {
            let api = if self.config.check_exposed {
                match ExposedApiClient::new() {
                    Ok(client) => Some(client),
                    Err(err) => {
                        tracing::warn!(error = %err, "Could not build management API client");
                        None
                    }
                }
            } else {
                None
            };
            let crawler = Arc::new(Crawler::new(
                seq,
                Arc::clone(&self.net),
                api,
                self.config.clone(),
            ));
            self.crawlers.push(Arc::clone(&crawler));

            let jobs = self.crawl_queue.clone();
            let results = self.results_queue.clone();
            self.worker_handles
                .push(tokio::spawn(async move { crawler.run(jobs, results).await }));
        }

        for seq in 1..=self.config.persister_count {
            let persister = Arc::new(Persister::new(
                seq,
                Arc::clone(&self.storage),
                crawl_id,
                self.config.persist_neighbors,
            ));
            self.persisters.push(Arc::clone(&persister));

            let queue = self.persist_queue.clone();
            self.worker_handles
                .push(tokio::spawn(async move { persister.run(queue).await }));
        }
    }

    /// Processes one visit result
    ///
    /// Marks the peer visited, updates the frequency tables, forwards the
    /// result to the persist queue and, when `dispatch` is set and the
    /// visit succeeded, tries to dispatch every reported neighbor.
    fn handle_result(&mut self, result: VisitResult, dispatch: bool) {
        let peer_id = result.peer.peer_id;
        tracing::debug!(
            crawler = %result.crawler_id,
            peer = %peer_id.short(),
            dialable = result.is_dialable(),
            "Handling crawl result"
        );

        self.queued.remove(&peer_id);
        self.visited.insert(peer_id);
        self.crawled += 1;
        metrics::record_visited_peer();

        let agent = result
            .agent_version
            .clone()
            .unwrap_or_else(|| "n.a.".to_string());
        *self.agent_versions.entry(agent).or_insert(0) += 1;
        for protocol in &result.protocols {
            *self.protocols.entry(protocol.clone()).or_insert(0) += 1;
        }

        match &result.connect_error {
            Some(err) => {
                self.undialable += 1;
                *self.conn_errors.entry(err.kind().to_string()).or_insert(0) += 1;
            }
            None => {
                if dispatch {
                    for neighbor in &result.neighbors {
                        self.try_dispatch(neighbor.clone());
                    }
                }
            }
        }

        self.persist_queue.push(result);
        metrics::set_crawl_queue_depth(self.crawl_queue.len());
        metrics::set_persist_queue_depth(self.persist_queue.len());

        if self.crawled % PROGRESS_INTERVAL == 0 {
            tracing::info!(
                crawled = self.crawled,
                queued = self.queued.len(),
                undialable = self.undialable,
                "Crawl progress"
            );
        }
    }

    /// Dispatches a peer unless it was already queued or visited
    ///
    /// First writer wins: the check happens synchronously in the result
    /// loop, so a peer reported by several neighbors is dispatched once.
    fn try_dispatch(&mut self, peer: PeerAddrInfo) {
        if self.queued.contains(&peer.peer_id) || self.visited.contains(&peer.peer_id) {
            return;
        }
        self.queued.insert(peer.peer_id);
        self.crawl_queue.push(peer);
        metrics::set_crawl_queue_depth(self.crawl_queue.len());
    }

    fn limit_reached(&self) -> bool {
        self.config.crawl_limit > 0 && self.crawled >= self.config.crawl_limit
    }

    /// Tears the pipeline down stage by stage
    ///
    /// Order matters: stop crawl-queue production, cancel and join the
    /// crawler pool, close the results queue and drain what the crawlers
    /// still produced, close the persist queue, then join the persisters.
    async fn drain(&mut self) {
        self.crawl_queue.done_producing();

        join_all(self.crawlers.iter().map(|c| c.shutdown())).await;

        self.results_queue.done_producing();
        let results_queue = self.results_queue.clone();
        while let Some(result) = results_queue.pop().await {
            // The frontier is closed; results still count and persist.
            self.handle_result(result, false);
        }

        self.persist_queue.done_producing();
        join_all(
            self.persisters
                .iter()
                .map(|p| async { p.sig_done().cancelled().await }),
        )
        .await;

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        self.crawl_queue.close();
    }

    /// Writes the finalized run record and its frequency tables
    fn finalize(&mut self, summary: &CrawlSummary) -> Result<(), KadmapError> {
        let run = RunRecord {
            id: summary.crawl_id,
            started_at: summary.started_at,
            finished_at: Some(summary.finished_at),
            state: summary.state,
            crawled_peers: summary.crawled_peers,
            dialable_peers: summary.dialable_peers,
            undialable_peers: summary.undialable_peers,
            remaining_queue: summary.remaining_queue,
        };

        let mut properties = HashMap::new();
        properties.insert("agent_version".to_string(), summary.agent_versions.clone());
        properties.insert("protocol".to_string(), summary.protocols.clone());
        properties.insert("conn_errors".to_string(), summary.conn_errors.clone());

        let mut storage = self.storage.lock().unwrap();
        storage.update_crawl_run(&run)?;
        storage.persist_crawl_properties(summary.crawl_id, &properties)?;
        Ok(())
    }
}

/// Logs the human-readable end-of-run summary
fn log_summary(summary: &CrawlSummary) {
    for (err, count) in &summary.conn_errors {
        tracing::info!(count = *count, value = %err, "Dial error");
    }
    for (agent, count) in &summary.agent_versions {
        tracing::info!(count = *count, value = %agent, "Agent");
    }
    for (protocol, count) in &summary.protocols {
        tracing::info!(count = *count, value = %protocol, "Protocol");
    }
    tracing::info!(
        state = summary.state.to_db_string(),
        crawled_peers = summary.crawled_peers,
        dialable_peers = summary.dialable_peers,
        undialable_peers = summary.undialable_peers,
        remaining_queue = summary.remaining_queue,
        duration = %(summary.finished_at - summary.started_at),
        "Finished crawl"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::sim::{SimNetwork, SimPeerSpec};
    use crate::net::DialError;
    use crate::storage::SqliteStorage;

    fn config(limit: u64) -> CrawlConfig {
        CrawlConfig {
            crawler_count: 2,
            persister_count: 1,
            dial_timeout_secs: 5,
            crawl_limit: limit,
            ..Default::default()
        }
    }

    fn storage() -> Arc<Mutex<dyn Storage>> {
        Arc::new(Mutex::new(SqliteStorage::new_in_memory().unwrap()))
    }

    async fn run_scheduler(
        net: Arc<SimNetwork>,
        cfg: CrawlConfig,
        bootstrap: &[&str],
    ) -> CrawlSummary {
        let scheduler = Scheduler::new(net.clone(), storage(), cfg);
        let bootstrap = bootstrap
            .iter()
            .map(|name| net.addr_info_of(name).unwrap())
            .collect();
        scheduler
            .run(bootstrap, CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_fanout_visits_all_reachable_peers() {
        let net = Arc::new(
            SimNetwork::builder()
                .add(
                    SimPeerSpec::named("boot")
                        .addrs(["1.0.0.1:4001"])
                        .agent("go-ipfs/0.12.1")
                        .neighbors(["n1", "n2", "n3"]),
                )
                .add(SimPeerSpec::named("n1").addrs(["1.0.0.2:4001"]))
                .add(SimPeerSpec::named("n2").addrs(["1.0.0.3:4001"]))
                .add(SimPeerSpec::named("n3").addrs(["1.0.0.4:4001"]))
                .build(),
        );

        let summary = run_scheduler(net, config(0), &["boot"]).await;

        assert_eq!(summary.crawled_peers, 4);
        assert_eq!(summary.remaining_queue, 0);
        assert_eq!(summary.state, RunState::Succeeded);
        assert_eq!(summary.dialable_peers, 4);
    }

    #[tokio::test]
    async fn test_mutual_neighbors_visited_once() {
        let net = Arc::new(
            SimNetwork::builder()
                .add(
                    SimPeerSpec::named("a")
                        .addrs(["1.0.0.1:4001"])
                        .neighbors(["b"]),
                )
                .add(
                    SimPeerSpec::named("b")
                        .addrs(["1.0.0.2:4001"])
                        .neighbors(["a"]),
                )
                .build(),
        );

        let summary = run_scheduler(Arc::clone(&net), config(0), &["a", "b"]).await;

        assert_eq!(summary.crawled_peers, 2);
        assert_eq!(summary.state, RunState::Succeeded);
        // The dedup gate must have allowed exactly one dial per peer.
        assert_eq!(net.connect_attempts(&SimNetwork::id_of("a")), 1);
        assert_eq!(net.connect_attempts(&SimNetwork::id_of("b")), 1);
    }

    #[tokio::test]
    async fn test_crawl_limit_stops_growth() {
        // A chain p0 -> p1 -> ... where every visit reveals the next
        // peer; without a limit this walks the whole chain. Later peers
        // answer slowly so the in-flight visit at limit time is aborted
        // by the draining pass instead of sneaking in as a third visit.
        let mut builder = SimNetwork::builder();
        for i in 0..5 {
            let mut spec = SimPeerSpec::named(format!("p{i}"))
                .addrs([format!("1.0.0.{}:4001", i + 1)])
                .neighbors([format!("p{}", i + 1)]);
            if i > 0 {
                spec = spec.latency(std::time::Duration::from_millis(200));
            }
            builder = builder.add(spec);
        }
        let net = Arc::new(builder.build());

        let mut cfg = config(2);
        cfg.crawler_count = 1;
        let summary = run_scheduler(net, cfg, &["p0"]).await;

        assert_eq!(summary.crawled_peers, 2);
        // Terminated by limit with work left: not a fully drained run.
        assert!(summary.remaining_queue > 0);
        assert_ne!(summary.state, RunState::Succeeded);
    }

    #[tokio::test]
    async fn test_error_frequency_tables() {
        let net = Arc::new(
            SimNetwork::builder()
                .add(
                    SimPeerSpec::named("boot")
                        .addrs(["1.0.0.1:4001"])
                        .agent("go-ipfs/0.12.1")
                        .protocols(["/ipfs/kad/1.0.0"])
                        .neighbors(["refused", "timeout"]),
                )
                .add(
                    SimPeerSpec::named("refused")
                        .addrs(["1.0.0.2:4001"])
                        .connect_error(DialError::ConnectionRefused),
                )
                .add(
                    SimPeerSpec::named("timeout")
                        .addrs(["1.0.0.3:4001"])
                        .connect_error(DialError::DialTimeout),
                )
                .build(),
        );

        let summary = run_scheduler(net, config(0), &["boot"]).await;

        assert_eq!(summary.crawled_peers, 3);
        assert_eq!(summary.dialable_peers, 1);
        assert_eq!(summary.undialable_peers, 2);
        assert_eq!(summary.conn_errors.get("connection_refused"), Some(&1));
        assert_eq!(summary.conn_errors.get("dial_timeout"), Some(&1));
        assert_eq!(summary.agent_versions.get("go-ipfs/0.12.1"), Some(&1));
        // Peers that never connected report no agent.
        assert_eq!(summary.agent_versions.get("n.a."), Some(&2));
        assert_eq!(summary.protocols.get("/ipfs/kad/1.0.0"), Some(&1));
    }

    #[tokio::test]
    async fn test_failed_visit_neighbors_not_dispatched() {
        // "gate" refuses connections, so its neighbor "hidden" must never
        // be dialed.
        let net = Arc::new(
            SimNetwork::builder()
                .add(
                    SimPeerSpec::named("gate")
                        .addrs(["1.0.0.1:4001"])
                        .connect_error(DialError::ConnectionRefused)
                        .neighbors(["hidden"]),
                )
                .add(SimPeerSpec::named("hidden").addrs(["1.0.0.2:4001"]))
                .build(),
        );

        let summary = run_scheduler(Arc::clone(&net), config(0), &["gate"]).await;

        assert_eq!(summary.crawled_peers, 1);
        assert_eq!(net.connect_attempts(&SimNetwork::id_of("hidden")), 0);
    }

    #[tokio::test]
    async fn test_cancellation_mid_run() {
        // Slow peers keep the run alive long enough to cancel it.
        let mut builder = SimNetwork::builder().add(
            SimPeerSpec::named("boot")
                .addrs(["1.0.0.1:4001"])
                .neighbors(["s0", "s1", "s2", "s3", "s4"]),
        );
        for i in 0..5 {
            builder = builder.add(
                SimPeerSpec::named(format!("s{i}"))
                    .addrs([format!("1.0.1.{}:4001", i + 1)])
                    .latency(std::time::Duration::from_secs(2)),
            );
        }
        let net = Arc::new(builder.build());

        let storage = storage();
        let cfg = CrawlConfig {
            crawler_count: 1,
            persister_count: 1,
            dial_timeout_secs: 30,
            ..Default::default()
        };
        let scheduler = Scheduler::new(net.clone(), Arc::clone(&storage), cfg);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                cancel.cancel();
            })
        };

        let start = std::time::Instant::now();
        let summary = scheduler
            .run(vec![net.addr_info_of("boot").unwrap()], cancel)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(summary.state, RunState::Cancelled);
        assert!(summary.remaining_queue > 0);
        // In-flight dials must unblock promptly instead of riding out
        // their latency.
        assert!(start.elapsed() < std::time::Duration::from_secs(2));

        // Every handled visit made it to storage before the run ended.
        let persisted = storage
            .lock()
            .unwrap()
            .count_visits(summary.crawl_id)
            .unwrap();
        assert_eq!(persisted, summary.crawled_peers);
    }

    #[tokio::test]
    async fn test_run_record_finalized_in_storage() {
        let net = Arc::new(
            SimNetwork::builder()
                .add(SimPeerSpec::named("solo").addrs(["1.0.0.1:4001"]))
                .build(),
        );
        let storage = storage();
        let scheduler = Scheduler::new(net.clone(), Arc::clone(&storage), config(0));
        let summary = scheduler
            .run(
                vec![net.addr_info_of("solo").unwrap()],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut guard = storage.lock().unwrap();
        let run = guard.get_run(summary.crawl_id).unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.crawled_peers, 1);
        assert!(run.finished_at.is_some());

        let agents = guard
            .get_crawl_properties(summary.crawl_id, "agent_version")
            .unwrap();
        assert_eq!(agents.get("n.a."), Some(&1));
    }

    #[tokio::test]
    async fn test_duplicate_bootstrap_entries_dispatch_once() {
        let net = Arc::new(
            SimNetwork::builder()
                .add(SimPeerSpec::named("solo").addrs(["1.0.0.1:4001"]))
                .build(),
        );
        let scheduler = Scheduler::new(net.clone(), storage(), config(0));
        let peer = net.addr_info_of("solo").unwrap();
        let summary = scheduler
            .run(vec![peer.clone(), peer], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.crawled_peers, 1);
        assert_eq!(net.connect_attempts(&SimNetwork::id_of("solo")), 1);
    }
}
