//! Crawler worker
//!
//! A crawler pulls one peer at a time from the crawl queue, visits it and
//! publishes exactly one [`VisitResult`] on the results queue. Visiting a
//! peer means: filter its addresses, connect, read back its advertised
//! identity, sweep its routing table with synthetic targets of increasing
//! common prefix length, optionally probe its exposed management API, and
//! release the connection again.

use crate::config::CrawlConfig;
use crate::crawl::result::VisitResult;
use crate::crawl::CrawlJob;
use crate::metrics;
use crate::net::api::ExposedApiClient;
use crate::net::{DialError, Network};
use crate::peer::{PeerAddrInfo, PeerId};
use crate::queue::WorkQueue;
use crate::service::Lifecycle;
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Number of routing-table sweep queries per visit, one per common prefix
/// length 0..NEIGHBOR_QUERIES
const NEIGHBOR_QUERIES: u32 = 16;

/// What the protocol-level probe of one peer produced
#[derive(Debug, Default)]
struct ProtocolProbe {
    connect_error: Option<DialError>,
    agent_version: Option<String>,
    protocols: Vec<String>,
    neighbors: Vec<PeerAddrInfo>,
    discovery_error: Option<String>,
    error_bits: u16,
    connect_started_at: Option<chrono::DateTime<Utc>>,
    connect_ended_at: Option<chrono::DateTime<Utc>>,
}

/// A worker visiting peers from the crawl queue
pub struct Crawler {
    lifecycle: Lifecycle,
    net: Arc<dyn Network>,
    api: Option<ExposedApiClient>,
    config: CrawlConfig,
    visited: AtomicUsize,
}

impl Crawler {
    /// Creates a crawler with the given pool sequence number
    ///
    /// Identifiers are injected by the scheduler at pool construction, so
    /// they are deterministic: `crawler-01`, `crawler-02`, ...
    pub fn new(
        seq: usize,
        net: Arc<dyn Network>,
        api: Option<ExposedApiClient>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(format!("crawler-{seq:02}")),
            net,
            api,
            config,
            visited: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.lifecycle.id()
    }

    /// Requests a shutdown and waits until the worker loop has exited
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    /// Consumes crawl jobs until shut down or the queue closes
    ///
    /// The shutdown signal takes precedence over a pending job at every
    /// iteration boundary.
    pub async fn run(&self, crawl_queue: WorkQueue<CrawlJob>, results: WorkQueue<VisitResult>) {
        self.lifecycle.started();
        let shutdown = self.lifecycle.sig_shutdown();
        let scope = self.lifecycle.scope();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = crawl_queue.pop() => match job {
                    Some(job) => {
                        let result = self.visit(&scope, job).await;
                        // Shutdown won the race against this visit: the
                        // aborted result is discarded and the peer stays
                        // queued-but-unvisited in the scheduler's books.
                        if shutdown.is_cancelled() {
                            break;
                        }
                        results.push(result);
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(
            crawler = self.id(),
            visited = self.visited.load(Ordering::Relaxed),
            "Crawler done"
        );
        self.lifecycle.stopped();
    }

    /// Visits a single peer and produces its result
    async fn visit(&self, scope: &CancellationToken, job: CrawlJob) -> VisitResult {
        let visit_started_at = Utc::now();
        let peer = job.public();

        tracing::debug!(
            crawler = self.id(),
            peer = %peer.peer_id.short(),
            "Visiting peer"
        );

        // Without a usable address there is nothing to probe.
        if peer.addrs.is_empty() {
            self.visited.fetch_add(1, Ordering::Relaxed);
            metrics::record_connect();
            metrics::record_connect_error();
            let now = Utc::now();
            return VisitResult {
                crawler_id: self.id().to_string(),
                peer,
                neighbors: Vec::new(),
                api_neighbor_ids: Vec::new(),
                agent_version: None,
                protocols: Vec::new(),
                connect_error: Some(DialError::NoPublicAddress),
                discovery_error: None,
                error_bits: 0,
                exposed_api: false,
                connect_started_at: now,
                connect_ended_at: now,
                visit_started_at,
                visit_ended_at: now,
            };
        }

        // Protocol probe and management API probe run independently; the
        // protocol side always wins for anything that continues the crawl.
        // The API probe walks the unfiltered address set, a management API
        // may well listen on an address the DHT transport does not use.
        let api_ips = job.distinct_ips();
        let proto_fut = self.probe_protocol(scope, &peer);
        let api_fut = async {
            match &self.api {
                Some(api) if self.config.check_exposed => {
                    api.probe(&api_ips, self.config.persist_neighbors, scope)
                        .await
                }
                _ => Default::default(),
            }
        };
        let (proto, api) = tokio::join!(proto_fut, api_fut);

        // Release connection resources no matter how the visit went.
        if let Err(err) = self.net.disconnect(&peer.peer_id).await {
            tracing::warn!(
                crawler = self.id(),
                peer = %peer.peer_id.short(),
                error = %err,
                "Could not close connection to peer"
            );
        }

        self.visited.fetch_add(1, Ordering::Relaxed);

        let exposed_api = api.id.is_some();
        let agent_version = proto
            .agent_version
            .or_else(|| api.id.as_ref().map(|id| id.agent_version.clone()))
            .filter(|a| !a.is_empty());
        let protocols = if proto.protocols.is_empty() {
            api.id.map(|id| id.protocols).unwrap_or_default()
        } else {
            proto.protocols
        };
        let api_neighbor_ids = api
            .routing_table
            .map(|rt| {
                rt.buckets
                    .into_iter()
                    .flat_map(|b| b.peers.into_iter().map(|p| p.id))
                    .collect()
            })
            .unwrap_or_default();

        let now = Utc::now();
        VisitResult {
            crawler_id: self.id().to_string(),
            peer,
            neighbors: proto.neighbors,
            api_neighbor_ids,
            agent_version,
            protocols,
            connect_error: proto.connect_error,
            discovery_error: proto.discovery_error,
            error_bits: proto.error_bits,
            exposed_api,
            connect_started_at: proto.connect_started_at.unwrap_or(visit_started_at),
            connect_ended_at: proto.connect_ended_at.unwrap_or(now),
            visit_started_at,
            visit_ended_at: now,
        }
    }

    /// Connects to the peer and, on success, discovers its neighbors
    async fn probe_protocol(
        &self,
        scope: &CancellationToken,
        peer: &PeerAddrInfo,
    ) -> ProtocolProbe {
        let mut probe = ProtocolProbe {
            connect_started_at: Some(Utc::now()),
            ..Default::default()
        };

        metrics::record_connect();
        let connected = tokio::select! {
            _ = scope.cancelled() => Err(DialError::Unknown("visit canceled".to_string())),
            res = self.net.connect(peer, self.config.dial_timeout()) => res,
        };
        probe.connect_ended_at = Some(Utc::now());

        match connected {
            Ok(()) => {
                if let Some(identity) = self.net.identify(&peer.peer_id) {
                    probe.agent_version = identity.agent_version;
                    probe.protocols = identity.protocols;
                }

                let (neighbors, error_bits, discovery_error) =
                    self.fetch_neighbors(scope, peer).await;
                probe.neighbors = neighbors;
                probe.error_bits = error_bits;
                probe.discovery_error = discovery_error;
            }
            Err(err) => {
                metrics::record_connect_error();
                probe.connect_error = Some(err);
            }
        }

        probe
    }

    /// Sweeps the peer's routing table with one query per common prefix
    /// length
    ///
    /// The queries run concurrently; a failing CPL does not cancel the
    /// others. Duplicates across CPLs are expected and left for the
    /// scheduler's dedup pass.
    async fn fetch_neighbors(
        &self,
        scope: &CancellationToken,
        peer: &PeerAddrInfo,
    ) -> (Vec<PeerAddrInfo>, u16, Option<String>) {
        let targets: Vec<(u32, PeerId)> = {
            let mut rng = rand::thread_rng();
            (0..NEIGHBOR_QUERIES)
                .map(|cpl| (cpl, peer.peer_id.with_common_prefix_len(cpl, &mut rng)))
                .collect()
        };

        let queries = targets.into_iter().map(|(cpl, target)| {
            let net = Arc::clone(&self.net);
            let peer_id = peer.peer_id;
            async move {
                let result = tokio::select! {
                    _ = scope.cancelled() => Err(crate::net::NetworkError::Query(
                        "visit canceled".to_string(),
                    )),
                    res = net.find_closest_peers(&peer_id, &target) => res,
                };
                (cpl, result)
            }
        });

        let mut neighbors = Vec::new();
        let mut error_bits: u16 = 0;
        let mut failures = 0;
        let mut last_error = None;
        for (cpl, result) in join_all(queries).await {
            match result {
                Ok(found) => neighbors.extend(found),
                Err(err) => {
                    error_bits |= 1 << cpl;
                    failures += 1;
                    last_error = Some(err);
                    tracing::trace!(
                        crawler = self.id(),
                        peer = %peer.peer_id.short(),
                        cpl,
                        "Neighbor query failed"
                    );
                }
            }
        }

        metrics::add_neighbors_fetched(neighbors.len() as u64);

        let discovery_error = if failures == NEIGHBOR_QUERIES {
            Some(format!(
                "all {NEIGHBOR_QUERIES} neighbor queries failed: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ))
        } else {
            None
        };
        (neighbors, error_bits, discovery_error)
    }
}
