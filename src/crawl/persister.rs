//! Persister worker
//!
//! Persisters decouple slow storage writes from the crawl's critical
//! path. Each one pulls completed visit results from the persist queue
//! and writes a denormalized raw-visit row. Writes are strictly
//! best-effort: a failure is logged and the job dropped, the crawl never
//! retries or blocks on persistence.

use crate::crawl::result::VisitResult;
use crate::queue::WorkQueue;
use crate::service::Lifecycle;
use crate::storage::{RawVisitRecord, Storage};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Longest error message stored per visit
const MAX_ERROR_MESSAGE_LEN: usize = 255;

/// A worker writing visit results to storage
pub struct Persister {
    lifecycle: Lifecycle,
    storage: Arc<Mutex<dyn Storage>>,
    crawl_id: i64,
    persist_neighbors: bool,
}

impl Persister {
    /// Creates a persister with the given pool sequence number
    pub fn new(
        seq: usize,
        storage: Arc<Mutex<dyn Storage>>,
        crawl_id: i64,
        persist_neighbors: bool,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(format!("persister-{seq:02}")),
            storage,
            crawl_id,
            persist_neighbors,
        }
    }

    pub fn id(&self) -> &str {
        self.lifecycle.id()
    }

    /// A token that is cancelled once this persister has stopped
    pub fn sig_done(&self) -> tokio_util::sync::CancellationToken {
        self.lifecycle.sig_done()
    }

    /// Consumes persist jobs until the queue closes
    ///
    /// Persisters are never cancelled mid-drain; the scheduler closes the
    /// persist queue and waits for them, so no completed visit is lost.
    pub async fn run(&self, persist_queue: WorkQueue<VisitResult>) {
        self.lifecycle.started();
        let mut persisted = 0u64;

        while let Some(result) = persist_queue.pop().await {
            let start = Instant::now();
            let ok = self.handle_persist_job(&result);
            if ok {
                persisted += 1;
            }
            tracing::debug!(
                persister = self.id(),
                peer = %result.peer.peer_id.short(),
                crawler = %result.crawler_id,
                success = ok,
                persisted,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Persisted visit"
            );
        }

        tracing::debug!(persister = self.id(), persisted, "Persister done");
        self.lifecycle.stopped();
    }

    /// Writes one raw-visit row; returns whether the write succeeded
    fn handle_persist_job(&self, result: &VisitResult) -> bool {
        let record = to_raw_visit(self.crawl_id, result);

        let mut storage = self.storage.lock().unwrap();
        if let Err(err) = storage.insert_raw_visit(&record) {
            tracing::warn!(
                persister = self.id(),
                peer = %result.peer.peer_id.short(),
                error = %err,
                "Error inserting raw visit"
            );
            return false;
        }

        if self.persist_neighbors {
            // Protocol-level neighbors win; the management API dump is
            // only used when the protocol sweep came back empty-handed.
            let neighbor_ids: Vec<String> = if result.neighbors.is_empty() {
                result.api_neighbor_ids.clone()
            } else {
                let mut ids: Vec<String> = result
                    .neighbors
                    .iter()
                    .map(|n| n.peer_id.to_string())
                    .collect();
                ids.sort();
                ids.dedup();
                ids
            };

            if !neighbor_ids.is_empty() {
                if let Err(err) = storage.persist_neighbor_edges(
                    self.crawl_id,
                    &record.peer_id,
                    &neighbor_ids,
                    result.error_bits,
                ) {
                    tracing::warn!(
                        persister = self.id(),
                        peer = %result.peer.peer_id.short(),
                        error = %err,
                        "Error persisting neighbor edges"
                    );
                }
            }
        }
        true
    }
}

/// Flattens a visit result into its denormalized database row
fn to_raw_visit(crawl_id: i64, result: &VisitResult) -> RawVisitRecord {
    let error_message = result.connect_error.as_ref().map(|e| {
        let mut msg = e.to_string();
        msg.truncate(MAX_ERROR_MESSAGE_LEN);
        msg
    });

    RawVisitRecord {
        crawl_id,
        crawler_id: result.crawler_id.clone(),
        peer_id: result.peer.peer_id.to_string(),
        addrs: result.peer.addrs.iter().map(|a| a.to_string()).collect(),
        agent_version: result.agent_version.clone(),
        protocols: result.protocols.clone(),
        neighbor_count: result.neighbors.len() as u64,
        error_kind: result.connect_error.as_ref().map(|e| e.kind().to_string()),
        error_message,
        discovery_error: result.discovery_error.clone(),
        error_bits: result.error_bits,
        exposed_api: result.exposed_api,
        connect_duration_ms: result.connect_duration().num_milliseconds(),
        visit_duration_ms: result.visit_duration().num_milliseconds(),
        visit_started_at: result.visit_started_at,
        visit_ended_at: result.visit_ended_at,
    }
}
