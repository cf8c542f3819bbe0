//! Monitor scheduler
//!
//! Drives one liveness-probing round: starts the dialer pool, dispatches
//! every known peer once, consumes dial results sequentially and persists
//! them. Shutdown follows the same strict draining order as the crawl
//! scheduler, so no finished probe is lost.

use crate::config::MonitorConfig;
use crate::monitor::dialer::{DialJob, DialResult, Dialer};
use crate::net::Network;
use crate::peer::{PeerAddrInfo, PeerId};
use crate::queue::WorkQueue;
use crate::storage::{DialVisitRecord, Storage};
use crate::KadmapError;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Aggregate outcome of one probing round
#[derive(Debug, Clone, Default)]
pub struct MonitorSummary {
    pub dialed: u64,
    pub alive: u64,
    pub dead: u64,
}

/// Orchestrates one round of liveness probes
pub struct MonitorScheduler {
    net: Arc<dyn Network>,
    storage: Arc<Mutex<dyn Storage>>,
    config: MonitorConfig,

    dial_queue: WorkQueue<DialJob>,
    results_queue: WorkQueue<DialResult>,

    dialers: Vec<Arc<Dialer>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl MonitorScheduler {
    pub fn new(
        net: Arc<dyn Network>,
        storage: Arc<Mutex<dyn Storage>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            net,
            storage,
            config,
            dial_queue: WorkQueue::new(),
            results_queue: WorkQueue::new(),
            dialers: Vec::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Probes the given peers once and persists the outcomes
    pub async fn run(
        mut self,
        peers: Vec<PeerAddrInfo>,
        cancel: CancellationToken,
    ) -> Result<MonitorSummary, KadmapError> {
        self.start_pool();

        // The probe set is fixed up front; duplicates are dropped here
        // instead of in the workers.
        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut dispatched: u64 = 0;
        for peer in peers {
            if seen.insert(peer.peer_id) {
                self.dial_queue.push(peer);
                dispatched += 1;
            }
        }
        self.dial_queue.done_producing();

        tracing::info!(
            peers = dispatched,
            dialers = self.config.dialer_count,
            "Starting liveness probes"
        );

        let results_queue = self.results_queue.clone();
        let mut summary = MonitorSummary::default();
        while summary.dialed < dispatched {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Received cancellation signal, stopping probes");
                    break;
                }
                result = results_queue.pop() => match result {
                    Some(result) => self.handle_result(result, &mut summary),
                    None => break,
                },
            }
        }

        // Draining: stop the dialers, then collect what they still
        // produced before closing the results stream.
        join_all(self.dialers.iter().map(|d| d.shutdown())).await;
        self.results_queue.done_producing();
        while let Some(result) = results_queue.pop().await {
            self.handle_result(result, &mut summary);
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        self.dial_queue.close();

        tracing::info!(
            dialed = summary.dialed,
            alive = summary.alive,
            dead = summary.dead,
            "Finished liveness probes"
        );
        Ok(summary)
    }

    fn start_pool(&mut self) {
        for seq in 1..=self.config.dialer_count {
            let dialer = Arc::new(Dialer::new(
                seq,
                Arc::clone(&self.net),
                self.config.clone(),
            ));
            self.dialers.push(Arc::clone(&dialer));

            let jobs = self.dial_queue.clone();
            let results = self.results_queue.clone();
            self.worker_handles
                .push(tokio::spawn(async move { dialer.run(jobs, results).await }));
        }
    }

    fn handle_result(&self, result: DialResult, summary: &mut MonitorSummary) {
        summary.dialed += 1;
        if result.is_alive() {
            summary.alive += 1;
        } else {
            summary.dead += 1;
        }

        let record = DialVisitRecord {
            dialer_id: result.dialer_id.clone(),
            peer_id: result.peer.peer_id.to_string(),
            success: result.is_alive(),
            error_kind: result.error.as_ref().map(|e| e.kind().to_string()),
            error_message: result.error.as_ref().map(|e| e.to_string()),
            attempts: result.attempts,
            dial_duration_ms: (result.dial_ended_at - result.dial_started_at).num_milliseconds(),
            dialed_at: result.dial_started_at,
        };
        if let Err(err) = self.storage.lock().unwrap().insert_dial_visit(&record) {
            tracing::warn!(
                peer = %result.peer.peer_id.short(),
                error = %err,
                "Error inserting dial visit"
            );
        }
    }
}
