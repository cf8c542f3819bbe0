//! Dialer worker
//!
//! Dialers perform lightweight liveness probes against previously known
//! peers. Unlike crawlers they fetch no neighbors, but they retry failed
//! dials under an explicit policy keyed on the classified error.

use crate::config::MonitorConfig;
use crate::metrics;
use crate::net::{DialError, Network};
use crate::peer::PeerAddrInfo;
use crate::queue::WorkQueue;
use crate::service::Lifecycle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum connect attempts per dial job
pub const MAX_ATTEMPTS: u32 = 3;

/// Long sleep for errors that look like remote rate limiting
const LONG_RETRY_SLEEP: Duration = Duration::from_secs(70);

/// A unit of monitor work: one peer to probe
pub type DialJob = PeerAddrInfo;

/// Outcome of probing a single peer
#[derive(Debug, Clone)]
pub struct DialResult {
    pub dialer_id: String,

    pub peer: PeerAddrInfo,

    /// The final classified error; `None` means the peer was dialable
    pub error: Option<DialError>,

    /// When the first failed attempt happened
    ///
    /// Retries can push the publication of this result well past the
    /// moment the peer actually stopped answering.
    pub first_error_at: Option<DateTime<Utc>>,

    /// Connect attempts actually made
    pub attempts: u32,

    pub dial_started_at: DateTime<Utc>,
    pub dial_ended_at: DateTime<Utc>,
}

impl DialResult {
    pub fn is_alive(&self) -> bool {
        self.error.is_none()
    }
}

/// What to do after a failed dial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up on this peer
    Stop,

    /// Sleep, then try again
    RetryAfter(Duration),
}

/// The retry policy table, evaluated top to bottom, first match wins
///
/// `attempt` is the zero-based index of the attempt that just failed.
pub fn retry_decision(error: &DialError, attempt: u32) -> RetryDecision {
    match error {
        // Talking to a different peer than expected; retrying dials the
        // same wrong node again.
        DialError::PeerIdMismatch => RetryDecision::Stop,

        // Nothing to dial.
        DialError::NoPublicAddress => RetryDecision::Stop,

        // A second refusal in a row looks like remote rate limiting.
        DialError::ConnectionRefused if attempt >= 1 => RetryDecision::Stop,

        DialError::MaxDialAttemptsExceeded => RetryDecision::RetryAfter(LONG_RETRY_SLEEP),

        _ => RetryDecision::RetryAfter(Duration::from_secs(10 * (attempt as u64 + 1))),
    }
}

/// A worker probing peers from the dial queue
pub struct Dialer {
    lifecycle: Lifecycle,
    net: Arc<dyn Network>,
    config: MonitorConfig,
}

impl Dialer {
    /// Creates a dialer with the given pool sequence number
    pub fn new(seq: usize, net: Arc<dyn Network>, config: MonitorConfig) -> Self {
        Self {
            lifecycle: Lifecycle::new(format!("dialer-{seq:02}")),
            net,
            config,
        }
    }

    pub fn id(&self) -> &str {
        self.lifecycle.id()
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    /// Consumes dial jobs until shut down or the queue closes
    pub async fn run(&self, dial_queue: WorkQueue<DialJob>, results: WorkQueue<DialResult>) {
        self.lifecycle.started();
        let shutdown = self.lifecycle.sig_shutdown();
        let scope = self.lifecycle.scope();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = dial_queue.pop() => match job {
                    Some(job) => {
                        let result = self.dial_peer(&scope, job).await;
                        // A probe aborted by shutdown is discarded.
                        if shutdown.is_cancelled() {
                            break;
                        }
                        results.push(result);
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(dialer = self.id(), "Dialer done");
        self.lifecycle.stopped();
    }

    /// Probes one peer, retrying per the policy table
    pub async fn dial_peer(&self, scope: &CancellationToken, job: DialJob) -> DialResult {
        let dial_started_at = Utc::now();
        let peer = job.public();

        let mut result = DialResult {
            dialer_id: self.id().to_string(),
            peer: peer.clone(),
            error: None,
            first_error_at: None,
            attempts: 0,
            dial_started_at,
            dial_ended_at: dial_started_at,
        };

        for attempt in 0..MAX_ATTEMPTS {
            result.attempts = attempt + 1;
            metrics::record_dial();

            let dialed = if peer.addrs.is_empty() {
                Err(DialError::NoPublicAddress)
            } else {
                tokio::select! {
                    _ = scope.cancelled() => Err(DialError::Unknown("dial canceled".to_string())),
                    res = self.net.connect(&peer, self.config.dial_timeout()) => res,
                }
            };

            match dialed {
                Ok(()) => {
                    // Alive: clear any earlier failure and release the
                    // connection again.
                    result.error = None;
                    result.first_error_at = None;
                    if let Err(err) = self.net.disconnect(&peer.peer_id).await {
                        tracing::warn!(
                            dialer = self.id(),
                            peer = %peer.peer_id.short(),
                            error = %err,
                            "Could not close connection to peer"
                        );
                    }
                    break;
                }
                Err(err) => {
                    metrics::record_dial_error();
                    if result.first_error_at.is_none() {
                        result.first_error_at = Some(Utc::now());
                    }
                    result.error = Some(err.clone());

                    if scope.is_cancelled() {
                        break;
                    }
                    match retry_decision(&err, attempt) {
                        RetryDecision::Stop => {
                            tracing::debug!(
                                dialer = self.id(),
                                peer = %peer.peer_id.short(),
                                attempt,
                                error = %err,
                                "Dial failed, not retrying"
                            );
                            break;
                        }
                        RetryDecision::RetryAfter(sleep) => {
                            tracing::debug!(
                                dialer = self.id(),
                                peer = %peer.peer_id.short(),
                                attempt,
                                error = %err,
                                sleep_secs = sleep.as_secs(),
                                "Dial failed, sleeping"
                            );
                            // A cancellation during the sleep stops the
                            // retry loop immediately.
                            tokio::select! {
                                _ = scope.cancelled() => break,
                                _ = tokio::time::sleep(sleep) => {}
                            }
                        }
                    }
                }
            }
        }

        result.dial_ended_at = Utc::now();
        result
    }
}
