//! Service lifecycle handling
//!
//! Every long-running component of the crawler (workers, persisters,
//! dialers, the scheduler itself) embeds a [`Lifecycle`] value and
//! delegates to it. The lifecycle tracks the component through
//! `Idle → Started → Stopping → Stopped`, exposes a shutdown signal and a
//! cancellation scope for in-flight network operations, and lets other
//! components block until the service has fully stopped.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The lifecycle states of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Idle => "idle",
            State::Started => "started",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Timestamps recorded as the service moves through its states
#[derive(Debug, Default, Clone, Copy)]
pub struct Times {
    pub started_at: Option<DateTime<Utc>>,
    pub shutdown_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
}

/// A start/stop/cancel primitive for long-running components
///
/// The scope token returned by [`Lifecycle::scope`] is active only while
/// the service is Started or Stopping and is cancelled the instant a
/// shutdown or stop occurs, so any in-flight operation selecting on it
/// unblocks promptly.
pub struct Lifecycle {
    id: String,
    state: Mutex<State>,
    times: Mutex<Times>,

    // Cancelled when the service should abandon in-flight work.
    scope: CancellationToken,
    // Cancelled to request a graceful shutdown.
    shutdown: CancellationToken,
    // Cancelled once the service has fully stopped.
    done: CancellationToken,
}

impl Lifecycle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(State::Idle),
            times: Mutex::new(Times::default()),
            scope: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// The service identifier, for logging
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Marks the service as started
    ///
    /// # Panics
    ///
    /// Panics when called on a service that is not Idle. Starting twice is
    /// a programming error, not a recoverable condition.
    pub fn started(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != State::Idle {
            panic!("service {} started twice (state: {})", self.id, *state);
        }
        *state = State::Started;
        self.times.lock().unwrap().started_at = Some(Utc::now());
        tracing::trace!(service = %self.id, "Service started");
    }

    /// Marks the service as stopped and releases pending `shutdown` calls
    ///
    /// Idempotent; calling it on an Idle service is a no-op.
    pub fn stopped(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::Idle | State::Stopped) {
            return;
        }
        *state = State::Stopped;
        drop(state);

        self.times.lock().unwrap().done_at = Some(Utc::now());
        self.scope.cancel();
        self.done.cancel();
        tracing::trace!(service = %self.id, "Service stopped");
    }

    /// Requests a graceful shutdown and waits for the service to stop
    ///
    /// Idempotent: concurrent and repeated calls all block until the
    /// service reports [`Lifecycle::stopped`]. Calling it on a service
    /// that was never started returns immediately.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Idle => return,
                State::Started => {
                    *state = State::Stopping;
                    drop(state);
                    self.times.lock().unwrap().shutdown_at = Some(Utc::now());
                    tracing::trace!(service = %self.id, "Service shutting down");
                    self.shutdown.cancel();
                    self.scope.cancel();
                }
                // Someone else already initiated the shutdown; fall
                // through and wait for completion.
                State::Stopping | State::Stopped => {}
            }
        }
        self.done.cancelled().await;
        tracing::trace!(service = %self.id, "Service was shut down");
    }

    /// The cancellation scope for in-flight operations of this service
    pub fn scope(&self) -> CancellationToken {
        self.scope.clone()
    }

    /// A token that is cancelled when a shutdown was requested
    ///
    /// Worker loops select on this at their iteration boundaries.
    pub fn sig_shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A token that is cancelled once the service has stopped
    pub fn sig_done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_started(&self) -> bool {
        *self.state.lock().unwrap() == State::Started
    }

    pub fn is_stopping(&self) -> bool {
        *self.state.lock().unwrap() == State::Stopping
    }

    /// The timestamps recorded so far
    pub fn times(&self) -> Times {
        *self.times.lock().unwrap()
    }
}
