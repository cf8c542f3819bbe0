//! Work queue connecting producers and worker pools
//!
//! The crawl pipeline needs a channel with slightly unusual properties:
//! pushing must never block the producer (the scheduler dispatches from the
//! same loop that consumes results, so a full channel would deadlock the
//! run), items must come out in push order, several workers must be able to
//! consume concurrently with exactly-once delivery, and marking the
//! producer side as done must let consumers drain what is buffered before
//! the stream ends.
//!
//! A pump task owns a growable buffer between an unbounded intake channel
//! and a capacity-one delivery channel. Workers share the delivery side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An ordered, growable, multi-consumer work queue
///
/// Cloning the queue is cheap; all clones refer to the same channel.
pub struct WorkQueue<T> {
    intake: Arc<Mutex<Option<mpsc::UnboundedSender<T>>>>,
    delivery: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    depth: Arc<AtomicUsize>,
    abort: CancellationToken,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            intake: Arc::clone(&self.intake),
            delivery: Arc::clone(&self.delivery),
            depth: Arc::clone(&self.depth),
            abort: self.abort.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Creates a new queue and spawns its pump task
    pub fn new() -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::channel(1);
        let depth = Arc::new(AtomicUsize::new(0));
        let abort = CancellationToken::new();

        tokio::spawn(pump(
            intake_rx,
            delivery_tx,
            Arc::clone(&depth),
            abort.clone(),
        ));

        Self {
            intake: Arc::new(Mutex::new(Some(intake_tx))),
            delivery: Arc::new(tokio::sync::Mutex::new(delivery_rx)),
            depth,
            abort,
        }
    }

    /// Enqueues an item without blocking
    ///
    /// Returns `false` if the queue no longer accepts items because
    /// [`WorkQueue::done_producing`] or [`WorkQueue::close`] was called.
    pub fn push(&self, item: T) -> bool {
        let intake = self.intake.lock().unwrap();
        match intake.as_ref() {
            Some(tx) => {
                if tx.send(item).is_ok() {
                    self.depth.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Receives the next item in push order
    ///
    /// Blocks until an item is available. Returns `None` once producing
    /// was marked done and every buffered item has been delivered. Safe
    /// to call from several consumers; each item goes to exactly one.
    pub async fn pop(&self) -> Option<T> {
        let item = self.delivery.lock().await.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Signals that no further items will be pushed
    ///
    /// Buffered items remain consumable; after the last one is delivered
    /// the consume stream ends. Idempotent.
    pub fn done_producing(&self) {
        // The pump observes closure once the only intake sender is gone.
        self.intake.lock().unwrap().take();
    }

    /// Shuts the queue down immediately, dropping anything still buffered
    pub fn close(&self) {
        self.done_producing();
        self.abort.cancel();
    }

    /// Number of items pushed but not yet delivered
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves items from intake to delivery, buffering the overflow
async fn pump<T>(
    mut intake: mpsc::UnboundedReceiver<T>,
    delivery: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
    abort: CancellationToken,
) {
    let mut buf: VecDeque<T> = VecDeque::new();
    let mut intake_open = true;

    loop {
        if abort.is_cancelled() {
            depth.fetch_sub(buf.len(), Ordering::Relaxed);
            return;
        }

        if buf.is_empty() {
            if !intake_open {
                // Nothing buffered and nothing more coming: the stream
                // ends by dropping `delivery`.
                return;
            }
            tokio::select! {
                _ = abort.cancelled() => {}
                item = intake.recv() => match item {
                    Some(item) => buf.push_back(item),
                    None => intake_open = false,
                },
            }
        } else {
            // Hand the front to whichever consumer is ready while
            // continuing to accept new items.
            tokio::select! {
                _ = abort.cancelled() => {}
                item = intake.recv(), if intake_open => match item {
                    Some(item) => buf.push_back(item),
                    None => intake_open = false,
                },
                permit = delivery.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(item) = buf.pop_front() {
                            permit.send(item);
                        }
                    }
                    // All consumers dropped their handles.
                    Err(_) => {
                        depth.fetch_sub(buf.len(), Ordering::Relaxed);
                        return;
                    }
                },
            }
        }
    }
}
