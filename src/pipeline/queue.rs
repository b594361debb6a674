//! Bounded queue with a configurable backpressure policy
//!
//! One primitive serves every hand-off in the service: the bridge channels
//! drop new items when full, the preview and alert feeds evict the oldest.
//! Producers never block on [`BoundedQueue::push`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do with a push when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Keep what is queued, discard the incoming item
    DropNewest,
    /// Evict the oldest queued item to make room for the incoming one
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after evicting the oldest queued item
    Replaced,
    /// Queue full, incoming item discarded
    Dropped,
    /// Queue closed, incoming item discarded
    Closed,
}

impl PushOutcome {
    pub fn is_queued(self) -> bool {
        matches!(self, PushOutcome::Accepted | PushOutcome::Replaced)
    }
}

#[derive(Default)]
struct Stats {
    accepted: AtomicU64,
    replaced: AtomicU64,
    dropped: AtomicU64,
    popped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub accepted: u64,
    pub replaced: u64,
    pub dropped: u64,
    pub popped: u64,
    pub len: usize,
    pub capacity: usize,
}

pub struct BoundedQueue<T> {
    name: Arc<str>,
    policy: Backpressure,
    capacity: usize,
    tx: Sender<T>,
    // Held by the queue itself so DropOldest can evict from the producer side
    rx: Receiver<T>,
    closed: AtomicBool,
    stats: CachePadded<Stats>,
}

// Log the first overflow and then every Nth to avoid flooding at frame rate
const OVERFLOW_LOG_EVERY: u64 = 100;

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<Arc<str>>, capacity: usize, policy: Backpressure) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);

        Self {
            name: name.into(),
            policy,
            capacity,
            tx,
            rx,
            closed: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Backpressure {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Producer: non-blocking push governed by the queue's policy
    pub fn push(&self, item: T) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }

        match self.policy {
            Backpressure::DropNewest => match self.tx.try_send(item) {
                Ok(()) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    PushOutcome::Accepted
                }
                Err(TrySendError::Full(_)) => {
                    self.record_overflow();
                    PushOutcome::Dropped
                }
                Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
            },
            Backpressure::DropOldest => {
                let mut item = item;
                let mut evicted = false;
                loop {
                    match self.tx.try_send(item) {
                        Ok(()) => {
                            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                            return if evicted {
                                PushOutcome::Replaced
                            } else {
                                PushOutcome::Accepted
                            };
                        }
                        Err(TrySendError::Full(back)) => {
                            item = back;
                            // The consumer may have drained it in between; just retry then
                            if self.rx.try_recv().is_ok() {
                                evicted = true;
                                self.record_overflow();
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
                    }
                }
            }
        }
    }

    /// Enqueue a control message regardless of policy or closed state,
    /// waiting up to `timeout` for room. Hands the item back on timeout.
    pub fn push_control(&self, item: T, timeout: Duration) -> Result<(), T> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) | Err(SendTimeoutError::Disconnected(item)) => {
                Err(item)
            }
        }
    }

    /// Consumer: pop without waiting
    pub fn try_pop(&self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Consumer: wait up to `timeout` for the next item
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Consumer: await the next item from an async context
    pub async fn pop_async(&self) -> Option<T> {
        let item = self.rx.recv_async().await.ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Reject every further [`push`](Self::push). Queued items stay poppable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.name, pending = self.len(), "Queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            replaced: self.stats.replaced.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }

    fn record_overflow(&self) {
        let counter = match self.policy {
            Backpressure::DropNewest => &self.stats.dropped,
            Backpressure::DropOldest => &self.stats.replaced,
        };
        let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("framehub_queue_dropped_total", "queue" => self.name.to_string())
            .increment(1);

        if total == 1 || total % OVERFLOW_LOG_EVERY == 0 {
            warn!(
                queue = %self.name,
                policy = ?self.policy,
                capacity = self.capacity,
                total,
                "Queue full, item dropped"
            );
        }
    }
}
