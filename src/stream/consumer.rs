//! Frame consumers and the per-source registry that fans frames out to them
//!
//! Delivery takes a snapshot of the registry under its lock and invokes the
//! callbacks after releasing it. Each entry carries its own delivery lock so
//! that [`ConsumerRegistry::remove`] can wait out an in-flight callback:
//! once `remove` returns, that consumer never sees another frame.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::capture::Frame;
use crate::error::ConsumerError;
use crate::utils::lock;

/// Anything that wants frames from a source: preview feeds, detection
/// pipelines, alert workers.
///
/// `on_frame` runs inline on the capture thread and must return quickly;
/// heavy work belongs behind a non-blocking queue. Returning an error (or
/// panicking) prunes the consumer.
pub trait FrameConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn on_frame(&self, frame: &Frame) -> Result<(), ConsumerError>;

    /// Cleared liveness prunes the consumer on the next broadcast
    fn is_active(&self) -> bool {
        true
    }
}

/// Closure-backed consumer
pub struct CallbackConsumer<F> {
    id: String,
    callback: F,
    active: AtomicBool,
}

impl<F> CallbackConsumer<F>
where
    F: Fn(&Frame) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(id: impl Into<String>, callback: F) -> Self {
        Self {
            id: id.into(),
            callback,
            active: AtomicBool::new(true),
        }
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl<F> FrameConsumer for CallbackConsumer<F>
where
    F: Fn(&Frame) -> Result<(), ConsumerError> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn on_frame(&self, frame: &Frame) -> Result<(), ConsumerError> {
        (self.callback)(frame)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct Entry {
    consumer: Arc<dyn FrameConsumer>,
    delivery: Mutex<()>,
    removed: AtomicBool,
    // Sequence + 1 of the last frame handed over, 0 = none yet
    next_sequence: AtomicU64,
    // Thread currently inside this consumer's callback
    delivering: Mutex<Option<ThreadId>>,
}

impl Entry {
    /// Deliver under the entry's delivery lock. Returns false on fault.
    fn deliver(&self, frame: &Frame) -> bool {
        let _guard = lock(&self.delivery);
        self.deliver_locked(frame)
    }

    fn deliver_locked(&self, frame: &Frame) -> bool {
        if self.removed.load(Ordering::Acquire) {
            return true;
        }
        // Late-join catch-up and a concurrent broadcast may both carry the same frame
        if frame.sequence() < self.next_sequence.load(Ordering::Relaxed) {
            return true;
        }
        if !self.consumer.is_active() {
            return false;
        }

        *lock(&self.delivering) = Some(thread::current().id());
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.consumer.on_frame(frame)));
        *lock(&self.delivering) = None;
        match result {
            Ok(Ok(())) => {
                self.next_sequence
                    .store(frame.sequence() + 1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                warn!(consumer = %self.consumer.id(), error = %e, "Consumer failed, pruning");
                false
            }
            Err(_) => {
                warn!(consumer = %self.consumer.id(), "Consumer panicked, pruning");
                false
            }
        }
    }
}

/// Thread-safe set of consumers attached to one source
#[derive(Default)]
pub struct ConsumerRegistry {
    entries: Mutex<Vec<Arc<Entry>>>,
    dispatcher: Mutex<Option<ThreadId>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer`; false if its id is already taken.
    ///
    /// `latest` is read after registration and, if it yields a frame, that
    /// frame is delivered immediately so a late joiner is not starved until
    /// the next capture tick.
    pub fn add(
        &self,
        consumer: Arc<dyn FrameConsumer>,
        latest: impl FnOnce() -> Option<Frame>,
    ) -> bool {
        let entry = Arc::new(Entry {
            consumer,
            delivery: Mutex::new(()),
            removed: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            delivering: Mutex::new(None),
        });

        // Hold the delivery lock across registration so a broadcast that
        // already sees the entry waits behind the catch-up frame
        let guard = lock(&entry.delivery);
        {
            let mut entries = lock(&self.entries);
            if entries.iter().any(|e| e.consumer.id() == entry.consumer.id()) {
                return false;
            }
            entries.push(Arc::clone(&entry));
        }
        debug!(consumer = %entry.consumer.id(), "Consumer registered");

        if let Some(frame) = latest() {
            if !entry.deliver_locked(&frame) {
                entry.removed.store(true, Ordering::Release);
                drop(guard);
                self.unlink(entry.consumer.id());
                return true;
            }
        }
        drop(guard);
        true
    }

    /// Deregister by id; false if not found. After this returns the consumer
    /// receives no further frames.
    pub fn remove(&self, id: &str) -> bool {
        let Some(entry) = self.unlink(id) else {
            return false;
        };
        self.retire(&entry);
        debug!(consumer = %id, "Consumer removed");
        true
    }

    /// Drop every consumer. Does not wait for an in-flight callback, so a
    /// stuck consumer cannot hold up a source shutdown.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.entries).drain(..).collect();
        for entry in &drained {
            entry.removed.store(true, Ordering::Release);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .map(|e| e.consumer.id().to_string())
            .collect()
    }

    /// Deliver `frame` to a snapshot of the consumers. Faulted or inactive
    /// consumers are pruned; their ids are returned.
    pub fn broadcast(&self, frame: &Frame) -> Vec<String> {
        *lock(&self.dispatcher) = Some(thread::current().id());

        let snapshot: Vec<Arc<Entry>> = lock(&self.entries).clone();
        let mut pruned = Vec::new();

        for entry in snapshot {
            if !entry.deliver(frame) {
                entry.removed.store(true, Ordering::Release);
                if self.unlink(entry.consumer.id()).is_some() {
                    pruned.push(entry.consumer.id().to_string());
                }
            }
        }

        pruned
    }

    fn unlink(&self, id: &str) -> Option<Arc<Entry>> {
        let mut entries = lock(&self.entries);
        let index = entries.iter().position(|e| e.consumer.id() == id)?;
        Some(entries.remove(index))
    }

    fn retire(&self, entry: &Entry) {
        // On the dispatching thread no other delivery can be in flight. A
        // consumer removing itself from its own callback (broadcast or
        // late-join catch-up) already holds the entry's lock up this stack.
        let current = thread::current().id();
        let on_dispatcher = *lock(&self.dispatcher) == Some(current);
        let in_own_callback = *lock(&entry.delivering) == Some(current);
        if on_dispatcher || in_own_callback {
            entry.removed.store(true, Ordering::Release);
        } else {
            let _guard = lock(&entry.delivery);
            entry.removed.store(true, Ordering::Release);
        }
    }
}
