//! Synchronous-to-asynchronous bridge
//!
//! Capture and inference loops hand derived results to the bridge with a
//! non-blocking push. Two dedicated workers, persistence and push, each run
//! on their own OS thread hosting their own current-thread tokio runtime and
//! own their sink. Nothing async is shared between workers or with the
//! caller's runtime.
//!
//! ```text
//!  capture / inference threads            bridge-persist thread
//!  ───────────────────────────            ┌────────────────────────────┐
//!  enqueue_persistence() ──try_send──► [queue] ─► runtime: store.store() │
//!                                         └────────────────────────────┘
//!                                         bridge-push thread
//!                                         ┌────────────────────────────┐
//!  enqueue_push() ─────────try_send──► [queue] ─► runtime: broadcast()  │
//!                                         └────────────────────────────┘
//! ```
//!
//! Both queues drop the incoming item when full. Stop closes the queues,
//! sends a shutdown sentinel behind any pending items and waits a bounded
//! time for the workers to drain, close their sinks and exit. A worker that
//! outlives the wait is detached; it still closes its sink and exits once
//! its queue is empty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info, warn};

use super::queue::{Backpressure, BoundedQueue, PushOutcome, QueueStats};
use super::work::{Broadcaster, Notification, ResultRecord, ResultStore, WorkItem};
use crate::error::{BridgeError, SinkError};
use crate::utils::lock;
use crate::BridgeConfig;

const IDLE_CHECK: Duration = Duration::from_millis(50);

enum Message {
    Work(WorkItem),
    Shutdown,
}

/// What a worker drives; adapts the two public sink traits to one loop
#[async_trait]
trait Sink: Send {
    async fn open(&mut self) -> Result<(), SinkError>;
    async fn deliver(&mut self, item: WorkItem) -> Result<(), SinkError>;
    async fn close(&mut self);
}

struct StoreSink<S>(S);

#[async_trait]
impl<S: ResultStore> Sink for StoreSink<S> {
    async fn open(&mut self) -> Result<(), SinkError> {
        self.0.connect().await
    }

    async fn deliver(&mut self, item: WorkItem) -> Result<(), SinkError> {
        match item {
            WorkItem::Persist(record) => self.0.store(record).await,
            WorkItem::Push(_) => Err(SinkError::Rejected(
                "push item on the persistence channel".into(),
            )),
        }
    }

    async fn close(&mut self) {
        self.0.close().await
    }
}

struct PushSink<B>(B);

#[async_trait]
impl<B: Broadcaster> Sink for PushSink<B> {
    async fn open(&mut self) -> Result<(), SinkError> {
        self.0.connect().await
    }

    async fn deliver(&mut self, item: WorkItem) -> Result<(), SinkError> {
        match item {
            WorkItem::Push(notification) => {
                let session = notification.session_id.clone();
                self.0.broadcast(&session, notification).await
            }
            WorkItem::Persist(_) => Err(SinkError::Rejected(
                "persistence item on the push channel".into(),
            )),
        }
    }

    async fn close(&mut self) {
        self.0.close().await
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

struct Channel {
    name: &'static str,
    queue: Arc<BoundedQueue<Message>>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelStats {
    pub queue: QueueStats,
    pub processed: u64,
    pub failed: u64,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BridgeStats {
    pub persistence: ChannelStats,
    pub push: ChannelStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

pub struct Bridge {
    config: BridgeConfig,
    persistence: Channel,
    push: Channel,
    state: Mutex<State>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            persistence: Channel::new("persistence", config.persistence_capacity),
            push: Channel::new("push", config.push_capacity),
            config,
            state: Mutex::new(State::Idle),
        }
    }

    /// Spawn both workers. Each gets its own runtime, built here so a
    /// failure surfaces to the caller, and owns the sink it is given.
    pub fn start<S, B>(&self, store: S, broadcaster: B) -> Result<(), BridgeError>
    where
        S: ResultStore + 'static,
        B: Broadcaster + 'static,
    {
        let mut state = lock(&self.state);
        match *state {
            State::Running => return Err(BridgeError::AlreadyStarted),
            State::Stopped => return Err(BridgeError::Stopped),
            State::Idle => {}
        }

        self.persistence.spawn(StoreSink(store))?;
        if let Err(e) = self.push.spawn(PushSink(broadcaster)) {
            self.persistence.shutdown(self.config.stop_timeout());
            *state = State::Stopped;
            return Err(e);
        }

        *state = State::Running;
        info!(
            persistence_capacity = self.persistence.queue.capacity(),
            push_capacity = self.push.queue.capacity(),
            "Bridge started"
        );
        Ok(())
    }

    /// Queue a result for storage. Never blocks; a full queue drops the
    /// record with a warning. Items queued before `start` wait for the worker.
    pub fn enqueue_persistence(&self, record: ResultRecord) -> PushOutcome {
        self.persistence.push(WorkItem::Persist(record))
    }

    /// Queue a notification for subscribers. Never blocks; best effort.
    pub fn enqueue_push(&self, notification: Notification) -> PushOutcome {
        self.push.push(WorkItem::Push(notification))
    }

    /// Route an item to the channel matching its kind
    pub fn enqueue(&self, item: WorkItem) -> PushOutcome {
        match item {
            WorkItem::Persist(_) => self.persistence.push(item),
            WorkItem::Push(_) => self.push.push(item),
        }
    }

    /// Drain and stop both workers, then dispose of their sinks and
    /// runtimes. Idempotent.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        let was_running = *state == State::Running;
        *state = State::Stopped;
        drop(state);

        let timeout = self.config.stop_timeout();
        self.persistence.shutdown(timeout);
        self.push.shutdown(timeout);

        if was_running {
            info!("Bridge stopped");
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            persistence: self.persistence.stats(),
            push: self.push.stats(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Channel {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            queue: Arc::new(BoundedQueue::new(name, capacity, Backpressure::DropNewest)),
            counters: Arc::new(Counters::default()),
            worker: Mutex::new(None),
        }
    }

    fn push(&self, item: WorkItem) -> PushOutcome {
        let session = item.session_id().to_string();
        let sequence = item.sequence();
        let outcome = self.queue.push(Message::Work(item));
        if outcome == PushOutcome::Closed {
            debug!(queue = self.name, session = %session, sequence, "Bridge closed, item discarded");
        }
        outcome
    }

    fn spawn<S: Sink + 'static>(&self, sink: S) -> Result<(), BridgeError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;

        let name = self.name;
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);

        let handle = thread::Builder::new()
            .name(format!("bridge-{}", name))
            .spawn(move || run_worker(name, runtime, queue, counters, sink))
            .map_err(BridgeError::Spawn)?;

        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    fn shutdown(&self, timeout: Duration) {
        self.queue.close();

        let Some(worker) = lock(&self.worker).take() else {
            return;
        };

        let deadline = Instant::now() + timeout;
        if self.queue.push_control(Message::Shutdown, timeout).is_err() {
            warn!(queue = self.name, "Worker not draining, shutdown signal not delivered");
        }

        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if !worker.is_finished() {
            warn!(
                queue = self.name,
                pending = self.queue.len(),
                "Worker did not exit in time, detaching"
            );
            return;
        }
        if worker.join().is_err() {
            error!(queue = self.name, "Bridge worker panicked");
        }

        let mut discarded = 0;
        while let Some(message) = self.queue.try_pop() {
            if matches!(message, Message::Work(_)) {
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!(queue = self.name, discarded, "Items queued after shutdown were discarded");
        }
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            queue: self.queue.stats(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            running: lock(&self.worker)
                .as_ref()
                .map(|w| !w.is_finished())
                .unwrap_or(false),
        }
    }
}

fn run_worker<S: Sink>(
    name: &'static str,
    runtime: Runtime,
    queue: Arc<BoundedQueue<Message>>,
    counters: Arc<Counters>,
    mut sink: S,
) {
    runtime.block_on(async move {
        if let Err(e) = sink.open().await {
            // Keep draining: each delivery will fail and be logged on its own
            error!(queue = name, error = %e, "Sink failed to connect");
        }
        debug!(queue = name, "Bridge worker running");

        loop {
            // The shutdown sentinel may never fit behind a slow sink, so a
            // closed and drained queue ends the loop on its own
            let message = match tokio::time::timeout(IDLE_CHECK, queue.pop_async()).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) if queue.is_closed() && queue.is_empty() => break,
                Err(_) => continue,
            };
            let item = match message {
                Message::Work(item) => item,
                Message::Shutdown => break,
            };

            let sequence = item.sequence();
            match sink.deliver(item).await {
                Ok(()) => {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("framehub_sink_failures_total", "queue" => name).increment(1);
                    warn!(queue = name, sequence, error = %e, "Sink failed, item discarded");
                }
            }
        }

        sink.close().await;
    });

    // Tasks the sink spawned on this runtime get a moment to wind down
    runtime.shutdown_timeout(Duration::from_millis(500));
    debug!(queue = name, "Bridge worker exited");
}
