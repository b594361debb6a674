//! One physical device and its capture loop
//!
//! The capture thread exclusively owns the device handle. Frames are stamped,
//! published as the latest frame and broadcast inline to every registered
//! consumer. Read failures are retried; after `reinit_after_failures`
//! consecutive failures the handle is released and the device reopened with
//! the same backend order, forever, until the source is stopped.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use flume::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::consumer::{ConsumerRegistry, FrameConsumer};
use crate::capture::{BackendCatalog, CaptureDevice, CaptureRequest, DeviceSpec, Frame, Negotiated};
use crate::error::{BackendAttempt, StartError};
use crate::utils::lock;
use crate::CaptureConfig;

// Consecutive read failures at which logging escalates
const INFO_AFTER_FAILURES: u32 = 3;
const WARN_AFTER_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameSourceStats {
    pub id: String,
    pub device: String,
    pub status: SourceStatus,
    pub backend: Option<String>,
    pub frame_count: u64,
    pub target_fps: u32,
    pub negotiated: Option<Negotiated>,
    pub consumer_count: usize,
    pub last_error: Option<String>,
    pub uptime_secs: Option<f64>,
    pub reinitializations: u64,
    pub consecutive_failures: u32,
}

struct Lifecycle {
    status: SourceStatus,
    backend: Option<String>,
    negotiated: Option<Negotiated>,
    last_error: Option<String>,
    started_at: Option<Instant>,
}

struct Shared {
    id: Arc<str>,
    device: DeviceSpec,
    config: CaptureConfig,
    catalog: Arc<BackendCatalog>,
    lifecycle: Mutex<Lifecycle>,
    frame_count: AtomicU64,
    latest: ArcSwapOption<Frame>,
    consumers: ConsumerRegistry,
    running: AtomicBool,
    reinitializations: AtomicU64,
    consecutive_failures: AtomicU32,
}

#[derive(Default)]
struct Control {
    worker: Option<JoinHandle<()>>,
    // Dropping the sender wakes the capture loop out of any wait
    stop_tx: Option<Sender<()>>,
}

pub struct FrameSource {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl FrameSource {
    pub fn new(
        id: impl Into<Arc<str>>,
        device: DeviceSpec,
        config: CaptureConfig,
        catalog: Arc<BackendCatalog>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                device,
                config,
                catalog,
                lifecycle: Mutex::new(Lifecycle {
                    status: SourceStatus::Stopped,
                    backend: None,
                    negotiated: None,
                    last_error: None,
                    started_at: None,
                }),
                frame_count: AtomicU64::new(0),
                latest: ArcSwapOption::empty(),
                consumers: ConsumerRegistry::new(),
                running: AtomicBool::new(false),
                reinitializations: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
            }),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn device(&self) -> &DeviceSpec {
        &self.shared.device
    }

    pub fn status(&self) -> SourceStatus {
        lock(&self.shared.lifecycle).status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SourceStatus::Running
    }

    /// Open the device (trying backends in order) and spawn the capture loop.
    /// A running source is left untouched.
    #[instrument(skip(self), fields(stream = %self.shared.id, device = %self.shared.device.path))]
    pub fn start(&self) -> Result<(), StartError> {
        let mut control = lock(&self.control);
        if control.worker.is_some() && self.is_running() {
            return Ok(());
        }
        // A loop left over from a failed run is retired before reopening
        self.halt(&mut control);

        self.set_status(SourceStatus::Starting);
        let shared = &self.shared;
        let request = shared.request();

        let (backend, device) = match shared.catalog.open(&shared.device, &request) {
            Ok(opened) => opened,
            Err(e) => {
                error!(error = %e, "Failed to start stream");
                let mut lifecycle = lock(&shared.lifecycle);
                lifecycle.status = SourceStatus::Error;
                lifecycle.last_error = Some(e.to_string());
                return Err(e);
            }
        };
        let negotiated = device.negotiated();

        let (stop_tx, stop_rx) = flume::bounded(1);
        shared.running.store(true, Ordering::Release);
        shared.consecutive_failures.store(0, Ordering::Relaxed);

        let capture = CaptureLoop {
            shared: Arc::clone(shared),
            device: Some(device),
            stop_rx,
        };
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", shared.id))
            .spawn(move || capture.run());

        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The closure, and with it the device, was dropped by spawn
                shared.running.store(false, Ordering::Release);
                let err = StartError {
                    device: shared.device.path.clone(),
                    attempts: vec![BackendAttempt {
                        backend,
                        reason: format!("failed to spawn capture thread: {}", e),
                    }],
                };
                let mut lifecycle = lock(&shared.lifecycle);
                lifecycle.status = SourceStatus::Error;
                lifecycle.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        {
            let mut lifecycle = lock(&shared.lifecycle);
            lifecycle.status = SourceStatus::Running;
            lifecycle.backend = Some(backend.clone());
            lifecycle.negotiated = Some(negotiated);
            lifecycle.last_error = None;
            lifecycle.started_at = Some(Instant::now());
        }
        control.worker = Some(worker);
        control.stop_tx = Some(stop_tx);

        info!(
            backend = %backend,
            width = negotiated.width,
            height = negotiated.height,
            fps = negotiated.fps,
            format = ?negotiated.format,
            "Stream started"
        );
        Ok(())
    }

    /// Stop the capture loop, release the device and drop every consumer.
    /// Idempotent.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        let was_active = control.worker.is_some();
        self.halt(&mut control);

        let dropped = self.shared.consumers.clear();
        self.shared.latest.store(None);

        let mut lifecycle = lock(&self.shared.lifecycle);
        lifecycle.status = SourceStatus::Stopped;
        lifecycle.started_at = None;
        drop(lifecycle);

        if was_active {
            info!(stream = %self.shared.id, consumers = dropped, "Stream stopped");
        }
    }

    fn halt(&self, control: &mut Control) {
        self.shared.running.store(false, Ordering::Release);
        control.stop_tx.take();

        let Some(worker) = control.worker.take() else {
            return;
        };

        let deadline = Instant::now() + self.shared.config.stop_timeout();
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if worker.is_finished() {
            if worker.join().is_err() {
                error!(stream = %self.shared.id, "Capture thread panicked");
            }
        } else {
            // The loop exits and releases the device once its blocking read returns
            warn!(
                stream = %self.shared.id,
                timeout_ms = self.shared.config.stop_timeout_ms,
                "Capture thread did not exit in time, detaching"
            );
        }
    }

    /// Register a consumer; false if the id is taken. A late joiner receives
    /// the current latest frame immediately.
    pub fn add_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> bool {
        let id = consumer.id().to_string();
        let added = self
            .shared
            .consumers
            .add(consumer, || self.latest_frame());
        if added {
            info!(stream = %self.shared.id, consumer = %id, "Consumer attached");
        }
        added
    }

    pub fn remove_consumer(&self, id: &str) -> bool {
        let removed = self.shared.consumers.remove(id);
        if removed {
            info!(stream = %self.shared.id, consumer = %id, "Consumer detached");
        }
        removed
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.shared.consumers.ids()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.latest.load_full().map(|frame| Frame::clone(&frame))
    }

    pub fn stats(&self) -> FrameSourceStats {
        let shared = &self.shared;
        let lifecycle = lock(&shared.lifecycle);

        FrameSourceStats {
            id: shared.id.to_string(),
            device: shared.device.path.clone(),
            status: lifecycle.status,
            backend: lifecycle.backend.clone(),
            frame_count: shared.frame_count.load(Ordering::Relaxed),
            target_fps: shared.config.target_fps,
            negotiated: lifecycle.negotiated,
            consumer_count: shared.consumers.len(),
            last_error: lifecycle.last_error.clone(),
            uptime_secs: lifecycle.started_at.map(|t| t.elapsed().as_secs_f64()),
            reinitializations: shared.reinitializations.load(Ordering::Relaxed),
            consecutive_failures: shared.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    fn set_status(&self, status: SourceStatus) {
        lock(&self.shared.lifecycle).status = status;
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn request(&self) -> CaptureRequest {
        CaptureRequest {
            width: self.config.width,
            height: self.config.height,
            fps: self.config.target_fps,
            format: self.config.format,
        }
    }
}

struct CaptureLoop {
    shared: Arc<Shared>,
    device: Option<Box<dyn CaptureDevice>>,
    stop_rx: Receiver<()>,
}

impl CaptureLoop {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let id = shared.id.to_string();

        if let Some(core) = shared.config.cpu_affinity {
            if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                warn!(stream = %id, core, "Failed to pin capture thread");
            }
        }

        debug!(stream = %id, "Capture loop running");
        let frame_interval = shared.config.frame_interval();
        let mut next_tick = Instant::now();

        while shared.running.load(Ordering::Acquire) {
            let Some(device) = self.device.as_mut() else {
                if !self.reinitialize() {
                    break;
                }
                continue;
            };

            match device.read_frame() {
                Ok(raw) => {
                    shared.consecutive_failures.store(0, Ordering::Relaxed);

                    let sequence = shared.frame_count.fetch_add(1, Ordering::Relaxed);
                    let frame = Frame::stamp(raw, Arc::clone(&shared.id), sequence);
                    shared.latest.store(Some(Arc::new(frame.clone())));
                    metrics::counter!("framehub_frames_captured_total", "stream" => id.clone())
                        .increment(1);

                    for consumer in shared.consumers.broadcast(&frame) {
                        info!(stream = %id, consumer = %consumer, "Consumer pruned");
                        metrics::counter!("framehub_consumers_pruned_total", "stream" => id.clone())
                            .increment(1);
                    }

                    if let Some(interval) = frame_interval {
                        next_tick += interval;
                        let now = Instant::now();
                        if next_tick > now {
                            if !self.wait(next_tick - now) {
                                break;
                            }
                        } else {
                            // Running behind; don't try to catch up with a burst
                            next_tick = now;
                        }
                    }
                }
                Err(e) => {
                    let failures = shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::counter!("framehub_read_failures_total", "stream" => id.clone())
                        .increment(1);

                    if failures >= WARN_AFTER_FAILURES {
                        warn!(stream = %id, failures, error = %e, "Frame read failing");
                    } else if failures >= INFO_AFTER_FAILURES {
                        info!(stream = %id, failures, error = %e, "Frame read failed");
                    } else {
                        debug!(stream = %id, failures, error = %e, "Frame read failed");
                    }

                    if failures >= shared.config.reinit_after_failures {
                        // Release before reopening; the old handle may be wedged
                        self.device = None;
                        if !self.reinitialize() {
                            break;
                        }
                    } else if !self.wait(shared.config.read_retry_delay()) {
                        break;
                    }
                    next_tick = Instant::now();
                }
            }
        }

        // Release the device on this thread
        self.device = None;
        debug!(stream = %id, "Capture loop exited, device released");
    }

    /// One reopen attempt. Returns false if the source was stopped meanwhile.
    fn reinitialize(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        let attempt = shared.reinitializations.fetch_add(1, Ordering::Relaxed) + 1;
        shared.consecutive_failures.store(0, Ordering::Relaxed);
        metrics::counter!("framehub_reinitializations_total", "stream" => shared.id.to_string())
            .increment(1);

        info!(stream = %shared.id, attempt, "Reinitializing device");

        match shared.catalog.open(&shared.device, &shared.request()) {
            Ok((backend, device)) => {
                let negotiated = device.negotiated();
                self.device = Some(device);

                let mut lifecycle = lock(&shared.lifecycle);
                // stop() may have raced us; it owns the final status
                if shared.running.load(Ordering::Acquire) {
                    lifecycle.status = SourceStatus::Running;
                }
                lifecycle.backend = Some(backend.clone());
                lifecycle.negotiated = Some(negotiated);
                lifecycle.last_error = None;
                drop(lifecycle);

                info!(stream = %shared.id, backend = %backend, "Device reinitialized");
                true
            }
            Err(e) => {
                error!(stream = %shared.id, attempt, error = %e, "Reinitialization failed");
                {
                    let mut lifecycle = lock(&shared.lifecycle);
                    if shared.running.load(Ordering::Acquire) {
                        lifecycle.status = SourceStatus::Error;
                    }
                    lifecycle.last_error = Some(e.to_string());
                }
                self.wait(shared.config.reinit_retry_interval())
            }
        }
    }

    /// Sleep unless stopped. Returns false when the source is stopping.
    fn wait(&self, duration: Duration) -> bool {
        match self.stop_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.shared.running.load(Ordering::Acquire),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
