//! Secondary alert worker
//!
//! Attaches to a stream like any other consumer. The capture thread only
//! drops the frame into a size-1 slot (latest wins); a dedicated thread that
//! owns the detector runs inference on whatever is newest, and a cooldown
//! keeps matching detections from turning into an alert storm. Alerts leave
//! through the bridge as a stored record plus a push notification.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::cooldown::Cooldown;
use super::detector::{Detection, Detector};
use crate::capture::{Frame, FrameView};
use crate::error::{ConsumerError, StreamError};
use crate::pipeline::queue::{Backpressure, BoundedQueue};
use crate::pipeline::work::{unix_millis, Notification, ResultRecord};
use crate::pipeline::Bridge;
use crate::stream::{FrameConsumer, SourceStatus, StreamManager};
use crate::utils::lock;
use crate::AlertConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which detections count as an alert
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    /// Empty matches any class
    pub classes: Vec<String>,
    pub min_confidence: f32,
}

impl AlertRule {
    pub fn matches(&self, detection: &Detection) -> bool {
        detection.confidence >= self.min_confidence
            && (self.classes.is_empty() || self.classes.iter().any(|c| *c == detection.class))
    }
}

impl From<&AlertConfig> for AlertRule {
    fn from(config: &AlertConfig) -> Self {
        Self {
            classes: config.classes.clone(),
            min_confidence: config.min_confidence,
        }
    }
}

#[derive(Default)]
struct Counters {
    frames_offered: AtomicU64,
    frames_analyzed: AtomicU64,
    alerts_fired: AtomicU64,
    alerts_suppressed: AtomicU64,
    inference_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub frames_offered: u64,
    pub frames_analyzed: u64,
    pub alerts_fired: u64,
    pub alerts_suppressed: u64,
    pub inference_errors: u64,
}

pub struct AlertWorker {
    id: String,
    slot: Arc<BoundedQueue<Frame>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Analyzer<D> {
    id: String,
    session_id: String,
    detector: D,
    rule: AlertRule,
    cooldown: Cooldown,
    bridge: Arc<Bridge>,
    counters: Arc<Counters>,
}

impl AlertWorker {
    /// Spawn the inference thread; the worker is idle until attached.
    pub fn spawn<D: Detector + 'static>(
        id: impl Into<String>,
        session_id: impl Into<String>,
        detector: D,
        rule: AlertRule,
        cooldown: Duration,
        bridge: Arc<Bridge>,
    ) -> std::io::Result<Arc<Self>> {
        let id = id.into();
        let slot = Arc::new(BoundedQueue::new(
            format!("alert:{}", id),
            1,
            Backpressure::DropOldest,
        ));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let mut analyzer = Analyzer {
            id: id.clone(),
            session_id: session_id.into(),
            detector,
            rule,
            cooldown: Cooldown::new(cooldown),
            bridge,
            counters: Arc::clone(&counters),
        };
        let (thread_slot, thread_running) = (Arc::clone(&slot), Arc::clone(&running));

        let handle = thread::Builder::new()
            .name(format!("alert-{}", id))
            .spawn(move || {
                debug!(worker = %analyzer.id, "Alert worker running");
                while thread_running.load(Ordering::Acquire) {
                    if let Some(frame) = thread_slot.pop_timeout(POLL_INTERVAL) {
                        analyzer.analyze(&frame);
                    }
                }
                debug!(worker = %analyzer.id, "Alert worker exited");
            })?;

        Ok(Arc::new(Self {
            id,
            slot,
            running,
            counters,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn attach(
        self: &Arc<Self>,
        manager: &StreamManager,
        stream_id: &str,
    ) -> Result<SourceStatus, StreamError> {
        manager.attach(stream_id, Arc::clone(self) as Arc<dyn FrameConsumer>)
    }

    pub fn detach(&self, manager: &StreamManager, stream_id: &str) -> bool {
        manager.detach(stream_id, &self.id)
    }

    /// Stop the inference thread. Any source still holding this worker
    /// prunes it on its next frame.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.slot.close();

        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        if handle.join().is_err() {
            error!(worker = %self.id, "Alert worker panicked");
        }
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            frames_offered: self.counters.frames_offered.load(Ordering::Relaxed),
            frames_analyzed: self.counters.frames_analyzed.load(Ordering::Relaxed),
            alerts_fired: self.counters.alerts_fired.load(Ordering::Relaxed),
            alerts_suppressed: self.counters.alerts_suppressed.load(Ordering::Relaxed),
            inference_errors: self.counters.inference_errors.load(Ordering::Relaxed),
        }
    }
}

impl FrameConsumer for AlertWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_frame(&self, frame: &Frame) -> Result<(), ConsumerError> {
        self.counters.frames_offered.fetch_add(1, Ordering::Relaxed);
        // Size-1 slot: an unprocessed older frame is simply replaced
        self.slot.push(frame.clone());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for AlertWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<D: Detector> Analyzer<D> {
    fn analyze(&mut self, frame: &Frame) {
        let rgb = match frame.to_rgb() {
            Ok(rgb) => rgb,
            Err(e) => {
                self.counters.inference_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.id, sequence = frame.sequence(), error = %e, "Frame decode failed");
                return;
            }
        };
        let view = FrameView {
            rgb: &rgb,
            width: frame.meta.width,
            height: frame.meta.height,
            sequence: frame.sequence(),
            captured_at: frame.meta.captured_at,
        };

        let detections = match self.detector.detect(view) {
            Ok(detections) => detections,
            Err(e) => {
                self.counters.inference_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %self.id, sequence = frame.sequence(), error = %e, "Inference failed");
                return;
            }
        };
        self.counters.frames_analyzed.fetch_add(1, Ordering::Relaxed);

        let hits: Vec<Detection> = detections
            .into_iter()
            .filter(|d| self.rule.matches(d))
            .collect();
        if hits.is_empty() {
            return;
        }

        let now = Instant::now();
        if !self.cooldown.try_acquire(now) {
            self.counters.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                worker = %self.id,
                remaining_ms = self.cooldown.remaining(now).as_millis() as u64,
                "Alert suppressed by cooldown"
            );
            return;
        }

        self.fire(frame, hits);
    }

    fn fire(&self, frame: &Frame, hits: Vec<Detection>) {
        let timestamp_ms = unix_millis(frame.meta.captured_at);
        let count = hits.len();
        let payload = json!({
            "worker": self.id,
            "source": frame.source(),
            "detections": hits,
        });

        let stored = self.bridge.enqueue_persistence(ResultRecord {
            session_id: self.session_id.clone(),
            source_id: frame.source().to_string(),
            sequence: frame.sequence(),
            timestamp_ms,
            payload: payload.clone(),
        });
        let pushed = self.bridge.enqueue_push(Notification {
            session_id: self.session_id.clone(),
            sequence: frame.sequence(),
            timestamp_ms,
            payload,
        });

        self.counters.alerts_fired.fetch_add(1, Ordering::Relaxed);
        info!(
            worker = %self.id,
            source = %frame.source(),
            sequence = frame.sequence(),
            detections = count,
            stored = ?stored,
            pushed = ?pushed,
            "Alert fired"
        );
    }
}
