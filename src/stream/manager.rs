//! Process-wide registry of frame sources
//!
//! The only entry point other subsystems use. The id -> source table has its
//! own lock, distinct from each source's internals, so a lookup never waits
//! on a capture loop. Sources are cloned out of the table before any
//! long-running call (start, stop) is made on them. Start and stop calls
//! are serialized on a separate lifecycle lock so that a check and the
//! replacement that follows it cannot interleave with another start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use super::consumer::FrameConsumer;
use super::source::{FrameSource, FrameSourceStats, SourceStatus};
use crate::capture::{BackendCatalog, DeviceSpec, Frame};
use crate::error::StreamError;
use crate::utils::lock;
use crate::CaptureConfig;

pub struct StreamManager {
    streams: RwLock<HashMap<String, Arc<FrameSource>>>,
    // Held for the whole of start_stream, stop_stream and stop_all
    lifecycle: Mutex<()>,
    catalog: Arc<BackendCatalog>,
    config: CaptureConfig,
}

impl StreamManager {
    pub fn new(config: CaptureConfig, catalog: BackendCatalog) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            catalog: Arc::new(catalog),
            config,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Device spec for `path` using the configured backend order
    pub fn device(&self, path: impl Into<String>) -> DeviceSpec {
        DeviceSpec {
            path: path.into(),
            backends: self.config.backends.clone(),
        }
    }

    /// Start the stream `id` on `device`.
    ///
    /// A running stream is left alone. A stream that exists but is not
    /// running is torn down and replaced by a fresh source. A failed start
    /// keeps the source registered in `Error` so attach and stats can report
    /// why. Concurrent starts of the same id open the device once.
    pub fn start_stream(&self, id: &str, device: DeviceSpec) -> Result<(), StreamError> {
        let _lifecycle = lock(&self.lifecycle);
        if let Some(existing) = self.get(id) {
            if existing.is_running() {
                return Ok(());
            }
            info!(stream = %id, status = ?existing.status(), "Replacing inactive stream");
            existing.stop();
        }

        let source = Arc::new(FrameSource::new(
            id,
            device,
            self.config.clone(),
            Arc::clone(&self.catalog),
        ));

        let previous = self
            .write_streams()
            .insert(id.to_string(), Arc::clone(&source));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &source) {
                previous.stop();
            }
        }

        source.start().map_err(StreamError::from)
    }

    /// Stop and remove the stream; false if absent
    pub fn stop_stream(&self, id: &str) -> bool {
        let _lifecycle = lock(&self.lifecycle);
        let Some(source) = self.write_streams().remove(id) else {
            return false;
        };
        source.stop();
        true
    }

    /// Attach a consumer. Returns the source status at attach time so the
    /// caller can tell a healthy stream from one that failed to start.
    pub fn attach(
        &self,
        id: &str,
        consumer: Arc<dyn FrameConsumer>,
    ) -> Result<SourceStatus, StreamError> {
        let source = self
            .get(id)
            .ok_or_else(|| StreamError::NotFound(id.to_string()))?;

        let consumer_id = consumer.id().to_string();
        if !source.add_consumer(consumer) {
            return Err(StreamError::DuplicateConsumer {
                stream: id.to_string(),
                consumer: consumer_id,
            });
        }

        let status = source.status();
        if status != SourceStatus::Running {
            warn!(stream = %id, consumer = %consumer_id, ?status, "Consumer attached to inactive stream");
        }
        Ok(status)
    }

    /// Detach a consumer; false if the stream or consumer is unknown
    pub fn detach(&self, id: &str, consumer_id: &str) -> bool {
        self.get(id)
            .map(|source| source.remove_consumer(consumer_id))
            .unwrap_or(false)
    }

    pub fn latest_frame(&self, id: &str) -> Option<Frame> {
        self.get(id)?.latest_frame()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.get(id).map(|s| s.is_running()).unwrap_or(false)
    }

    pub fn stats(&self, id: &str) -> Option<FrameSourceStats> {
        Some(self.get(id)?.stats())
    }

    pub fn all_stats(&self) -> HashMap<String, FrameSourceStats> {
        self.sources()
            .into_iter()
            .map(|source| (source.id().to_string(), source.stats()))
            .collect()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.read_streams().keys().cloned().collect()
    }

    pub fn stop_all(&self) {
        let _lifecycle = lock(&self.lifecycle);
        let drained: Vec<_> = self.write_streams().drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for source in drained {
            source.stop();
        }
        if count > 0 {
            info!(streams = count, "All streams stopped");
        }
    }

    fn get(&self, id: &str) -> Option<Arc<FrameSource>> {
        self.read_streams().get(id).cloned()
    }

    fn sources(&self) -> Vec<Arc<FrameSource>> {
        self.read_streams().values().cloned().collect()
    }

    fn read_streams(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<FrameSource>>> {
        self.streams.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_streams(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<FrameSource>>> {
        self.streams.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::capture::PixelFormat;
    use crate::stream::CallbackConsumer;

    fn manager() -> StreamManager {
        let config = CaptureConfig {
            width: 2,
            height: 2,
            target_fps: 100,
            format: PixelFormat::Rgb24,
            backends: vec!["test-pattern".into()],
            ..CaptureConfig::default()
        };
        StreamManager::new(config, BackendCatalog::with_builtin())
    }

    fn counter(id: &str) -> (Arc<dyn FrameConsumer>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let consumer = CallbackConsumer::new(id, move |_: &Frame| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (Arc::new(consumer), count)
    }

    #[test]
    fn unknown_streams() {
        let manager = manager();
        let (consumer, _) = counter("a");

        assert!(matches!(
            manager.attach("nope", consumer),
            Err(StreamError::NotFound(_))
        ));
        assert!(!manager.detach("nope", "a"));
        assert!(!manager.stop_stream("nope"));
        assert!(!manager.is_running("nope"));
        assert!(manager.stats("nope").is_none());
        assert!(manager.latest_frame("nope").is_none());
    }

    #[test]
    fn start_attach_detach_stop() {
        let manager = manager();
        manager.start_stream("front", manager.device("0")).unwrap();
        assert!(manager.is_running("front"));

        let (consumer, count) = counter("preview");
        assert_eq!(
            manager.attach("front", consumer.clone()).unwrap(),
            SourceStatus::Running
        );
        assert!(matches!(
            manager.attach("front", consumer),
            Err(StreamError::DuplicateConsumer { .. })
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
        assert!(manager.latest_frame("front").is_some());
        assert_eq!(manager.stats("front").unwrap().consumer_count, 1);

        assert!(manager.detach("front", "preview"));
        assert!(!manager.detach("front", "preview"));

        assert!(manager.stop_stream("front"));
        assert!(!manager.is_running("front"));
        assert!(manager.all_stats().is_empty());
    }

    #[test]
    fn starting_a_running_stream_keeps_it() {
        let manager = manager();
        manager.start_stream("front", manager.device("0")).unwrap();
        let (consumer, _) = counter("keep");
        manager.attach("front", consumer).unwrap();

        manager.start_stream("front", manager.device("0")).unwrap();
        assert_eq!(manager.stats("front").unwrap().consumer_count, 1);
        manager.stop_all();
        assert!(manager.stream_ids().is_empty());
    }

    #[test]
    fn failed_start_stays_visible_and_is_replaced_on_retry() {
        let manager = manager();
        let broken = DeviceSpec::new("/dev/video7", &["v4l-missing"]);

        let err = manager.start_stream("back", broken).unwrap_err();
        assert!(err.to_string().contains("v4l-missing"));
        assert_eq!(manager.stats("back").unwrap().status, SourceStatus::Error);

        let (consumer, _) = counter("late");
        assert_eq!(manager.attach("back", consumer).unwrap(), SourceStatus::Error);

        manager.start_stream("back", manager.device("0")).unwrap();
        let stats = manager.stats("back").unwrap();
        assert_eq!(stats.status, SourceStatus::Running);
        assert_eq!(stats.consumer_count, 0);
        manager.stop_all();
    }
}
