#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};

use framehub::capture::{
    BackendCatalog, CaptureBackend, CaptureDevice, CaptureRequest, Negotiated, PixelFormat,
    RawFrame,
};
use framehub::error::{ConsumerError, OpenError, ReadError};
use framehub::stream::{CallbackConsumer, FrameConsumer};
use framehub::{CaptureConfig, Frame, StreamManager};

pub const FAKE: &str = "fake";

/// One scripted device read
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Frame,
    Fail,
}

/// Capture backend driven by the test. Every opened device reads from the
/// same script, so a failure queued before a reopen is seen by the new handle.
/// An empty script reads as a short timeout; a held backend blocks reads
/// instead, so a test can attach consumers before anything is read.
pub struct FakeBackend {
    tx: Sender<Step>,
    rx: Receiver<Step>,
    held: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

struct FakeDevice {
    rx: Receiver<Step>,
    held: Arc<AtomicBool>,
    negotiated: Negotiated,
    closes: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            tx,
            rx,
            held: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn frames(&self, count: usize) {
        self.script(Step::Frame, count);
    }

    pub fn failures(&self, count: usize) {
        self.script(Step::Fail, count);
    }

    pub fn script(&self, step: Step, count: usize) {
        for _ in 0..count {
            let _ = self.tx.send(step);
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for FakeBackend {
    fn name(&self) -> &str {
        FAKE
    }

    fn open(&self, _path: &str, request: &CaptureRequest) -> Result<Box<dyn CaptureDevice>, OpenError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            rx: self.rx.clone(),
            held: Arc::clone(&self.held),
            negotiated: Negotiated {
                width: request.width,
                height: request.height,
                fps: request.fps,
                format: PixelFormat::Rgb24,
            },
            closes: Arc::clone(&self.closes),
        }))
    }
}

impl CaptureDevice for FakeDevice {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        while self.held.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        match self.rx.recv_timeout(Duration::from_millis(5)) {
            Ok(Step::Frame) => Ok(RawFrame {
                data: Bytes::from_static(&[0xAB, 0xCD, 0xEF]),
                width: 1,
                height: 1,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            }),
            Ok(Step::Fail) => Err(ReadError::Backend("scripted failure".into())),
            Err(RecvTimeoutError::Timeout) => Err(ReadError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ReadError::Disconnected),
        }
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Unpaced capture with fast retries; `reinit_after_failures` effectively off
pub fn config() -> CaptureConfig {
    CaptureConfig {
        width: 1,
        height: 1,
        target_fps: 0,
        format: PixelFormat::Rgb24,
        backends: vec![FAKE.into()],
        read_retry_delay_ms: 1,
        reinit_after_failures: u32::MAX,
        reinit_retry_interval_ms: 10,
        stop_timeout_ms: 1000,
        cpu_affinity: None,
    }
}

pub fn manager(fake: &Arc<FakeBackend>, config: CaptureConfig) -> StreamManager {
    let mut catalog = BackendCatalog::new();
    catalog.register(Arc::clone(fake) as Arc<dyn CaptureBackend>);
    StreamManager::new(config, catalog)
}

/// Consumer that records every sequence it receives
pub fn recorder(id: &str) -> (Arc<dyn FrameConsumer>, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer = CallbackConsumer::new(id, move |frame: &Frame| {
        sink.lock().unwrap().push(frame.sequence());
        Ok::<(), ConsumerError>(())
    });
    (Arc::new(consumer), seen)
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}
