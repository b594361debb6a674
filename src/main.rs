//! framehub: share capture devices between preview, detection and alerting

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use framehub::alert::{AlertRule, AlertWorker, BBox, Detection};
use framehub::capture::{BackendCatalog, FrameView, PixelFormat};
use framehub::error::{DetectError, SinkError};
use framehub::pipeline::{Bridge, Broadcaster, Notification, PreviewFeed, PreviewReceiver, ResultRecord, ResultStore};
use framehub::{Settings, StreamManager};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framehub=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framehub launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut settings = Settings::load(config_path.as_deref())?;
    if settings.streams.is_empty() {
        settings.ensure_default_stream(detect_device());
    }

    let manager = Arc::new(StreamManager::new(
        settings.capture.clone(),
        BackendCatalog::with_builtin(),
    ));

    let bridge = Arc::new(Bridge::new(settings.bridge.clone()));
    bridge.start(LogStore::default(), LogBroadcaster)?;

    let alerts = AlertWorker::spawn(
        "motion-alert",
        settings.alert.session_id.clone(),
        MotionDetector::default(),
        AlertRule::from(&settings.alert),
        settings.alert.cooldown(),
        Arc::clone(&bridge),
    )?;

    for stream in &settings.streams {
        let id = stream.id.clone();
        let mut device = manager.device(stream.device.clone());
        if let Some(backends) = &stream.backends {
            device.backends = backends.clone();
        }

        if let Err(e) = manager.start_stream(&id, device) {
            error!(stream = %id, error = %e, "Stream failed to start");
            continue;
        }

        let (feed, preview) = PreviewFeed::new(format!("preview-{}", id), settings.preview.capacity);
        manager.attach(&id, feed)?;
        tokio::spawn(drain_preview(id.clone(), preview));

        alerts.attach(&manager, &id)?;
    }

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for (id, stats) in manager.all_stats() {
                    info!(
                        stream = %id,
                        status = ?stats.status,
                        frames = stats.frame_count,
                        consumers = stats.consumer_count,
                        reinitializations = stats.reinitializations,
                        "Stream stats"
                    );
                }
                let bridge_stats = bridge.stats();
                info!(
                    persisted = bridge_stats.persistence.processed,
                    pushed = bridge_stats.push.processed,
                    dropped = bridge_stats.persistence.queue.dropped + bridge_stats.push.queue.dropped,
                    alerts = alerts.stats().alerts_fired,
                    "Bridge stats"
                );
            }
        }
    }

    info!("framehub shutting down");
    // Joins worker threads; keep it off the async workers
    tokio::task::spawn_blocking(move || {
        alerts.stop();
        manager.stop_all();
        bridge.stop();
    })
    .await?;

    Ok(())
}

fn detect_device() -> Option<(String, PixelFormat)> {
    #[cfg(feature = "v4l2")]
    {
        framehub::utils::auto_detect_device()
    }
    #[cfg(not(feature = "v4l2"))]
    {
        None
    }
}

/// Stand-in for a streaming response: pulls the freshest preview frames
async fn drain_preview(stream: String, preview: PreviewReceiver) {
    let mut received = 0u64;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), preview.recv()).await {
            Ok(Some(frame)) => {
                received += 1;
                if received % 300 == 0 {
                    debug!(stream = %stream, sequence = frame.sequence(), received, "Preview frames");
                }
            }
            Ok(None) => break,
            Err(_) => warn!(stream = %stream, "No preview frame for 5s"),
        }
    }
}

/// Result store that only logs; swap for a database-backed store
#[derive(Default)]
struct LogStore {
    stored: u64,
}

#[async_trait]
impl ResultStore for LogStore {
    async fn store(&mut self, record: ResultRecord) -> Result<(), SinkError> {
        self.stored += 1;
        info!(
            session = %record.session_id,
            source = %record.source_id,
            sequence = record.sequence,
            payload = %record.payload,
            "Result stored"
        );
        Ok(())
    }

    async fn close(&mut self) {
        info!(stored = self.stored, "Result store closed");
    }
}

struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn broadcast(
        &mut self,
        session_id: &str,
        notification: Notification,
    ) -> Result<(), SinkError> {
        info!(session = %session_id, sequence = notification.sequence, "Notification pushed");
        Ok(())
    }
}

/// Mean-luma frame differencing; reports whole-frame "motion"
#[derive(Default)]
struct MotionDetector {
    previous_luma: Option<f32>,
}

const MOTION_THRESHOLD: f32 = 12.0;

impl framehub::alert::Detector for MotionDetector {
    fn detect(&mut self, frame: FrameView<'_>) -> Result<Vec<Detection>, DetectError> {
        let pixels = frame.rgb.len() / 3;
        if pixels == 0 {
            return Err(DetectError::Inference("empty frame".into()));
        }

        let sum: u64 = frame
            .rgb
            .chunks_exact(3)
            .map(|px| (px[0] as u64 * 299 + px[1] as u64 * 587 + px[2] as u64 * 114) / 1000)
            .sum();
        let luma = sum as f32 / pixels as f32;

        let delta = self.previous_luma.map(|prev| (luma - prev).abs()).unwrap_or(0.0);
        self.previous_luma = Some(luma);

        if delta < MOTION_THRESHOLD {
            return Ok(Vec::new());
        }
        Ok(vec![Detection {
            class: "motion".into(),
            confidence: (delta / 255.0 * 4.0).min(1.0),
            bbox: BBox {
                x: 0.0,
                y: 0.0,
                width: frame.width as f32,
                height: frame.height as f32,
            },
        }])
    }
}
