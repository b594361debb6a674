pub mod alert;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod stream;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameMetadata};
pub use error::SettingsError;
pub use stream::{FrameSource, SourceStatus, StreamManager};

/// Service configuration
///
/// Loaded once at startup and handed to the components that need it; nothing
/// reads configuration from global state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureConfig,
    pub bridge: BridgeConfig,
    pub preview: PreviewConfig,
    pub alert: AlertConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// 0 lets the device pace the loop
    pub target_fps: u32,
    pub format: PixelFormat,
    /// Default backend preference order
    pub backends: Vec<String>,
    pub read_retry_delay_ms: u64,
    /// Consecutive read failures before the device is reopened
    pub reinit_after_failures: u32,
    pub reinit_retry_interval_ms: u64,
    pub stop_timeout_ms: u64,
    /// Pin capture threads to this core
    pub cpu_affinity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub persistence_capacity: usize,
    pub push_capacity: usize,
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_secs: u64,
    pub min_confidence: f32,
    /// Classes that trigger an alert; empty matches any class
    pub classes: Vec<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub device: String,
    /// Overrides `capture.backends` for this stream
    #[serde(default)]
    pub backends: Option<Vec<String>>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            target_fps: 30,
            format: PixelFormat::Mjpeg,
            backends: vec!["v4l2".into(), "gstreamer".into(), "test-pattern".into()],
            read_retry_delay_ms: 50,
            reinit_after_failures: 10,
            reinit_retry_interval_ms: 2000,
            stop_timeout_ms: 2000,
            cpu_affinity: None,
        }
    }
}

impl CaptureConfig {
    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn reinit_retry_interval(&self) -> Duration {
        Duration::from_millis(self.reinit_retry_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn frame_interval(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_nanos(1_000_000_000 / self.target_fps as u64))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            persistence_capacity: 256,
            push_capacity: 256,
            stop_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self { capacity: 2 }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            min_confidence: 0.5,
            classes: Vec::new(),
            session_id: "alerts".into(),
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Settings {
    /// Load from an optional TOML file, then `FRAMEHUB__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("FRAMEHUB")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Fall back to a single `cam0` stream when none are configured. A
    /// detected device replaces `capture.format` with the format it offers.
    pub fn ensure_default_stream(&mut self, detected: Option<(String, PixelFormat)>) {
        if !self.streams.is_empty() {
            return;
        }
        let device = match detected {
            Some((path, format)) => {
                self.capture.format = format;
                path
            }
            None => "/dev/video0".into(),
        };
        self.streams.push(StreamConfig {
            id: "cam0".into(),
            device,
            backends: None,
        });
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(SettingsError::Invalid {
                field: "capture.width",
                reason: format!(
                    "{}x{} is not a valid resolution",
                    self.capture.width, self.capture.height
                ),
            });
        }
        if self.capture.reinit_after_failures == 0 {
            return Err(SettingsError::Invalid {
                field: "capture.reinit_after_failures",
                reason: "must be at least 1".into(),
            });
        }
        if self.capture.backends.is_empty() {
            return Err(SettingsError::Invalid {
                field: "capture.backends",
                reason: "at least one backend is required".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.alert.min_confidence) {
            return Err(SettingsError::Invalid {
                field: "alert.min_confidence",
                reason: format!("{} is outside 0..=1", self.alert.min_confidence),
            });
        }
        Ok(())
    }
}
