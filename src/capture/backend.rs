//! Capture backend abstraction
//!
//! A [`CaptureBackend`] knows how to open a device; the [`CaptureDevice`] it
//! returns is the exclusively owned handle the capture loop reads from.
//! Dropping the device releases the hardware.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::frame::{PixelFormat, RawFrame};
use crate::error::{BackendAttempt, OpenError, ReadError, StartError};

/// Device identity plus the backends to try, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Device path or index, e.g. `/dev/video0` or `0`
    pub path: String,
    /// Backend names in preference order
    pub backends: Vec<String>,
}

impl DeviceSpec {
    pub fn new(path: impl Into<String>, backends: &[&str]) -> Self {
        Self {
            path: path.into(),
            backends: backends.iter().map(|b| b.to_string()).collect(),
        }
    }
}

/// Requested capture parameters; backends may negotiate something else
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

/// What the device actually agreed to
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Negotiated {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open(
        &self,
        path: &str,
        request: &CaptureRequest,
    ) -> Result<Box<dyn CaptureDevice>, OpenError>;
}

/// An open device handle. Only ever touched by one capture thread.
pub trait CaptureDevice: Send {
    fn negotiated(&self) -> Negotiated;

    /// Block until the next frame is available
    fn read_frame(&mut self) -> Result<RawFrame, ReadError>;
}

/// Named set of backends available to the stream manager
#[derive(Clone, Default)]
pub struct BackendCatalog {
    backends: HashMap<String, Arc<dyn CaptureBackend>>,
}

impl BackendCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every backend compiled into this build
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        #[cfg(feature = "v4l2")]
        catalog.register(Arc::new(super::v4l2::V4l2Backend));
        #[cfg(feature = "gstreamer-pipeline")]
        catalog.register(Arc::new(super::gst_capture::GstBackend));
        catalog.register(Arc::new(super::test_pattern::TestPatternBackend));
        catalog
    }

    pub fn register(&mut self, backend: Arc<dyn CaptureBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    /// Try each backend of `device` in order; the first that opens wins.
    pub fn open(
        &self,
        device: &DeviceSpec,
        request: &CaptureRequest,
    ) -> Result<(String, Box<dyn CaptureDevice>), StartError> {
        let mut attempts = Vec::with_capacity(device.backends.len());

        for name in &device.backends {
            let result = match self.backends.get(name) {
                Some(backend) => backend.open(&device.path, request),
                None => Err(OpenError::Unavailable(name.clone())),
            };

            match result {
                Ok(handle) => return Ok((name.clone(), handle)),
                Err(e) => {
                    debug!(device = %device.path, backend = %name, error = %e, "Backend failed to open device");
                    attempts.push(BackendAttempt {
                        backend: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(StartError {
            device: device.path.clone(),
            attempts,
        })
    }
}
