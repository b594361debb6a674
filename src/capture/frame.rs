use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::error::DetectError;

/// Frame data with zero-copy semantics
///
/// Cloning a `Frame` is cheap: the pixel buffer is reference counted and
/// immutable, so every consumer shares the same allocation without being
/// able to mutate what a sibling is reading.
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Stream the frame was captured on
    pub source: Arc<str>,
    /// Per-source frame counter, starting at 0
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Wall clock capture time, carried into derived results
    pub captured_at: SystemTime,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

/// What a device read hands back before the source stamps it
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
}

/// Borrowed, decoded view handed across the inference boundary
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub rgb: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: SystemTime,
}

impl Frame {
    pub(crate) fn stamp(raw: RawFrame, source: Arc<str>, sequence: u64) -> Self {
        Self {
            data: raw.data,
            meta: Arc::new(FrameMetadata {
                source,
                sequence,
                width: raw.width,
                height: raw.height,
                format: raw.format,
                captured_at: SystemTime::now(),
                device_timestamp: raw.device_timestamp,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn source(&self) -> &str {
        &self.meta.source
    }

    /// Packed RGB24 pixels for this frame, decoding MJPEG if needed
    pub fn to_rgb(&self) -> Result<Bytes, DetectError> {
        super::decoder::decode_rgb(&self.data, self.meta.format).map(|rgb| match rgb {
            Some(pixels) => Bytes::from(pixels),
            None => self.data.clone(),
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("source", &self.meta.source)
            .field("sequence", &self.meta.sequence)
            .field("size", &(self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
